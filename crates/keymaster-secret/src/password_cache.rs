//! A process-wide mailbox for a single passphrase, consulted when a system key's PEM is
//! encrypted and no passphrase was supplied inline.
//!
//! Single slot by design (spec: "single-slot byte buffer with get/set/clear"). `get` returns a
//! defensive copy so the caller's use of the bytes can't alias the cache's own storage; `clear`
//! zeroes the slot in place.

use parking_lot::Mutex;

use crate::mlock::zero_region;

#[derive(Default)]
pub struct PasswordCache {
    slot: Mutex<Option<Vec<u8>>>,
}

impl PasswordCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store a passphrase, replacing (and zeroing) any previous value.
    pub fn set(&self, passphrase: Vec<u8>) {
        let mut guard = self.slot.lock();
        if let Some(mut old) = guard.take() {
            zero_region(old.as_mut_ptr(), old.len());
        }
        *guard = Some(passphrase);
    }

    /// Return a defensive copy of the cached passphrase, if any.
    pub fn get(&self) -> Option<Vec<u8>> {
        self.slot.lock().clone()
    }

    /// Zero and clear the slot.
    pub fn clear(&self) {
        let mut guard = self.slot.lock();
        if let Some(mut old) = guard.take() {
            zero_region(old.as_mut_ptr(), old.len());
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl std::fmt::Debug for PasswordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCache")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value() {
        let cache = PasswordCache::new();
        cache.set(b"hunter2".to_vec());
        assert_eq!(cache.get(), Some(b"hunter2".to_vec()));
    }

    #[test]
    fn get_is_a_defensive_copy() {
        let cache = PasswordCache::new();
        cache.set(b"hunter2".to_vec());
        let mut copy = cache.get().unwrap();
        copy[0] = b'X';
        assert_eq!(cache.get().unwrap()[0], b'h');
    }

    #[test]
    fn clear_empties_the_slot() {
        let cache = PasswordCache::new();
        cache.set(b"hunter2".to_vec());
        cache.clear();
        assert_eq!(cache.get(), None);
        assert!(!cache.is_set());
    }

    #[test]
    fn debug_never_shows_value() {
        let cache = PasswordCache::new();
        cache.set(b"hunter2".to_vec());
        let dbg = format!("{cache:?}");
        assert!(!dbg.contains("hunter2"));
    }
}
