//! The Bootstrap Registry: the one place the ephemeral private key lives while a session is in
//! flight (spec.md §5: "guarded by a read-write lock"; the teacher's pack prefers `parking_lot`
//! over `std::sync` where available).

use std::collections::HashMap;

use keymaster_secret::Secret;
use parking_lot::RwLock;

use crate::fsm::BootstrapFsm;

pub struct RegistryEntry {
    pub fsm: BootstrapFsm,
    /// OpenSSH PEM of the ephemeral key's private half. Never persisted; dropping (or explicitly
    /// taking) this entry zeroes it.
    pub ephemeral_private: Secret<String>,
}

#[derive(Default)]
pub struct BootstrapRegistry {
    sessions: RwLock<HashMap<String, RegistryEntry>>,
}

impl BootstrapRegistry {
    pub fn new() -> Self {
        BootstrapRegistry::default()
    }

    pub fn register(&self, entry: RegistryEntry) {
        self.sessions.write().insert(entry.fsm.session_id.clone(), entry);
    }

    pub fn with_entry<R>(&self, session_id: &str, f: impl FnOnce(&mut RegistryEntry) -> R) -> Option<R> {
        self.sessions.write().get_mut(session_id).map(f)
    }

    /// Removes and returns the entry, dropping the caller's `Secret` at the call site (the
    /// `Secret`'s own `Drop` zeroes the PEM).
    pub fn unregister(&self, session_id: &str) -> Option<RegistryEntry> {
        self.sessions.write().remove(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry {
            fsm: BootstrapFsm::new(id.to_string()),
            ephemeral_private: Secret::new("fake-pem".to_string()),
        }
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let registry = BootstrapRegistry::new();
        registry.register(entry("s1"));
        assert_eq!(registry.len(), 1);
        let removed = registry.unregister("s1");
        assert!(removed.is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn with_entry_mutates_in_place() {
        let registry = BootstrapRegistry::new();
        registry.register(entry("s1"));
        registry.with_entry("s1", |e| e.fsm.await_confirm().unwrap());
        let ids = registry.session_ids();
        assert_eq!(ids, vec!["s1".to_string()]);
    }

    #[test]
    fn missing_session_is_none() {
        let registry = BootstrapRegistry::new();
        assert!(registry.with_entry("nope", |_| ()).is_none());
    }
}
