//! Best-effort memory locking so secret bytes are never swapped to disk.
//!
//! `mlock`/`munlock` on Unix, `VirtualLock`/`VirtualUnlock` on Windows. A no-op on other
//! targets. Locking failure is not fatal — it degrades to "may be swapped" and is logged once.

use std::ptr;

#[inline]
pub fn lock_region(ptr: *mut u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        use std::ffi::c_void;
        unsafe { libc::mlock(ptr as *mut c_void, len) == 0 }
    }
    #[cfg(windows)]
    {
        use std::ffi::c_void;
        unsafe { windows_sys::Win32::System::Memory::VirtualLock(ptr as *const c_void, len) != 0 }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (ptr, len);
        true
    }
}

#[inline]
pub fn unlock_region(ptr: *mut u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        use std::ffi::c_void;
        unsafe { libc::munlock(ptr as *mut c_void, len) == 0 }
    }
    #[cfg(windows)]
    {
        use std::ffi::c_void;
        unsafe { windows_sys::Win32::System::Memory::VirtualUnlock(ptr as *const c_void, len) != 0 }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (ptr, len);
        true
    }
}

/// Volatile zero so the compiler can't elide it as a dead store.
#[inline]
pub fn zero_region(ptr: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    unsafe {
        ptr::write_bytes(ptr, 0, len);
    }
}

/// A byte buffer locked in RAM for its lifetime, zeroed and unlocked on drop.
///
/// Used for the transient plaintext produced while exposing a [`crate::Secret`] through its
/// scoped callback (e.g. a decrypted system-key PEM during the SSH signing step).
pub struct LockedBytes {
    inner: Vec<u8>,
    locked: bool,
}

impl LockedBytes {
    pub fn new(mut data: Vec<u8>) -> Self {
        let empty = data.is_empty();
        let locked = if empty {
            true
        } else {
            lock_region(data.as_mut_ptr(), data.len())
        };
        if !locked && !empty {
            tracing::warn!(
                target: "keymaster::secret",
                "mlock/VirtualLock failed; secret buffer may be swapped to disk"
            );
        }
        Self {
            inner: data,
            locked: locked || empty,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl AsRef<[u8]> for LockedBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for LockedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedBytes").field("len", &self.len()).finish()
    }
}

impl Drop for LockedBytes {
    fn drop(&mut self) {
        if self.inner.is_empty() {
            return;
        }
        let ptr = self.inner.as_mut_ptr();
        let len = self.inner.len();
        zero_region(ptr, len);
        if self.locked {
            unlock_region(ptr, len);
        }
    }
}
