//! [`Secret<T>`] owns sensitive material (system-key PEM text, bootstrap passphrases) and
//! never lets it leak through a log line, a `Debug` dump, or an accidental clone.
//!
//! It forbids implicit copy (no `Clone`/`Copy` derive), redacts itself in `Debug`/`Display`,
//! and exposes the wrapped value only through [`Secret::expose_secret`], a scoped callback —
//! the same shape as the teacher's `LockedVec` in `secure_memory.rs`, generalized from "locked
//! byte buffer" to "anything that can zeroize itself."

use std::fmt;
use zeroize::Zeroize;

const REDACTED: &str = "[redacted]";

/// Sensitive material that zeroizes on drop and never prints itself.
pub struct Secret<T: Zeroize> {
    inner: T,
}

impl<T: Zeroize> Secret<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Expose the wrapped value to `f` for the duration of the call only. `f` must not move
    /// the value out; any copy `f` makes internally is `f`'s responsibility to zero.
    pub fn expose_secret<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner)
    }

    pub fn expose_secret_mut<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner)
    }
}

impl<T: Zeroize + AsRef<[u8]>> Secret<T> {
    /// Convenience for callers that only need a byte view (e.g. the SSH signing step).
    pub fn expose_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.as_ref())
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&REDACTED).finish()
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REDACTED}")
    }
}

// Never derive Serialize for Secret<T>: a secret that round-trips through JSON/TOML is a
// secret that leaked. Callers that must persist it (the Store, writing system_keys.private_key)
// do so explicitly via `expose_secret`, at the one boundary that is allowed to touch the bytes.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_shows_value() {
        let s = Secret::new(String::from("super-secret-pem"));
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("super-secret-pem"));
        assert_eq!(dbg, "Secret(\"[redacted]\")");
    }

    #[test]
    fn display_never_shows_value() {
        let s = Secret::new(String::from("super-secret-pem"));
        assert_eq!(format!("{s}"), "[redacted]");
    }

    #[test]
    fn expose_secret_returns_the_value() {
        let s = Secret::new(String::from("hunter2"));
        let len = s.expose_secret(|v| v.len());
        assert_eq!(len, 7);
    }

    #[test]
    fn zeroizes_on_drop() {
        // Zeroize's String impl clears the buffer in place; we can only assert this doesn't
        // panic and that expose_secret works up to the point of drop.
        let s = Secret::new(String::from("drop-me"));
        drop(s);
    }
}
