//! Secret-material handling shared across the Keymaster workspace.
//!
//! Everything that touches system-key private bytes or operator passphrases goes through this
//! crate: [`Secret<T>`] for the "owned, redacted, zeroize-on-drop" case and [`PasswordCache`]
//! for the one process-wide mailbox the SSH transport consults when a PEM is encrypted.

mod mlock;
mod password_cache;
mod secret;

pub use mlock::{lock_region, unlock_region, zero_region, LockedBytes};
pub use password_cache::PasswordCache;
pub use secret::Secret;
