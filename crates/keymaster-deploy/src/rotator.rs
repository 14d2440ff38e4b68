//! The Rotator (spec.md §4.8): generates a new system key and retires the previous one as
//! "inactive but retained" so lagging accounts can still be reached with the key the Deployer
//! last stamped them with.

use std::sync::Arc;

use keymaster_core::error::Result;
use keymaster_core::keygen::generate_ed25519_keypair;
use keymaster_core::store::Store;
use keymaster_secret::Secret;

pub struct Rotator {
    store: Arc<dyn Store>,
}

impl Rotator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Rotator { store }
    }

    /// Generates a new ed25519 keypair, optionally passphrase-encrypted, and hands it to the
    /// Store in one transaction: the previous active row is deactivated (never deleted), the
    /// new row is inserted active, and every active account is marked dirty.
    pub fn rotate(&self, passphrase: Option<&Secret<Vec<u8>>>) -> Result<i64> {
        let (public_key, private_key) = generate_ed25519_keypair(passphrase)?;
        private_key.expose_secret(|pem| self.store.rotate_system_key(public_key.clone(), pem))
    }
}
