//! The Auditor (spec.md §4.6): read-only drift detection, in two modes. Never mutates Store
//! state — it shares the Deployer's Transport and Renderer but stops after comparison.

use std::sync::Arc;

use chrono::Utc;
use keymaster_core::error::{KeymasterError, Result};
use keymaster_core::model::AccountId;
use keymaster_core::render::{extract_managed, hash, normalize, parse_header_serial};
use keymaster_core::store::Store;
use keymaster_ssh::{HostKeyVerification, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Match,
    Mismatch {
        expected: [u8; 32],
        actual: [u8; 32],
    },
    SerialMatch,
    SerialMismatch {
        expected: i64,
        actual: i64,
    },
}

type StoreHandle = Arc<dyn Store>;
type TransportHandle = Arc<dyn Transport>;

/// Holds the same `Arc`-wired handles as `Deployer` so it can be cloned into fleet fan-out the
/// same way.
#[derive(Clone)]
pub struct Auditor {
    store: StoreHandle,
    transport: TransportHandle,
}

impl Auditor {
    pub fn new(store: StoreHandle, transport: TransportHandle) -> Self {
        Auditor { store, transport }
    }

    fn fetch_remote_managed_block(&self, account_id: AccountId) -> Result<String> {
        let account = self.store.get_account(account_id)?;
        let system_key = self.store.active_system_key()?;
        let known_host = self
            .store
            .get_known_host_key(&account.hostname)?
            .ok_or_else(|| KeymasterError::HostKeyMissing {
                hostname: account.hostname.clone(),
            })?;
        let expected_blob = crate::deployer::decode_host_key_blob(&known_host.key)?;

        let outcome = self.transport.connect(
            &account.hostname,
            22,
            &account.username,
            &system_key.private_key,
            None,
            HostKeyVerification::KnownHost {
                expected_key_blob: &expected_blob,
            },
        )?;
        let mut session = outcome.session;
        let remote = session.read_authorized_keys()?;
        session.close()?;
        let remote_text = String::from_utf8_lossy(&remote).into_owned();
        let (managed, _tail) = extract_managed(&remote_text);
        Ok(managed)
    }

    /// Full normalized-content comparison. `expected_hash` is `Account.key_hash` when present;
    /// when absent (never deployed) the expected block is rendered fresh from the Store.
    pub fn audit_strict(&self, account_id: AccountId) -> Result<AuditOutcome> {
        let account = self.store.get_account(account_id)?;
        let expected_hash = match account.key_hash {
            Some(h) => h,
            None => {
                let system_key = self.store.active_system_key()?;
                let block = crate::deployer::render_block_for(
                    self.store.as_ref(),
                    &account,
                    &system_key.public_key,
                    Utc::now(),
                )?;
                hash(&block)
            }
        };

        let managed = self.fetch_remote_managed_block(account_id)?;
        let actual_hash = hash(&normalize(&managed));

        if expected_hash == actual_hash {
            Ok(AuditOutcome::Match)
        } else {
            Ok(AuditOutcome::Mismatch {
                expected: expected_hash,
                actual: actual_hash,
            })
        }
    }

    /// Compares the remote managed block's header serial against `Account.serial`. Useful during
    /// staged rotations where full content comparison would flag every lagging account at once.
    pub fn audit_serial(&self, account_id: AccountId) -> Result<AuditOutcome> {
        let account = self.store.get_account(account_id)?;
        let managed = self.fetch_remote_managed_block(account_id)?;
        let remote_serial = parse_header_serial(&managed)?;

        if remote_serial == account.serial {
            Ok(AuditOutcome::SerialMatch)
        } else {
            Ok(AuditOutcome::SerialMismatch {
                expected: account.serial,
                actual: remote_serial,
            })
        }
    }

    /// Strips Keymaster's managed block from an account's remote file (or deletes the file
    /// outright when `remove_entire_file` is set) and removes the local account row. Named in
    /// spec.md §4.6's glossary but not otherwise specified there as an operation; implemented
    /// because the extractor rule exists specifically to make this possible without clobbering
    /// an operator's own `authorized_keys` content.
    pub fn decommission(&self, account_id: AccountId, remove_entire_file: bool) -> Result<()> {
        let account = self.store.get_account(account_id)?;
        let system_key = self.store.active_system_key()?;
        let known_host = self
            .store
            .get_known_host_key(&account.hostname)?
            .ok_or_else(|| KeymasterError::HostKeyMissing {
                hostname: account.hostname.clone(),
            })?;
        let expected_blob = crate::deployer::decode_host_key_blob(&known_host.key)?;

        let outcome = self.transport.connect(
            &account.hostname,
            22,
            &account.username,
            &system_key.private_key,
            None,
            HostKeyVerification::KnownHost {
                expected_key_blob: &expected_blob,
            },
        )?;
        let mut session = outcome.session;

        let write_result = if remove_entire_file {
            session.write_authorized_keys(b"")
        } else {
            let remote = session.read_authorized_keys()?;
            let remote_text = String::from_utf8_lossy(&remote).into_owned();
            let (_, tail) = extract_managed(&remote_text);
            session.write_authorized_keys(normalize(&tail).as_bytes())
        };
        session.close()?;
        write_result?;

        self.store.delete_account(account_id)?;
        self.store.append_audit(
            "system",
            "DECOMMISSION",
            &format!("account={account_id} remove_entire_file={remove_entire_file}"),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymaster_core::model::PublicKeyMaterial;
    use keymaster_core::store::fake::FakeStore;
    use keymaster_ssh::FakeTransport;

    fn setup() -> (Arc<FakeStore>, Arc<FakeTransport>) {
        let store = Arc::new(FakeStore::new());
        let transport = Arc::new(FakeTransport::new());
        store
            .rotate_system_key(
                PublicKeyMaterial {
                    algorithm: "ssh-ed25519".into(),
                    key_data: "SYSKEY".into(),
                },
                "PEM-DATA",
            )
            .unwrap();
        (store, transport)
    }

    #[test]
    fn strict_audit_matches_freshly_deployed_account() {
        let (store, transport) = setup();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        transport.set_host_key("h1", b"fake-host-key:h1".to_vec());
        store
            .set_known_host_key("h1", "ssh-ed25519 ZmFrZS1ob3N0LWtleTpoMQ==")
            .unwrap();

        let deployer = crate::Deployer::new(store.clone(), transport.clone());
        deployer.deploy_account(acc, false).unwrap();

        let auditor = Auditor::new(store.clone(), transport.clone());
        assert_eq!(auditor.audit_strict(acc).unwrap(), AuditOutcome::Match);
        assert_eq!(auditor.audit_serial(acc).unwrap(), AuditOutcome::SerialMatch);
    }

    #[test]
    fn strict_audit_flags_hand_edited_remote_content() {
        let (store, transport) = setup();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        transport.set_host_key("h1", b"fake-host-key:h1".to_vec());
        store
            .set_known_host_key("h1", "ssh-ed25519 ZmFrZS1ob3N0LWtleTpoMQ==")
            .unwrap();

        let deployer = crate::Deployer::new(store.clone(), transport.clone());
        deployer.deploy_account(acc, false).unwrap();

        let mut remote = transport.remote_file("h1").unwrap();
        remote.extend_from_slice(b"ssh-ed25519 EXTRA hand-added\n");
        transport.set_remote_file("h1", remote);

        let auditor = Auditor::new(store.clone(), transport.clone());
        assert!(matches!(
            auditor.audit_strict(acc).unwrap(),
            AuditOutcome::Mismatch { .. }
        ));
        assert_eq!(auditor.audit_serial(acc).unwrap(), AuditOutcome::SerialMatch);
    }

    #[test]
    fn decommission_strips_managed_block_and_removes_account() {
        let (store, transport) = setup();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        transport.set_host_key("h1", b"fake-host-key:h1".to_vec());
        store
            .set_known_host_key("h1", "ssh-ed25519 ZmFrZS1ob3N0LWtleTpoMQ==")
            .unwrap();

        let deployer = crate::Deployer::new(store.clone(), transport.clone());
        deployer.deploy_account(acc, false).unwrap();

        let auditor = Auditor::new(store.clone(), transport.clone());
        auditor.decommission(acc, false).unwrap();

        assert!(store.get_account(acc).is_err());
        let remote_text = String::from_utf8(transport.remote_file("h1").unwrap()).unwrap();
        assert!(!remote_text.contains("# Keymaster Managed Keys"));
    }
}
