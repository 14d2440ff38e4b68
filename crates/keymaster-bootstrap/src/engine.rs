//! Drives the Bootstrap FSM: every method that touches the Store or Transport lives here, never
//! inside `fsm.rs` — per spec.md §9's "avoid interleaving UI concerns with state transitions",
//! applied equally to the engine itself (it is a view/driver over the FSM, not the other way
//! round).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use keymaster_core::error::{KeymasterError, Result};
use keymaster_core::keygen::generate_ed25519_keypair;
use keymaster_core::model::{AccountId, BootstrapSession, BootstrapStatus, KeyId};
use keymaster_core::render::{normalize, render_managed_block};
use keymaster_core::store::Store;
use keymaster_ssh::{HostKeyVerification, Transport};
use uuid::Uuid;

use crate::fsm::BootstrapFsm;
use crate::registry::{BootstrapRegistry, RegistryEntry};

pub struct BootstrapEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    registry: Arc<BootstrapRegistry>,
    ttl: Duration,
}

/// Everything the operator needs to see to paste the temp key onto the target host.
pub struct PasteInstructions {
    pub session_id: String,
    pub command: String,
}

pub struct HostKeyOffer {
    pub algorithm: String,
    pub blob: Vec<u8>,
    pub sha256_fingerprint: String,
    pub md5_fingerprint: String,
}

impl BootstrapEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Arc<BootstrapRegistry>,
        ttl: Duration,
    ) -> Self {
        BootstrapEngine {
            store,
            transport,
            registry,
            ttl,
        }
    }

    /// Step 1: generate the ephemeral key, persist only its public half, present the paste-once
    /// command. The session starts in `AwaitConfirm`.
    pub fn start(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: &[String],
    ) -> Result<PasteInstructions> {
        let (temp_public, temp_private) = generate_ed25519_keypair(None)?;
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let session = BootstrapSession {
            id: session_id.clone(),
            username: username.to_string(),
            hostname: hostname.to_string(),
            label: label.map(str::to_string),
            tags: tags.to_vec(),
            temp_public_key: temp_public.clone(),
            created_at: now,
            expires_at: now + self.ttl,
            status: BootstrapStatus::Active,
        };
        self.store.create_bootstrap_session(&session)?;

        let mut fsm = BootstrapFsm::new(session_id.clone());
        fsm.await_confirm()?;
        self.registry.register(RegistryEntry {
            fsm,
            ephemeral_private: temp_private,
        });

        let command = format!(
            "echo '{} {} keymaster-bootstrap-temp' >> ~/.ssh/authorized_keys",
            temp_public.algorithm, temp_public.key_data
        );
        Ok(PasteInstructions { session_id, command })
    }

    /// Step 3: fetch the remote host key with no prior trust, and display its fingerprints.
    pub fn fetch_host_key(&self, session_id: &str) -> Result<HostKeyOffer> {
        let session = self.store.get_bootstrap_session(session_id)?;
        let private_pem = self
            .registry
            .with_entry(session_id, |entry| {
                entry.ephemeral_private.expose_secret(|pem| pem.clone())
            })
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))?;
        let private_pem = keymaster_secret::Secret::new(private_pem);

        let outcome = self.transport.connect(
            &session.hostname,
            22,
            &session.username,
            &private_pem,
            None,
            HostKeyVerification::Trust,
        );

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.registry.with_entry(session_id, |entry| entry.fsm.fail(e.to_string()));
                return Err(e);
            }
        };
        let _ = outcome.session.close();

        let algorithm = outcome.offered_host_key.algorithm.clone();
        let blob = outcome.offered_host_key.blob.clone();
        let sha256_fingerprint = keymaster_ssh::known_hosts::fingerprint_sha256(&blob);
        let md5_fingerprint = keymaster_ssh::known_hosts::fingerprint_md5(&blob);

        self.registry
            .with_entry(session_id, |entry| entry.fsm.offer_host_key(algorithm.clone(), blob.clone()))
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))??;

        Ok(HostKeyOffer {
            algorithm,
            blob,
            sha256_fingerprint,
            md5_fingerprint,
        })
    }

    /// Step 4: operator accepted the fingerprints; open a pinned test session.
    pub fn accept_host_key_and_test(&self, session_id: &str) -> Result<()> {
        self.registry
            .with_entry(session_id, |entry| entry.fsm.accept_host_key())
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))??;

        let session = self.store.get_bootstrap_session(session_id)?;
        let accepted_blob = self
            .registry
            .with_entry(session_id, |entry| match &entry.fsm.state {
                crate::fsm::BootstrapState::TestConnection { accepted_blob } => Some(accepted_blob.clone()),
                _ => None,
            })
            .flatten()
            .ok_or_else(|| KeymasterError::Internal("expected TestConnection state".into()))?;

        let private_pem = self
            .registry
            .with_entry(session_id, |entry| entry.ephemeral_private.expose_secret(|p| p.clone()))
            .map(keymaster_secret::Secret::new)
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))?;

        let result = self.transport.connect(
            &session.hostname,
            22,
            &session.username,
            &private_pem,
            None,
            HostKeyVerification::Pinned {
                accepted_key_blob: &accepted_blob,
            },
        );

        match result {
            Ok(outcome) => {
                let _ = outcome.session.close();
                self.registry
                    .with_entry(session_id, |entry| entry.fsm.test_connection_succeeded())
                    .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))??;
                Ok(())
            }
            Err(e) => {
                self.registry
                    .with_entry(session_id, |entry| entry.fsm.test_connection_failed())
                    .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))??;
                Err(e)
            }
        }
    }

    /// Step 5: record which additional (non-global) keys the operator selected.
    pub fn select_keys(&self, session_id: &str, key_ids: Vec<KeyId>) -> Result<()> {
        self.registry
            .with_entry(session_id, |entry| entry.fsm.select_keys(key_ids))
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))?
    }

    /// Step 6: the atomic-from-the-operator's-view commit. Any failure after the account row is
    /// inserted rolls back: delete the row, best-effort remote cleanup, `status=failed`.
    pub fn commit(&self, session_id: &str) -> Result<AccountId> {
        self.registry
            .with_entry(session_id, |entry| entry.fsm.begin_deploy())
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))??;

        let session = self.store.get_bootstrap_session(session_id)?;
        let key_ids = self
            .registry
            .with_entry(session_id, |entry| match &entry.fsm.state {
                crate::fsm::BootstrapState::Deploying { key_ids, .. } => Some(key_ids.clone()),
                _ => None,
            })
            .flatten()
            .ok_or_else(|| KeymasterError::Internal("expected Deploying state".into()))?;
        let accepted_blob = self
            .registry
            .with_entry(session_id, |entry| match &entry.fsm.state {
                crate::fsm::BootstrapState::Deploying { accepted_blob, .. } => Some(accepted_blob.clone()),
                _ => None,
            })
            .flatten()
            .ok_or_else(|| KeymasterError::Internal("expected Deploying state".into()))?;

        self.store
            .set_bootstrap_status(session_id, BootstrapStatus::Committing)?;

        let result = self.commit_inner(&session, &key_ids, &accepted_blob, session_id);
        match result {
            Ok(account_id) => Ok(account_id),
            Err(e) => {
                self.rollback(session_id, &session, &accepted_blob);
                self.registry.with_entry(session_id, |entry| entry.fsm.fail(e.to_string()));
                Err(e)
            }
        }
    }

    fn commit_inner(
        &self,
        session: &BootstrapSession,
        key_ids: &[KeyId],
        accepted_blob: &[u8],
        session_id: &str,
    ) -> Result<AccountId> {
        let account_id = self.store.add_account(
            &session.username,
            &session.hostname,
            session.label.as_deref(),
            &session.tags,
        )?;

        for key_id in key_ids {
            self.store.assign_key(*key_id, account_id)?;
        }

        let system_key = self.store.active_system_key()?;
        let globals = self.store.list_global_keys()?;
        let assigned = self.store.list_keys_for_account(account_id)?;
        let managed_block = render_managed_block(
            system_key.serial,
            &system_key.public_key,
            &globals,
            &assigned,
            Utc::now(),
        );

        let private_pem = self
            .registry
            .with_entry(session_id, |entry| entry.ephemeral_private.expose_secret(|p| p.clone()))
            .map(keymaster_secret::Secret::new)
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {session_id}")))?;

        let outcome = self.transport.connect(
            &session.hostname,
            22,
            &session.username,
            &private_pem,
            None,
            HostKeyVerification::Pinned {
                accepted_key_blob: accepted_blob,
            },
        )?;
        let mut conn = outcome.session;
        let remote = conn.read_authorized_keys()?;
        let remote_text = String::from_utf8_lossy(&remote).into_owned();
        let tail = strip_temp_key_line(&remote_text, &session.temp_public_key.key_data);
        let composed = if tail.trim().is_empty() {
            normalize(&managed_block)
        } else {
            format!("{}\n{}\n", normalize(&managed_block).trim_end_matches('\n'), tail.trim_end_matches('\n'))
        };
        let write_result = conn.write_authorized_keys(composed.as_bytes());
        conn.close()?;
        write_result?;

        let known_host_line = format!(
            "{} {}",
            "ssh-ed25519",
            base64_encode(accepted_blob)
        );
        self.store.set_known_host_key(&session.hostname, &known_host_line)?;
        self.store.update_account_serial(account_id, system_key.serial)?;
        self.store.set_account_key_hash(account_id, keymaster_core::render::hash(&managed_block))?;

        self.registry.with_entry(session_id, |entry| entry.fsm.complete(account_id));

        self.store.set_bootstrap_status(session_id, BootstrapStatus::Completed)?;
        self.store.delete_bootstrap_session(session_id)?;
        // Drops the ephemeral private key's `Secret`, zeroing it (spec.md §4.7 step 6f).
        self.registry.unregister(session_id);
        self.store.append_audit(
            "system",
            "BOOTSTRAP_COMPLETE",
            &format!("account={account_id} session={session_id}"),
        )?;

        Ok(account_id)
    }

    fn rollback(&self, session_id: &str, session: &BootstrapSession, accepted_blob: &[u8]) {
        if let Some(private_pem) = self
            .registry
            .with_entry(session_id, |entry| entry.ephemeral_private.expose_secret(|p| p.clone()))
        {
            let private_pem = keymaster_secret::Secret::new(private_pem);
            if let Ok(outcome) = self.transport.connect(
                &session.hostname,
                22,
                &session.username,
                &private_pem,
                None,
                HostKeyVerification::Pinned {
                    accepted_key_blob: accepted_blob,
                },
            ) {
                let mut conn = outcome.session;
                if let Ok(remote) = conn.read_authorized_keys() {
                    let remote_text = String::from_utf8_lossy(&remote).into_owned();
                    let stripped = strip_temp_key_line(&remote_text, &session.temp_public_key.key_data);
                    let _ = conn.write_authorized_keys(stripped.as_bytes());
                }
                let _ = conn.close();
            }
        }

        let _ = self.store.set_bootstrap_status(session_id, BootstrapStatus::Failed);
        let _ = self.store.append_audit(
            "system",
            "BOOTSTRAP_FAILED",
            &format!("session={session_id} host={}", session.hostname),
        );
    }

    /// Graceful-shutdown hook: zero every registered session's secret and move its row to a
    /// terminal status (spec.md §5's signal-handling requirement).
    pub fn cleanup_all_active_sessions(&self) {
        for session_id in self.registry.session_ids() {
            let _ = self.store.set_bootstrap_status(&session_id, BootstrapStatus::Orphaned);
            self.registry.unregister(&session_id);
        }
    }

    pub fn default_poll_interval() -> StdDuration {
        StdDuration::from_secs(60)
    }
}

/// Removes any line containing the ephemeral public key's base64 data; everything else is kept
/// as-is so a file with pre-existing unrelated content is not clobbered.
fn strip_temp_key_line(content: &str, temp_key_data: &str) -> String {
    content
        .lines()
        .filter(|line| !line.contains(temp_key_data))
        .collect::<Vec<_>>()
        .join("\n")
}

fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let triple = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
        out.push(ALPHABET[(triple >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6 & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(triple & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymaster_core::model::PublicKeyMaterial;
    use keymaster_core::store::fake::FakeStore;
    use keymaster_ssh::FakeTransport;

    fn setup() -> (Arc<FakeStore>, Arc<FakeTransport>, BootstrapEngine) {
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
        let registry = Arc::new(BootstrapRegistry::new());
        let engine = BootstrapEngine::new(store.clone(), transport.clone(), registry, Duration::hours(24));
        (store, transport, engine)
    }

    #[test]
    fn happy_path_creates_an_account_and_clears_the_session() {
        let (store, transport, engine) = setup();
        let paste = engine.start("deploy", "newhost", None, &[]).unwrap();

        let offer = engine.fetch_host_key(&paste.session_id).unwrap();
        assert!(!offer.sha256_fingerprint.is_empty());

        engine.accept_host_key_and_test(&paste.session_id).unwrap();
        engine.select_keys(&paste.session_id, vec![]).unwrap();
        let account_id = engine.commit(&paste.session_id).unwrap();

        assert!(store.get_account(account_id).is_ok());
        assert!(store.get_bootstrap_session(&paste.session_id).is_err());

        let remote_text = String::from_utf8(transport.remote_file("newhost").unwrap()).unwrap();
        assert!(remote_text.contains("# Keymaster Managed Keys"));
        assert!(!remote_text.contains("keymaster-bootstrap-temp"));
    }

    #[test]
    fn mismatched_host_key_on_test_connection_fails_the_session() {
        let (_store, transport, engine) = setup();
        let paste = engine.start("deploy", "newhost", None, &[]).unwrap();
        engine.fetch_host_key(&paste.session_id).unwrap();

        transport.set_host_key("newhost", b"rotated-key".to_vec());
        let err = engine.accept_host_key_and_test(&paste.session_id);
        assert!(err.is_err());
    }
}
