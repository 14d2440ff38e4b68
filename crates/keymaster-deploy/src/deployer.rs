//! The Deployer (spec.md §4.5): single-account deployment is the atomic unit; fleet deployment
//! is that unit fanned out across the Parallel Runner.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

type StoreHandle = Arc<dyn Store>;
type TransportHandle = Arc<dyn Transport>;

use chrono::Utc;
use keymaster_core::error::{KeymasterError, Result};
use keymaster_core::model::{Account, AccountId};
use keymaster_core::render::{compose_with_tail, extract_managed, hash, render_managed_block};
use keymaster_core::store::Store;
use keymaster_runner::{ParallelRunner, RunSummary, TaskOutcome};
use keymaster_secret::Secret;
use keymaster_ssh::{HostKeyVerification, Transport};

/// Default overall per-account deploy budget, split across dial/session-open/transfer per
/// spec.md §5 — the Transport's own timeouts cover dial and session-open; this is the ceiling
/// the Parallel Runner enforces around the whole attempt.
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum DeployOutcome {
    Success { account_id: AccountId, serial: i64 },
    Skipped { account_id: AccountId },
}

impl TaskOutcome for DeployOutcome {
    fn is_skipped(&self) -> bool {
        matches!(self, DeployOutcome::Skipped { .. })
    }
}

/// Holds its `Store`/`Transport` as `Arc`s, wired once at the composition root (spec.md §9),
/// so a single `Deployer` can be cloned cheaply into every fleet-deploy worker thread.
#[derive(Clone)]
pub struct Deployer {
    store: StoreHandle,
    transport: TransportHandle,
}

impl Deployer {
    pub fn new(store: StoreHandle, transport: TransportHandle) -> Self {
        Deployer { store, transport }
    }

    /// The seven steps of spec.md §4.5. `force` deploys even when the account is inactive.
    pub fn deploy_account(&self, account_id: AccountId, force: bool) -> Result<DeployOutcome> {
        let account = self.store.get_account(account_id)?;
        if !account.is_active && !force {
            return Ok(DeployOutcome::Skipped { account_id });
        }

        let system_key = self.store.active_system_key()?;
        let known_host = self
            .store
            .get_known_host_key(&account.hostname)?
            .ok_or_else(|| KeymasterError::HostKeyMissing {
                hostname: account.hostname.clone(),
            })?;
        let expected_blob = decode_host_key_blob(&known_host.key)?;

        let managed_block = render_block_for(self.store.as_ref(), &account, &system_key.public_key, Utc::now())?;
        let expected_hash = hash(&managed_block);

        let result = self.deploy_with_transport(
            &account,
            &system_key.private_key,
            &managed_block,
            &expected_blob,
        );

        match result {
            Ok(()) => {
                self.store
                    .update_account_serial(account_id, system_key.serial)?;
                self.store.set_account_key_hash(account_id, expected_hash)?;
                self.store.clear_dirty(account_id)?;
                self.store.append_audit(
                    "system",
                    "DEPLOY_SUCCESS",
                    &format!("account={account_id} serial={}", system_key.serial),
                )?;
                Ok(DeployOutcome::Success {
                    account_id,
                    serial: system_key.serial,
                })
            }
            Err(e) => {
                self.store
                    .append_audit("system", "DEPLOY_FAIL", &format!("account={account_id} err={e}"))?;
                Err(e)
            }
        }
    }

    fn deploy_with_transport(
        &self,
        account: &Account,
        private_key: &Secret<String>,
        managed_block: &str,
        expected_host_key_blob: &[u8],
    ) -> Result<()> {
        let outcome = self.transport.connect(
            &account.hostname,
            22,
            &account.username,
            private_key,
            None,
            HostKeyVerification::KnownHost {
                expected_key_blob: expected_host_key_blob,
            },
        )?;
        if let Some(warning) = &outcome.weak_algorithm_warning {
            tracing::warn!(account = account.id, "{warning}");
        }

        let mut session = outcome.session;
        let current = session.read_authorized_keys()?;
        let current_text = String::from_utf8_lossy(&current);
        let (_, tail) = extract_managed(&current_text);
        let composed = compose_with_tail(managed_block, &tail);
        let write_result = session.write_authorized_keys(composed.as_bytes());
        session.close()?;
        write_result
    }

    /// Fleet deployment fans out over the Parallel Runner; per-account failures never abort the
    /// run, matching spec.md §5's "no per-account locking" / independent-connection model.
    pub fn deploy_fleet(
        &self,
        accounts: Vec<Account>,
        force: bool,
        runner: &ParallelRunner,
        cancel: Arc<AtomicBool>,
        timeout: Duration,
    ) -> RunSummary<DeployOutcome> {
        let deployer = self.clone();
        runner.run(accounts, cancel, timeout, move |account: &Account| {
            deployer.deploy_account(account.id, force)
        })
    }
}

pub(crate) fn render_block_for(
    store: &dyn Store,
    account: &Account,
    system_public: &keymaster_core::model::PublicKeyMaterial,
    now: chrono::DateTime<Utc>,
) -> Result<String> {
    let globals = store.list_global_keys()?;
    let assigned = store.list_keys_for_account(account.id)?;
    let system_key = store.active_system_key()?;
    Ok(render_managed_block(
        system_key.serial,
        system_public,
        &globals,
        &assigned,
        now,
    ))
}

/// `KnownHostKey.key` is stored as the OpenSSH `<algorithm> <base64>` line; the blob Transport
/// compares against is the raw decoded key, not the line.
pub(crate) fn decode_host_key_blob(known_host_line: &str) -> Result<Vec<u8>> {
    let base64_part = known_host_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| KeymasterError::Internal(format!("malformed known host entry: {known_host_line}")))?;
    base64_decode(base64_part)
        .ok_or_else(|| KeymasterError::Internal(format!("bad base64 in known host entry: {known_host_line}")))
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let clean: Vec<u8> = s.bytes().filter(|&c| c != b'=').collect();
    let mut out = Vec::with_capacity(clean.len() * 3 / 4);
    for chunk in clean.chunks(4) {
        let vals: Vec<u8> = chunk.iter().map(|&c| value(c)).collect::<Option<_>>()?;
        let n = vals.len();
        let b0 = vals[0];
        let b1 = *vals.get(1).unwrap_or(&0);
        let b2 = *vals.get(2).unwrap_or(&0);
        let b3 = *vals.get(3).unwrap_or(&0);
        let triple = (b0 as u32) << 18 | (b1 as u32) << 12 | (b2 as u32) << 6 | b3 as u32;
        out.push((triple >> 16) as u8);
        if n > 2 {
            out.push((triple >> 8) as u8);
        }
        if n > 3 {
            out.push(triple as u8);
        }
    }
    Some(out)
}
