//! The Session Reaper (spec.md §4.7): a cooperative background OS thread that sweeps expired and
//! orphaned bootstrap sessions. `RecoverFromCrash` runs the identical sweep once at process
//! start, so a crash mid-flight cleans up the same way a slow operator timing out does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::Utc;
use keymaster_core::model::BootstrapStatus;
use keymaster_core::store::Store;
use keymaster_ssh::{HostKeyVerification, Transport};

use crate::registry::BootstrapRegistry;

pub struct Reaper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawns the background sweep thread. Call [`Reaper::stop`] to end it cooperatively; it is
    /// not forcibly killed, matching the Parallel Runner's own stance on blocking I/O.
    pub fn spawn(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Arc<BootstrapRegistry>,
        interval: StdDuration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if thread_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                sweep(&store, &transport, &registry);
            }
        });

        Reaper {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs the same sweep the background thread performs, once, synchronously — for
/// `RecoverFromCrash` at process start.
pub fn recover_from_crash(store: &Arc<dyn Store>, transport: &Arc<dyn Transport>, registry: &Arc<BootstrapRegistry>) {
    sweep(store, transport, registry);
}

fn sweep(store: &Arc<dyn Store>, transport: &Arc<dyn Transport>, registry: &Arc<BootstrapRegistry>) {
    let expired = match store.list_expired_or_orphaned_sessions(Utc::now()) {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::warn!(error = %e, "reaper: failed to list expired sessions");
            return;
        }
    };

    for session in expired {
        tracing::info!(session_id = %session.id, hostname = %session.hostname, "reaping bootstrap session");

        // Best-effort remote cleanup: only possible if we still hold the ephemeral private key
        // in memory (a crash-recovered session never will, since it was never persisted).
        let private_pem = registry.with_entry(&session.id, |entry| {
            entry.ephemeral_private.expose_secret(|pem| pem.clone())
        });

        if let Some(private_pem) = private_pem {
            let private_pem = keymaster_secret::Secret::new(private_pem);
            if let Ok(known_host) = store.get_known_host_key(&session.hostname) {
                if let Some(known_host) = known_host {
                    if let Some(accepted_blob) = decode_known_host_blob(&known_host.key) {
                        if let Ok(outcome) = transport.connect(
                            &session.hostname,
                            22,
                            &session.username,
                            &private_pem,
                            None,
                            HostKeyVerification::Pinned {
                                accepted_key_blob: &accepted_blob,
                            },
                        ) {
                            let mut conn = outcome.session;
                            if let Ok(remote) = conn.read_authorized_keys() {
                                let remote_text = String::from_utf8_lossy(&remote).into_owned();
                                let stripped: String = remote_text
                                    .lines()
                                    .filter(|l| !l.contains(&session.temp_public_key.key_data))
                                    .collect::<Vec<_>>()
                                    .join("\n");
                                let _ = conn.write_authorized_keys(stripped.as_bytes());
                            }
                            let _ = conn.close();
                        }
                    }
                }
            }
        }

        let _ = store.set_bootstrap_status(&session.id, BootstrapStatus::Orphaned);
        let _ = store.delete_bootstrap_session(&session.id);
        registry.unregister(&session.id);
        let _ = store.append_audit(
            "system",
            "BOOTSTRAP_REAPED",
            &format!("session={} host={}", session.id, session.hostname),
        );
    }
}

fn decode_known_host_blob(known_host_line: &str) -> Option<Vec<u8>> {
    let base64_part = known_host_line.split_whitespace().nth(1)?;
    let clean: Vec<u8> = base64_part.bytes().filter(|&c| c != b'=').collect();
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
    let mut out = Vec::with_capacity(clean.len() * 3 / 4);
    for chunk in clean.chunks(4) {
        let vals: Vec<u8> = chunk.iter().map(|&c| value(c)).collect::<Option<_>>()?;
        let n = vals.len();
        let triple = (vals[0] as u32) << 18
            | (*vals.get(1).unwrap_or(&0) as u32) << 12
            | (*vals.get(2).unwrap_or(&0) as u32) << 6
            | *vals.get(3).unwrap_or(&0) as u32;
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

#[cfg(test)]
mod tests {
    use super::*;
    use keymaster_core::model::{BootstrapSession, PublicKeyMaterial};
    use keymaster_core::store::fake::FakeStore;
    use keymaster_ssh::FakeTransport;

    fn session(id: &str, expires_at: chrono::DateTime<Utc>) -> BootstrapSession {
        BootstrapSession {
            id: id.to_string(),
            username: "deploy".into(),
            hostname: "h1".into(),
            label: None,
            tags: vec![],
            temp_public_key: PublicKeyMaterial {
                algorithm: "ssh-ed25519".into(),
                key_data: "TEMPKEY".into(),
            },
            created_at: Utc::now() - chrono::Duration::hours(25),
            expires_at,
            status: BootstrapStatus::Active,
        }
    }

    #[test]
    fn sweep_removes_expired_sessions() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport::new());
        let registry = Arc::new(BootstrapRegistry::new());

        store
            .create_bootstrap_session(&session("s1", Utc::now() - chrono::Duration::hours(1)))
            .unwrap();

        sweep(&store, &transport, &registry);

        assert!(store.get_bootstrap_session("s1").is_err());
    }

    #[test]
    fn sweep_leaves_unexpired_sessions_alone() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport::new());
        let registry = Arc::new(BootstrapRegistry::new());

        store
            .create_bootstrap_session(&session("s1", Utc::now() + chrono::Duration::hours(1)))
            .unwrap();

        sweep(&store, &transport, &registry);

        assert!(store.get_bootstrap_session("s1").is_ok());
    }
}
