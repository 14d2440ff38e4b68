//! In-memory `Transport`/`Session` used by every other crate's test suite: a map of
//! `hostname -> authorized_keys bytes`, a map of `hostname -> host key blob` the fake offers,
//! and knobs to force `HostUnreachable`/`AuthFailed` for a given host.

use std::collections::HashMap;
use std::sync::Arc;

use keymaster_core::error::{KeymasterError, Result};
use keymaster_secret::Secret;
use parking_lot::Mutex;

use super::{ConnectOutcome, HostKeyVerification, OfferedHostKey, Session, Transport};

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    host_keys: HashMap<String, Vec<u8>>,
    unreachable: std::collections::HashSet<String>,
    auth_failures: std::collections::HashSet<String>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Arc<Mutex<State>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport::default()
    }

    pub fn set_remote_file(&self, host: &str, content: Vec<u8>) {
        self.state.lock().files.insert(host.to_string(), content);
    }

    pub fn remote_file(&self, host: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(host).cloned()
    }

    pub fn set_host_key(&self, host: &str, blob: Vec<u8>) {
        self.state.lock().host_keys.insert(host.to_string(), blob);
    }

    pub fn force_unreachable(&self, host: &str) {
        self.state.lock().unreachable.insert(host.to_string());
    }

    pub fn force_auth_failure(&self, host: &str) {
        self.state.lock().auth_failures.insert(host.to_string());
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        host: &str,
        _port: u16,
        _username: &str,
        _system_key_pem: &Secret<String>,
        _passphrase: Option<&Secret<Vec<u8>>>,
        verification: HostKeyVerification<'_>,
    ) -> Result<ConnectOutcome> {
        let mut state = self.state.lock();
        if state.unreachable.contains(host) {
            return Err(KeymasterError::HostUnreachable(host.to_string()));
        }
        if state.auth_failures.contains(host) {
            return Err(KeymasterError::AuthFailed(host.to_string()));
        }

        let blob = state
            .host_keys
            .entry(host.to_string())
            .or_insert_with(|| format!("fake-host-key:{host}").into_bytes())
            .clone();

        match verification {
            HostKeyVerification::KnownHost { expected_key_blob }
            | HostKeyVerification::Pinned {
                accepted_key_blob: expected_key_blob,
            } => {
                if expected_key_blob != blob.as_slice() {
                    return Err(KeymasterError::HostKeyMismatch {
                        hostname: host.to_string(),
                    });
                }
            }
            HostKeyVerification::Trust => {}
        }

        state.files.entry(host.to_string()).or_default();
        drop(state);

        Ok(ConnectOutcome {
            session: Box::new(FakeSession {
                host: host.to_string(),
                state: Arc::clone(&self.state),
            }),
            offered_host_key: OfferedHostKey {
                algorithm: "ssh-ed25519".to_string(),
                blob,
            },
            weak_algorithm_warning: None,
        })
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<State>>,
}

impl Session for FakeSession {
    fn read_authorized_keys(&mut self) -> Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .files
            .get(&self.host)
            .cloned()
            .unwrap_or_default())
    }

    fn write_authorized_keys(&mut self, content: &[u8]) -> Result<()> {
        self.state
            .lock()
            .files
            .insert(self.host.clone(), content.to_vec());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem() -> Secret<String> {
        Secret::new("fake pem".to_string())
    }

    #[test]
    fn missing_remote_file_reads_as_empty() {
        let transport = FakeTransport::new();
        let mut outcome = transport
            .connect("h1", 22, "deploy", &pem(), None, HostKeyVerification::Trust)
            .unwrap();
        assert_eq!(outcome.session.read_authorized_keys().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn write_then_read_round_trips() {
        let transport = FakeTransport::new();
        let mut outcome = transport
            .connect("h1", 22, "deploy", &pem(), None, HostKeyVerification::Trust)
            .unwrap();
        outcome.session.write_authorized_keys(b"ssh-ed25519 AAA x\n").unwrap();
        assert_eq!(
            transport.remote_file("h1").unwrap(),
            b"ssh-ed25519 AAA x\n".to_vec()
        );
    }

    #[test]
    fn forced_unreachable_fails_connect() {
        let transport = FakeTransport::new();
        transport.force_unreachable("h1");
        let err = transport
            .connect("h1", 22, "deploy", &pem(), None, HostKeyVerification::Trust)
            .unwrap_err();
        assert!(matches!(err, KeymasterError::HostUnreachable(_)));
    }

    #[test]
    fn mismatched_known_host_key_is_rejected() {
        let transport = FakeTransport::new();
        transport.set_host_key("h1", b"real-key".to_vec());
        let err = transport
            .connect(
                "h1",
                22,
                "deploy",
                &pem(),
                None,
                HostKeyVerification::KnownHost {
                    expected_key_blob: b"wrong-key",
                },
            )
            .unwrap_err();
        assert!(matches!(err, KeymasterError::HostKeyMismatch { .. }));
    }
}
