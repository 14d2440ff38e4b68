//! Blocking ssh2 (libssh2) implementation of [`Transport`], matching spec.md §5's thread-per-task
//! concurrency model: every call here blocks the calling OS thread, which is exactly what the
//! Parallel Runner expects from a unit of work.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use keymaster_core::error::{KeymasterError, Result};
use keymaster_secret::{LockedBytes, Secret};
use ssh2::Session as Ssh2Session;

use crate::known_hosts::{fingerprint_sha256, is_weak_algorithm};
use crate::transport::{ConnectOutcome, HostKeyVerification, OfferedHostKey, Session, Transport};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct Ssh2Transport;

impl Ssh2Transport {
    pub fn new() -> Self {
        Ssh2Transport
    }
}

impl Transport for Ssh2Transport {
    fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        system_key_pem: &Secret<String>,
        passphrase: Option<&Secret<Vec<u8>>>,
        verification: HostKeyVerification<'_>,
    ) -> Result<ConnectOutcome> {
        let stream = TcpStream::connect_timeout(
            &format!("{host}:{port}")
                .parse()
                .or_else(|_| resolve_one(host, port))
                .map_err(|e| KeymasterError::HostUnreachable(e.to_string()))?,
            DIAL_TIMEOUT,
        )
        .map_err(|e| KeymasterError::HostUnreachable(e.to_string()))?;
        stream
            .set_read_timeout(Some(SESSION_OPEN_TIMEOUT))
            .map_err(|e| KeymasterError::HostUnreachable(e.to_string()))?;

        let mut session = Ssh2Session::new()
            .map_err(|e| KeymasterError::Internal(format!("ssh2 session init: {e}")))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| KeymasterError::HostUnreachable(format!("handshake failed: {e}")))?;

        let (offered_key_blob, algorithm) = session
            .host_key()
            .map(|(blob, kind)| (blob.to_vec(), host_key_type_name(kind)))
            .ok_or_else(|| KeymasterError::HostUnreachable("no host key offered".into()))?;

        match verification {
            HostKeyVerification::KnownHost { expected_key_blob } => {
                if expected_key_blob != offered_key_blob.as_slice() {
                    return Err(KeymasterError::HostKeyMismatch {
                        hostname: host.to_string(),
                    });
                }
            }
            HostKeyVerification::Pinned { accepted_key_blob } => {
                if accepted_key_blob != offered_key_blob.as_slice() {
                    return Err(KeymasterError::HostKeyMismatch {
                        hostname: host.to_string(),
                    });
                }
            }
            HostKeyVerification::Trust => {}
        }

        authenticate(&session, username, system_key_pem, passphrase)?;

        let weak_algorithm_warning = is_weak_algorithm(&algorithm).then(|| {
            format!(
                "{host} offered a deprecated host key type ({algorithm}, fingerprint {})",
                fingerprint_sha256(&offered_key_blob)
            )
        });

        Ok(ConnectOutcome {
            session: Box::new(Ssh2SftpSession { session }),
            offered_host_key: OfferedHostKey {
                algorithm,
                blob: offered_key_blob,
            },
            weak_algorithm_warning,
        })
    }
}

fn resolve_one(host: &str, port: u16) -> std::io::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
}

fn host_key_type_name(kind: ssh2::HostKeyType) -> String {
    match kind {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
    .to_string()
}

/// Public-key auth from the active system key's in-memory PEM, exposed only for the duration of
/// this call via [`Secret::expose_secret`]/[`Secret::expose_bytes`].
fn authenticate(
    session: &Ssh2Session,
    username: &str,
    system_key_pem: &Secret<String>,
    passphrase: Option<&Secret<Vec<u8>>>,
) -> Result<()> {
    let passphrase_str = passphrase.map(|p| p.expose_bytes(|bytes| {
        String::from_utf8_lossy(bytes).into_owned()
    }));

    system_key_pem
        .expose_secret(|pem| {
            // Locked for the duration of the signing call so the PEM's plaintext copy handed to
            // libssh2 never gets paged to disk; zeroed and unlocked the moment this scope ends.
            let locked = LockedBytes::new(pem.clone().into_bytes());
            let pem_str = std::str::from_utf8(locked.as_slice())
                .expect("system key PEM is valid UTF-8");
            session.userauth_pubkey_memory(username, None, pem_str, passphrase_str.as_deref())
        })
        .map_err(|e| {
            let needs_passphrase = passphrase_str.is_none()
                && e.message().to_ascii_lowercase().contains("passphrase");
            if needs_passphrase {
                KeymasterError::PassphraseRequired
            } else {
                KeymasterError::AuthFailed(e.to_string())
            }
        })?;

    if !session.authenticated() {
        return Err(KeymasterError::AuthFailed(
            "public-key authentication did not succeed".into(),
        ));
    }
    Ok(())
}

struct Ssh2SftpSession {
    session: Ssh2Session,
}

const AUTHORIZED_KEYS_PATH: &str = ".ssh/authorized_keys";
const TMP_PATH: &str = ".ssh/authorized_keys.keymaster.tmp";
const BAK_PATH: &str = ".ssh/authorized_keys.keymaster.bak";

impl Session for Ssh2SftpSession {
    fn read_authorized_keys(&mut self) -> Result<Vec<u8>> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| KeymasterError::RemoteIO(format!("sftp subsystem: {e}")))?;
        match sftp.open(std::path::Path::new(AUTHORIZED_KEYS_PATH)) {
            Ok(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)
                    .map_err(|e| KeymasterError::RemoteIO(e.to_string()))?;
                Ok(buf)
            }
            Err(e) if e.code() == ssh2::ErrorCode::SFTP(2) => Ok(Vec::new()),
            Err(e) => Err(KeymasterError::RemoteIO(e.to_string())),
        }
    }

    fn write_authorized_keys(&mut self, content: &[u8]) -> Result<()> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| KeymasterError::RemoteIO(format!("sftp subsystem: {e}")))?;

        let tmp = std::path::Path::new(TMP_PATH);
        let target = std::path::Path::new(AUTHORIZED_KEYS_PATH);
        let bak = std::path::Path::new(BAK_PATH);

        let write_result = (|| -> Result<()> {
            let mut file = sftp
                .create(tmp)
                .map_err(|e| KeymasterError::RemoteIO(format!("create temp file: {e}")))?;
            file.write_all(content)
                .map_err(|e| KeymasterError::RemoteIO(e.to_string()))?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = sftp.unlink(tmp);
            return Err(e);
        }

        match sftp.rename(tmp, target, None) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Server doesn't support atomic overwrite: back up, then place the temp file.
                let _ = sftp.unlink(bak);
                if sftp.rename(target, bak, None).is_err() {
                    let _ = sftp.unlink(tmp);
                    return Err(KeymasterError::RemoteIO(
                        "rename-over-existing unsupported and backup failed".into(),
                    ));
                }
                match sftp.rename(tmp, target, None) {
                    Ok(()) => {
                        let _ = sftp.unlink(bak);
                        Ok(())
                    }
                    Err(e) => {
                        let _ = sftp.rename(bak, target, None);
                        Err(KeymasterError::RemoteIO(format!(
                            "fallback rename failed, restored backup: {e}"
                        )))
                    }
                }
            }
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        let _ = self.session.disconnect(None, "keymaster session closed", None);
        Ok(())
    }
}
