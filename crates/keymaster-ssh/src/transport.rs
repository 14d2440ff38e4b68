//! The `Transport` contract (spec.md §4.4): one connected SSH/SFTP session per call site, with
//! a single canonical production implementation (`Ssh2Transport`) and an in-memory fake for
//! tests — no process-wide connection pool, wired fresh at each call the way the Parallel
//! Runner dials out.

use keymaster_core::error::Result;
use keymaster_secret::Secret;

pub mod fake;
mod ssh2_transport;

pub use ssh2_transport::Ssh2Transport;

/// How the remote host key is checked before authentication proceeds.
pub enum HostKeyVerification<'a> {
    /// Normal operation: the caller already has a trusted `KnownHostKey` row and the offered
    /// key must match it exactly. Mismatch is `HostKeyMismatch`; this variant is never used when
    /// no row exists — the caller resolves that to `HostKeyMissing` before dialing.
    KnownHost { expected_key_blob: &'a [u8] },
    /// Bootstrap only: no prior trust exists. The transport still reports the offered key and
    /// its fingerprints back to the caller, who is responsible for getting explicit operator
    /// acceptance before this variant's session is used for anything but fetching the key.
    Trust,
    /// A previously-fetched-and-accepted key, pinned for the rest of a bootstrap flow (the
    /// engine's `TestConnection`/`Deploying` states, once the operator has already confirmed).
    Pinned { accepted_key_blob: &'a [u8] },
}

/// The host key offered by the remote during connect, reported regardless of verification
/// outcome so bootstrap can display it and bounce a mismatch back to the caller as a decision.
pub struct OfferedHostKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

pub struct ConnectOutcome {
    pub session: Box<dyn Session>,
    pub offered_host_key: OfferedHostKey,
    /// Set when the offered host key is of a deprecated type (spec.md §4.4's weak-algorithm
    /// warning). Non-fatal — the caller decides whether to surface it.
    pub weak_algorithm_warning: Option<String>,
}

/// Dial out to `host:port` and authenticate as `username` using `system_key_pem`'s private
/// material, exposed only for the duration of the signing step via [`Secret::expose_bytes`].
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        system_key_pem: &Secret<String>,
        passphrase: Option<&Secret<Vec<u8>>>,
        verification: HostKeyVerification<'_>,
    ) -> Result<ConnectOutcome>;
}

/// An authenticated session's SFTP surface. Implementations own the underlying connection and
/// must release it on drop even if a write left a temp file behind.
pub trait Session: Send {
    /// Missing file reads as empty, not an error (spec.md §4.4).
    fn read_authorized_keys(&mut self) -> Result<Vec<u8>>;

    /// Atomic write-and-rename with the documented `.bak` fallback for servers that reject
    /// rename-over-existing.
    fn write_authorized_keys(&mut self, content: &[u8]) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}
