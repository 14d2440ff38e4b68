//! The closed set of error kinds surfaced at component boundaries.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeymasterError>;

#[derive(Error, Debug)]
pub enum KeymasterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key mismatch for {hostname}")]
    HostKeyMismatch { hostname: String },

    #[error("no known host key for {hostname}")]
    HostKeyMissing { hostname: String },

    #[error("system key is passphrase-protected and no passphrase is available")]
    PassphraseRequired,

    /// Non-fatal: callers should log/display this and continue.
    #[error("remote offered a weak host key ({0})")]
    WeakHostKey(String),

    #[error("cannot render: {0}")]
    RenderError(String),

    #[error("remote I/O error: {0}")]
    RemoteIO(String),

    #[error("canceled")]
    Canceled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An invariant the rest of the system assumes was violated. Never expected in normal
    /// operation; the caller should abort just the current task and audit the occurrence.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl KeymasterError {
    /// True for the one variant spec.md classifies as a warning rather than a failure.
    pub fn is_warning(&self) -> bool {
        matches!(self, KeymasterError::WeakHostKey(_))
    }
}
