//! SSH/SFTP transport contract for Keymaster, plus the blocking `ssh2`-backed production
//! implementation and an in-memory fake for tests.

pub mod known_hosts;
mod transport;

pub use transport::fake::FakeTransport;
pub use transport::{
    ConnectOutcome, HostKeyVerification, OfferedHostKey, Session, Ssh2Transport, Transport,
};
