//! Entities from the data model: `Account`, `PublicKey`, `SystemKey`, the `AccountKey`
//! assignment join, `KnownHostKey`, `AuditLogEntry`, and `BootstrapSession`.

use chrono::{DateTime, Utc};
use keymaster_secret::Secret;
use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type KeyId = i64;
pub type Serial = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub hostname: String,
    pub label: Option<String>,
    pub tags: Vec<String>,
    /// Serial of the SystemKey most recently successfully deployed. 0 = never deployed.
    pub serial: Serial,
    pub is_active: bool,
    pub is_dirty: bool,
    /// SHA-256 of the normalized managed block that would be written next.
    pub key_hash: Option<[u8; 32]>,
}

impl Account {
    /// `user@host`, the identifier format accepted by the fleet selector resolver.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: KeyId,
    pub algorithm: String,
    pub key_data: String,
    /// Unique; used as the dedup identifier on import.
    pub comment: String,
    pub is_global: bool,
    /// `None` means never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl PublicKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// The `<algorithm> <key_data> <comment>` OpenSSH line for an unprefixed key.
    pub fn openssh_line(&self) -> String {
        format!("{} {} {}", self.algorithm, self.key_data, self.comment)
    }
}

/// A system key row. `private_key` is `None` for rows read back without material (e.g. a list
/// view); the production Store always populates it when a signing operation needs it.
pub struct SystemKey {
    pub serial: Serial,
    pub public_key: PublicKeyMaterial,
    pub private_key: Secret<String>,
    pub is_active: bool,
}

impl std::fmt::Debug for SystemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemKey")
            .field("serial", &self.serial)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key)
            .field("is_active", &self.is_active)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyMaterial {
    pub algorithm: String,
    pub key_data: String,
}

impl PublicKeyMaterial {
    pub fn openssh_line(&self, comment: &str) -> String {
        format!("{} {} {}", self.algorithm, self.key_data, comment)
    }
}

/// `(key_id, account_id)` assignment. Deleting either side removes the row (enforced via
/// `ON DELETE CASCADE` in the SQLite schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKey {
    pub key_id: KeyId,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHostKey {
    /// Canonicalized: port stripped, IPv6 unbracketed.
    pub hostname: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub os_user: String,
    pub action: String,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Active,
    Committing,
    Completed,
    Failed,
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSession {
    pub id: String,
    pub username: String,
    pub hostname: String,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub temp_public_key: PublicKeyMaterial,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: BootstrapStatus,
}
