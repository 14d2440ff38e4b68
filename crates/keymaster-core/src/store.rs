//! The `Store` contract (spec.md §4.1): a transactional relational store over the data model.
//! Every mutating operation is one transaction that also recomputes the Dirty Tracker's affected
//! set and appends the audit entry; partial success is never observable to callers.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Account, AccountId, AuditLogEntry, BootstrapSession, KeyId, KnownHostKey, PublicKey,
    PublicKeyMaterial, Serial, SystemKey,
};

pub mod fake;

/// Implemented once in production (`keymaster-store-sqlite::SqliteStore`) and once as an
/// in-memory fake for tests (`store::fake::FakeStore`) — no process-wide singleton; callers
/// hold their own `Arc<dyn Store>` wired at the composition root.
pub trait Store: Send + Sync {
    // -- accounts --------------------------------------------------------

    fn add_account(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: &[String],
    ) -> Result<AccountId>;

    fn get_account(&self, id: AccountId) -> Result<Account>;
    fn list_accounts(&self) -> Result<Vec<Account>>;
    fn find_account_by_user_host(&self, username: &str, hostname: &str) -> Result<Option<Account>>;
    fn set_account_active(&self, id: AccountId, active: bool) -> Result<()>;
    fn delete_account(&self, id: AccountId) -> Result<()>;
    fn update_account_serial(&self, id: AccountId, serial: Serial) -> Result<()>;
    fn clear_dirty(&self, id: AccountId) -> Result<()>;
    fn set_account_key_hash(&self, id: AccountId, hash: [u8; 32]) -> Result<()>;

    // -- public keys -------------------------------------------------------

    fn add_key(
        &self,
        algorithm: &str,
        key_data: &str,
        comment: &str,
        is_global: bool,
    ) -> Result<KeyId>;

    fn get_key(&self, id: KeyId) -> Result<PublicKey>;
    fn list_keys(&self) -> Result<Vec<PublicKey>>;
    fn list_global_keys(&self) -> Result<Vec<PublicKey>>;
    fn list_keys_for_account(&self, account_id: AccountId) -> Result<Vec<PublicKey>>;
    fn account_ids_with_key(&self, key_id: KeyId) -> Result<Vec<AccountId>>;

    /// Idempotent: assigning an already-assigned key succeeds without creating a duplicate row.
    fn assign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()>;
    /// Idempotent: unassigning a key that isn't assigned succeeds as a no-op.
    fn unassign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()>;

    /// Flips `is_global`; marks every account dirty (global membership changed for everyone).
    fn toggle_global(&self, key_id: KeyId) -> Result<()>;
    /// Marks dirty every account the key is (or, via global, was) applicable to.
    fn set_expiry(&self, key_id: KeyId, when: Option<DateTime<Utc>>) -> Result<()>;
    /// Removes assignments, then the key; marks affected accounts dirty.
    fn delete_key(&self, key_id: KeyId) -> Result<()>;

    // -- system keys -------------------------------------------------------

    fn active_system_key(&self) -> Result<SystemKey>;
    fn system_key_by_serial(&self, serial: Serial) -> Result<SystemKey>;
    fn system_key_public(&self, serial: Serial) -> Result<PublicKeyMaterial>;

    /// Deactivates the previous active row, inserts a new one, marks all active accounts dirty.
    fn rotate_system_key(&self, public: PublicKeyMaterial, private_pem: &str) -> Result<Serial>;

    // -- known hosts -------------------------------------------------------

    fn get_known_host_key(&self, hostname: &str) -> Result<Option<KnownHostKey>>;
    fn set_known_host_key(&self, hostname: &str, key: &str) -> Result<()>;

    // -- bootstrap sessions --------------------------------------------------

    fn create_bootstrap_session(&self, session: &BootstrapSession) -> Result<()>;
    fn get_bootstrap_session(&self, id: &str) -> Result<BootstrapSession>;
    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSession>>;
    fn list_expired_or_orphaned_sessions(&self, now: DateTime<Utc>) -> Result<Vec<BootstrapSession>>;
    fn set_bootstrap_status(
        &self,
        id: &str,
        status: crate::model::BootstrapStatus,
    ) -> Result<()>;
    fn delete_bootstrap_session(&self, id: &str) -> Result<()>;

    // -- audit ---------------------------------------------------------------

    fn append_audit(&self, os_user: &str, action: &str, details: &str) -> Result<()>;
    fn list_audit_log(&self, limit: usize) -> Result<Vec<AuditLogEntry>>;
}
