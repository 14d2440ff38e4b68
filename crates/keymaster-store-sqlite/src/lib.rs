//! SQLite-backed `Store`. One connection per call, matching the teacher's own
//! `ChronosSqlite` shape: `SqliteStore` is cheap to clone, carries just a path, and opens a
//! fresh `rusqlite::Connection` per operation with `foreign_keys = ON` pinned on every open.
//! Mutating operations run inside a single `rusqlite` transaction so the Dirty Tracker
//! recomputation and the audit append are never observable apart from the mutation itself.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};

use keymaster_core::dirty::{affected, DirtyView, Mutation};
use keymaster_core::error::{KeymasterError, Result};
use keymaster_core::model::{
    Account, AccountId, AuditLogEntry, BootstrapSession, BootstrapStatus, KeyId, KnownHostKey,
    PublicKey, PublicKeyMaterial, Serial, SystemKey,
};
use keymaster_core::render;
use keymaster_core::store::Store;
use keymaster_secret::Secret;

fn map_sqlite_err(err: rusqlite::Error) -> KeymasterError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            KeymasterError::Constraint(err.to_string())
        }
        _ => KeymasterError::Internal(format!("sqlite: {err}")),
    }
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KeymasterError::Internal(format!("bad timestamp {s}: {e}")))
}

fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn hash_to_hex(hash: [u8; 32]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for b in hash {
        write!(out, "{b:02x}").unwrap();
    }
    out
}

fn hash_from_hex(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(byte_str, 16).ok()?;
    }
    Some(out)
}

#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let this = SqliteStore {
            db_path: db_path.into(),
        };
        this.init().map_err(map_sqlite_err)?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init(&self) -> rusqlite::Result<()> {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                hostname TEXT NOT NULL,
                label TEXT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                serial INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                key_hash TEXT NULL,
                UNIQUE(username, hostname)
            );

            CREATE TABLE IF NOT EXISTS public_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                algorithm TEXT NOT NULL,
                key_data TEXT NOT NULL,
                comment TEXT NOT NULL UNIQUE,
                is_global INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS account_keys (
                key_id INTEGER NOT NULL REFERENCES public_keys(id) ON DELETE CASCADE,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                PRIMARY KEY (key_id, account_id)
            );

            CREATE INDEX IF NOT EXISTS idx_account_keys_account ON account_keys(account_id);

            CREATE TABLE IF NOT EXISTS system_keys (
                serial INTEGER PRIMARY KEY AUTOINCREMENT,
                algorithm TEXT NOT NULL,
                key_data TEXT NOT NULL,
                private_pem TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS known_hosts (
                hostname TEXT PRIMARY KEY,
                key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bootstrap_sessions (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                hostname TEXT NOT NULL,
                label TEXT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                temp_algorithm TEXT NOT NULL,
                temp_key_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                os_user TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp);
            "#,
        )?;
        Ok(())
    }

    fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
        let tags_json: String = row.get(4)?;
        let key_hash_hex: Option<String> = row.get(8)?;
        Ok(Account {
            id: row.get(0)?,
            username: row.get(1)?,
            hostname: row.get(2)?,
            label: row.get(3)?,
            tags: tags_from_json(&tags_json),
            serial: row.get(5)?,
            is_active: row.get::<_, i64>(6)? != 0,
            is_dirty: row.get::<_, i64>(7)? != 0,
            key_hash: key_hash_hex.and_then(|h| hash_from_hex(&h)),
        })
    }

    const ACCOUNT_COLUMNS: &'static str =
        "id, username, hostname, label, tags, serial, is_active, is_dirty, key_hash";

    fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublicKey> {
        let expires_at: Option<String> = row.get(5)?;
        Ok(PublicKey {
            id: row.get(0)?,
            algorithm: row.get(1)?,
            key_data: row.get(2)?,
            comment: row.get(3)?,
            is_global: row.get::<_, i64>(4)? != 0,
            expires_at: expires_at.and_then(|s| parse_rfc3339(&s).ok()),
        })
    }

    const KEY_COLUMNS: &'static str = "id, algorithm, key_data, comment, is_global, expires_at";

    fn bootstrap_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BootstrapSession> {
        let created_at: String = row.get(7)?;
        let expires_at: String = row.get(8)?;
        let status: String = row.get(9)?;
        Ok(BootstrapSession {
            id: row.get(0)?,
            username: row.get(1)?,
            hostname: row.get(2)?,
            label: row.get(3)?,
            tags: tags_from_json(&row.get::<_, String>(4)?),
            temp_public_key: PublicKeyMaterial {
                algorithm: row.get(5)?,
                key_data: row.get(6)?,
            },
            created_at: parse_rfc3339(&created_at).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
            expires_at: parse_rfc3339(&expires_at).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
            status: status_from_str(&status),
        })
    }

    /// Resolve the Dirty Tracker's affected set for `mutation` against the current transaction.
    /// Must run before any `account_keys`/`public_keys` rows `mutation` refers to are removed —
    /// `delete_key` needs the pre-deletion assignment rows to find which accounts carried it.
    fn resolve_affected(tx: &Transaction<'_>, mutation: &Mutation) -> rusqlite::Result<Vec<AccountId>> {
        let all_ids: Vec<AccountId> = {
            let mut stmt = tx.prepare("SELECT id FROM accounts")?;
            stmt.query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        let active_ids: Vec<AccountId> = {
            let mut stmt = tx.prepare("SELECT id FROM accounts WHERE is_active = 1")?;
            stmt.query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        let lookup = |key_id: KeyId| -> Vec<AccountId> {
            let mut stmt = tx
                .prepare("SELECT account_id FROM account_keys WHERE key_id = ?1")
                .expect("prepared statement");
            stmt.query_map(params![key_id], |r| r.get(0))
                .expect("query")
                .collect::<rusqlite::Result<_>>()
                .expect("rows")
        };
        let view = DirtyView {
            all_account_ids: &all_ids,
            active_account_ids: &active_ids,
            account_ids_with_key: &lookup,
        };
        Ok(affected(mutation, &view).into_iter().collect())
    }

    fn active_system_key_public(tx: &Transaction<'_>) -> rusqlite::Result<Option<(Serial, PublicKeyMaterial)>> {
        tx.query_row(
            "SELECT serial, algorithm, key_data FROM system_keys WHERE is_active = 1 ORDER BY serial DESC LIMIT 1",
            [],
            |r| {
                Ok((
                    r.get(0)?,
                    PublicKeyMaterial {
                        algorithm: r.get(1)?,
                        key_data: r.get(2)?,
                    },
                ))
            },
        )
        .optional()
    }

    fn global_keys_for_render(tx: &Transaction<'_>) -> rusqlite::Result<Vec<PublicKey>> {
        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM public_keys WHERE is_global = 1",
            Self::KEY_COLUMNS
        ))?;
        stmt.query_map([], Self::key_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
    }

    fn assigned_keys_for_render(tx: &Transaction<'_>, account_id: AccountId) -> rusqlite::Result<Vec<PublicKey>> {
        let mut stmt = tx.prepare(
            "SELECT pk.id, pk.algorithm, pk.key_data, pk.comment, pk.is_global, pk.expires_at \
             FROM public_keys pk JOIN account_keys ak ON ak.key_id = pk.id WHERE ak.account_id = ?1",
        )?;
        stmt.query_map(params![account_id], Self::key_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
    }

    /// Recompute `key_hash` (the hash of the managed block that would be written next) for every
    /// account in `ids`, mark it dirty, and append the `ACCOUNT_KEY_HASH_UPDATED` audit entry —
    /// all inside `tx`, per spec.md §4.2. Must run after any key/assignment rows the triggering
    /// mutation changed.
    fn restamp_key_hashes(tx: &Transaction<'_>, ids: &[AccountId]) -> rusqlite::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let system_key = Self::active_system_key_public(tx)?;
        let globals = Self::global_keys_for_render(tx)?;
        let now = Utc::now();
        for &id in ids {
            tx.execute(
                "UPDATE accounts SET is_dirty = 1 WHERE id = ?1",
                params![id],
            )?;
            if let Some((serial, system_public)) = &system_key {
                let assigned = Self::assigned_keys_for_render(tx, id)?;
                let block = render::render_managed_block(*serial, system_public, &globals, &assigned, now);
                let hash_hex = hash_to_hex(render::hash(&block));
                tx.execute(
                    "UPDATE accounts SET key_hash = ?1 WHERE id = ?2",
                    params![hash_hex, id],
                )?;
            }
        }
        append_audit_tx(
            tx,
            "system",
            "ACCOUNT_KEY_HASH_UPDATED",
            &format!("{} account(s)", ids.len()),
        )?;
        Ok(())
    }

    /// Resolve the affected set for `mutation` against the current state and restamp in one
    /// step. Only correct when `mutation` is applied against tables that already reflect the
    /// triggering change (see `delete_key`, which must resolve before it deletes).
    fn apply_dirty(tx: &Transaction<'_>, mutation: Mutation) -> rusqlite::Result<()> {
        let ids = Self::resolve_affected(tx, &mutation)?;
        Self::restamp_key_hashes(tx, &ids)
    }
}

fn status_to_str(status: BootstrapStatus) -> &'static str {
    match status {
        BootstrapStatus::Active => "active",
        BootstrapStatus::Committing => "committing",
        BootstrapStatus::Completed => "completed",
        BootstrapStatus::Failed => "failed",
        BootstrapStatus::Orphaned => "orphaned",
    }
}

fn status_from_str(s: &str) -> BootstrapStatus {
    match s {
        "committing" => BootstrapStatus::Committing,
        "completed" => BootstrapStatus::Completed,
        "failed" => BootstrapStatus::Failed,
        "orphaned" => BootstrapStatus::Orphaned,
        _ => BootstrapStatus::Active,
    }
}

fn append_audit_tx(
    tx: &Transaction<'_>,
    os_user: &str,
    action: &str,
    details: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO audit_log (timestamp, os_user, action, details) VALUES (?1, ?2, ?3, ?4)",
        params![rfc3339(Utc::now()), os_user, action, details],
    )?;
    Ok(())
}

impl Store for SqliteStore {
    fn add_account(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: &[String],
    ) -> Result<AccountId> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let result = tx.execute(
            "INSERT INTO accounts (username, hostname, label, tags, serial, is_active, is_dirty) \
             VALUES (?1, ?2, ?3, ?4, 0, 1, 1)",
            params![username, hostname, label, tags_to_json(tags)],
        );
        let id = match result {
            Ok(_) => tx.last_insert_rowid(),
            Err(e) => return Err(map_sqlite_err(e)),
        };
        append_audit_tx(&tx, "system", "ACCOUNT_CREATED", &format!("{username}@{hostname}"))
            .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(id)
    }

    fn get_account(&self, id: AccountId) -> Result<Account> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", Self::ACCOUNT_COLUMNS),
            params![id],
            Self::account_from_row,
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM accounts ORDER BY id", Self::ACCOUNT_COLUMNS))
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map([], Self::account_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)?;
        Ok(rows)
    }

    fn find_account_by_user_host(&self, username: &str, hostname: &str) -> Result<Option<Account>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            &format!(
                "SELECT {} FROM accounts WHERE username = ?1 AND hostname = ?2",
                Self::ACCOUNT_COLUMNS
            ),
            params![username, hostname],
            Self::account_from_row,
        )
        .optional()
        .map_err(map_sqlite_err)
    }

    fn set_account_active(&self, id: AccountId, active: bool) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let changed = tx
            .execute(
                "UPDATE accounts SET is_active = ?1 WHERE id = ?2",
                params![active as i64, id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("account {id}")));
        }
        Self::apply_dirty(&tx, Mutation::SingleAccount(id)).map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "ACCOUNT_ACTIVE_SET", &format!("{id}={active}"))
            .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn delete_account(&self, id: AccountId) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let changed = tx
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("account {id}")));
        }
        append_audit_tx(&tx, "system", "ACCOUNT_DELETED", &format!("{id}")).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn update_account_serial(&self, id: AccountId, serial: Serial) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let changed = conn
            .execute(
                "UPDATE accounts SET serial = ?1 WHERE id = ?2",
                params![serial, id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    fn clear_dirty(&self, id: AccountId) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let changed = conn
            .execute("UPDATE accounts SET is_dirty = 0 WHERE id = ?1", params![id])
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    fn set_account_key_hash(&self, id: AccountId, hash: [u8; 32]) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let changed = conn
            .execute(
                "UPDATE accounts SET key_hash = ?1 WHERE id = ?2",
                params![hash_to_hex(hash), id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    fn add_key(&self, algorithm: &str, key_data: &str, comment: &str, is_global: bool) -> Result<KeyId> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute(
            "INSERT INTO public_keys (algorithm, key_data, comment, is_global) VALUES (?1, ?2, ?3, ?4)",
            params![algorithm, key_data, comment, is_global as i64],
        )
        .map_err(map_sqlite_err)?;
        let id = tx.last_insert_rowid();
        if is_global {
            Self::apply_dirty(&tx, Mutation::AllAccounts).map_err(map_sqlite_err)?;
        }
        append_audit_tx(&tx, "system", "KEY_ADDED", comment).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(id)
    }

    fn get_key(&self, id: KeyId) -> Result<PublicKey> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            &format!("SELECT {} FROM public_keys WHERE id = ?1", Self::KEY_COLUMNS),
            params![id],
            Self::key_from_row,
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound(format!("key {id}")))
    }

    fn list_keys(&self) -> Result<Vec<PublicKey>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM public_keys ORDER BY id", Self::KEY_COLUMNS))
            .map_err(map_sqlite_err)?;
        stmt.query_map([], Self::key_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn list_global_keys(&self) -> Result<Vec<PublicKey>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM public_keys WHERE is_global = 1 ORDER BY comment",
                Self::KEY_COLUMNS
            ))
            .map_err(map_sqlite_err)?;
        stmt.query_map([], Self::key_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn list_keys_for_account(&self, account_id: AccountId) -> Result<Vec<PublicKey>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT pk.id, pk.algorithm, pk.key_data, pk.comment, pk.is_global, pk.expires_at \
                 FROM public_keys pk JOIN account_keys ak ON ak.key_id = pk.id \
                 WHERE ak.account_id = ?1 ORDER BY pk.comment"
            ))
            .map_err(map_sqlite_err)?;
        stmt.query_map(params![account_id], Self::key_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn account_ids_with_key(&self, key_id: KeyId) -> Result<Vec<AccountId>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare("SELECT account_id FROM account_keys WHERE key_id = ?1")
            .map_err(map_sqlite_err)?;
        stmt.query_map(params![key_id], |r| r.get(0))
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn assign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute(
            "INSERT INTO account_keys (key_id, account_id) VALUES (?1, ?2) \
             ON CONFLICT(key_id, account_id) DO NOTHING",
            params![key_id, account_id],
        )
        .map_err(map_sqlite_err)?;
        Self::apply_dirty(&tx, Mutation::SingleAccount(account_id)).map_err(map_sqlite_err)?;
        append_audit_tx(
            &tx,
            "system",
            "KEY_ASSIGNED",
            &format!("key={key_id} account={account_id}"),
        )
        .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn unassign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute(
            "DELETE FROM account_keys WHERE key_id = ?1 AND account_id = ?2",
            params![key_id, account_id],
        )
        .map_err(map_sqlite_err)?;
        Self::apply_dirty(&tx, Mutation::SingleAccount(account_id)).map_err(map_sqlite_err)?;
        append_audit_tx(
            &tx,
            "system",
            "KEY_UNASSIGNED",
            &format!("key={key_id} account={account_id}"),
        )
        .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn toggle_global(&self, key_id: KeyId) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let changed = tx
            .execute(
                "UPDATE public_keys SET is_global = NOT is_global WHERE id = ?1",
                params![key_id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("key {key_id}")));
        }
        Self::apply_dirty(&tx, Mutation::AllAccounts).map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "KEY_GLOBAL_TOGGLED", &format!("{key_id}"))
            .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn set_expiry(&self, key_id: KeyId, when: Option<DateTime<Utc>>) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let is_global: Option<i64> = tx
            .query_row(
                "SELECT is_global FROM public_keys WHERE id = ?1",
                params![key_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)?;
        let Some(is_global) = is_global else {
            return Err(KeymasterError::NotFound(format!("key {key_id}")));
        };
        tx.execute(
            "UPDATE public_keys SET expires_at = ?1 WHERE id = ?2",
            params![when.map(rfc3339), key_id],
        )
        .map_err(map_sqlite_err)?;
        let mutation = if is_global != 0 {
            Mutation::AllAccounts
        } else {
            Mutation::AccountsWithKey(key_id)
        };
        Self::apply_dirty(&tx, mutation).map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "KEY_EXPIRY_SET", &format!("{key_id}")).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn delete_key(&self, key_id: KeyId) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let is_global: Option<i64> = tx
            .query_row(
                "SELECT is_global FROM public_keys WHERE id = ?1",
                params![key_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_sqlite_err)?;
        let Some(is_global) = is_global else {
            return Err(KeymasterError::NotFound(format!("key {key_id}")));
        };
        let mut affected_ids =
            Self::resolve_affected(&tx, &Mutation::AccountsWithKey(key_id)).map_err(map_sqlite_err)?;
        if is_global != 0 {
            affected_ids.extend(
                Self::resolve_affected(&tx, &Mutation::AllAccounts).map_err(map_sqlite_err)?,
            );
            affected_ids.sort_unstable();
            affected_ids.dedup();
        }
        tx.execute("DELETE FROM account_keys WHERE key_id = ?1", params![key_id])
            .map_err(map_sqlite_err)?;
        tx.execute("DELETE FROM public_keys WHERE id = ?1", params![key_id])
            .map_err(map_sqlite_err)?;
        Self::restamp_key_hashes(&tx, &affected_ids).map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "KEY_DELETED", &format!("{key_id}")).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn active_system_key(&self) -> Result<SystemKey> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            "SELECT serial, algorithm, key_data, private_pem FROM system_keys \
             WHERE is_active = 1 ORDER BY serial DESC LIMIT 1",
            [],
            |row| {
                Ok(SystemKey {
                    serial: row.get(0)?,
                    public_key: PublicKeyMaterial {
                        algorithm: row.get(1)?,
                        key_data: row.get(2)?,
                    },
                    private_key: Secret::new(row.get(3)?),
                    is_active: true,
                })
            },
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound("no active system key".into()))
    }

    fn system_key_by_serial(&self, serial: Serial) -> Result<SystemKey> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            "SELECT serial, algorithm, key_data, private_pem, is_active FROM system_keys WHERE serial = ?1",
            params![serial],
            |row| {
                Ok(SystemKey {
                    serial: row.get(0)?,
                    public_key: PublicKeyMaterial {
                        algorithm: row.get(1)?,
                        key_data: row.get(2)?,
                    },
                    private_key: Secret::new(row.get(3)?),
                    is_active: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound(format!("system key serial {serial}")))
    }

    fn system_key_public(&self, serial: Serial) -> Result<PublicKeyMaterial> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            "SELECT algorithm, key_data FROM system_keys WHERE serial = ?1",
            params![serial],
            |row| {
                Ok(PublicKeyMaterial {
                    algorithm: row.get(0)?,
                    key_data: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound(format!("system key serial {serial}")))
    }

    fn rotate_system_key(&self, public: PublicKeyMaterial, private_pem: &str) -> Result<Serial> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute("UPDATE system_keys SET is_active = 0", [])
            .map_err(map_sqlite_err)?;
        tx.execute(
            "INSERT INTO system_keys (algorithm, key_data, private_pem, is_active) VALUES (?1, ?2, ?3, 1)",
            params![public.algorithm, public.key_data, private_pem],
        )
        .map_err(map_sqlite_err)?;
        let serial = tx.last_insert_rowid();
        Self::apply_dirty(&tx, Mutation::ActiveAccounts).map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "SYSTEM_KEY_ROTATED", &format!("{serial}"))
            .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(serial)
    }

    fn get_known_host_key(&self, hostname: &str) -> Result<Option<KnownHostKey>> {
        let hostname = keymaster_core::hostname::canonicalize_hostname(hostname);
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            "SELECT hostname, key FROM known_hosts WHERE hostname = ?1",
            params![hostname],
            |row| {
                Ok(KnownHostKey {
                    hostname: row.get(0)?,
                    key: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(map_sqlite_err)
    }

    fn set_known_host_key(&self, hostname: &str, key: &str) -> Result<()> {
        let hostname = keymaster_core::hostname::canonicalize_hostname(hostname);
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute(
            "INSERT INTO known_hosts (hostname, key) VALUES (?1, ?2) \
             ON CONFLICT(hostname) DO UPDATE SET key = excluded.key",
            params![hostname, key],
        )
        .map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "KNOWN_HOST_SET", &hostname).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn create_bootstrap_session(&self, session: &BootstrapSession) -> Result<()> {
        let mut conn = self.open().map_err(map_sqlite_err)?;
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        tx.execute(
            "INSERT INTO bootstrap_sessions \
             (id, username, hostname, label, tags, temp_algorithm, temp_key_data, created_at, expires_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.username,
                session.hostname,
                session.label,
                tags_to_json(&session.tags),
                session.temp_public_key.algorithm,
                session.temp_public_key.key_data,
                rfc3339(session.created_at),
                rfc3339(session.expires_at),
                status_to_str(session.status),
            ],
        )
        .map_err(map_sqlite_err)?;
        append_audit_tx(&tx, "system", "BOOTSTRAP_STARTED", &session.id).map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(())
    }

    fn get_bootstrap_session(&self, id: &str) -> Result<BootstrapSession> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.query_row(
            "SELECT id, username, hostname, label, tags, temp_algorithm, temp_key_data, \
             created_at, expires_at, status FROM bootstrap_sessions WHERE id = ?1",
            params![id],
            Self::bootstrap_from_row,
        )
        .optional()
        .map_err(map_sqlite_err)?
        .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {id}")))
    }

    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSession>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, username, hostname, label, tags, temp_algorithm, temp_key_data, \
                 created_at, expires_at, status FROM bootstrap_sessions WHERE status = 'active'",
            )
            .map_err(map_sqlite_err)?;
        stmt.query_map([], Self::bootstrap_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn list_expired_or_orphaned_sessions(&self, now: DateTime<Utc>) -> Result<Vec<BootstrapSession>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, username, hostname, label, tags, temp_algorithm, temp_key_data, \
                 created_at, expires_at, status FROM bootstrap_sessions \
                 WHERE status = 'orphaned' OR expires_at <= ?1",
            )
            .map_err(map_sqlite_err)?;
        stmt.query_map(params![rfc3339(now)], Self::bootstrap_from_row)
            .map_err(map_sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_err)
    }

    fn set_bootstrap_status(&self, id: &str, status: BootstrapStatus) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let changed = conn
            .execute(
                "UPDATE bootstrap_sessions SET status = ?1 WHERE id = ?2",
                params![status_to_str(status), id],
            )
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("bootstrap session {id}")));
        }
        Ok(())
    }

    fn delete_bootstrap_session(&self, id: &str) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let changed = conn
            .execute("DELETE FROM bootstrap_sessions WHERE id = ?1", params![id])
            .map_err(map_sqlite_err)?;
        if changed == 0 {
            return Err(KeymasterError::NotFound(format!("bootstrap session {id}")));
        }
        Ok(())
    }

    fn append_audit(&self, os_user: &str, action: &str, details: &str) -> Result<()> {
        let conn = self.open().map_err(map_sqlite_err)?;
        conn.execute(
            "INSERT INTO audit_log (timestamp, os_user, action, details) VALUES (?1, ?2, ?3, ?4)",
            params![rfc3339(Utc::now()), os_user, action, details],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    fn list_audit_log(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let conn = self.open().map_err(map_sqlite_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, os_user, action, details FROM audit_log \
                 ORDER BY id DESC LIMIT ?1",
            )
            .map_err(map_sqlite_err)?;
        stmt.query_map(params![limit as i64], |row| {
            let timestamp: String = row.get(1)?;
            Ok(AuditLogEntry {
                id: row.get(0)?,
                timestamp: parse_rfc3339(&timestamp).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
                os_user: row.get(2)?,
                action: row.get(3)?,
                details: row.get(4)?,
            })
        })
        .map_err(map_sqlite_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite_err)
    }
}
