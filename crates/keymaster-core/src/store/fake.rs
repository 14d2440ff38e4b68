//! In-memory `Store` used by every other crate's test suite. Mirrors the production SQLite
//! store's semantics (conflicts, cascades, dirty propagation) without touching disk, the same
//! role the teacher's `ModuleRegistry` in-memory variants play in its own test harnesses.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::dirty::{affected, DirtyView, Mutation};
use crate::error::{KeymasterError, Result};
use crate::model::{
    Account, AccountId, AuditLogEntry, BootstrapSession, BootstrapStatus, KeyId, KnownHostKey,
    PublicKey, PublicKeyMaterial, Serial, SystemKey,
};
use crate::store::Store;
use keymaster_secret::Secret;

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    next_account_id: AccountId,
    keys: HashMap<KeyId, PublicKey>,
    next_key_id: KeyId,
    assignments: Vec<(KeyId, AccountId)>,
    system_keys: Vec<(Serial, PublicKeyMaterial, String)>,
    next_serial: Serial,
    known_hosts: HashMap<String, String>,
    bootstrap_sessions: HashMap<String, BootstrapSession>,
    audit_log: Vec<AuditLogEntry>,
    next_audit_id: i64,
}

pub struct FakeStore {
    state: Mutex<State>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        FakeStore {
            state: Mutex::new(State {
                next_account_id: 1,
                next_key_id: 1,
                next_serial: 1,
                next_audit_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Resolve the Dirty Tracker's affected set for `mutation` against the current state. Must
    /// run before any assignment/key rows `mutation` refers to are removed — `delete_key` needs
    /// the pre-deletion assignment list to find which accounts carried the key.
    fn resolve_affected(state: &State, mutation: &Mutation) -> BTreeSet<AccountId> {
        let all_ids: Vec<AccountId> = state.accounts.keys().copied().collect();
        let active_ids: Vec<AccountId> = state
            .accounts
            .values()
            .filter(|a| a.is_active)
            .map(|a| a.id)
            .collect();
        let assignments = state.assignments.clone();
        let lookup = |key_id: KeyId| -> Vec<AccountId> {
            assignments
                .iter()
                .filter(|(k, _)| *k == key_id)
                .map(|(_, acc)| *acc)
                .collect()
        };
        let view = DirtyView {
            all_account_ids: &all_ids,
            active_account_ids: &active_ids,
            account_ids_with_key: &lookup,
        };
        affected(mutation, &view)
    }

    /// Recompute `key_hash` (the hash of the managed block that would be written next) for every
    /// account in `ids`, mark it dirty, and append the `ACCOUNT_KEY_HASH_UPDATED` audit entry,
    /// per spec.md §4.2. Must run after any key/assignment rows the triggering mutation changed.
    fn restamp_key_hashes(state: &mut State, ids: &BTreeSet<AccountId>) {
        if ids.is_empty() {
            return;
        }
        let system_key = state.system_keys.last().cloned();
        let globals: Vec<PublicKey> = state.keys.values().filter(|k| k.is_global).cloned().collect();
        let now = Utc::now();
        for &id in ids {
            let assigned: Vec<PublicKey> = state
                .assignments
                .iter()
                .filter(|(_, acc)| *acc == id)
                .filter_map(|(key_id, _)| state.keys.get(key_id).cloned())
                .collect();
            if let Some(account) = state.accounts.get_mut(&id) {
                account.is_dirty = true;
                if let Some((serial, public, _)) = &system_key {
                    let block = crate::render::render_managed_block(*serial, public, &globals, &assigned, now);
                    account.key_hash = Some(crate::render::hash(&block));
                }
            }
        }
        Self::audit(
            state,
            "system",
            "ACCOUNT_KEY_HASH_UPDATED",
            &format!("{} account(s)", ids.len()),
        );
    }

    fn mark_dirty(state: &mut State, mutation: Mutation) {
        let ids = Self::resolve_affected(state, &mutation);
        Self::restamp_key_hashes(state, &ids);
    }

    fn audit(state: &mut State, os_user: &str, action: &str, details: &str) {
        let id = state.next_audit_id;
        state.next_audit_id += 1;
        state.audit_log.push(AuditLogEntry {
            id,
            timestamp: Utc::now(),
            os_user: os_user.to_string(),
            action: action.to_string(),
            details: details.to_string(),
        });
    }
}

impl Store for FakeStore {
    fn add_account(
        &self,
        username: &str,
        hostname: &str,
        label: Option<&str>,
        tags: &[String],
    ) -> Result<AccountId> {
        let mut state = self.state.lock();
        if state
            .accounts
            .values()
            .any(|a| a.username == username && a.hostname == hostname)
        {
            return Err(KeymasterError::Conflict(format!(
                "account {username}@{hostname} already exists"
            )));
        }
        let id = state.next_account_id;
        state.next_account_id += 1;
        state.accounts.insert(
            id,
            Account {
                id,
                username: username.to_string(),
                hostname: hostname.to_string(),
                label: label.map(String::from),
                tags: tags.to_vec(),
                serial: 0,
                is_active: true,
                is_dirty: true,
                key_hash: None,
            },
        );
        Self::audit(
            &mut state,
            "system",
            "ACCOUNT_CREATED",
            &format!("{username}@{hostname}"),
        );
        Ok(id)
    }

    fn get_account(&self, id: AccountId) -> Result<Account> {
        self.state
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.state.lock().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    fn find_account_by_user_host(
        &self,
        username: &str,
        hostname: &str,
    ) -> Result<Option<Account>> {
        Ok(self
            .state
            .lock()
            .accounts
            .values()
            .find(|a| a.username == username && a.hostname == hostname)
            .cloned())
    }

    fn set_account_active(&self, id: AccountId, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))?
            .is_active = active;
        Self::mark_dirty(&mut state, Mutation::SingleAccount(id));
        Self::audit(&mut state, "system", "ACCOUNT_ACTIVE_SET", &format!("{id}={active}"));
        Ok(())
    }

    fn delete_account(&self, id: AccountId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .accounts
            .remove(&id)
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))?;
        state.assignments.retain(|(_, acc)| *acc != id);
        Self::audit(&mut state, "system", "ACCOUNT_DELETED", &format!("{id}"));
        Ok(())
    }

    fn update_account_serial(&self, id: AccountId, serial: Serial) -> Result<()> {
        let mut state = self.state.lock();
        state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))?
            .serial = serial;
        Ok(())
    }

    fn clear_dirty(&self, id: AccountId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))?
            .is_dirty = false;
        Ok(())
    }

    fn set_account_key_hash(&self, id: AccountId, hash: [u8; 32]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| KeymasterError::NotFound(format!("account {id}")))?
            .key_hash = Some(hash);
        Ok(())
    }

    fn add_key(
        &self,
        algorithm: &str,
        key_data: &str,
        comment: &str,
        is_global: bool,
    ) -> Result<KeyId> {
        let mut state = self.state.lock();
        if state.keys.values().any(|k| k.comment == comment) {
            return Err(KeymasterError::Conflict(format!(
                "key with comment {comment} already exists"
            )));
        }
        let id = state.next_key_id;
        state.next_key_id += 1;
        state.keys.insert(
            id,
            PublicKey {
                id,
                algorithm: algorithm.to_string(),
                key_data: key_data.to_string(),
                comment: comment.to_string(),
                is_global,
                expires_at: None,
            },
        );
        if is_global {
            Self::mark_dirty(&mut state, Mutation::AllAccounts);
        }
        Self::audit(&mut state, "system", "KEY_ADDED", comment);
        Ok(id)
    }

    fn get_key(&self, id: KeyId) -> Result<PublicKey> {
        self.state
            .lock()
            .keys
            .get(&id)
            .cloned()
            .ok_or_else(|| KeymasterError::NotFound(format!("key {id}")))
    }

    fn list_keys(&self) -> Result<Vec<PublicKey>> {
        let mut keys: Vec<PublicKey> = self.state.lock().keys.values().cloned().collect();
        keys.sort_by_key(|k| k.id);
        Ok(keys)
    }

    fn list_global_keys(&self) -> Result<Vec<PublicKey>> {
        Ok(self
            .state
            .lock()
            .keys
            .values()
            .filter(|k| k.is_global)
            .cloned()
            .collect())
    }

    fn list_keys_for_account(&self, account_id: AccountId) -> Result<Vec<PublicKey>> {
        let state = self.state.lock();
        Ok(state
            .assignments
            .iter()
            .filter(|(_, acc)| *acc == account_id)
            .filter_map(|(key_id, _)| state.keys.get(key_id).cloned())
            .collect())
    }

    fn account_ids_with_key(&self, key_id: KeyId) -> Result<Vec<AccountId>> {
        Ok(self
            .state
            .lock()
            .assignments
            .iter()
            .filter(|(k, _)| *k == key_id)
            .map(|(_, acc)| *acc)
            .collect())
    }

    fn assign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.keys.contains_key(&key_id) {
            return Err(KeymasterError::NotFound(format!("key {key_id}")));
        }
        if !state.accounts.contains_key(&account_id) {
            return Err(KeymasterError::NotFound(format!("account {account_id}")));
        }
        if !state.assignments.contains(&(key_id, account_id)) {
            state.assignments.push((key_id, account_id));
        }
        Self::mark_dirty(&mut state, Mutation::SingleAccount(account_id));
        Self::audit(
            &mut state,
            "system",
            "KEY_ASSIGNED",
            &format!("key={key_id} account={account_id}"),
        );
        Ok(())
    }

    fn unassign_key(&self, key_id: KeyId, account_id: AccountId) -> Result<()> {
        let mut state = self.state.lock();
        state.assignments.retain(|pair| *pair != (key_id, account_id));
        Self::mark_dirty(&mut state, Mutation::SingleAccount(account_id));
        Self::audit(
            &mut state,
            "system",
            "KEY_UNASSIGNED",
            &format!("key={key_id} account={account_id}"),
        );
        Ok(())
    }

    fn toggle_global(&self, key_id: KeyId) -> Result<()> {
        let mut state = self.state.lock();
        let key = state
            .keys
            .get_mut(&key_id)
            .ok_or_else(|| KeymasterError::NotFound(format!("key {key_id}")))?;
        key.is_global = !key.is_global;
        Self::mark_dirty(&mut state, Mutation::AllAccounts);
        Self::audit(&mut state, "system", "KEY_GLOBAL_TOGGLED", &format!("{key_id}"));
        Ok(())
    }

    fn set_expiry(&self, key_id: KeyId, when: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.state.lock();
        let is_global = {
            let key = state
                .keys
                .get_mut(&key_id)
                .ok_or_else(|| KeymasterError::NotFound(format!("key {key_id}")))?;
            key.expires_at = when;
            key.is_global
        };
        if is_global {
            Self::mark_dirty(&mut state, Mutation::AllAccounts);
        } else {
            Self::mark_dirty(&mut state, Mutation::AccountsWithKey(key_id));
        }
        Self::audit(&mut state, "system", "KEY_EXPIRY_SET", &format!("{key_id}"));
        Ok(())
    }

    fn delete_key(&self, key_id: KeyId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.keys.contains_key(&key_id) {
            return Err(KeymasterError::NotFound(format!("key {key_id}")));
        }
        let is_global = state.keys.get(&key_id).map(|k| k.is_global).unwrap_or(false);
        let mut affected_ids = Self::resolve_affected(&state, &Mutation::AccountsWithKey(key_id));
        if is_global {
            affected_ids.extend(Self::resolve_affected(&state, &Mutation::AllAccounts));
        }
        state.assignments.retain(|(k, _)| *k != key_id);
        state.keys.remove(&key_id);
        Self::restamp_key_hashes(&mut state, &affected_ids);
        Self::audit(&mut state, "system", "KEY_DELETED", &format!("{key_id}"));
        Ok(())
    }

    fn active_system_key(&self) -> Result<SystemKey> {
        let state = self.state.lock();
        let (serial, public, private_pem) = state
            .system_keys
            .last()
            .ok_or_else(|| KeymasterError::NotFound("no active system key".into()))?;
        Ok(SystemKey {
            serial: *serial,
            public_key: public.clone(),
            private_key: Secret::new(private_pem.clone()),
            is_active: true,
        })
    }

    fn system_key_by_serial(&self, serial: Serial) -> Result<SystemKey> {
        let state = self.state.lock();
        let (found_serial, public, private_pem) = state
            .system_keys
            .iter()
            .find(|(s, _, _)| *s == serial)
            .ok_or_else(|| KeymasterError::NotFound(format!("system key serial {serial}")))?;
        let is_active = state.system_keys.last().map(|(s, _, _)| *s) == Some(*found_serial);
        Ok(SystemKey {
            serial: *found_serial,
            public_key: public.clone(),
            private_key: Secret::new(private_pem.clone()),
            is_active,
        })
    }

    fn system_key_public(&self, serial: Serial) -> Result<PublicKeyMaterial> {
        let state = self.state.lock();
        state
            .system_keys
            .iter()
            .find(|(s, _, _)| *s == serial)
            .map(|(_, public, _)| public.clone())
            .ok_or_else(|| KeymasterError::NotFound(format!("system key serial {serial}")))
    }

    fn rotate_system_key(&self, public: PublicKeyMaterial, private_pem: &str) -> Result<Serial> {
        let mut state = self.state.lock();
        let serial = state.next_serial;
        state.next_serial += 1;
        state
            .system_keys
            .push((serial, public, private_pem.to_string()));
        Self::mark_dirty(&mut state, Mutation::ActiveAccounts);
        Self::audit(&mut state, "system", "SYSTEM_KEY_ROTATED", &format!("{serial}"));
        Ok(serial)
    }

    fn get_known_host_key(&self, hostname: &str) -> Result<Option<KnownHostKey>> {
        let hostname = crate::hostname::canonicalize_hostname(hostname);
        Ok(self
            .state
            .lock()
            .known_hosts
            .get(&hostname)
            .map(|key| KnownHostKey {
                hostname: hostname.clone(),
                key: key.clone(),
            }))
    }

    fn set_known_host_key(&self, hostname: &str, key: &str) -> Result<()> {
        let hostname = crate::hostname::canonicalize_hostname(hostname);
        let mut state = self.state.lock();
        state
            .known_hosts
            .insert(hostname.clone(), key.to_string());
        Self::audit(&mut state, "system", "KNOWN_HOST_SET", &hostname);
        Ok(())
    }

    fn create_bootstrap_session(&self, session: &BootstrapSession) -> Result<()> {
        let mut state = self.state.lock();
        state
            .bootstrap_sessions
            .insert(session.id.clone(), session.clone());
        Self::audit(&mut state, "system", "BOOTSTRAP_STARTED", &session.id);
        Ok(())
    }

    fn get_bootstrap_session(&self, id: &str) -> Result<BootstrapSession> {
        self.state
            .lock()
            .bootstrap_sessions
            .get(id)
            .cloned()
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {id}")))
    }

    fn list_active_bootstrap_sessions(&self) -> Result<Vec<BootstrapSession>> {
        Ok(self
            .state
            .lock()
            .bootstrap_sessions
            .values()
            .filter(|s| s.status == BootstrapStatus::Active)
            .cloned()
            .collect())
    }

    fn list_expired_or_orphaned_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<BootstrapSession>> {
        Ok(self
            .state
            .lock()
            .bootstrap_sessions
            .values()
            .filter(|s| s.status == BootstrapStatus::Orphaned || s.expires_at <= now)
            .cloned()
            .collect())
    }

    fn set_bootstrap_status(&self, id: &str, status: BootstrapStatus) -> Result<()> {
        let mut state = self.state.lock();
        state
            .bootstrap_sessions
            .get_mut(id)
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {id}")))?
            .status = status;
        Ok(())
    }

    fn delete_bootstrap_session(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .bootstrap_sessions
            .remove(id)
            .ok_or_else(|| KeymasterError::NotFound(format!("bootstrap session {id}")))?;
        Ok(())
    }

    fn append_audit(&self, os_user: &str, action: &str, details: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::audit(&mut state, os_user, action, details);
        Ok(())
    }

    fn list_audit_log(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let state = self.state.lock();
        let mut entries = state.audit_log.clone();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_account_is_a_conflict() {
        let store = FakeStore::new();
        store.add_account("alice", "host1", None, &[]).unwrap();
        let err = store.add_account("alice", "host1", None, &[]).unwrap_err();
        assert!(matches!(err, KeymasterError::Conflict(_)));
    }

    #[test]
    fn new_account_is_born_dirty() {
        let store = FakeStore::new();
        let id = store.add_account("alice", "host1", None, &[]).unwrap();
        assert!(store.get_account(id).unwrap().is_dirty);
    }

    #[test]
    fn toggle_global_marks_every_account_dirty() {
        let store = FakeStore::new();
        let a = store.add_account("alice", "h1", None, &[]).unwrap();
        let b = store.add_account("bob", "h2", None, &[]).unwrap();
        store.clear_dirty(a).unwrap();
        store.clear_dirty(b).unwrap();
        let key = store.add_key("ssh-ed25519", "AAAA", "k1", false).unwrap();
        store.clear_dirty(a).unwrap();
        store.clear_dirty(b).unwrap();

        store.toggle_global(key).unwrap();

        assert!(store.get_account(a).unwrap().is_dirty);
        assert!(store.get_account(b).unwrap().is_dirty);
    }

    #[test]
    fn assign_key_is_idempotent() {
        let store = FakeStore::new();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        let key = store.add_key("ssh-ed25519", "AAAA", "k1", false).unwrap();
        store.assign_key(key, acc).unwrap();
        store.assign_key(key, acc).unwrap();
        assert_eq!(store.list_keys_for_account(acc).unwrap().len(), 1);
    }

    #[test]
    fn rotate_system_key_marks_all_active_accounts_dirty() {
        let store = FakeStore::new();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        store.clear_dirty(acc).unwrap();

        let serial = store
            .rotate_system_key(
                PublicKeyMaterial {
                    algorithm: "ssh-ed25519".into(),
                    key_data: "SYS1".into(),
                },
                "PEM-1",
            )
            .unwrap();

        assert_eq!(serial, 1);
        assert!(store.get_account(acc).unwrap().is_dirty);
        assert!(store.active_system_key().unwrap().is_active);
    }

    #[test]
    fn rotate_system_key_recomputes_key_hash_for_active_accounts() {
        let store = FakeStore::new();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        store
            .rotate_system_key(
                PublicKeyMaterial {
                    algorithm: "ssh-ed25519".into(),
                    key_data: "SYS1".into(),
                },
                "PEM-1",
            )
            .unwrap();
        let hash_after_first = store.get_account(acc).unwrap().key_hash;
        assert!(hash_after_first.is_some());

        store
            .rotate_system_key(
                PublicKeyMaterial {
                    algorithm: "ssh-ed25519".into(),
                    key_data: "SYS2".into(),
                },
                "PEM-2",
            )
            .unwrap();
        let hash_after_second = store.get_account(acc).unwrap().key_hash;
        assert_ne!(hash_after_first, hash_after_second);
    }

    #[test]
    fn delete_key_removes_assignments_and_the_key() {
        let store = FakeStore::new();
        let acc = store.add_account("alice", "h1", None, &[]).unwrap();
        let key = store.add_key("ssh-ed25519", "AAAA", "k1", false).unwrap();
        store.assign_key(key, acc).unwrap();

        store.delete_key(key).unwrap();

        assert!(store.get_key(key).is_err());
        assert!(store.list_keys_for_account(acc).unwrap().is_empty());
    }
}
