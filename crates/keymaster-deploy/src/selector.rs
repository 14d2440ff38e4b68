//! Resolves a fleet operation's target accounts: all active accounts, a tag filter, or an
//! explicit list of identifiers (numeric id, `user@host`, or label), per spec.md §4.5.

use keymaster_core::model::{Account, AccountId};
use keymaster_core::store::Store;
use keymaster_core::Result;

#[derive(Debug, Clone)]
pub enum Selector {
    AllActive,
    Tag(String),
    Identifiers(Vec<String>),
}

/// One identifier resolves to exactly one account: try numeric id first, then `user@host`,
/// then label. A label that matches more than one account is ambiguous and returned as a
/// `NotFound` rather than picking arbitrarily.
fn resolve_identifier(store: &dyn Store, identifier: &str) -> Result<Account> {
    if let Ok(id) = identifier.parse::<AccountId>() {
        if let Ok(account) = store.get_account(id) {
            return Ok(account);
        }
    }

    if let Some((username, hostname)) = identifier.split_once('@') {
        if let Some(account) = store.find_account_by_user_host(username, hostname)? {
            return Ok(account);
        }
    }

    let matches: Vec<Account> = store
        .list_accounts()?
        .into_iter()
        .filter(|a| a.label.as_deref() == Some(identifier))
        .collect();
    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap()),
        0 => Err(keymaster_core::KeymasterError::NotFound(format!(
            "no account matches identifier {identifier}"
        ))),
        _ => Err(keymaster_core::KeymasterError::Conflict(format!(
            "identifier {identifier} matches more than one account by label"
        ))),
    }
}

pub fn resolve(store: &dyn Store, selector: &Selector) -> Result<Vec<Account>> {
    match selector {
        Selector::AllActive => Ok(store
            .list_accounts()?
            .into_iter()
            .filter(|a| a.is_active)
            .collect()),
        Selector::Tag(tag) => Ok(store
            .list_accounts()?
            .into_iter()
            .filter(|a| a.is_active && a.tags.iter().any(|t| t == tag))
            .collect()),
        Selector::Identifiers(identifiers) => identifiers
            .iter()
            .map(|identifier| resolve_identifier(store, identifier))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymaster_core::store::fake::FakeStore;

    fn seeded() -> FakeStore {
        let store = FakeStore::new();
        store
            .add_account("alice", "h1", Some("web-1"), &["prod".to_string()])
            .unwrap();
        store
            .add_account("bob", "h2", None, &["staging".to_string()])
            .unwrap();
        store
    }

    #[test]
    fn all_active_returns_every_active_account() {
        let store = seeded();
        let accounts = resolve(&store, &Selector::AllActive).unwrap();
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn tag_filters_to_matching_accounts() {
        let store = seeded();
        let accounts = resolve(&store, &Selector::Tag("prod".to_string())).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, "alice");
    }

    #[test]
    fn identifiers_resolve_by_id_user_host_and_label() {
        let store = seeded();
        let by_id = resolve_identifier(&store, "1").unwrap();
        assert_eq!(by_id.username, "alice");

        let by_user_host = resolve_identifier(&store, "bob@h2").unwrap();
        assert_eq!(by_user_host.id, 2);

        let by_label = resolve_identifier(&store, "web-1").unwrap();
        assert_eq!(by_label.username, "alice");
    }

    #[test]
    fn unknown_identifier_is_not_found() {
        let store = seeded();
        assert!(resolve_identifier(&store, "nope@nowhere").is_err());
    }
}
