//! The Dirty Tracker: a pure function from "what mutation just happened" to "which accounts
//! need their managed block re-rendered", per spec.md §4.2. Kept free of any Store or I/O
//! dependency so it can be unit-tested as plain data in, data out.

use std::collections::BTreeSet;

use crate::model::{AccountId, KeyId};

/// What changed. Each Store mutation maps to exactly one variant; `render::render_managed_block`
/// never runs against anything the tracker didn't mark dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Global membership changed for everyone: `toggle_global`, a key created/deleted while
    /// global, or a global key's expiry changing. Marks literally every account, active or not —
    /// the source this was distilled from dirties inactive accounts here too, so this preserves
    /// that rather than narrowing it to active accounts.
    AllAccounts,
    /// A change whose effect is scoped to accounts that are active right now, e.g. system-key
    /// rotation (only active accounts are ever redeployed against the new serial).
    ActiveAccounts,
    /// A key's assignment set, comment, or non-global expiry changed: every account currently
    /// holding it.
    AccountsWithKey(KeyId),
    /// A single account's own fields changed (tags unaffected; label/active-flag do).
    SingleAccount(AccountId),
}

/// A minimal read-only view of the fleet the tracker needs to resolve a [`Mutation`] into the
/// concrete set of account ids to mark dirty. Implemented by `Store` and by `FakeStore` directly,
/// no trait needed since `affected` only ever borrows slices/closures.
pub struct DirtyView<'a> {
    pub all_account_ids: &'a [AccountId],
    pub active_account_ids: &'a [AccountId],
    pub account_ids_with_key: &'a dyn Fn(KeyId) -> Vec<AccountId>,
}

/// Resolve a mutation to the set of accounts whose managed block is now stale.
pub fn affected(mutation: &Mutation, view: &DirtyView<'_>) -> BTreeSet<AccountId> {
    match mutation {
        Mutation::AllAccounts => view.all_account_ids.iter().copied().collect(),
        Mutation::ActiveAccounts => view.active_account_ids.iter().copied().collect(),
        Mutation::AccountsWithKey(key_id) => (view.account_ids_with_key)(*key_id)
            .into_iter()
            .collect(),
        Mutation::SingleAccount(account_id) => {
            let mut set = BTreeSet::new();
            set.insert(*account_id);
            set
        }
    }
}
