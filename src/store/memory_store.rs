use super::EntityStore;
use crate::entities::{Account, Group};
use crate::error::CoreResult;
use crate::ids::{AccountId, GroupId, SessionHash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory `EntityStore` fake for tests: pre-seed groups/accounts, then
/// exercise the selector and pipeline without an HTTP backend.
#[derive(Default)]
pub struct InMemoryEntityStore {
    groups: Mutex<HashMap<GroupId, Group>>,
    accounts: Mutex<HashMap<GroupId, Vec<Account>>>,
    sticky: Mutex<HashMap<(GroupId, SessionHash), AccountId>>,
    paused: Mutex<Vec<(AccountId, u32, u64)>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_group(&self, group: Group) {
        self.groups.lock().unwrap().insert(group.id.clone(), group);
    }

    pub fn put_accounts(&self, group_id: GroupId, accounts: Vec<Account>) {
        self.accounts.lock().unwrap().insert(group_id, accounts);
    }

    pub fn pause_calls(&self) -> Vec<(AccountId, u32, u64)> {
        self.paused.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_group(&self, group_id: &GroupId) -> CoreResult<Option<Group>> {
        Ok(self.groups.lock().unwrap().get(group_id).cloned())
    }

    async fn list_accounts_by_group(&self, group_id: &GroupId) -> CoreResult<Vec<Account>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn pause_account_for_30m_limit(
        &self,
        account_id: &AccountId,
        cooldown_minutes: u32,
        count: u64,
    ) -> CoreResult<()> {
        self.paused
            .lock()
            .unwrap()
            .push((account_id.clone(), cooldown_minutes, count));
        Ok(())
    }

    async fn bind_sticky_session(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
        account_id: &AccountId,
    ) -> CoreResult<()> {
        self.sticky
            .lock()
            .unwrap()
            .insert((group_id.clone(), session.clone()), account_id.clone());
        Ok(())
    }

    async fn get_sticky_account(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
    ) -> CoreResult<Option<AccountId>> {
        Ok(self
            .sticky
            .lock()
            .unwrap()
            .get(&(group_id.clone(), session.clone()))
            .cloned())
    }
}
