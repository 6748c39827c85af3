//! Entity store contract (§6), consumed by the selector for read snapshots
//! and idempotent writes — never write locks. One HTTP/JSON implementation,
//! same shape as the teacher's `EtcdClient`/`ConsulClient` (a thin `Clone`
//! wrapper around a pooled `reqwest::Client`), plus an in-memory fake for
//! tests.

pub mod http_store;
pub mod memory_store;

pub use http_store::HttpEntityStore;
pub use memory_store::InMemoryEntityStore;

use crate::entities::{Account, Group};
use crate::error::CoreResult;
use crate::ids::{AccountId, GroupId, SessionHash};
use async_trait::async_trait;

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_group(&self, group_id: &GroupId) -> CoreResult<Option<Group>>;
    async fn list_accounts_by_group(&self, group_id: &GroupId) -> CoreResult<Vec<Account>>;
    async fn pause_account_for_30m_limit(
        &self,
        account_id: &AccountId,
        cooldown_minutes: u32,
        count: u64,
    ) -> CoreResult<()>;
    async fn bind_sticky_session(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
        account_id: &AccountId,
    ) -> CoreResult<()>;
    async fn get_sticky_account(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
    ) -> CoreResult<Option<AccountId>>;
}
