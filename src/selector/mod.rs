//! C4 — Account Selector (§4.4). Sits between the entity store (read-only
//! snapshots) and C1/C3 (the actual slot attempt); never holds a write lock,
//! so concurrent selections racing on the same account are resolved by the
//! slot store, not by anything in here.

use crate::concurrency::release::ReleaseHandle;
use crate::concurrency::{AccountSlotOutcome, ConcurrencyManager};
use crate::config::{ConcurrencyConfig, LoadBalancingConfig};
use crate::entities::Account;
use crate::error::{CoreError, CoreResult};
use crate::ids::{AccountId, GroupId, ModelCategory, SessionHash};
use crate::kvstore::KvStore;
use crate::scheduler::{self, SlotAcquisition, SlotHandle};
use crate::store::EntityStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returned when step 7 of §4.4 cannot acquire any candidate immediately:
/// the pipeline enters the wait loop against this account instead.
#[derive(Debug, Clone)]
pub struct WaitPlan {
    pub account_id: AccountId,
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub max_waiting: u32,
    /// Carried through so the wait loop knows whether to retry via C3 (the
    /// session scheduler) or the plain account-slot path (§8: empty session
    /// hash never invokes C3).
    pub has_session: bool,
}

/// A pre-acquired slot, either session-partitioned (C3) or the plain
/// account-wide slot taken on the empty-`sessionHash` fast path (§8).
pub enum SelectedSlot {
    Session(SlotHandle),
    Account { key: String, member: String },
    /// `maxConcurrency <= 0`: always "acquired", nothing to release.
    Unlimited,
}

impl SelectedSlot {
    /// Slot index for the pacing cache key; the plain account path has no
    /// category-partitioned index, so it uses a fixed slot of `0`.
    pub fn slot_number(&self) -> u32 {
        match self {
            SelectedSlot::Session(handle) => handle.slot,
            SelectedSlot::Account { .. } | SelectedSlot::Unlimited => 0,
        }
    }

    pub fn into_release_handle(self, store: Arc<dyn KvStore>, cancel: CancellationToken) -> ReleaseHandle {
        match self {
            SelectedSlot::Session(handle) => handle.into_release_handle(store, cancel),
            SelectedSlot::Account { key, member } => {
                crate::concurrency::release::slot_release_handle(store, key, member, cancel)
            }
            SelectedSlot::Unlimited => crate::concurrency::release::noop_release_handle(cancel),
        }
    }
}

pub enum Selected {
    /// A slot was pre-acquired; the caller owns `handle` and must release it.
    Acquired { account: Account, handle: SelectedSlot },
    /// No immediate slot; caller should enqueue against `plan.account_id`.
    Wait { account: Account, plan: WaitPlan },
}

pub struct AccountSelector {
    entity_store: Arc<dyn EntityStore>,
    kv: Arc<dyn KvStore>,
    concurrency_mgr: Arc<ConcurrencyManager>,
    concurrency: ConcurrencyConfig,
    load_balancing: LoadBalancingConfig,
}

impl AccountSelector {
    pub fn new(
        entity_store: Arc<dyn EntityStore>,
        kv: Arc<dyn KvStore>,
        concurrency_mgr: Arc<ConcurrencyManager>,
        concurrency: ConcurrencyConfig,
        load_balancing: LoadBalancingConfig,
    ) -> Self {
        Self {
            entity_store,
            kv,
            concurrency_mgr,
            concurrency,
            load_balancing,
        }
    }

    /// §4.4 steps 1-8. `requested_model` is the caller's raw model string;
    /// returns the group-mapped model alongside the selection so the
    /// pipeline can overwrite `RequestContext::model`.
    #[allow(clippy::too_many_arguments)]
    pub async fn select(
        &self,
        group_id: &GroupId,
        session: &SessionHash,
        requested_model: &str,
        model_category: ModelCategory,
        is_claude_code_client: bool,
        failed_accounts: &HashSet<AccountId>,
        max_wait_seconds: u64,
        max_waiting: u32,
        request_id: &str,
    ) -> CoreResult<(String, Selected)> {
        let (group_id, group) = self.resolve_group(group_id, is_claude_code_client).await?;

        if !group.is_model_allowed(requested_model) {
            return Err(CoreError::InvalidRequest(format!(
                "model {requested_model} not permitted for group {group_id}"
            )));
        }
        let mapped_model = group.map_model(requested_model).to_string();

        let mut candidates: Vec<Account> = self
            .entity_store
            .list_accounts_by_group(&group_id)
            .await?
            .into_iter()
            .filter(|a| a.schedulable && !failed_accounts.contains(&a.id))
            .collect();
        if candidates.is_empty() {
            return Err(CoreError::NoSchedulableAccount);
        }

        if let Some(sticky_id) = self.entity_store.get_sticky_account(&group_id, session).await? {
            if let Some(pos) = candidates.iter().position(|a| a.id == sticky_id) {
                let sticky = candidates.remove(pos);
                candidates.insert(0, sticky);
            }
        }

        let loads = self.batch_load(&candidates).await?;
        self.sort_candidates(&mut candidates, &loads);

        let slot_ttl = Duration::from_secs(self.concurrency.slot_ttl_minutes * 60);
        let binding_ttl = Duration::from_secs(self.concurrency.session_binding_ttl_minutes * 60);
        let has_session = !session.as_str().is_empty();

        if has_session {
            for account in &candidates {
                match scheduler::acquire_session_slot(
                    self.kv.as_ref(),
                    account,
                    session,
                    model_category,
                    slot_ttl,
                    binding_ttl,
                    self.concurrency.haiku_max_parallel,
                )
                .await?
                {
                    SlotAcquisition::Acquired(handle) => {
                        self.entity_store
                            .bind_sticky_session(&group_id, session, &account.id)
                            .await?;
                        return Ok((
                            mapped_model,
                            Selected::Acquired {
                                account: account.clone(),
                                handle: SelectedSlot::Session(handle),
                            },
                        ));
                    }
                    SlotAcquisition::Full { .. } => continue,
                }
            }
        } else {
            // §8: empty session hash takes the plain account-slot path; C3
            // (the session scheduler) is never invoked.
            for account in &candidates {
                match self
                    .concurrency_mgr
                    .acquire_account_slot(&account.id, account.concurrency_limit, request_id)
                    .await?
                {
                    AccountSlotOutcome::Acquired { key, member } => {
                        return Ok((
                            mapped_model,
                            Selected::Acquired {
                                account: account.clone(),
                                handle: SelectedSlot::Account { key, member },
                            },
                        ));
                    }
                    AccountSlotOutcome::Unlimited => {
                        return Ok((
                            mapped_model,
                            Selected::Acquired {
                                account: account.clone(),
                                handle: SelectedSlot::Unlimited,
                            },
                        ));
                    }
                    AccountSlotOutcome::Full => continue,
                }
            }
        }

        let best = candidates.into_iter().next().expect("checked non-empty above");
        let plan = WaitPlan {
            account_id: best.id.clone(),
            max_concurrency: best.concurrency_limit,
            timeout: Duration::from_secs(max_wait_seconds),
            max_waiting,
            has_session,
        };
        Ok((mapped_model, Selected::Wait { account: best, plan }))
    }

    /// §4.4 step 1: `claudeCodeOnly` redirect-or-fail.
    async fn resolve_group(
        &self,
        group_id: &GroupId,
        is_claude_code_client: bool,
    ) -> CoreResult<(GroupId, crate::entities::Group)> {
        let group = self
            .entity_store
            .get_group(group_id)
            .await?
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown group {group_id}")))?;

        if !group.claude_code_only || is_claude_code_client {
            return Ok((group_id.clone(), group));
        }

        match &group.fallback_group_id {
            Some(fallback_id) => {
                let fallback = self
                    .entity_store
                    .get_group(fallback_id)
                    .await?
                    .ok_or_else(|| CoreError::AccessDenied("claude_code_only".to_string()))?;
                Ok((fallback_id.clone(), fallback))
            }
            None => Err(CoreError::AccessDenied("claude_code_only".to_string())),
        }
    }

    /// §4.4 step 5: one batch load query across all candidates.
    async fn batch_load(
        &self,
        candidates: &[Account],
    ) -> CoreResult<std::collections::HashMap<AccountId, crate::kvstore::AccountLoad>> {
        let slot_ttl = Duration::from_secs(self.concurrency.slot_ttl_minutes * 60);
        let window = Duration::from_secs(self.load_balancing.window_minutes * 60);
        let accounts: Vec<(AccountId, u32)> = candidates
            .iter()
            .map(|a| (a.id.clone(), a.concurrency_limit))
            .collect();
        self.kv.load_batch(slot_ttl, window, &accounts).await
    }

    /// §4.4 step 6. The sticky candidate (if present) was already moved to
    /// index 0 by the caller and is excluded from the sort so it keeps its
    /// priority slot.
    fn sort_candidates(
        &self,
        candidates: &mut [Account],
        loads: &std::collections::HashMap<AccountId, crate::kvstore::AccountLoad>,
    ) {
        let sticky = candidates.first().cloned();
        let start = if sticky.is_some() { 1 } else { 0 };
        let rest = &mut candidates[start..];

        if !self.load_balancing.enabled {
            rest.sort_by(|a, b| {
                let la = loads.get(&a.id).map(|l| l.load_percent).unwrap_or(0.0);
                let lb = loads.get(&b.id).map(|l| l.load_percent).unwrap_or(0.0);
                a.priority
                    .cmp(&b.priority)
                    .then(la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal))
            });
            return;
        }

        let max_request_count = rest
            .iter()
            .map(|a| loads.get(&a.id).map(|l| l.request_count).unwrap_or(0))
            .max()
            .unwrap_or(0);
        let base = (max_request_count as f64).max(100.0);
        let offset = self.load_balancing.offset_percent;

        rest.sort_by(|a, b| {
            let ra = loads.get(&a.id).map(|l| l.request_count).unwrap_or(0);
            let rb = loads.get(&b.id).map(|l| l.request_count).unwrap_or(0);
            let ea = ra as f64 + (a.priority as f64 - 1.0) * offset * base / 100.0;
            let eb = rb as f64 + (b.priority as f64 - 1.0) * offset * base / 100.0;
            ea.partial_cmp(&eb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ra.cmp(&rb))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;
    use crate::store::InMemoryEntityStore;

    fn account(id: &str, priority: u32, limit: u32) -> Account {
        Account {
            id: AccountId::from(id.to_string()),
            platform: "test".to_string(),
            priority,
            concurrency_limit: limit,
            max_rpm: 1000,
            max_30m_requests: 1000,
            cooldown_minutes: 10,
            schedulable: true,
        }
    }

    fn group(id: &str) -> crate::entities::Group {
        crate::entities::Group {
            id: GroupId::from(id.to_string()),
            platform: "test".to_string(),
            claude_code_only: false,
            fallback_group_id: None,
            allowed_models: Default::default(),
            model_mapping: Default::default(),
        }
    }

    fn selector() -> (AccountSelector, Arc<InMemoryEntityStore>) {
        let entity_store = Arc::new(InMemoryEntityStore::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let concurrency_mgr = Arc::new(ConcurrencyManager::new(
            kv.clone(),
            ConcurrencyConfig::default(),
            crate::config::WaitQueueConfig::default(),
            crate::config::BackoffConfig::default(),
        ));
        let selector = AccountSelector::new(
            entity_store.clone(),
            kv,
            concurrency_mgr,
            ConcurrencyConfig::default(),
            LoadBalancingConfig::default(),
        );
        (selector, entity_store)
    }

    #[tokio::test]
    async fn picks_the_only_account_and_acquires_a_slot() {
        let (selector, store) = selector();
        store.put_group(group("g1"));
        store.put_accounts(GroupId::from("g1"), vec![account("a1", 1, 6)]);

        let (_model, selected) = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from("s1"),
                "claude-3-opus",
                ModelCategory::Heavy,
                true,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await
            .unwrap();
        match selected {
            Selected::Acquired { account, .. } => assert_eq!(account.id.as_str(), "a1"),
            Selected::Wait { .. } => panic!("expected immediate acquisition"),
        }
    }

    #[tokio::test]
    async fn no_schedulable_accounts_is_an_error() {
        let (selector, store) = selector();
        store.put_group(group("g1"));
        store.put_accounts(GroupId::from("g1"), vec![]);

        let err = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from("s1"),
                "claude-3-opus",
                ModelCategory::Heavy,
                true,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await;
        assert!(matches!(err, Err(CoreError::NoSchedulableAccount)));
    }

    #[tokio::test]
    async fn claude_code_only_without_client_falls_back_when_configured() {
        let (selector, store) = selector();
        let mut restricted = group("g1");
        restricted.claude_code_only = true;
        restricted.fallback_group_id = Some(GroupId::from("g2"));
        store.put_group(restricted);
        store.put_group(group("g2"));
        store.put_accounts(GroupId::from("g2"), vec![account("a2", 1, 6)]);

        let (_model, selected) = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from("s1"),
                "claude-3-opus",
                ModelCategory::Heavy,
                false,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await
            .unwrap();
        match selected {
            Selected::Acquired { account, .. } => assert_eq!(account.id.as_str(), "a2"),
            Selected::Wait { .. } => panic!("expected immediate acquisition"),
        }
    }

    #[tokio::test]
    async fn claude_code_only_without_fallback_is_denied() {
        let (selector, store) = selector();
        let mut restricted = group("g1");
        restricted.claude_code_only = true;
        store.put_group(restricted);
        store.put_accounts(GroupId::from("g1"), vec![account("a1", 1, 6)]);

        let err = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from("s1"),
                "claude-3-opus",
                ModelCategory::Heavy,
                false,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await;
        assert!(matches!(err, Err(CoreError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn disallowed_model_is_rejected() {
        let (selector, store) = selector();
        let mut g = group("g1");
        g.allowed_models.insert("claude-3-haiku".to_string());
        store.put_group(g);
        store.put_accounts(GroupId::from("g1"), vec![account("a1", 1, 6)]);

        let err = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from("s1"),
                "claude-3-opus",
                ModelCategory::Heavy,
                true,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await;
        assert!(matches!(err, Err(CoreError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn empty_session_hash_takes_the_plain_account_slot_path() {
        let (selector, store) = selector();
        store.put_group(group("g1"));
        store.put_accounts(GroupId::from("g1"), vec![account("a1", 1, 1)]);

        let (_model, selected) = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from(""),
                "claude-3-opus",
                ModelCategory::Heavy,
                true,
                &HashSet::new(),
                30,
                70,
                "r1",
            )
            .await
            .unwrap();
        let handle = match selected {
            Selected::Acquired { account, handle } => {
                assert_eq!(account.id.as_str(), "a1");
                handle
            }
            Selected::Wait { .. } => panic!("expected immediate acquisition"),
        };
        assert!(matches!(handle, SelectedSlot::Account { .. }));

        // The account's single slot is now held by the plain account path;
        // a second empty-session request must find it full and fall back
        // to the wait plan, not retry the session-scheduler's T-expanded
        // pool.
        let (_model, second) = selector
            .select(
                &GroupId::from("g1"),
                &SessionHash::from(""),
                "claude-3-opus",
                ModelCategory::Heavy,
                true,
                &HashSet::new(),
                30,
                70,
                "r2",
            )
            .await
            .unwrap();
        match second {
            Selected::Wait { plan, .. } => assert!(!plan.has_session),
            Selected::Acquired { .. } => panic!("account slot should already be held"),
        }
    }
}
