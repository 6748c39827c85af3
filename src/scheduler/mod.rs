//! C3 — Session Scheduler (§4.3). Pure synchronous hashing/range logic; the
//! only I/O this module performs is through `KvStore`'s session-aware
//! primitives, so the hashing and range-splitting rules themselves are
//! exhaustively unit-testable without a store at all.

pub mod hash;

use crate::entities::Account;
use crate::error::CoreResult;
use crate::ids::{ModelCategory, SessionHash};
use crate::kvstore::{keys, KvStore, SessionAcquire};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// [rangeStart, rangeEnd) for one model category against a pool of `total`
/// slots (§4.3). For `total == 1` heavy and medium both get `[0, 1)`.
pub fn category_range(category: ModelCategory, total: u32) -> (u32, u32) {
    if total <= 1 {
        return (0, total.max(1));
    }
    match category {
        ModelCategory::Heavy => (0, total / 2),
        ModelCategory::Medium => (total / 2, total),
        ModelCategory::Light => (0, total),
    }
}

/// `haiku_max_parallel` (configured, default 3) caps same-session sharing
/// for light models; heavy/medium never share a slot across requests.
fn max_parallel_for(category: ModelCategory, haiku_max_parallel: u32) -> u32 {
    match category {
        ModelCategory::Light => haiku_max_parallel,
        ModelCategory::Heavy | ModelCategory::Medium => 1,
    }
}

/// Outcome of `acquire_session_slot` (§4.3 step 7).
pub enum SlotAcquisition {
    Acquired(SlotHandle),
    /// The range is saturated; `target` is the hash-computed slot the
    /// pipeline's wait loop should keep retrying against.
    Full { target: u32 },
}

/// Release handle for a session-aware slot. Dropping without calling
/// `release()` leaks the slot until TTL expiry — `concurrency::SessionSlotGuard`
/// wraps this with the crate's standard cancel-aware release-once pattern.
pub struct SlotHandle {
    pub account_id: crate::ids::AccountId,
    pub session: SessionHash,
    pub slot: u32,
    owner_key: String,
    slot_key: String,
}

impl SlotHandle {
    pub async fn release(&self, store: &dyn KvStore) -> CoreResult<()> {
        store
            .release_slot_with_session(&self.owner_key, &self.slot_key, self.slot, self.session.as_str())
            .await
    }

    /// Wraps this handle in the crate's standard cancel-aware release-once
    /// guard (`concurrency::release`), so a cancelled request frees it even
    /// if the pipeline never reaches its normal release point.
    pub fn into_release_handle(
        self,
        store: Arc<dyn KvStore>,
        cancel: CancellationToken,
    ) -> crate::concurrency::release::ReleaseHandle {
        crate::concurrency::release::session_slot_release_handle(
            store,
            self.owner_key,
            self.slot_key,
            self.slot,
            self.session.to_string(),
            cancel,
        )
    }
}

/// `hashToSlotIndex(sessionHash, rangeSize)` — sum of bytes mod `rangeSize`
/// (§4.3). Deliberately weak; see DESIGN.md for why this is not swapped for
/// a stronger hash.
pub fn hash_to_slot_index(session: &SessionHash, range_size: u32) -> u32 {
    if range_size == 0 {
        return 0;
    }
    let sum: u64 = session.as_str().bytes().map(u64::from).sum();
    (sum % range_size as u64) as u32
}

/// §4.3 `acquireSessionSlot`. `max_concurrency <= 0` is the no-limit fast
/// path (step 1); callers for that case should skip this function entirely
/// and use a nop release, since there is no slot store entry to create.
#[allow(clippy::too_many_arguments)]
pub async fn acquire_session_slot(
    store: &dyn KvStore,
    account: &Account,
    session: &SessionHash,
    category: ModelCategory,
    slot_ttl: Duration,
    binding_ttl: Duration,
    haiku_max_parallel: u32,
) -> CoreResult<SlotAcquisition> {
    let total = account.total_slots();
    let (range_start, range_end) = category_range(category, total);
    let max_parallel = max_parallel_for(category, haiku_max_parallel);
    let binding_key = keys::session_slot(&account.id, session);

    // Step 2-4: existing binding.
    if let Some(bound) = store.get_session_binding(&binding_key).await? {
        if bound >= range_start && bound < range_end {
            if let Some(handle) = try_acquire(
                store,
                account,
                session,
                bound,
                max_parallel,
                slot_ttl,
            )
            .await?
            {
                store
                    .set_session_binding(&binding_key, bound, binding_ttl)
                    .await?;
                return Ok(SlotAcquisition::Acquired(handle));
            }
            // Falls through to step 5 (re-derive target, scan range).
        }
        // Binding outside current range (model switch): discarded implicitly
        // by recomputing the target below; a stale binding is simply
        // overwritten on the next successful acquire.
    }

    // Step 5: computed target.
    let range_size = range_end - range_start;
    let target = range_start + hash_to_slot_index(session, range_size);
    if let Some(handle) = try_acquire(store, account, session, target, max_parallel, slot_ttl).await? {
        store
            .set_session_binding(&binding_key, target, binding_ttl)
            .await?;
        return Ok(SlotAcquisition::Acquired(handle));
    }

    // Step 6: rotational scan within [range_start, range_end), excluding target.
    for offset in 1..range_size {
        let candidate = range_start + (target - range_start + offset) % range_size;
        if let Some(handle) =
            try_acquire(store, account, session, candidate, max_parallel, slot_ttl).await?
        {
            store
                .set_session_binding(&binding_key, candidate, binding_ttl)
                .await?;
            return Ok(SlotAcquisition::Acquired(handle));
        }
    }

    // Step 7: saturated.
    Ok(SlotAcquisition::Full { target })
}

async fn try_acquire(
    store: &dyn KvStore,
    account: &Account,
    session: &SessionHash,
    slot: u32,
    max_parallel: u32,
    ttl: Duration,
) -> CoreResult<Option<SlotHandle>> {
    let owner_key = keys::slot_owner(&account.id, slot);
    let slot_key = keys::concurrency_account(&account.id);
    let outcome = store
        .acquire_slot_with_session(&owner_key, &slot_key, ttl, slot, session.as_str(), max_parallel)
        .await?;
    Ok(match outcome {
        SessionAcquire::Acquired => Some(SlotHandle {
            account_id: account.id.clone(),
            session: session.clone(),
            slot,
            owner_key,
            slot_key,
        }),
        SessionAcquire::Full => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;

    fn session(s: &str) -> SessionHash {
        SessionHash::from(s.to_string())
    }

    fn account(concurrency_limit: u32) -> Account {
        Account {
            id: crate::ids::AccountId::from("acc-1".to_string()),
            platform: "test".to_string(),
            priority: 1,
            concurrency_limit,
            max_rpm: 1000,
            max_30m_requests: 1000,
            cooldown_minutes: 10,
            schedulable: true,
        }
    }

    #[test]
    fn range_split_hard_isolates_heavy_and_medium() {
        let (h_start, h_end) = category_range(ModelCategory::Heavy, 8);
        let (m_start, m_end) = category_range(ModelCategory::Medium, 8);
        assert_eq!((h_start, h_end), (0, 4));
        assert_eq!((m_start, m_end), (4, 8));
    }

    #[test]
    fn single_slot_pool_shares_range() {
        assert_eq!(category_range(ModelCategory::Heavy, 1), (0, 1));
        assert_eq!(category_range(ModelCategory::Medium, 1), (0, 1));
    }

    #[test]
    fn hash_to_slot_is_stable() {
        let s = session("abc-session");
        assert_eq!(hash_to_slot_index(&s, 4), hash_to_slot_index(&s, 4));
    }

    #[tokio::test]
    async fn model_pool_isolation_under_pressure() {
        // C=6 -> T=8, heavy=[0,4) medium=[4,8).
        let store = MemoryStore::new();
        let account = account(6);
        let mut heavy_slots = Vec::new();
        for i in 0..4 {
            let s = session(&format!("heavy-session-{i}"));
            match acquire_session_slot(
                &store,
                &account,
                &s,
                ModelCategory::Heavy,
                Duration::from_secs(900),
                Duration::from_secs(3600),
                3,
            )
            .await
            .unwrap()
            {
                SlotAcquisition::Acquired(h) => heavy_slots.push(h),
                SlotAcquisition::Full { .. } => panic!("expected acquisition"),
            }
        }
        // 5th heavy session cannot get a slot even though medium is idle.
        let fifth = session("heavy-session-4");
        let outcome = acquire_session_slot(
            &store,
            &account,
            &fifth,
            ModelCategory::Heavy,
            Duration::from_secs(900),
            Duration::from_secs(3600),
            3,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, SlotAcquisition::Full { .. }));

        for slot in &heavy_slots {
            assert!(slot.slot < 4);
        }

        // Medium still succeeds.
        let medium_session = session("medium-session");
        let medium = acquire_session_slot(
            &store,
            &account,
            &medium_session,
            ModelCategory::Medium,
            Duration::from_secs(900),
            Duration::from_secs(3600),
            3,
        )
        .await
        .unwrap();
        match medium {
            SlotAcquisition::Acquired(h) => assert!(h.slot >= 4),
            SlotAcquisition::Full { .. } => panic!("medium should have free slots"),
        }
    }

    #[tokio::test]
    async fn light_model_allows_same_session_sharing_up_to_max_parallel() {
        let store = MemoryStore::new();
        let account = account(3);
        let s = session("light-session");
        let mut handles = Vec::new();
        for _ in 0..3 {
            match acquire_session_slot(
                &store,
                &account,
                &s,
                ModelCategory::Light,
                Duration::from_secs(900),
                Duration::from_secs(3600),
                3,
            )
            .await
            .unwrap()
            {
                SlotAcquisition::Acquired(h) => handles.push(h),
                SlotAcquisition::Full { .. } => panic!("should share one slot"),
            }
        }
        assert_eq!(handles.iter().map(|h| h.slot).collect::<std::collections::HashSet<_>>().len(), 1);

        // Different session cannot join that slot even though haikuMaxParallel
        // is a per-session cap, not a per-account pool cap — but since all
        // other slots are free, the other session lands on a different one.
        let other = session("other-light-session");
        let other_handle = acquire_session_slot(
            &store,
            &account,
            &other,
            ModelCategory::Light,
            Duration::from_secs(900),
            Duration::from_secs(3600),
            3,
        )
        .await
        .unwrap();
        if let SlotAcquisition::Acquired(h) = other_handle {
            assert_ne!(h.slot, handles[0].slot);
        } else {
            panic!("other session should find a free slot");
        }
    }
}
