//! C1 — Atomic Slot Store (§4.1). Defines the `KvStore` trait abstracting
//! the server-side script contract in §6, so C2-C5 can be unit-tested
//! against `MemoryStore` without a live Redis, and run in production
//! against `RedisStore`.

pub mod keys;
pub mod memory_store;
pub mod redis_store;
mod scripts;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::CoreResult;
use crate::ids::AccountId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Snapshot of one account's load, as read by the selector's batch query
/// (§4.1 `loadBatch`, §4.4 step 5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountLoad {
    pub current_concurrency: u32,
    pub waiting_count: u32,
    pub load_percent: f64,
    /// Request count in the configurable load-balancing window
    /// (`loadBalancing.windowMinutes`), feeding the weighted `effective`
    /// score in §4.4 step 6.
    pub request_count: u64,
}

/// Outcome of a session-aware slot acquire (§4.1 `acquireSlotWithSession`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAcquire {
    Acquired,
    Full,
}

/// Server-side atomic script contract (§4.1, §6). Every mutating method is
/// a single round trip; the `RedisStore` implementation backs it with a
/// `redis::Script` (Lua `EVAL`/`EVALSHA`), the `MemoryStore` implementation
/// backs it with an in-process mutex over the same semantics, for
/// Docker-free unit tests of everything built on top.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `acquireSlot(key, maxConc, ttl, memberID)`.
    async fn acquire_slot(
        &self,
        key: &str,
        max_conc: u32,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool>;

    /// Explicit release, idempotent.
    async fn release_slot(&self, key: &str, member_id: &str) -> CoreResult<()>;

    /// `acquireSlotInRange(key, ttl, target, rangeStart, rangeEnd)`. Returns
    /// the claimed slot index, or `None` if the range is saturated.
    async fn acquire_slot_in_range(
        &self,
        key: &str,
        ttl: Duration,
        target: u32,
        range_start: u32,
        range_end: u32,
    ) -> CoreResult<Option<u32>>;

    /// `acquireSlotWithSession(ownerKey, slotKey, ttl, slot, session, maxParallel, memberID)`.
    #[allow(clippy::too_many_arguments)]
    async fn acquire_slot_with_session(
        &self,
        owner_key: &str,
        slot_key: &str,
        ttl: Duration,
        slot: u32,
        session: &str,
        max_parallel: u32,
    ) -> CoreResult<SessionAcquire>;

    /// `releaseSlotWithSession(ownerKey, slotKey, slot, session)`.
    async fn release_slot_with_session(
        &self,
        owner_key: &str,
        slot_key: &str,
        slot: u32,
        session: &str,
    ) -> CoreResult<()>;

    /// `acquireSessionMutex(key, ttl, memberID)`.
    async fn acquire_session_mutex(
        &self,
        key: &str,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool>;

    /// `releaseSessionMutex(key, memberID)`.
    async fn release_session_mutex(&self, key: &str, member_id: &str) -> CoreResult<()>;

    /// `incrementWait(key, maxWait, ttl)`.
    async fn increment_wait(&self, key: &str, max_wait: u32, ttl: Duration) -> CoreResult<bool>;

    /// `decrementWait(key)`.
    async fn decrement_wait(&self, key: &str) -> CoreResult<()>;

    /// `recordSlidingWindow(key, windowMs, keyTTL, memberID)`. Returns the
    /// post-prune cardinality.
    async fn record_sliding_window(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<u64>;

    /// Prune-then-read cardinality.
    async fn sliding_window_count(&self, key: &str, window: Duration) -> CoreResult<u64>;

    /// Prune, then return how long until the oldest surviving member ages
    /// out of the window (used by the RPM wait).
    async fn sliding_window_oldest_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> CoreResult<Option<Duration>>;

    /// `loadBatch` (§4.1): one round trip covering every candidate account.
    async fn load_batch(
        &self,
        ttl: Duration,
        load_window: Duration,
        accounts: &[(AccountId, u32)],
    ) -> CoreResult<HashMap<AccountId, AccountLoad>>;

    async fn set_account_paused(&self, account: &AccountId, ttl: Duration) -> CoreResult<()>;
    async fn is_account_paused(&self, account: &AccountId) -> CoreResult<bool>;

    async fn get_session_binding(&self, key: &str) -> CoreResult<Option<u32>>;
    async fn set_session_binding(&self, key: &str, slot: u32, ttl: Duration) -> CoreResult<()>;

    /// Marks `key` with the store's own server time (§4.5 user-input
    /// pacing: "the per-slot timestamp is set after [9] completes").
    async fn mark_timestamp(&self, key: &str, ttl: Duration) -> CoreResult<()>;
    /// Time elapsed since `key` was last marked, or `None` if never marked
    /// or expired.
    async fn time_since_marked(&self, key: &str) -> CoreResult<Option<Duration>>;

    /// `cleanupAll(pattern, ttl)`: sweep expired members out of every
    /// matching key. Returns the number of members removed.
    async fn cleanup_all(&self, pattern: &str, ttl: Duration) -> CoreResult<u64>;

    /// `clearAll()`: wipe every runtime key family (startup only, §3).
    async fn clear_all(&self) -> CoreResult<()>;
}
