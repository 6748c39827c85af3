//! C2 — Concurrency Manager (§4.2). Wraps C1 (`KvStore`) with typed
//! operations and release handles; every wait goes through the same
//! backoff/ping/cancellation machinery in [`wait`].

pub mod backoff;
pub mod release;
pub mod wait;

use crate::config::{BackoffConfig, ConcurrencyConfig, WaitQueueConfig};
use crate::error::{CoreError, CoreResult, RateLimitedReason};
use crate::ids::{AccountId, UserId};
use crate::kvstore::{keys, KvStore};
use release::ReleaseHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wait::{PingSink, WaitOptions};

const RPM_WINDOW: Duration = Duration::from_secs(60);
const QUOTA_30M_WINDOW: Duration = Duration::from_secs(1800);
/// RPM wait is capped at 60s even if the oldest entry ages out later (§4.5).
const RPM_WAIT_CAP: Duration = Duration::from_secs(60);

/// Outcome of [`ConcurrencyManager::acquire_account_slot`].
pub enum AccountSlotOutcome {
    /// A plain slot was claimed; `key`/`member` are what a `ReleaseHandle`
    /// needs to release it later.
    Acquired { key: String, member: String },
    /// `max_conc <= 0` (§8 boundary behavior): always succeeds, nothing to
    /// release.
    Unlimited,
    /// No free slot right now; caller should fall back to the wait path.
    Full,
}

pub struct ConcurrencyManager {
    store: Arc<dyn KvStore>,
    concurrency: ConcurrencyConfig,
    wait_queue: WaitQueueConfig,
    backoff: BackoffConfig,
}

impl ConcurrencyManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        concurrency: ConcurrencyConfig,
        wait_queue: WaitQueueConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            concurrency,
            wait_queue,
            backoff,
        }
    }

    fn slot_ttl(&self) -> Duration {
        Duration::from_secs(self.concurrency.slot_ttl_minutes * 60)
    }

    /// `acquireUserSlot(userID, maxConc)` (§4.2). `max_conc <= 0` is the
    /// no-limit fast path (§8 boundary behaviors): always succeeds with a
    /// no-op release.
    pub async fn acquire_user_slot(
        &self,
        user: &UserId,
        max_conc: u32,
        request_id: &str,
        cancel: CancellationToken,
    ) -> CoreResult<Option<ReleaseHandle>> {
        if max_conc == 0 {
            return Ok(None);
        }
        let key = keys::concurrency_user(user);
        let acquired = self
            .store
            .acquire_slot(&key, max_conc, self.slot_ttl(), request_id)
            .await?;
        if !acquired {
            return Err(CoreError::RateLimited(RateLimitedReason::UserWaitQueueFull));
        }
        Ok(Some(release::slot_release_handle(
            self.store.clone(),
            key,
            request_id.to_string(),
            cancel,
        )))
    }

    /// `acquireAccountSlot` (§4.2), the plain non-session variant — used by
    /// the selector's empty-`sessionHash` fast path (§4.4, §8: the selector
    /// uses the non-session fast path and C3 is never invoked). Returns the
    /// raw key/member rather than a live `ReleaseHandle` since the caller
    /// (the selector) doesn't hold a request's cancellation token yet; the
    /// admission pipeline builds the handle once it does.
    pub async fn acquire_account_slot(
        &self,
        account: &AccountId,
        max_conc: u32,
        request_id: &str,
    ) -> CoreResult<AccountSlotOutcome> {
        if max_conc == 0 {
            return Ok(AccountSlotOutcome::Unlimited);
        }
        let key = keys::concurrency_account(account);
        let acquired = self
            .store
            .acquire_slot(&key, max_conc, self.slot_ttl(), request_id)
            .await?;
        if !acquired {
            return Ok(AccountSlotOutcome::Full);
        }
        Ok(AccountSlotOutcome::Acquired {
            key,
            member: request_id.to_string(),
        })
    }

    /// `maxWaitUser = userConcurrency + 20` (§4.5): the queue cap scales
    /// with the caller's own concurrency limit, not a single fixed constant.
    pub async fn inc_wait(&self, user: &UserId, user_concurrency_limit: u32) -> CoreResult<bool> {
        let key = keys::wait_user(user);
        self.store
            .increment_wait(
                &key,
                user_concurrency_limit + 20,
                Duration::from_secs(self.wait_queue.wait_entry_ttl_seconds),
            )
            .await
    }

    pub async fn dec_wait(&self, user: &UserId) -> CoreResult<()> {
        self.store.decrement_wait(&keys::wait_user(user)).await
    }

    pub async fn inc_account_wait(&self, account: &AccountId) -> CoreResult<bool> {
        let key = keys::wait_account(account);
        self.store
            .increment_wait(
                &key,
                self.wait_queue.max_account_wait,
                Duration::from_secs(self.wait_queue.wait_entry_ttl_seconds),
            )
            .await
    }

    pub async fn dec_account_wait(&self, account: &AccountId) -> CoreResult<()> {
        self.store.decrement_wait(&keys::wait_account(account)).await
    }

    /// `acquireSessionMutex(accountID, sessionHash, timeout, stream,
    /// streamStarted)` (§4.2, §4.5). Heavy/medium only — callers skip this
    /// entirely for light models.
    pub async fn acquire_session_mutex(
        &self,
        account: &AccountId,
        session: &crate::ids::SessionHash,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        ping_sink: Option<&dyn PingSink>,
    ) -> CoreResult<ReleaseHandle> {
        let key = keys::session_mutex(account, session);
        let ttl = Duration::from_secs(self.concurrency.session_mutex_ttl_seconds);
        let store = self.store.clone();

        let acquired = wait::poll_until(
            || {
                let store = store.clone();
                let key = key.clone();
                let member = request_id.to_string();
                async move {
                    if store.acquire_session_mutex(&key, ttl, &member).await? {
                        Ok(Some(()))
                    } else {
                        Ok(None)
                    }
                }
            },
            backoff::Backoff::new(&self.backoff),
            cancel,
            WaitOptions {
                ping_interval: Duration::from_secs(self.wait_queue.ping_interval_seconds),
                overall_timeout: timeout,
                ping_sink,
            },
            RateLimitedReason::ConcurrencyTimeout,
        )
        .await;
        acquired?;

        Ok(release::mutex_release_handle(
            self.store.clone(),
            key,
            request_id.to_string(),
            cancel.clone(),
        ))
    }

    /// Records one RPM + one 30m-quota sliding-window member.
    pub async fn record_request(&self, account: &AccountId) -> CoreResult<()> {
        let now_id = uuid_like_member();
        self.store
            .record_sliding_window(
                &keys::rpm_limit(account),
                RPM_WINDOW,
                RPM_WINDOW + Duration::from_secs(5),
                &now_id,
            )
            .await?;
        Ok(())
    }

    /// Records one sample into the short load-balancing window (§4.4 step
    /// 5) alongside the RPM sample — both are written once per forwarded
    /// request.
    pub async fn record_load_sample(&self, account: &AccountId, window_minutes: u64) -> CoreResult<()> {
        let member = uuid_like_member();
        let window = Duration::from_secs(window_minutes * 60);
        self.store
            .record_sliding_window(
                &keys::load_window(account),
                window,
                window + Duration::from_secs(30),
                &member,
            )
            .await?;
        Ok(())
    }

    /// `record30m` + `getCount30m` (§4.2, §4.5 post-forward check).
    pub async fn record_30m(&self, account: &AccountId) -> CoreResult<u64> {
        let member = uuid_like_member();
        self.store
            .record_sliding_window(
                &keys::rate_30m(account),
                QUOTA_30M_WINDOW,
                QUOTA_30M_WINDOW + Duration::from_secs(30),
                &member,
            )
            .await
    }

    pub async fn get_count_30m(&self, account: &AccountId) -> CoreResult<u64> {
        self.store
            .sliding_window_count(&keys::rate_30m(account), QUOTA_30M_WINDOW)
            .await
    }

    /// `waitForRPMSlot` (§4.5): if current RPM >= max, sleep until the
    /// oldest entry ages out (capped at 60s), then re-check. `max_rpm == 0`
    /// skips the wait entirely (§8 boundary behaviors).
    pub async fn wait_for_rpm_slot(
        &self,
        account: &AccountId,
        max_rpm: u32,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if max_rpm == 0 {
            return Ok(());
        }
        let key = keys::rpm_limit(account);
        loop {
            let count = self.store.sliding_window_count(&key, RPM_WINDOW).await?;
            if count < max_rpm as u64 {
                return Ok(());
            }
            let wait = self
                .store
                .sliding_window_oldest_expiry(&key, RPM_WINDOW)
                .await?
                .unwrap_or(Duration::from_secs(0))
                .min(RPM_WAIT_CAP);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    return Err(CoreError::RateLimited(RateLimitedReason::UpstreamRateLimitExhausted));
                }
            }
        }
    }

    pub async fn set_account_paused(&self, account: &AccountId, cooldown_minutes: u32) -> CoreResult<()> {
        self.store
            .set_account_paused(account, Duration::from_secs(cooldown_minutes as u64 * 60))
            .await
    }

    pub async fn is_account_paused(&self, account: &AccountId) -> CoreResult<bool> {
        self.store.is_account_paused(account).await
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }
}

fn uuid_like_member() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;

    fn manager() -> ConcurrencyManager {
        ConcurrencyManager::new(
            Arc::new(MemoryStore::new()),
            ConcurrencyConfig::default(),
            WaitQueueConfig::default(),
            BackoffConfig::default(),
        )
    }

    #[tokio::test]
    async fn user_slot_zero_max_conc_is_nop() {
        let mgr = manager();
        let user = UserId::from("u1".to_string());
        let handle = mgr
            .acquire_user_slot(&user, 0, "r1", CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn user_slot_respects_capacity_then_releases() {
        let mgr = manager();
        let user = UserId::from("u1".to_string());
        let h1 = mgr
            .acquire_user_slot(&user, 1, "r1", CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let err = mgr
            .acquire_user_slot(&user, 1, "r2", CancellationToken::new())
            .await;
        assert!(matches!(err, Err(CoreError::RateLimited(_))));
        h1.release().await.unwrap();
        assert!(mgr
            .acquire_user_slot(&user, 1, "r2", CancellationToken::new())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rpm_wait_skipped_when_max_is_zero() {
        let mgr = manager();
        let account = AccountId::from("a1".to_string());
        mgr.wait_for_rpm_slot(&account, 0, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pause_marker_roundtrip() {
        let mgr = manager();
        let account = AccountId::from("a1".to_string());
        assert!(!mgr.is_account_paused(&account).await.unwrap());
        mgr.set_account_paused(&account, 30).await.unwrap();
        assert!(mgr.is_account_paused(&account).await.unwrap());
    }
}
