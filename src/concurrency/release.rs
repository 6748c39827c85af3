//! Release-handle pattern (§4.2, §7 leakage prevention), grounded in the
//! teacher's `RequestGuard` (`Drop`-based auto-decrement). Release here is
//! inherently async (it's a K/V round trip), so instead of releasing in
//! `Drop` this spawns a background listener that releases once if the
//! request is cancelled before the explicit `release()` call — the same
//! once-guard contract, adapted for an async backend.

use crate::error::CoreResult;
use crate::kvstore::KvStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type ReleaseFut = Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;

/// Background releases get a fresh, short timeout derived from a root
/// independent of the (possibly already-cancelled) request context, so they
/// still succeed when the client has already disconnected (§5).
const BACKGROUND_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// A release-once guard over an arbitrary K/V release operation. Construct
/// via [`ReleaseHandle::spawn`]; call [`ReleaseHandle::release`] on the
/// normal exit path. If the handle is dropped without an explicit release
/// and the cancellation token fires first, the background task releases it.
pub struct ReleaseHandle {
    released: Arc<AtomicBool>,
    listener: tokio::task::JoinHandle<()>,
    op: Option<Box<dyn FnOnce() -> ReleaseFut + Send>>,
}

impl ReleaseHandle {
    /// Explicit release on the normal exit path. Idempotent: a second call
    /// is a no-op, matching the slot store's own idempotent release scripts.
    pub async fn release(mut self) -> CoreResult<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.listener.abort();
            return Ok(());
        }
        self.listener.abort();
        if let Some(op) = self.op.take() {
            op().await
        } else {
            Ok(())
        }
    }
}

/// Builds a release handle for a plain `(key, member)` slot release
/// (user/account slot, RAII over `KvStore::release_slot`).
pub fn slot_release_handle(
    store: Arc<dyn KvStore>,
    key: String,
    member: String,
    cancel: CancellationToken,
) -> ReleaseHandle {
    build(store, cancel, move |store| {
        let key = key.clone();
        let member = member.clone();
        Box::pin(async move { store.release_slot(&key, &member).await })
    })
}

/// Builds a release handle for a session mutex.
pub fn mutex_release_handle(
    store: Arc<dyn KvStore>,
    key: String,
    member: String,
    cancel: CancellationToken,
) -> ReleaseHandle {
    build(store, cancel, move |store| {
        let key = key.clone();
        let member = member.clone();
        Box::pin(async move { store.release_session_mutex(&key, &member).await })
    })
}

/// Builds a release handle for a session-aware model slot.
pub fn session_slot_release_handle(
    store: Arc<dyn KvStore>,
    owner_key: String,
    slot_key: String,
    slot: u32,
    session: String,
    cancel: CancellationToken,
) -> ReleaseHandle {
    build(store, cancel, move |store| {
        let owner_key = owner_key.clone();
        let slot_key = slot_key.clone();
        let session = session.clone();
        Box::pin(async move {
            store
                .release_slot_with_session(&owner_key, &slot_key, slot, &session)
                .await
        })
    })
}

/// A release handle with nothing to release (§8: `maxConcurrency <= 0`
/// always succeeds with a no-op release). Still cancel-aware so dropping it
/// on a cancelled request behaves the same as every other handle.
pub fn noop_release_handle(cancel: CancellationToken) -> ReleaseHandle {
    let released = Arc::new(AtomicBool::new(false));
    let listener = {
        let released = released.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            released.store(true, Ordering::SeqCst);
        })
    };
    ReleaseHandle {
        released,
        listener,
        op: Some(Box::new(|| Box::pin(async { Ok(()) }))),
    }
}

fn build(
    store: Arc<dyn KvStore>,
    cancel: CancellationToken,
    make: impl Fn(Arc<dyn KvStore>) -> ReleaseFut + Send + Sync + Clone + 'static,
) -> ReleaseHandle {
    let released = Arc::new(AtomicBool::new(false));
    let listener = {
        let released = released.clone();
        let store = store.clone();
        let make = make.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if released
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let fut = make(store);
                let _ = tokio::time::timeout(BACKGROUND_RELEASE_TIMEOUT, fut).await;
            }
        })
    };

    let op: Box<dyn FnOnce() -> ReleaseFut + Send> = {
        let store = store.clone();
        Box::new(move || make(store))
    };

    ReleaseHandle {
        released,
        listener,
        op: Some(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn explicit_release_runs_operation_once() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.acquire_slot("k", 1, StdDuration::from_secs(60), "m1").await.unwrap();
        let cancel = CancellationToken::new();
        let handle = slot_release_handle(store.clone(), "k".to_string(), "m1".to_string(), cancel);
        handle.release().await.unwrap();
        // Slot is free again.
        assert!(store.acquire_slot("k", 1, StdDuration::from_secs(60), "m2").await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_triggers_background_release() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.acquire_slot("k", 1, StdDuration::from_secs(60), "m1").await.unwrap();
        let cancel = CancellationToken::new();
        let _handle = slot_release_handle(store.clone(), "k".to_string(), "m1".to_string(), cancel.clone());
        cancel.cancel();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(store.acquire_slot("k", 1, StdDuration::from_secs(60), "m2").await.unwrap());
    }
}
