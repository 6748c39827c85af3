//! User-input pacing gate (§4.5 step 7). Applied only when the current
//! message is a fresh user turn (not a tool result) on a subscription
//! account — mimics natural typing cadence so upstream anti-abuse
//! heuristics see a more human request cadence.

use crate::config::UserInputPacingConfig;
use crate::kvstore::KvStore;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Waits until `[min, max]` seconds have elapsed since `key`'s last-marked
/// timestamp. If never marked (first request against this slot), returns
/// immediately — there is no prior cadence to imitate yet.
pub async fn wait_for_pacing(
    store: &dyn KvStore,
    key: &str,
    cfg: &UserInputPacingConfig,
    cancel: &CancellationToken,
) -> bool {
    let Ok(Some(elapsed)) = store.time_since_marked(key).await else {
        return true;
    };
    let target = Duration::from_secs_f64(
        rand::thread_rng().gen_range(cfg.min_seconds..=cfg.max_seconds.max(cfg.min_seconds)),
    );
    if elapsed >= target {
        return true;
    }
    let remaining = target - elapsed;
    tokio::select! {
        _ = tokio::time::sleep(remaining) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Stamps `key` with the current time; call after forwarding completes
/// (§4.5: "the per-slot timestamp is set after [9] completes").
pub async fn mark_response_end(store: &dyn KvStore, key: &str, ttl: Duration) {
    let _ = store.mark_timestamp(key, ttl).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;

    #[tokio::test]
    async fn first_request_on_a_slot_is_never_paced() {
        let store = MemoryStore::new();
        let cfg = UserInputPacingConfig {
            min_seconds: 10.0,
            max_seconds: 20.0,
        };
        let proceeded = wait_for_pacing(&store, "slot_last_response:a1:0", &cfg, &CancellationToken::new()).await;
        assert!(proceeded);
    }

    #[tokio::test]
    async fn already_elapsed_window_does_not_block() {
        let store = MemoryStore::new();
        store
            .mark_timestamp("slot_last_response:a1:0", Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cfg = UserInputPacingConfig {
            min_seconds: 0.0,
            max_seconds: 0.0,
        };
        let proceeded = wait_for_pacing(&store, "slot_last_response:a1:0", &cfg, &CancellationToken::new()).await;
        assert!(proceeded);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let store = MemoryStore::new();
        store
            .mark_timestamp("slot_last_response:a1:0", Duration::from_secs(60))
            .await
            .unwrap();
        let cfg = UserInputPacingConfig {
            min_seconds: 30.0,
            max_seconds: 30.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let proceeded = wait_for_pacing(&store, "slot_last_response:a1:0", &cfg, &cancel).await;
        assert!(!proceeded);
    }
}
