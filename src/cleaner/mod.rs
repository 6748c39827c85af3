//! C6 — Idle Cleaner (§4.6). Same loop-owner shape as the teacher's
//! `start_health_check_loop`/`sleep_or_shutdown`: one task, woken on an
//! interval or a shutdown `Notify`, that never touches live members — the
//! underlying `cleanupAll` script only deletes by score threshold.

use crate::kvstore::{keys, KvStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

/// Runs `clearAll` once at startup, then sweeps expired entries out of the
/// concurrency/slot-owner/session-mutex key families on `interval`.
pub async fn run(store: Arc<dyn KvStore>, slot_ttl: Duration, interval: Duration, shutdown: Arc<Notify>) {
    if let Err(e) = store.clear_all().await {
        error!(error = %e, "cleaner: clear_all failed at startup");
    } else {
        info!("cleaner: clear_all completed at startup");
    }

    loop {
        if sleep_or_shutdown(interval, &shutdown).await {
            return;
        }
        sweep(&store, slot_ttl).await;
    }
}

async fn sweep(store: &Arc<dyn KvStore>, ttl: Duration) {
    for pattern in [
        keys::CONCURRENCY_PATTERN,
        keys::SLOT_OWNER_PATTERN,
        keys::SESSION_MUTEX_PATTERN,
    ] {
        match store.cleanup_all(pattern, ttl).await {
            Ok(removed) => {
                metrics::counter!(
                    "admission_cleanup_removed_total",
                    "pattern" => pattern,
                )
                .increment(removed);
                info!(pattern, removed, "cleaner: sweep completed");
            }
            Err(e) => {
                error!(pattern, error = %e, "cleaner: sweep failed");
            }
        }
    }
    metrics::gauge!("admission_cleanup_last_run_timestamp_seconds").set(unix_now_seconds());
}

fn unix_now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;

    #[tokio::test]
    async fn clear_all_runs_before_first_sweep() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store
            .acquire_slot("concurrency:account:a1", 5, Duration::from_secs(60), "r1")
            .await
            .unwrap();
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        run(store.clone(), Duration::from_secs(60), Duration::from_millis(10), shutdown).await;
    }
}
