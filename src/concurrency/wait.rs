//! Wait-with-SSE-ping protocol and cancellation-aware polling (§4.2).
//!
//! Every wait in this crate — slot, mutex, RPM refill — selects on the same
//! four branches: a retry timer, a ping tick, client cancellation, and an
//! overall timeout. Only stream-mode requests get ping ticks; the sink is a
//! thin trait so this module stays decoupled from the actual transport
//! (writing SSE bytes is the surrounding gateway's job, out of scope here).

use crate::error::{CoreError, RateLimitedReason};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives keep-alive pings while a stream-mode request waits. The first
/// ping implies "headers not yet sent" bookkeeping (switch to
/// `text/event-stream`, disable buffering) that belongs to the transport
/// layer, not here — this trait only marks *that* a ping happened.
#[async_trait::async_trait]
pub trait PingSink: Send + Sync {
    async fn ping(&self);
}

/// A sink that does nothing — used for non-stream requests and tests.
pub struct NullPingSink;

#[async_trait::async_trait]
impl PingSink for NullPingSink {
    async fn ping(&self) {}
}

pub struct WaitOptions<'a> {
    pub ping_interval: Duration,
    pub overall_timeout: Duration,
    pub ping_sink: Option<&'a (dyn PingSink)>,
}

/// Polls `attempt` with exponential backoff until it returns `Some(value)`,
/// the cancellation token fires, or `overall_timeout` elapses. `slot_type`
/// names the exhausted resource for the resulting `CoreError`.
pub async fn poll_until<F, Fut, T>(
    mut attempt: F,
    mut backoff: super::backoff::Backoff,
    cancel: &CancellationToken,
    opts: WaitOptions<'_>,
    on_timeout: RateLimitedReason,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::CoreResult<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + opts.overall_timeout;
    let mut ping_tick = opts.ping_sink.map(|_| tokio::time::interval(opts.ping_interval));

    loop {
        if let Some(value) = attempt().await? {
            return Ok(value);
        }

        let sleep = tokio::time::sleep(backoff.next());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = cancel.cancelled() => {
                    return Err(CoreError::RateLimited(on_timeout));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CoreError::RateLimited(on_timeout));
                }
                _ = async {
                    match ping_tick.as_mut() {
                        Some(tick) => { tick.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Some(sink) = opts.ping_sink {
                        sink.ping().await;
                    }
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::RateLimited(on_timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_once_attempt_returns_some() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let backoff = super::super::backoff::Backoff::new(&BackoffConfig {
            initial_ms: 5,
            max_ms: 20,
            multiplier: 1.5,
            jitter_ratio: 0.1,
        });
        let result = poll_until(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(if n >= 2 { Some(42) } else { None })
            },
            backoff,
            &cancel,
            WaitOptions {
                ping_interval: Duration::from_secs(10),
                overall_timeout: Duration::from_secs(5),
                ping_sink: None,
            },
            RateLimitedReason::ConcurrencyTimeout,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn cancellation_returns_rate_limited() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backoff = super::super::backoff::Backoff::new(&BackoffConfig {
            initial_ms: 1000,
            max_ms: 2000,
            multiplier: 1.5,
            jitter_ratio: 0.0,
        });
        let result: Result<u32, _> = poll_until(
            || async { Ok(None) },
            backoff,
            &cancel,
            WaitOptions {
                ping_interval: Duration::from_secs(10),
                overall_timeout: Duration::from_secs(5),
                ping_sink: None,
            },
            RateLimitedReason::ConcurrencyTimeout,
        )
        .await;
        assert!(matches!(result, Err(CoreError::RateLimited(_))));
    }

    #[tokio::test]
    async fn overall_timeout_elapses() {
        let cancel = CancellationToken::new();
        let backoff = super::super::backoff::Backoff::new(&BackoffConfig {
            initial_ms: 20,
            max_ms: 20,
            multiplier: 1.0,
            jitter_ratio: 0.0,
        });
        let result: Result<u32, _> = poll_until(
            || async { Ok(None) },
            backoff,
            &cancel,
            WaitOptions {
                ping_interval: Duration::from_secs(10),
                overall_timeout: Duration::from_millis(60),
                ping_sink: None,
            },
            RateLimitedReason::ConcurrencyTimeout,
        )
        .await;
        assert!(matches!(result, Err(CoreError::RateLimited(_))));
    }
}
