//! Exponential backoff with jitter between acquisition attempts (§4.2).
//! Deterministic periodic polling causes thundering herds on the K/V store;
//! the jitter spreads retries out.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

pub struct Backoff {
    current_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self {
            current_ms: cfg.initial_ms as f64,
            max_ms: cfg.max_ms as f64,
            multiplier: cfg.multiplier,
            jitter_ratio: cfg.jitter_ratio,
        }
    }

    /// Returns the next sleep duration and advances internal state.
    pub fn next(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
        let sleep_ms = self.current_ms * jitter;
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms);
        Duration::from_millis(sleep_ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_jittered_bounds_and_caps_at_max() {
        let cfg = BackoffConfig {
            initial_ms: 100,
            max_ms: 2000,
            multiplier: 1.5,
            jitter_ratio: 0.2,
        };
        let mut backoff = Backoff::new(&cfg);
        let mut last_base = 100.0;
        for _ in 0..30 {
            let d = backoff.next();
            let ms = d.as_millis() as f64;
            assert!(ms <= last_base * 1.2 + 1.0);
            last_base = (last_base * 1.5).min(2000.0);
            assert!(d.as_millis() as f64 <= 2000.0 * 1.2 + 1.0);
        }
    }
}
