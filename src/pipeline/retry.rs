//! Retry backoff and the timer scheduler. Spec §4.1 "Retry policy".

use crate::config::RetryConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// `base * 2^(attempt-1)`, capped at `max`, then scaled by a uniform random
/// fraction in `[0, 1)` ("full jitter").
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
    let raw = cfg.base_delay.mul_f64(exp).min(cfg.max_delay);
    raw.mul_f64(fastrand::f64())
}

/// Tracks outstanding retry timers so shutdown can await them (spec: "The
/// retry scheduler increments a wait group so shutdown awaits outstanding
/// timers").
pub struct RetryScheduler {
    tasks: Mutex<JoinSet<()>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Schedule `f` to run after `delay`, cancellable via `cancel`.
    pub async fn schedule<F>(&self, delay: Duration, cancel: crate::fetcher::CancelToken, f: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => f.await,
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Await all outstanding timers (called during engine shutdown).
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        };
        for attempt in 1..=10 {
            let d = backoff_delay(&cfg, attempt);
            assert!(d <= cfg.max_delay);
        }
    }

    #[test]
    fn grows_exponentially_before_cap() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };
        // With jitter in [0,1) we can't assert exact values, but the
        // theoretical ceiling (pre-jitter) should grow.
        let ceiling = |attempt: u32| cfg.base_delay.mul_f64(2f64.powi(attempt as i32 - 1));
        assert!(ceiling(2) > ceiling(1));
        assert!(ceiling(3) > ceiling(2));
    }
}
