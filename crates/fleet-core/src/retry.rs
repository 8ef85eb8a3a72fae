//! Bounded exponential backoff.
//!
//! Every call the controller makes to the cluster, the store or the bus goes
//! through [`retry`] (or [`retry_with`]) so transient failures are absorbed
//! and permanent ones surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Classifies an error as worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fraction of each delay randomized away (0.0 disables jitter).
    pub jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            factor: 2.0,
            max_attempts: max_attempts.max(1),
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(32) as i32);
        let millis = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let offset = rand::rng().random_range(0.0..=spread);
        Duration::from_millis((base.as_millis() as f64 - offset).max(0.0) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10), 5)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry<T, E, F, Fut>(backoff: &Backoff, label: &str, op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with(backoff, label, |_, _| {}, op).await
}

/// Like [`retry`], invoking `on_retry(attempt, &err)` before each sleep.
pub async fn retry_with<T, E, F, Fut, R>(
    backoff: &Backoff,
    label: &str,
    mut on_retry: R,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, &E),
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                debug!(
                    op = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                on_retry(attempt, &e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
