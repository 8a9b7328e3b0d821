use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::sleep;

/// Jittered exponential backoff for async steps that must eventually succeed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Backoff for re-linking a sent payout to its funding row.
    pub fn link(max_attempts: usize, base_delay_ms: u64) -> Self {
        Self::new(max_attempts, base_delay_ms, base_delay_ms.saturating_mul(20), 0.2)
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        if self.jitter_pct == 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(offset))
    }

    /// Run `op` until it succeeds, the attempts run out, or `retryable`
    /// rejects the error. The last error is returned.
    pub async fn retry_async_if<F, Fut, T, E, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !retryable(&err) {
                        return Err(err);
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 250, 5_000, 0.2)
    }
}
