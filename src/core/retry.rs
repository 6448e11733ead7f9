//! Exponential backoff for transient failures.

use crate::core::control::Control;
use crate::core::error::UnitError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as transient (worth another attempt) or permanent.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for UnitError {
    fn is_retryable(&self) -> bool {
        matches!(self, UnitError::NetworkTransient(_))
    }
}

impl IsRetryable for reqwest::Error {
    fn is_retryable(&self) -> bool {
        if self.is_timeout() || self.is_connect() {
            return true;
        }
        match self.status() {
            Some(status) => is_transient_status(status),
            // A body cut short mid-stream is a reset, not a bad response.
            None => self.is_body() || self.is_request(),
        }
    }
}

pub fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let delay = Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()));
        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Jitter between 0% and 25% on top of the delay.
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=0.25);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}

/// Runs `operation` until it succeeds, fails permanently, or the attempt
/// budget runs out. Each attempt is preceded by a suspension point and the
/// backoff sleep is cut short by cancellation.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    control: &Control,
    mut operation: F,
) -> Result<T, UnitError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UnitError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        control.checkpoint().await?;
        attempt += 1;
        match operation(attempt).await {
            Ok(v) => {
                if attempt > 1 {
                    tracing::debug!(attempts = attempt, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                control.sleep(delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let p = RetryPolicy { jitter: true, ..RetryPolicy::default() };
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(625));
        }
    }

    #[tokio::test]
    async fn transient_errors_use_whole_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r: Result<(), _> = run_with_retry(&fast(), &Control::default(), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(UnitError::NetworkTransient("503".into()))
            }
        })
        .await;
        assert!(matches!(r, Err(UnitError::NetworkTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r: Result<(), _> = run_with_retry(&fast(), &Control::default(), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(UnitError::NetworkPermanent("404".into()))
            }
        })
        .await;
        assert!(matches!(r, Err(UnitError::NetworkPermanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let r = run_with_retry(&fast(), &Control::default(), |attempt| async move {
            if attempt < 2 {
                Err(UnitError::NetworkTransient("reset".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(r.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_control_stops_before_first_attempt() {
        let control = Control::default();
        control.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r: Result<(), _> = run_with_retry(&fast(), &control, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert!(matches!(r, Err(UnitError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
