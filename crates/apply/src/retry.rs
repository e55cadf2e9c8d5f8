//! Bounded re-attempts for idempotent operations against a converging control plane.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

pub const ATTEMPTS_ENV: &str = "KON_APPLY_RETRY_ATTEMPTS";
pub const DELAY_ENV: &str = "KON_APPLY_RETRY_DELAY_MS";

/// Pause between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Delay {
    None,
    Fixed(Duration),
    /// `initial * factor^(n-1)` before retry `n`, capped at `max`.
    Exponential { initial: Duration, max: Duration, factor: f64 },
}

impl Delay {
    /// Pause before retry number `retry` (1-based).
    pub fn before_retry(&self, retry: u32) -> Duration {
        match self {
            Delay::None => Duration::ZERO,
            Delay::Fixed(d) => *d,
            Delay::Exponential { initial, max, factor } => {
                let exp = retry.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exp);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()).max(0.0))
            }
        }
    }
}

/// Attempt budget for one call. Never shared across calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Delay,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Delay) -> Self { Self { max_attempts, delay } }

    pub fn immediate(max_attempts: u32) -> Self { Self::new(max_attempts, Delay::None) }

    /// `KON_APPLY_RETRY_ATTEMPTS` (8) and `KON_APPLY_RETRY_DELAY_MS` (0).
    pub fn from_env() -> Self {
        let attempts = std::env::var(ATTEMPTS_ENV).ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(8);
        let delay_ms = std::env::var(DELAY_ENV).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let delay = if delay_ms == 0 { Delay::None } else { Delay::Fixed(Duration::from_millis(delay_ms)) };
        Self::new(attempts, delay)
    }

    fn attempts(&self) -> u32 { self.max_attempts.max(1) }
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::immediate(8) }
}

/// Retry every error until success or the budget is spent; returns the last error.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, op_name: &str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, op_name, |_| true, op).await
}

/// Like [`retry`], but stops at the first error `retryable` rejects.
pub async fn retry_if<F, Fut, T, E, P>(policy: &RetryPolicy, op_name: &str, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max = policy.attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max || !retryable(&e) {
                    return Err(e);
                }
                let pause = policy.delay.before_retry(attempt);
                counter!("retry_attempts_total", 1u64);
                warn!(operation = %op_name, attempt, max_attempts = max, error = %e, delay_ms = pause.as_millis() as u64, "operation failed, retrying");
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately() {
        let res: Result<i32, String> = retry(&RetryPolicy::immediate(3), "op", || async { Ok(42) }).await;
        assert_eq!(res, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<u32, String> = retry(&RetryPolicy::immediate(8), "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(res, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_on_last_allowed_attempt() {
        for n in 1..=5u32 {
            let count = Arc::new(AtomicU32::new(0));
            let c = count.clone();
            let res: Result<u32, String> = retry(&RetryPolicy::immediate(n), "op", || {
                let c = c.clone();
                async move {
                    let k = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if k < n { Err(format!("fail {}", k)) } else { Ok(k) }
                }
            })
            .await;
            assert_eq!(res, Ok(n));
            assert_eq!(count.load(Ordering::SeqCst), n);
        }
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), String> = retry(&RetryPolicy::immediate(4), "op", || {
            let c = c.clone();
            async move { Err(format!("fail {}", c.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .await;
        assert_eq!(res, Err("fail 4".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _: Result<(), String> = retry(&RetryPolicy::immediate(0), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predicate_stops_on_fatal_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let res: Result<(), String> = retry_if(&RetryPolicy::immediate(8), "op", |e: &String| e != "fatal", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 2 { Err("fatal".to_string()) } else { Err("transient".to_string()) }
            }
        })
        .await;
        assert_eq!(res, Err("fatal".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fixed_delay_pauses_between_attempts() {
        let policy = RetryPolicy::new(3, Delay::Fixed(Duration::from_millis(20)));
        let t0 = std::time::Instant::now();
        let _: Result<(), String> = retry(&policy, "op", || async { Err("x".to_string()) }).await;
        assert!(t0.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let d = Delay::Exponential { initial: Duration::from_millis(100), max: Duration::from_secs(1), factor: 2.0 };
        assert_eq!(d.before_retry(1), Duration::from_millis(100));
        assert_eq!(d.before_retry(2), Duration::from_millis(200));
        assert_eq!(d.before_retry(4), Duration::from_millis(800));
        assert_eq!(d.before_retry(5), Duration::from_secs(1));
        assert_eq!(d.before_retry(500), Duration::from_secs(1));
        assert_eq!(Delay::None.before_retry(3), Duration::ZERO);
    }
}
