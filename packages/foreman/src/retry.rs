//! Retry with exponential backoff and jitter, plus per-driver circuit
//! breaking.
//!
//! The retry wrapper consumes a fallible async closure and a policy. Only
//! error kinds the policy lists as retryable trigger another attempt;
//! build-logic failures (a compiler exiting non-zero) never do.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::context::CancelFlag;
use crate::error::{EngineError, ErrorKind};

/// Backoff and classification policy for one action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter in `[0, 1]`: the delay is scaled by `1 ± jitter`.
    pub jitter_fraction: f64,
    pub retryable: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.5,
            retryable: BTreeSet::from([
                ErrorKind::FileSystem,
                ErrorKind::System,
                ErrorKind::Network,
            ]),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `k + 1`: `min(base * multiplier^k, max)`
    /// scaled by `1 ± jitter`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        let scaled = capped * (1.0 + self.jitter_fraction * spread);
        Duration::from_millis(scaled.max(0.0) as u64)
    }

    /// Whether the policy retries this error. `FileSystem` errors retry
    /// only when flagged transient.
    pub fn is_retryable(&self, err: &EngineError) -> bool {
        if !self.retryable.contains(&err.kind) {
            return false;
        }
        err.kind != ErrorKind::FileSystem || err.transient
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-driver circuit breaker: after `threshold` consecutive failures,
/// short-circuit further attempts for a cooldown window.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether the breaker currently refuses attempts.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed: half-open, allow a probe attempt.
                state.open_until = None;
                state.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                failures = state.consecutive_failures,
                cooldown = ?self.cooldown,
                "circuit breaker opened"
            );
        }
    }
}

/// Run `op` under the policy, sleeping between attempts.
///
/// Cancellation is checked before every attempt; a tripped breaker
/// short-circuits without consuming attempts.
#[instrument(skip(policy, breaker, cancel, op))]
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    cancel: &CancelFlag,
    what: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<EngineError> = None;
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(EngineError::system("build cancelled").frame(what.to_string()));
        }
        if let Some(breaker) = breaker
            && breaker.is_open()
        {
            return Err(EngineError::system("circuit breaker open")
                .frame(what.to_string())
                .suggest("wait for the driver cooldown to elapse, then retry"));
        }
        match op().await {
            Ok(value) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                return Ok(value);
            }
            Err(err) => {
                if let Some(breaker) = breaker {
                    breaker.record_failure();
                }
                if !policy.is_retryable(&err) || attempt + 1 == attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(%err, attempt, ?delay, "retrying after backoff");
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::internal("retry loop exited without error")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn delay_respects_cap_and_jitter_envelope() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.5,
            ..RetryPolicy::default()
        };
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt).as_millis() as f64;
            let raw = (100.0 * 2f64.powi(attempt as i32)).min(1_000.0);
            assert!(delay >= raw * 0.5 - 1.0, "attempt {attempt}: {delay}");
            assert!(delay <= raw * 1.5 + 1.0, "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(
            &policy(5),
            None,
            &CancelFlag::new(),
            "flaky op",
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(EngineError::network("connection reset"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn build_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &policy(5),
            None,
            &CancelFlag::new(),
            "compile",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::build_failure("cc exited with status 1")) }
            },
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::BuildFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transient_fs_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &policy(5),
            None,
            &CancelFlag::new(),
            "read",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::filesystem("no such file")) }
            },
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::FileSystem);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &policy(3),
            None,
            &CancelFlag::new(),
            "always down",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::network("timeout")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &policy(3),
            Some(&breaker),
            &CancelFlag::new(),
            "driver",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::system("boom")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure();
        assert!(breaker.is_open());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(3), None, &cancel, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::network("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
