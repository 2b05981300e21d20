//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Breaker-aware exponential backoff retry loop."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::time::Duration;

use faultline_common::BackoffConfig;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::{ResilienceError, Result};
use crate::operation::{Operation, OperationContext};

/// Policy parameters controlling retry attempts and their spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive successes needed before the dependency counts as recovered.
    pub success_threshold: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Result<Self> {
        Self::from_config(&BackoffConfig {
            max_retries,
            base_delay,
            max_delay,
            success_threshold: 1,
        })
    }

    pub fn from_config(config: &BackoffConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            success_threshold: config.success_threshold,
        })
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// `min(base_delay * 2^(n-1), max_delay)` for the n-th retry (1-indexed),
    /// i.e. the wait before attempt `n + 1`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = BackoffConfig::default();
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            success_threshold: config.success_threshold,
        }
    }
}

/// Admission and result reporting around each attempt.
pub trait CallGate: Send + Sync {
    /// Admit one call, or `None` when the gate is closed.
    fn admit(&self) -> Option<Admission>;
    /// Whether a call would be rejected right now, without taking a slot.
    fn is_rejecting(&self) -> bool;
    fn record(&self, success: bool);
    /// Give back an admission whose call never reported a result.
    fn abandon(&self, admission: Admission);
}

impl CallGate for CircuitBreaker {
    fn admit(&self) -> Option<Admission> {
        CircuitBreaker::admit(self)
    }

    fn is_rejecting(&self) -> bool {
        CircuitBreaker::is_rejecting(self)
    }

    fn record(&self, success: bool) {
        self.on_result(success);
    }

    fn abandon(&self, admission: Admission) {
        CircuitBreaker::abandon(self, admission);
    }
}

/// One admitted call. Dropping it without [`GatePermit::record`], e.g. when the
/// caller's future is cancelled mid-call, hands the admission back to the gate.
#[must_use = "dropping the permit gives the admission back"]
pub struct GatePermit<'a> {
    gate: &'a dyn CallGate,
    admission: Option<Admission>,
}

impl<'a> GatePermit<'a> {
    pub fn acquire(gate: &'a dyn CallGate) -> Option<Self> {
        gate.admit().map(|admission| Self {
            gate,
            admission: Some(admission),
        })
    }

    pub fn record(mut self, success: bool) {
        self.admission = None;
        self.gate.record(success);
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.gate.abandon(admission);
        }
    }
}

impl std::fmt::Debug for GatePermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("admission", &self.admission)
            .finish()
    }
}

/// Why a retry run gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub attempts: u32,
    /// The gate rejected the call; no attempt was consumed for it.
    pub circuit_open: bool,
    /// Every attempt was used.
    pub exhausted: bool,
    /// The last error could not be retried.
    pub non_retryable: bool,
    pub last_error: Option<ResilienceError>,
    pub elapsed: Duration,
}

/// Result of [`RetryExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Success { attempts: u32, elapsed: Duration },
    Failure(RetryFailure),
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } => *attempts,
            RetryOutcome::Failure(failure) => failure.attempts,
        }
    }
}

/// Exponential backoff retry loop that fails fast when its gate is closed.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds `success_threshold` times in a row, the
    /// attempts run out, a non-retryable error occurs, or the gate refuses a call.
    pub async fn execute(
        &self,
        operation: &dyn Operation,
        context: &OperationContext,
        gate: Option<&dyn CallGate>,
    ) -> RetryOutcome {
        let started = Instant::now();
        let mut streak = 0;
        let mut last_error = None;
        let mut attempt = 0;

        while attempt < self.policy.max_retries {
            if gate.is_some_and(|gate| gate.is_rejecting()) {
                return self.circuit_open(context, attempt, started);
            }

            // `attempt` calls made so far: the n-th retry waits delay(n).
            if attempt > 0 && streak == 0 {
                let delay = self.policy.delay(attempt);
                debug!(
                    target: "faultline::resilience::retry",
                    component = %context.component_id,
                    retry = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry",
                );
                sleep(delay).await;
            }

            // Admission is taken after the backoff so no slot is held while sleeping.
            let permit = match gate {
                Some(gate) => match GatePermit::acquire(gate) {
                    Some(permit) => Some(permit),
                    None => return self.circuit_open(context, attempt, started),
                },
                None => None,
            };

            attempt += 1;
            let result = operation.invoke(&context.with_attempt(attempt)).await;
            if let Some(permit) = permit {
                permit.record(result.is_ok());
            }

            match result {
                Ok(()) => {
                    streak += 1;
                    if streak >= self.policy.success_threshold {
                        info!(
                            target: "faultline::resilience::retry",
                            component = %context.component_id,
                            operation = operation.name(),
                            attempts = attempt,
                            "operation succeeded",
                        );
                        return RetryOutcome::Success {
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        };
                    }
                }
                Err(err) => {
                    streak = 0;
                    warn!(
                        target: "faultline::resilience::retry",
                        component = %context.component_id,
                        operation = operation.name(),
                        attempt,
                        error = %err,
                        "attempt failed",
                    );
                    if !err.is_retryable() {
                        return RetryOutcome::Failure(RetryFailure {
                            attempts: attempt,
                            circuit_open: false,
                            exhausted: false,
                            non_retryable: true,
                            last_error: Some(err),
                            elapsed: started.elapsed(),
                        });
                    }
                    last_error = Some(err);
                }
            }
        }

        RetryOutcome::Failure(RetryFailure {
            attempts: attempt,
            circuit_open: false,
            exhausted: true,
            non_retryable: false,
            last_error,
            elapsed: started.elapsed(),
        })
    }

    fn circuit_open(&self, context: &OperationContext, attempts: u32, started: Instant) -> RetryOutcome {
        warn!(
            target: "faultline::resilience::retry",
            component = %context.component_id,
            attempts,
            "circuit open; short-circuiting retry loop",
        );
        RetryOutcome::Failure(RetryFailure {
            attempts,
            circuit_open: true,
            exhausted: false,
            non_retryable: false,
            last_error: Some(ResilienceError::CircuitOpen(context.component_id.clone())),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::operation::FnOperation;
    use faultline_common::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(10), Duration::from_millis(50)).unwrap()
    }

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl Operation {
        FnOperation::new("flaky", move |_ctx: OperationContext| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(ResilienceError::Transient(format!("call {n} failed")))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[test]
    fn delay_is_monotonic_and_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        let mut previous = Duration::ZERO;
        for n in 1..=64 {
            let delay = policy.delay(n);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(50));
            previous = delay;
        }
    }

    #[test]
    fn zero_retries_are_a_configuration_error() {
        let err = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(2))
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(2, calls.clone());
        let executor = RetryExecutor::new(policy(4));
        let started = Instant::now();
        let outcome = executor
            .execute(&op, &OperationContext::new("ai_inference", "t"), None)
            .await;
        match outcome {
            RetryOutcome::Success { attempts, elapsed } => {
                assert_eq!(attempts, 3);
                assert!(elapsed >= Duration::from_millis(30));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(u32::MAX, calls.clone());
        let outcome = RetryExecutor::new(policy(3))
            .execute(&op, &OperationContext::new("data_store", "t"), None)
            .await;
        match outcome {
            RetryOutcome::Failure(failure) => {
                assert!(failure.exhausted);
                assert!(!failure.circuit_open);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_errors_stop_immediately() {
        let op = FnOperation::new("auth", |_ctx: OperationContext| async {
            Err::<(), _>(ResilienceError::Persistent("bad credentials".into()))
        });
        let outcome = RetryExecutor::new(policy(5))
            .execute(&op, &OperationContext::new("notification_dispatch", "t"), None)
            .await;
        match outcome {
            RetryOutcome::Failure(failure) => {
                assert!(failure.non_retryable);
                assert_eq!(failure.attempts, 1);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_without_sleeping() {
        let breaker = CircuitBreaker::new(
            "remote_execution",
            BreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(60),
                half_open_trial_count: 1,
                success_threshold: 1,
            },
        )
        .unwrap();
        breaker.on_result(false);
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(0, calls.clone());
        let started = Instant::now();
        let outcome = RetryExecutor::new(policy(3))
            .execute(
                &op,
                &OperationContext::new("remote_execution", "t"),
                Some(&breaker as &dyn CallGate),
            )
            .await;
        match outcome {
            RetryOutcome::Failure(failure) => {
                assert!(failure.circuit_open);
                assert_eq!(failure.attempts, 0);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nth_retry_waits_nth_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(3, calls.clone());
        let outcome = RetryExecutor::new(policy(4))
            .execute(&op, &OperationContext::new("ai_inference", "t"), None)
            .await;
        match outcome {
            RetryOutcome::Success { attempts, elapsed } => {
                assert_eq!(attempts, 4);
                // delay(1) + delay(2) + delay(3) = 10 + 20 + 40
                assert_eq!(elapsed, Duration::from_millis(70));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_call_returns_its_slot() {
        let breaker = CircuitBreaker::new(
            "remote_execution",
            BreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_millis(100),
                half_open_trial_count: 1,
                success_threshold: 1,
            },
        )
        .unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;

        let hung = FnOperation::new("hung", |_ctx: OperationContext| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let executor = RetryExecutor::new(policy(3));
        let context = OperationContext::new("remote_execution", "t");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            executor.execute(&hung, &context, Some(&breaker as &dyn CallGate)),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(breaker.trials_in_flight(), 0);

        let calls = Arc::new(AtomicU32::new(0));
        let healthy = flaky(0, calls.clone());
        let outcome = executor
            .execute(&healthy, &context, Some(&breaker as &dyn CallGate))
            .await;
        assert!(outcome.is_success());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_is_checked_again_after_backoff() {
        let breaker = CircuitBreaker::new(
            "remote_execution",
            BreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_secs(60),
                half_open_trial_count: 1,
                success_threshold: 1,
            },
        )
        .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(u32::MAX, calls.clone());
        let executor = RetryExecutor::new(policy(5));
        let context = OperationContext::new("remote_execution", "t");
        let run = executor.execute(&op, &context, Some(&breaker as &dyn CallGate));
        let trip = async {
            // Another caller opens the circuit while the first backoff is pending.
            sleep(Duration::from_millis(5)).await;
            breaker.on_result(false);
        };
        let (outcome, ()) = tokio::join!(run, trip);
        match outcome {
            RetryOutcome::Failure(failure) => {
                assert!(failure.circuit_open);
                assert_eq!(failure.attempts, 1);
            }
            other => panic!("expected circuit-open failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_threshold_requires_consecutive_successes() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = flaky(1, calls.clone());
        let executor = RetryExecutor::new(policy(5).with_success_threshold(2));
        let outcome = executor
            .execute(&op, &OperationContext::new("network_probe", "t"), None)
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
    }
}
