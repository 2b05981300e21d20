//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Per-component circuit breaker state machine."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use faultline_common::BreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Circuit states gating calls to a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally and failures are counted.
    Closed,
    /// Calls fail fast until the open timeout elapses.
    Open,
    /// A bounded number of trial calls probe the dependency.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission to make one call, returned by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit was closed.
    Normal,
    /// A half-open trial slot from the given half-open round.
    Trial { round: u64 },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Incremented every time trial slots are handed out afresh.
    round: u64,
    /// Last trial admission or trial result in the current round.
    trial_activity: Option<Instant>,
}

impl BreakerInner {
    fn closed(round: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            round,
            trial_activity: None,
        }
    }
}

/// Circuit breaker guarding a single component.
///
/// Half-open admission is bounded by an atomic in-flight counter so a burst of
/// callers arriving right after the open timeout cannot exceed
/// `half_open_trial_count` concurrent trials. A trial slot is released when its
/// result is reported through [`CircuitBreaker::on_result`], when its
/// [`Admission`] is handed back through [`CircuitBreaker::abandon`], or when
/// every slot has been held for a whole `open_timeout` without a result.
#[derive(Debug)]
pub struct CircuitBreaker {
    component: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    trials_in_flight: AtomicU32,
}

impl CircuitBreaker {
    /// Build a breaker, rejecting invalid thresholds up front.
    pub fn new(component: impl Into<String>, config: BreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            component: component.into(),
            config,
            inner: Mutex::new(BreakerInner::closed(0)),
            trials_in_flight: AtomicU32::new(0),
        })
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without triggering the open to half-open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn trials_in_flight(&self) -> u32 {
        self.trials_in_flight.load(Ordering::SeqCst)
    }

    /// Time left before an open circuit admits a trial call.
    pub fn remaining_open(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.open_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Decide whether a call may proceed right now.
    ///
    /// A `true` taken in half-open state holds a trial slot until the call's
    /// result is reported. Callers that may be cancelled mid-call should use
    /// [`CircuitBreaker::admit`] and hand the admission back on cancellation.
    pub fn should_allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Admit one call, or `None` when the circuit rejects it.
    pub fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < self.config.open_timeout {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                self.start_round(&mut inner);
                info!(
                    target: "faultline::resilience::circuit_breaker",
                    component = %self.component,
                    open_ms = elapsed.as_millis() as u64,
                    "circuit half-open; admitting trial calls",
                );
                self.admit_trial(&mut inner)
            }
            CircuitState::HalfOpen => {
                if self.trials_stalled(&inner) {
                    warn!(
                        target: "faultline::resilience::circuit_breaker",
                        component = %self.component,
                        trials = self.trials_in_flight(),
                        "trial calls reported nothing within the open timeout; recycling slots",
                    );
                    self.start_round(&mut inner);
                }
                self.admit_trial(&mut inner)
            }
        }
    }

    /// Would [`CircuitBreaker::admit`] reject a call right now? Takes no slot.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|opened_at| opened_at.elapsed() < self.config.open_timeout),
            CircuitState::HalfOpen => {
                self.trials_in_flight() >= self.config.half_open_trial_count
                    && !self.trials_stalled(&inner)
            }
        }
    }

    /// Hand back an admission whose call never reported a result.
    pub fn abandon(&self, admission: Admission) {
        let Admission::Trial { round } = admission else {
            return;
        };
        let inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.round == round {
            self.release_trial();
            debug!(
                target: "faultline::resilience::circuit_breaker",
                component = %self.component,
                round,
                "abandoned trial slot released",
            );
        }
    }

    fn start_round(&self, inner: &mut BreakerInner) {
        inner.round += 1;
        inner.trial_activity = Some(Instant::now());
        self.trials_in_flight.store(0, Ordering::SeqCst);
    }

    fn trials_stalled(&self, inner: &BreakerInner) -> bool {
        self.trials_in_flight() >= self.config.half_open_trial_count
            && inner
                .trial_activity
                .is_some_and(|at| at.elapsed() >= self.config.open_timeout)
    }

    fn admit_trial(&self, inner: &mut BreakerInner) -> Option<Admission> {
        let limit = self.config.half_open_trial_count;
        let admitted = self
            .trials_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_flight| {
                (in_flight < limit).then_some(in_flight + 1)
            })
            .is_ok();
        if !admitted {
            return None;
        }
        inner.trial_activity = Some(Instant::now());
        Some(Admission::Trial { round: inner.round })
    }

    fn release_trial(&self) {
        let _ = self
            .trials_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_flight| {
                Some(in_flight.saturating_sub(1))
            });
    }

    /// Report the result of a call. Returns the new state when a transition happened.
    pub fn on_result(&self, success: bool) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed if success => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        target: "faultline::resilience::circuit_breaker",
                        component = %self.component,
                        failures = inner.consecutive_failures,
                        "failure threshold reached; opening circuit",
                    );
                    self.open_locked(&mut inner);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.release_trial();
                inner.trial_activity = Some(Instant::now());
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        let round = inner.round;
                        *inner = BreakerInner::closed(round);
                        self.trials_in_flight.store(0, Ordering::SeqCst);
                        info!(
                            target: "faultline::resilience::circuit_breaker",
                            component = %self.component,
                            "trial calls succeeded; circuit closed",
                        );
                        return Some(CircuitState::Closed);
                    }
                    None
                } else {
                    warn!(
                        target: "faultline::resilience::circuit_breaker",
                        component = %self.component,
                        "trial call failed; reopening circuit",
                    );
                    self.open_locked(&mut inner);
                    Some(CircuitState::Open)
                }
            }
            CircuitState::Open => {
                debug!(
                    target: "faultline::resilience::circuit_breaker",
                    component = %self.component,
                    success,
                    "late result ignored while circuit is open",
                );
                None
            }
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.consecutive_failures = 0;
        self.trials_in_flight.store(0, Ordering::SeqCst);
    }

    /// Force the circuit open, e.g. when an operator isolates a dependency.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open_locked(&mut inner);
    }

    /// Return to a fresh closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let round = inner.round;
        *inner = BreakerInner::closed(round);
        self.trials_in_flight.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(failure_threshold: u32, trials: u32, successes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            open_timeout: Duration::from_millis(100),
            half_open_trial_count: trials,
            success_threshold: successes,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_open_the_circuit() {
        for threshold in 1..=8 {
            let breaker = CircuitBreaker::new("db", config(threshold, 1, 1)).unwrap();
            for _ in 0..threshold - 1 {
                assert_eq!(breaker.on_result(false), None);
            }
            assert_eq!(breaker.on_result(false), Some(CircuitState::Open));
            assert!(!breaker.should_allow());
            tokio::time::advance(Duration::from_millis(99)).await;
            assert!(!breaker.should_allow(), "threshold {threshold}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_call_before_timeout_is_rejected() {
        let breaker = CircuitBreaker::new("inference", config(5, 1, 1)).unwrap();
        for _ in 0..5 {
            assert!(breaker.should_allow());
            breaker.on_result(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow());
        assert!(breaker.remaining_open() > Duration::ZERO);
    }

    #[tokio::test]
    async fn closed_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("mail", config(3, 1, 1)).unwrap();
        breaker.on_result(false);
        breaker.on_result(false);
        assert_eq!(breaker.consecutive_failures(), 2);
        breaker.on_result(true);
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.on_result(false);
        breaker.on_result(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("exec", config(1, 1, 2)).unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.should_allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.should_allow(), "only one trial may be in flight");
        assert_eq!(breaker.on_result(true), None);
        assert!(breaker.should_allow());
        assert_eq!(breaker.on_result(true), Some(CircuitState::Closed));
        assert_eq!(breaker.trials_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("exec", config(1, 2, 3)).unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.should_allow());
        breaker.on_result(true);
        assert!(breaker.should_allow());
        assert_eq!(breaker.on_result(false), Some(CircuitState::Open));
        assert!(!breaker.should_allow());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trials_are_bounded() {
        let breaker = Arc::new(CircuitBreaker::new("probe", config(1, 3, 5)).unwrap());
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move { breaker.should_allow() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(breaker.trials_in_flight(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_its_slot() {
        let breaker = CircuitBreaker::new("exec", config(1, 1, 1)).unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        let admission = breaker.admit().unwrap();
        assert!(matches!(admission, Admission::Trial { .. }));
        assert!(breaker.admit().is_none());
        assert!(breaker.is_rejecting());

        breaker.abandon(admission);
        assert_eq!(breaker.trials_in_flight(), 0);
        assert!(!breaker.is_rejecting());
        assert!(breaker.should_allow());
        assert_eq!(breaker.on_result(true), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_admission_does_not_free_a_later_round() {
        let breaker = CircuitBreaker::new("exec", config(1, 1, 2)).unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        let stale = breaker.admit().unwrap();
        breaker.force_open();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.admit().is_some());
        breaker.abandon(stale);
        assert_eq!(breaker.trials_in_flight(), 1);
        assert!(breaker.admit().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_trials_are_recycled_after_open_timeout() {
        let breaker = CircuitBreaker::new("exec", config(1, 1, 1)).unwrap();
        breaker.on_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.should_allow());
        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!breaker.should_allow());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!breaker.is_rejecting());
        assert!(breaker.should_allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.trials_in_flight(), 1);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(CircuitBreaker::new("x", config(0, 1, 1)).is_err());
        assert!(CircuitBreaker::new("x", config(1, 0, 1)).is_err());
    }
}
