//! Per-target circuit breakers for the tool-call bridge.
//!
//! Failures are kept as timestamps and pruned to the failure window before
//! every decision. Reaching the threshold inside the window opens the
//! breaker; while open every call is rejected until the reset timeout
//! elapses, after which a limited number of trial calls go through (half-open).
//! One failed trial re-opens it; enough consecutive successful trial calls close
//! it and clear the history.
//!
//! Callers that await between admission and outcome take a [`CallPermit`]
//! from [`CircuitBreaker::try_acquire`]. A permit dropped without an outcome
//! (its call was cancelled) hands its trial slot back.
//!
//! Time comes from [`tokio::time::Instant`], so tests can drive it with a
//! paused clock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Breaker tuning, shared by every target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the breaker.
    pub failure_threshold: u32,
    /// How far back failures count.
    pub failure_window: Duration,
    /// How long the breaker stays open before admitting trial calls.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Trial calls allowed in flight while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 1,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass; failures are counted.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls pass.
    HalfOpen,
}

impl CircuitState {
    /// Kebab-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with `(target, new_state)` on every transition.
pub type TransitionHook = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    next_attempt: Option<Instant>,
    /// Bumped on every transition; trial permits from an older epoch no
    /// longer hold a slot.
    epoch: u64,
}

/// Breaker for one target.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    on_transition: Option<TransitionHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// A closed breaker for `target`.
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                half_open_in_flight: 0,
                next_attempt: None,
                epoch: 0,
            }),
            on_transition: None,
        }
    }

    fn with_hook(mut self, hook: Option<TransitionHook>) -> Self {
        self.on_transition = hook;
        self
    }

    /// Target id.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Does not advance open to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures currently inside the window.
    pub fn failure_count(&self) -> usize {
        let mut st = self.lock();
        self.prune(&mut st, Instant::now());
        st.failures.len()
    }

    /// Whether a call may proceed now. Admitting a half-open trial counts
    /// against `half_open_max_calls` until its outcome is recorded.
    pub fn can_execute(&self) -> bool {
        self.admit().is_some()
    }

    /// Admit one call and tie its trial slot, if any, to the returned
    /// permit. `None` when the breaker refuses the call.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let trial_epoch = self.admit()?;
        Some(CallPermit {
            breaker: self.clone(),
            trial_epoch,
            settled: false,
        })
    }

    /// `None` when refused, `Some(Some(epoch))` for a half-open trial.
    fn admit(&self) -> Option<Option<u64>> {
        let now = Instant::now();
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => {
                if st.next_attempt.is_some_and(|t| now >= t) {
                    self.transition(&mut st, CircuitState::HalfOpen);
                    st.half_open_in_flight = 1;
                    Some(Some(st.epoch))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if st.half_open_in_flight < self.config.half_open_max_calls {
                    st.half_open_in_flight += 1;
                    Some(Some(st.epoch))
                } else {
                    None
                }
            }
        }
    }

    /// Trial calls currently holding a half-open slot.
    pub fn trials_in_flight(&self) -> u32 {
        self.lock().half_open_in_flight
    }

    /// Time left before an open breaker admits a trial.
    pub fn retry_after(&self) -> Option<Duration> {
        let st = self.lock();
        match st.state {
            CircuitState::Open => st
                .next_attempt
                .map(|t| t.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            self.trial_succeeded(&mut st);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        self.failed(&mut st, now);
    }

    fn trial_succeeded(&self, st: &mut BreakerState) {
        st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        st.half_open_successes += 1;
        if st.half_open_successes >= self.config.success_threshold {
            self.transition(st, CircuitState::Closed);
        }
    }

    fn failed(&self, st: &mut BreakerState, now: Instant) {
        match st.state {
            CircuitState::HalfOpen => {
                st.failures.push_back(now);
                self.open(st, now);
            }
            CircuitState::Closed => {
                self.prune(st, now);
                st.failures.push_back(now);
                if st.failures.len() >= self.config.failure_threshold as usize {
                    self.open(st, now);
                }
            }
            CircuitState::Open => {
                self.prune(st, now);
                st.failures.push_back(now);
            }
        }
    }

    /// Whether `trial_epoch` still holds a slot in the current half-open run.
    fn holds_slot(st: &BreakerState, trial_epoch: Option<u64>) -> bool {
        st.state == CircuitState::HalfOpen && trial_epoch == Some(st.epoch)
    }

    fn settle(&self, trial_epoch: Option<u64>, success: bool) {
        let now = Instant::now();
        let mut st = self.lock();
        if success {
            // A call admitted before the breaker last opened says nothing
            // about recovery.
            if Self::holds_slot(&st, trial_epoch) {
                self.trial_succeeded(&mut st);
            }
        } else {
            if Self::holds_slot(&st, trial_epoch) {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
            self.failed(&mut st, now);
        }
    }

    fn release(&self, trial_epoch: Option<u64>) {
        let mut st = self.lock();
        if Self::holds_slot(&st, trial_epoch) {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            tracing::debug!(target_id = %self.target, "half-open trial abandoned");
        }
    }

    fn prune(&self, st: &mut BreakerState, now: Instant) {
        while st
            .failures
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) > self.config.failure_window)
        {
            st.failures.pop_front();
        }
    }

    fn open(&self, st: &mut BreakerState, now: Instant) {
        st.next_attempt = Some(now + self.config.reset_timeout);
        self.transition(st, CircuitState::Open);
        tracing::warn!(
            target_id = %self.target,
            failures = st.failures.len(),
            reset_ms = self.config.reset_timeout.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        st.state = to;
        st.half_open_successes = 0;
        st.half_open_in_flight = 0;
        st.epoch += 1;
        match to {
            CircuitState::Closed => {
                st.failures.clear();
                st.next_attempt = None;
                tracing::info!(target_id = %self.target, "circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                tracing::info!(target_id = %self.target, "circuit breaker half-open, allowing trial");
            }
            CircuitState::Open => {}
        }
        if from != to {
            if let Some(hook) = &self.on_transition {
                hook(&self.target, to);
            }
        }
    }
}

/// Admission for one call through a [`CircuitBreaker`].
///
/// Consume it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unrecorded frees a
/// half-open trial slot without counting an outcome.
#[must_use = "dropping a permit discards the call's outcome"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial_epoch: Option<u64>,
    settled: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("target", &self.breaker.target)
            .field("trial", &self.trial_epoch.is_some())
            .finish()
    }
}

impl CallPermit {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial_epoch.is_some()
    }

    /// The call succeeded.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial_epoch, true);
    }

    /// The call failed.
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial_epoch, false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.trial_epoch);
        }
    }
}

/// Breakers keyed by target id, created on first use.
#[derive(Default)]
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    on_transition: Option<TransitionHook>,
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("targets", &self.snapshot())
            .finish()
    }
}

impl CircuitBreakerManager {
    /// A manager handing out breakers with `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            on_transition: None,
        }
    }

    /// Observe every transition of every breaker created afterwards.
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    /// The breaker for `target`.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(target, self.config.clone())
                        .with_hook(self.on_transition.clone()),
                )
            })
            .clone()
    }

    /// State of every known target, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
