//! Circuit breaker for endpoint protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: endpoint assumed down, calls fail fast
//! - HalfOpen: one trial call tests whether the endpoint recovered
//! - PermanentlyOpen: endpoint does not offer the feature; terminal until
//!   reset or config reload
//!
//! # State Transitions
//! ```text
//! Closed → Open: open_threshold consecutive transient failures within window
//! Open → HalfOpen: after cool_down (observed lazily, trial granted on admission)
//! HalfOpen → Closed: success_threshold trial successes (cool-down back to base)
//! HalfOpen → Open: trial fails (cool-down doubled, capped)
//! any → PermanentlyOpen: PermanentlyUnsupported failure
//! ```
//!
//! # Design Decisions
//! - Per-endpoint breaker (not global), one mutex per endpoint for transitions
//! - Lock-free reads from an `ArcSwap` snapshot published after each change
//! - Admission is split: `would_allow` for route planning, `is_call_allowed`
//!   at dispatch, which claims the half-open trial
//! - An unresolved trial expires after one cool-down

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::endpoint::EndpointId;
use crate::observability::metrics;
use crate::resilience::backoff::next_cool_down;
use crate::resilience::classify::FailureClass;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    PermanentlyOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::PermanentlyOpen => "permanently_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of one breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub endpoint: EndpointId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cool_down_ms: u64,
    /// Milliseconds since the last state change.
    pub since_change_ms: u64,
    /// Milliseconds since the last recorded failure.
    pub since_failure_ms: Option<u64>,
}

/// Published after every transition; read without locking.
#[derive(Debug, Clone)]
struct Snapshot {
    state: CircuitState,
    open_until: Option<Instant>,
    trial_started: Option<Instant>,
    consecutive_failures: u32,
    cool_down: Duration,
    last_state_change: Instant,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Timestamps of the current failure streak, pruned to the window.
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    open_until: Option<Instant>,
    trial_started: Option<Instant>,
    half_open_successes: u32,
    cool_down: Duration,
}

impl BreakerInner {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_failure: None,
            last_state_change: Instant::now(),
            open_until: None,
            trial_started: None,
            half_open_successes: 0,
            cool_down: config.cool_down(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            open_until: self.open_until,
            trial_started: self.trial_started,
            consecutive_failures: self.failures.len() as u32,
            cool_down: self.cool_down,
            last_state_change: self.last_state_change,
            last_failure: self.last_failure,
        }
    }
}

/// Circuit breaker for a single endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: EndpointId,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    snapshot: ArcSwap<Snapshot>,
}

impl CircuitBreaker {
    pub fn new(endpoint: EndpointId, config: BreakerConfig) -> Self {
        let inner = BreakerInner::new(&config);
        let snapshot = ArcSwap::from_pointee(inner.snapshot());
        Self {
            endpoint,
            config,
            inner: Mutex::new(inner),
            snapshot,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &BreakerInner) {
        self.snapshot.store(Arc::new(inner.snapshot()));
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.last_state_change = Instant::now();
        metrics::record_breaker_state(self.endpoint.as_str(), to);
        match to {
            CircuitState::PermanentlyOpen => tracing::warn!(
                endpoint = %self.endpoint,
                from = %from,
                "Endpoint permanently unsupported, circuit permanently open"
            ),
            CircuitState::Open => tracing::warn!(
                endpoint = %self.endpoint,
                from = %from,
                cool_down = ?inner.cool_down,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                endpoint = %self.endpoint,
                "Circuit half-open, admitting trial call"
            ),
            CircuitState::Closed => tracing::info!(
                endpoint = %self.endpoint,
                from = %from,
                "Circuit closed"
            ),
        }
    }

    /// Current state, lock-free. Reports `HalfOpen` once an open circuit's
    /// cool-down has elapsed, even before a trial is admitted.
    pub fn current_state(&self) -> CircuitState {
        let snap = self.snapshot.load();
        match snap.state {
            CircuitState::Open if snap.open_until.is_some_and(|t| Instant::now() >= t) => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    /// Whether a call would currently be admitted, without claiming a trial.
    pub fn would_allow(&self) -> bool {
        let snap = self.snapshot.load();
        let now = Instant::now();
        match snap.state {
            CircuitState::Closed => true,
            CircuitState::Open => snap.open_until.is_some_and(|t| now >= t),
            CircuitState::HalfOpen => trial_available(snap.trial_started, snap.cool_down, now),
            CircuitState::PermanentlyOpen => false,
        }
    }

    /// Admit a call. In the half-open state this claims the single trial.
    pub fn is_call_allowed(&self) -> bool {
        // Fast path for the common case.
        if self.snapshot.load().state == CircuitState::Closed {
            return true;
        }

        let mut inner = self.lock();
        let now = Instant::now();
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::PermanentlyOpen => false,
            CircuitState::Open => {
                if inner.open_until.is_some_and(|t| now >= t) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_successes = 0;
                    inner.trial_started = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if trial_available(inner.trial_started, inner.cool_down, now) {
                    if inner.trial_started.is_some() {
                        tracing::debug!(endpoint = %self.endpoint, "Half-open trial expired, admitting another");
                    }
                    inner.trial_started = Some(now);
                    true
                } else {
                    false
                }
            }
        };
        self.publish(&inner);
        allowed
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::PermanentlyOpen | CircuitState::Open => return,
            CircuitState::Closed => {
                if inner.failures.is_empty() {
                    return;
                }
                inner.failures.clear();
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                inner.trial_started = None;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    inner.open_until = None;
                    inner.half_open_successes = 0;
                    inner.cool_down = self.config.cool_down();
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
        }
        self.publish(&inner);
    }

    pub fn record_failure(&self, class: FailureClass) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);

        if class == FailureClass::PermanentlyUnsupported {
            if inner.state != CircuitState::PermanentlyOpen {
                inner.open_until = None;
                inner.trial_started = None;
                self.transition(&mut inner, CircuitState::PermanentlyOpen);
                self.publish(&inner);
            }
            return;
        }

        match inner.state {
            CircuitState::PermanentlyOpen | CircuitState::Open => {}
            CircuitState::Closed => {
                let window = self.config.window();
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);
                if inner.failures.len() as u32 >= self.config.open_threshold {
                    inner.open_until = Some(now + inner.cool_down);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.cool_down = next_cool_down(inner.cool_down, self.config.max_cool_down());
                inner.open_until = Some(now + inner.cool_down);
                inner.trial_started = None;
                inner.half_open_successes = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
        }
        self.publish(&inner);
    }

    /// Force the breaker back to `Closed` with a base cool-down.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = BreakerInner::new(&self.config);
        inner.state = previous;
        self.transition(&mut inner, CircuitState::Closed);
        self.publish(&inner);
    }

    pub fn status(&self) -> BreakerStatus {
        let snap = self.snapshot.load();
        BreakerStatus {
            endpoint: self.endpoint.clone(),
            state: self.current_state(),
            consecutive_failures: snap.consecutive_failures,
            cool_down_ms: snap.cool_down.as_millis() as u64,
            since_change_ms: snap.last_state_change.elapsed().as_millis() as u64,
            since_failure_ms: snap.last_failure.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

fn trial_available(trial_started: Option<Instant>, cool_down: Duration, now: Instant) -> bool {
    match trial_started {
        None => true,
        Some(started) => now >= started + cool_down,
    }
}

/// One breaker per endpoint.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<EndpointId, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new<'a>(config: BreakerConfig, endpoints: impl IntoIterator<Item = &'a EndpointId>) -> Self {
        let breakers = DashMap::new();
        for id in endpoints {
            breakers.insert(id.clone(), Arc::new(CircuitBreaker::new(id.clone(), config.clone())));
        }
        Self { config, breakers }
    }

    /// Breaker for `endpoint`, created on first use.
    pub fn get(&self, endpoint: &EndpointId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint) {
            return breaker.clone();
        }
        self.breakers
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint.clone(), self.config.clone())))
            .clone()
    }

    pub fn record_success(&self, endpoint: &EndpointId) {
        self.get(endpoint).record_success();
    }

    pub fn record_failure(&self, endpoint: &EndpointId, class: FailureClass) {
        self.get(endpoint).record_failure(class);
    }

    pub fn is_call_allowed(&self, endpoint: &EndpointId) -> bool {
        self.get(endpoint).is_call_allowed()
    }

    pub fn would_allow(&self, endpoint: &EndpointId) -> bool {
        self.get(endpoint).would_allow()
    }

    pub fn current_state(&self, endpoint: &EndpointId) -> CircuitState {
        self.get(endpoint).current_state()
    }

    /// Reset one endpoint. Returns false for an unknown endpoint.
    pub fn reset(&self, endpoint: &EndpointId) -> bool {
        match self.breakers.get(endpoint) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every `PermanentlyOpen` breaker. Returns the endpoints reset.
    pub fn reset_permanent(&self) -> Vec<EndpointId> {
        let permanent: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .filter(|b| b.current_state() == CircuitState::PermanentlyOpen)
            .map(|b| b.value().clone())
            .collect();
        permanent
            .iter()
            .map(|breaker| {
                breaker.reset();
                breaker.endpoint.clone()
            })
            .collect()
    }

    /// Status of every breaker, ordered by endpoint id.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self.breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.endpoint.as_str().cmp(b.endpoint.as_str()));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            open_threshold: 3,
            window_ms: 60_000,
            cool_down_ms: 1_000,
            max_cool_down_ms: 3_000,
            success_threshold: 1,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(EndpointId::new("ai.primary"), config())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_transient_failures() {
        let b = breaker();
        b.record_failure(FailureClass::Transient);
        b.record_failure(FailureClass::Transient);
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.is_call_allowed());

        b.record_failure(FailureClass::Transient);
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(!b.is_call_allowed());
        assert!(!b.would_allow());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_accumulate() {
        let b = breaker();
        b.record_failure(FailureClass::Transient);
        b.record_failure(FailureClass::Transient);
        tokio::time::advance(Duration::from_secs(61)).await;
        b.record_failure(FailureClass::Transient);
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert_eq!(b.status().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let b = breaker();
        b.record_failure(FailureClass::Transient);
        b.record_failure(FailureClass::Transient);
        b.record_success();
        b.record_failure(FailureClass::Transient);
        assert_eq!(b.current_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cool_down_admits_exactly_one_trial() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(FailureClass::Transient);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert_eq!(b.current_state(), CircuitState::HalfOpen);
        assert!(b.would_allow());
        assert!(b.is_call_allowed());
        assert!(!b.is_call_allowed());
        assert!(!b.would_allow());

        b.record_success();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert_eq!(b.status().cool_down_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_needs_success_threshold_trials_to_close() {
        let b = CircuitBreaker::new(
            EndpointId::new("ai.primary"),
            BreakerConfig {
                success_threshold: 2,
                ..config()
            },
        );
        for _ in 0..3 {
            b.record_failure(FailureClass::Transient);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert!(b.is_call_allowed());
        b.record_success();
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        // The first success frees the trial slot for the next one.
        assert!(b.is_call_allowed());
        assert!(!b.is_call_allowed());
        b.record_success();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert_eq!(b.status().cool_down_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_between_half_open_successes_reopens() {
        let b = CircuitBreaker::new(
            EndpointId::new("ai.primary"),
            BreakerConfig {
                success_threshold: 2,
                ..config()
            },
        );
        for _ in 0..3 {
            b.record_failure(FailureClass::Transient);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(b.is_call_allowed());
        b.record_success();
        assert!(b.is_call_allowed());
        b.record_failure(FailureClass::Transient);

        assert_eq!(b.current_state(), CircuitState::Open);
        assert_eq!(b.status().cool_down_ms, 2_000);

        // The success count starts over after the next cool-down.
        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert!(b.is_call_allowed());
        b.record_success();
        assert_eq!(b.current_state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_doubled_cool_down() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(FailureClass::Transient);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(b.is_call_allowed());
        b.record_failure(FailureClass::Transient);

        assert_eq!(b.current_state(), CircuitState::Open);
        assert_eq!(b.status().cool_down_ms, 2_000);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(!b.is_call_allowed());
        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(b.is_call_allowed());

        // Capped at max_cool_down.
        b.record_failure(FailureClass::Transient);
        assert_eq!(b.status().cool_down_ms, 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_expires() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure(FailureClass::Transient);
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(b.is_call_allowed());

        // The trial caller never reports back.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!b.is_call_allowed());
        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(b.is_call_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_terminal_until_reset() {
        let b = breaker();
        b.record_failure(FailureClass::PermanentlyUnsupported);
        assert_eq!(b.current_state(), CircuitState::PermanentlyOpen);

        b.record_success();
        b.record_failure(FailureClass::Transient);
        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert_eq!(b.current_state(), CircuitState::PermanentlyOpen);
        assert!(!b.is_call_allowed());
        assert!(!b.would_allow());

        b.reset();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.is_call_allowed());
    }

    #[test]
    fn registry_resets_only_permanent_breakers() {
        let primary = EndpointId::new("ai.primary");
        let secondary = EndpointId::new("ai.secondary");
        let registry = BreakerRegistry::new(config(), [&primary, &secondary]);

        registry.record_failure(&primary, FailureClass::PermanentlyUnsupported);
        for _ in 0..3 {
            registry.record_failure(&secondary, FailureClass::Transient);
        }

        assert_eq!(registry.reset_permanent(), vec![primary.clone()]);
        assert_eq!(registry.current_state(&primary), CircuitState::Closed);
        assert_eq!(registry.current_state(&secondary), CircuitState::Open);
    }

    #[test]
    fn registry_creates_unknown_breakers_lazily() {
        let registry = BreakerRegistry::new(config(), std::iter::empty());
        let id = EndpointId::new("store.fallback");
        assert!(!registry.reset(&id));
        assert_eq!(registry.current_state(&id), CircuitState::Closed);
        assert!(registry.reset(&id));
        assert_eq!(registry.statuses().len(), 1);
    }
}
