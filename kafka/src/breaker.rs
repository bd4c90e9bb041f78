//! Failure-ratio circuit breaker guarding the publish path.
//!
//! The breaker counts call outcomes per generation. A generation ends on every
//! state change and, while closed, whenever the rolling `interval` elapses.
//! Outcomes of calls admitted in an earlier generation are ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::config::duration_ms;

/// State of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Call counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    /// Share of admitted requests that failed, `0.0` when nothing was admitted.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }

    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Tuning for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Name reported with every state change.
    pub name: String,

    /// Trial calls admitted while half-open; this many consecutive successes
    /// close the breaker.
    pub max_requests: u32,

    /// Rolling window after which closed-state counters reset. Zero keeps the
    /// counters until the next state change.
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,

    /// Cooldown spent open before probing.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,

    /// Requests in the window before the failure ratio is evaluated.
    pub min_requests: u32,

    /// Failure ratio at or above which the breaker opens.
    pub failure_ratio: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "kafka-producer".to_string(),
            max_requests: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

impl BreakerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the trip condition: at least `min_requests` with a failure ratio
    /// of `failure_ratio` or more.
    pub fn with_trip(mut self, min_requests: u32, failure_ratio: f64) -> Self {
        self.min_requests = min_requests;
        self.failure_ratio = failure_ratio;
        self
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }
}

/// Receives every state transition of a breaker.
///
/// Called with the breaker's lock held; implementations must not call back
/// into the breaker.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

impl<F> StateObserver for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self(name, from, to)
    }
}

/// Default observer: one structured warning per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl StateObserver for LogObserver {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        warn!(name, from = %from, to = %to, "Circuit breaker state change");
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("circuit breaker is half-open and its trial budget is spent")]
    TooManyRequests,

    #[error("{0}")]
    Inner(E),
}

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    observer: Box<dyn StateObserver>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.settings.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a breaker that logs its transitions.
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_observer(settings, LogObserver)
    }

    pub fn with_observer(mut settings: BreakerSettings, observer: impl StateObserver + 'static) -> Self {
        settings.max_requests = settings.max_requests.max(1);
        let expiry = Self::closed_expiry(&settings, Instant::now());
        Self {
            settings,
            observer: Box::new(observer),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Current state, applying any cooldown or window expiry first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Counters of the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// True iff the breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Runs `f` if the breaker admits the call and records its outcome.
    ///
    /// When the breaker is open, `f` is not invoked. If the returned future is
    /// dropped before `f` completes, the call counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;
        let mut pending = Pending {
            breaker: self,
            generation,
            done: false,
        };

        let result = f().await;
        pending.finish(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Open => return Err(BreakerError::Open),
            CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                return Err(BreakerError::TooManyRequests);
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.on_success();
            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_requests
            {
                self.set_state(&mut inner, CircuitState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                CircuitState::Closed if self.settings.ready_to_trip(&inner.counts) => {
                    self.set_state(&mut inner, CircuitState::Open, now);
                }
                CircuitState::HalfOpen => self.set_state(&mut inner, CircuitState::Open, now),
                _ => {}
            }
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => self.set_state(inner, CircuitState::HalfOpen, now),
            _ => {}
        }
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);
        self.observer.on_state_change(&self.settings.name, from, to);
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => Self::closed_expiry(&self.settings, now),
            CircuitState::Open => Some(now + self.settings.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn closed_expiry(settings: &BreakerSettings, now: Instant) -> Option<Instant> {
        (!settings.interval.is_zero()).then(|| now + settings.interval)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records a failure for an admitted call whose future was dropped.
struct Pending<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    done: bool,
}

impl Pending<'_> {
    fn finish(&mut self, success: bool) {
        self.done = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.after_request(self.generation, false);
        }
    }
}
