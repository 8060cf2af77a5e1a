//! Circuit breaker: fail fast when a downstream dependency is unhealthy
//!
//! `CLOSED → OPEN` after `failure_threshold` consecutive expected failures.
//! While `OPEN`, calls are rejected without touching the dependency until the
//! recovery timeout has elapsed; the next call then runs as a single
//! `HALF_OPEN` probe. A successful probe closes the breaker, a failed one
//! reopens it.
//!
//! Only failures matching the configured expected-error list count toward
//! tripping. Other errors are returned to the caller unchanged and leave the
//! breaker state alone.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without calling the dependency
    Open { name: String, retry_in: Duration },
    /// The wrapped operation failed
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True if the call was rejected by an open breaker
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { name, retry_in } => write!(
                f,
                "Circuit breaker '{}' is open, retry in {}ms",
                name,
                retry_in.as_millis()
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Request counters exported for health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    /// Every call seen, including rejected ones
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    /// `failed / total`, rounded to two decimals
    pub failure_rate: f64,
    /// Closed and failing less than 10% of calls
    pub is_healthy: bool,
}

/// Health export entry for one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    pub state: CircuitState,
    pub stats: BreakerStats,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped whenever a half-open slot is handed out
    trial_epoch: u64,
    consecutive_failures: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            next_attempt: None,
            probe_in_flight: false,
            trial_epoch: 0,
            consecutive_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
        }
    }
}

/// Per-dependency circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given settings
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Create a breaker with default settings (5 failures, 60s recovery)
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// When the next probe will be allowed, if the breaker is open
    pub fn next_attempt(&self) -> Option<Instant> {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => inner.next_attempt,
            _ => None,
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Returns `BreakerError::Open` without invoking `operation` while the
    /// breaker is open (or a half-open probe is already running).
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        let admission = self.acquire::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            armed: true,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(admission, &e);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Whether `error` matches the expected-error list
    ///
    /// Matches each configured name against the error's `Debug` output
    /// (type names, `io::ErrorKind` variants) and its message.
    pub fn is_expected_failure<E: fmt::Debug + fmt::Display>(&self, error: &E) -> bool {
        let debug = format!("{:?}", error);
        let message = error.to_string();
        self.config
            .expected_errors
            .iter()
            .any(|expected| debug.contains(expected.as_str()) || message.contains(expected.as_str()))
    }

    /// Counters and derived health
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        let failure_rate = if inner.total_requests == 0 {
            0.0
        } else {
            let rate = inner.failed_requests as f64 / inner.total_requests as f64;
            (rate * 100.0).round() / 100.0
        };
        BreakerStats {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            consecutive_failures: inner.consecutive_failures,
            failure_rate,
            is_healthy: inner.state == CircuitState::Closed && failure_rate < 0.1,
        }
    }

    /// State plus stats, as exported to health checks
    pub fn health(&self) -> BreakerHealth {
        BreakerHealth {
            state: self.state(),
            stats: self.stats(),
        }
    }

    /// Close the breaker and clear every counter
    pub fn reset(&self) {
        let mut inner = self.lock();
        // Epochs keep counting so a trial from before the reset stays stale
        let trial_epoch = inner.trial_epoch;
        *inner = BreakerInner::new();
        inner.trial_epoch = trial_epoch;
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Open the breaker now, regardless of failures
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout());
        inner.probe_in_flight = false;
        tracing::warn!(breaker = %self.name, "Circuit breaker forced open");
    }

    /// Close the breaker now and clear the consecutive failure count
    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.next_attempt = None;
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        tracing::info!(breaker = %self.name, "Circuit breaker forced closed");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit or reject a call, reporting which kind of call was admitted
    fn acquire<E>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.lock();
        inner.total_requests += 1;
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let next_attempt = inner.next_attempt.unwrap_or(now);
                if now >= next_attempt {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing");
                    Ok(inner.start_trial())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in: next_attempt - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    Ok(inner.start_trial())
                }
            }
        }
    }

    /// Only the call holding the current half-open slot may close the
    /// breaker. Calls admitted while closed that finish after a trip just
    /// update the counters.
    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.successful_requests += 1;

        match admission {
            Admission::Normal => {
                if inner.state == CircuitState::Closed {
                    inner.consecutive_failures = 0;
                }
            }
            Admission::Trial(epoch) => {
                if inner.finish_trial(epoch) && inner.state == CircuitState::HalfOpen {
                    inner.state = CircuitState::Closed;
                    inner.next_attempt = None;
                    inner.consecutive_failures = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker closed after successful probe");
                }
            }
        }
    }

    fn on_failure<E: fmt::Debug + fmt::Display>(&self, admission: Admission, error: &E) {
        let expected = self.is_expected_failure(error);
        let mut inner = self.lock();
        inner.failed_requests += 1;
        let owns_trial = match admission {
            Admission::Normal => false,
            Admission::Trial(epoch) => inner.finish_trial(epoch),
        };

        if !expected {
            tracing::debug!(
                breaker = %self.name,
                error = %error,
                "Unexpected error, not counted toward tripping"
            );
            return;
        }

        inner.consecutive_failures += 1;
        let trip = match inner.state {
            CircuitState::HalfOpen => owns_trial,
            CircuitState::Closed => {
                admission == Admission::Normal
                    && inner.consecutive_failures >= self.config.failure_threshold
            }
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout());
            tracing::warn!(
                breaker = %self.name,
                consecutive_failures = inner.consecutive_failures,
                recovery_ms = self.config.recovery_timeout_ms,
                error = %error,
                "Circuit breaker opened"
            );
        }
    }
}

/// Which kind of call `acquire` let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Admitted while closed
    Normal,
    /// Holds the half-open slot handed out at this epoch
    Trial(u64),
}

impl BreakerInner {
    fn start_trial(&mut self) -> Admission {
        self.probe_in_flight = true;
        self.trial_epoch += 1;
        Admission::Trial(self.trial_epoch)
    }

    /// Release the half-open slot if `epoch` still owns it
    fn finish_trial(&mut self, epoch: u64) -> bool {
        if self.probe_in_flight && self.trial_epoch == epoch {
            self.probe_in_flight = false;
            true
        } else {
            false
        }
    }
}

/// Releases the half-open probe slot if the probing future is dropped
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let (true, Admission::Trial(epoch)) = (self.armed, self.admission) {
            self.breaker.lock().finish_trial(epoch);
        }
    }
}

/// Named collection of breakers
///
/// A process normally uses the shared instance from [`BreakerRegistry::global`].
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static BreakerRegistry {
        static GLOBAL: OnceLock<BreakerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BreakerRegistry::new)
    }

    /// Get the breaker named `name`, creating it with `config` if absent
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Circuit breaker registered");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = breakers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Health of every registered breaker, keyed by name
    pub fn health_status(&self) -> BTreeMap<String, BreakerHealth> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.health()))
            .collect()
    }

    /// Reset every registered breaker
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        for breaker in &breakers {
            breaker.reset();
        }
        tracing::info!(count = breakers.len(), "All circuit breakers reset");
    }
}
