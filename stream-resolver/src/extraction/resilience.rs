//! Per-provider circuit breaking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Configuration for circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before the first half-open trial, in milliseconds.
    pub cooldown_ms: u64,
    /// Cooldown multiplier applied for each consecutive reopen from half-open.
    pub backoff_multiplier: f64,
    /// Upper bound for the cooldown, in milliseconds.
    pub max_cooldown_ms: u64,
    /// Whether to add up to 25% jitter to the cooldown.
    pub use_jitter: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            backoff_multiplier: 2.0,
            max_cooldown_ms: 10 * 60_000,
            use_jitter: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown to apply after `reopens` consecutive reopens from half-open.
    pub fn cooldown_for(&self, reopens: u32) -> Duration {
        let base = self.cooldown_ms as f64 * self.backoff_multiplier.max(1.0).powi(reopens as i32);
        let delay_ms = base.min(self.max_cooldown_ms.max(self.cooldown_ms) as f64) as u64;

        let final_delay = if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; attempts are rejected until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one trial attempt decides the next state.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    reset_at: Option<Instant>,
    reset_at_wall: Option<DateTime<Utc>>,
    /// Consecutive reopens from half-open, drives the cooldown backoff.
    reopens: u32,
    /// Whether the single half-open trial has been handed out.
    trial_in_flight: bool,
    /// Bumped on every state change; permits from an older generation are stale.
    generation: u64,
}

impl BreakerInner {
    fn check_state_transition(&mut self) {
        if self.state == CircuitState::Open
            && let Some(reset_at) = self.reset_at
            && Instant::now() >= reset_at
        {
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
            self.generation += 1;
            debug!("Circuit breaker transitioned to half-open state");
        }
    }

    fn open(&mut self, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.trial_in_flight = false;
        self.generation += 1;
        self.reset_at = Some(Instant::now() + cooldown);
        self.reset_at_wall = chrono::Duration::from_std(cooldown)
            .ok()
            .map(|d| Utc::now() + d);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.reopens = 0;
        self.trial_in_flight = false;
        self.generation += 1;
        self.reset_at = None;
        self.reset_at_wall = None;
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub is_open: bool,
    pub is_half_open: bool,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for one provider.
///
/// All transitions happen under one lock, so the half-open trial is handed to
/// exactly one caller.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                reset_at: None,
                reset_at_wall: None,
                reopens: 0,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        inner.state
    }

    /// Whether an attempt would be admitted right now. Does not take the trial.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Admit one attempt. In half-open only the first caller gets a permit.
    ///
    /// The outcome must be reported through [`CircuitPermit::on_result`];
    /// dropping the permit unreported hands a half-open trial back.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CircuitPermit> {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if inner.trial_in_flight => return None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
        };
        Some(CircuitPermit {
            breaker: self.clone(),
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn settle(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        if inner.generation != generation {
            debug!(success, "Ignoring result from a previous circuit state");
            return;
        }
        if success {
            self.apply_success(&mut inner);
        } else {
            self.apply_failure(&mut inner);
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation
            && inner.state == CircuitState::HalfOpen
            && inner.trial_in_flight
        {
            inner.trial_in_flight = false;
            debug!("Released half-open trial");
        }
    }

    /// Record a success outside of a permit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        self.apply_success(&mut inner);
    }

    /// Record a failure outside of a permit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        self.apply_failure(&mut inner);
    }

    fn apply_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.close();
                info!("Circuit breaker closed after successful trial");
            }
            CircuitState::Open => {
                debug!("Ignoring success recorded while circuit is open");
            }
        }
    }

    fn apply_failure(&self, inner: &mut BreakerInner) {
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    let cooldown = self.config.cooldown_for(0);
                    inner.reopens = 0;
                    inner.open(cooldown);
                    warn!(
                        failures = inner.failures,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.reopens = inner.reopens.saturating_add(1);
                let cooldown = self.config.cooldown_for(inner.reopens);
                inner.open(cooldown);
                warn!(
                    reopens = inner.reopens,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Circuit breaker reopened after failed trial"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.inner.lock().close();
        debug!("Circuit breaker reset to closed state");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.check_state_transition();
        CircuitBreakerSnapshot {
            state: inner.state,
            is_open: inner.state == CircuitState::Open,
            is_half_open: inner.state == CircuitState::HalfOpen,
            failures: inner.failures,
            reset_at: match inner.state {
                CircuitState::Closed => None,
                _ => inner.reset_at_wall,
            },
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Admission for one attempt, tied to the circuit state it was granted in.
///
/// Results from a permit granted before the last state change are ignored.
#[must_use = "an unreported permit is treated as abandoned"]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    /// Whether this permit carries the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn on_result(mut self, success: bool) {
        self.settled = true;
        self.breaker.settle(self.generation, success);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release(self.generation);
        }
    }
}

/// Circuit breakers keyed by provider id.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker for a provider.
    pub fn get(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(provider_id) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn allow(&self, provider_id: &str) -> bool {
        self.get(provider_id).allow()
    }

    pub fn try_acquire(&self, provider_id: &str) -> Option<CircuitPermit> {
        self.get(provider_id).try_acquire()
    }

    pub fn record_success(&self, provider_id: &str) {
        self.get(provider_id).record_success();
    }

    pub fn record_failure(&self, provider_id: &str) {
        self.get(provider_id).record_failure();
    }

    pub fn reset(&self, provider_id: &str) {
        self.get(provider_id).reset();
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
        info!("Reset all circuit breakers");
    }

    pub fn snapshot(&self, provider_id: &str) -> CircuitBreakerSnapshot {
        self.get(provider_id).snapshot()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
