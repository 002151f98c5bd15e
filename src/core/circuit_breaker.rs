//! Circuit breaker state machine shared by every call through one breaker id.
//!
//! ```text
//!  CLOSED --(failure_threshold consecutive failures)--> OPEN
//!  OPEN   --(wait_duration_in_open_state elapsed)-----> HALF_OPEN
//!  HALF_OPEN --(all trial calls succeed)--> CLOSED
//!  HALF_OPEN --(any trial call fails)-----> OPEN
//! ```
//!
//! All transitions happen under one lock. Outcomes are reported through a
//! [`CallPermit`]; a permit dropped without an outcome (cancelled request)
//! gives its half-open trial slot back and counts as neither success nor
//! failure. Each transition bumps a generation so that late outcomes from
//! calls admitted in an earlier state are ignored.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub wait_duration_in_open_state: Duration,
    pub permitted_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open_state: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: u32,
    trial_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    settings: CircuitBreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying a due OPEN -> HALF_OPEN transition first.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.advance(&mut state);
        state.state
    }

    fn advance(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let due = state
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.settings.wait_duration_in_open_state);
        if due {
            self.transition(state, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        tracing::info!(breaker = %self.name, from = ?state.state, to = ?to, "Circuit breaker transition");
        state.state = to;
        state.generation += 1;
        state.consecutive_failures = 0;
        state.trial_in_flight = 0;
        state.trial_successes = 0;
        state.opened_at = (to == CircuitState::Open).then(Instant::now);
    }

    /// Ask to make a call. `None` means the breaker refuses it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let mut state = self.lock();
        self.advance(&mut state);
        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if state.trial_in_flight + state.trial_successes
                    >= self.settings.permitted_calls_in_half_open_state
                {
                    return None;
                }
                state.trial_in_flight += 1;
                true
            }
        };
        Some(CallPermit {
            breaker: Arc::clone(self),
            generation: state.generation,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                state.trial_in_flight = state.trial_in_flight.saturating_sub(1);
                state.trial_successes += 1;
                if state.trial_successes >= self.settings.permitted_calls_in_half_open_state {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut state, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn on_abandon(&self, generation: u64, trial: bool) {
        let mut state = self.lock();
        if trial && state.generation == generation {
            state.trial_in_flight = state.trial_in_flight.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Admission to one call through a breaker.
#[must_use = "report the outcome with record_success or record_failure"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.generation, self.trial);
        }
    }
}

/// Breakers by id, kept across route refreshes.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The existing breaker for `name`, unless its settings changed, in
    /// which case a fresh CLOSED breaker replaces it.
    pub fn get_or_create(&self, name: &str, settings: CircuitBreakerSettings) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = breakers.get(name)
            && existing.settings == settings
        {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, settings));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
