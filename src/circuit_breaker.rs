//! Closed / Open / HalfOpen gate around a fallible async operation.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(cool-down elapsed)--> HalfOpen
//!    ^                                  ^                              |
//!    |                                  +-------(trial fails)----------+
//!    +---------------------(trial succeeds)----------------------------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BreakerError;
use crate::events::{event_names, EventBus, SubscriptionId};
use crate::types::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }
}

/// Queryable view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    record: Mutex<BreakerRecord>,
    transitions: EventBus<BreakerSnapshot>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
        };
        Self {
            name: name.to_string(),
            config,
            record: Mutex::new(BreakerRecord::new()),
            transitions: EventBus::new(event_names::BREAKER_STATE),
        }
    }

    /// Called with a fresh snapshot after every state transition.
    pub fn on_state_change<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&BreakerSnapshot) -> Result<(), String> + Send + Sync + 'static,
    {
        self.transitions.subscribe(subscriber)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u64 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let record = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            last_failure_at: record.last_failure_at,
        }
    }

    /// Force the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        let previous = std::mem::replace(&mut *self.lock(), BreakerRecord::new()).state;
        info!(breaker = %self.name, "Circuit breaker reset");
        if previous != CircuitState::Closed {
            self.publish_transition();
        }
    }

    /// Run `op` through the breaker, counting every error as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(op, |_| true).await
    }

    /// Run `op` through the breaker. Only errors for which `is_failure`
    /// returns true move the counters; all errors are returned unchanged.
    pub async fn call_with<F, Fut, T, E, C>(&self, op: F, is_failure: C) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let is_trial = self.admit().map_err(|remaining| BreakerError::Open {
            breaker: self.name.clone(),
            remaining,
        })?;
        let mut guard = TrialGuard {
            breaker: self,
            active: is_trial,
        };

        match op().await {
            Ok(value) => {
                guard.active = false;
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                guard.active = false;
                if is_failure(&e) {
                    self.on_failure();
                } else {
                    self.release_trial();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed. `Ok(true)` marks the half-open
    /// trial call; `Err` carries the remaining cool-down.
    fn admit(&self) -> Result<bool, Duration> {
        let mut record = self.lock();
        match record.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = record
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    record.state = CircuitState::HalfOpen;
                    record.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit breaker half-open, admitting trial call");
                    drop(record);
                    self.publish_transition();
                    Ok(true)
                } else {
                    let remaining = self.config.cooldown - elapsed;
                    debug!(
                        breaker = %self.name,
                        remaining_ms = remaining.as_millis() as u64,
                        "Circuit breaker open, failing fast"
                    );
                    Err(remaining)
                }
            }
            CircuitState::HalfOpen => {
                if record.trial_in_flight {
                    debug!(breaker = %self.name, "Trial call in flight, failing fast");
                    Err(Duration::ZERO)
                } else {
                    record.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut record = self.lock();
        record.success_count += 1;
        record.trial_in_flight = false;
        if record.state == CircuitState::HalfOpen {
            record.state = CircuitState::Closed;
            record.failure_count = 0;
            info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            drop(record);
            self.publish_transition();
        }
    }

    fn on_failure(&self) {
        let mut record = self.lock();
        record.failure_count += 1;
        record.last_failure = Some(Instant::now());
        record.last_failure_at = Some(Utc::now());
        record.trial_in_flight = false;
        let opened = match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                warn!(breaker = %self.name, "Circuit breaker reopened after failed trial");
                true
            }
            CircuitState::Closed if record.failure_count >= self.config.failure_threshold => {
                record.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = record.failure_count,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
                true
            }
            CircuitState::Closed | CircuitState::Open => false,
        };
        drop(record);
        if opened {
            self.publish_transition();
        }
    }

    fn publish_transition(&self) {
        let snapshot = self.snapshot();
        self.transitions.publish(&snapshot);
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Frees the half-open trial slot if the call future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.breaker.release_trial();
        }
    }
}
