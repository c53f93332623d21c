use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure surfaced by [`crate::circuit_breaker::CircuitBreaker::call`].
///
/// `Open` is a fast-fail: the wrapped operation was never invoked. `Inner`
/// carries the downstream error untouched.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{breaker}' is open, retry in {:.1}s", .remaining.as_secs_f64())]
    Open { breaker: String, remaining: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The downstream error, if the operation actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open { .. } => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// Failure surfaced by [`crate::retry::RetryPolicy::execute`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last downstream error observed.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Classified outcome of a failed probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("circuit open, next probe allowed in {}ms", .0.as_millis())]
    CircuitOpen(Duration),
    #[error("probe failed: {0}")]
    Other(String),
}

impl ProbeError {
    /// Whether a retry has a chance of a different outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Other(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rule '{rule}' failed to evaluate: {reason}")]
pub struct RuleEvaluationError {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure to assemble or run the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to watch config: {0}")]
    Watch(#[from] notify::Error),
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
