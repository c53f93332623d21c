use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::error::{BreakerError, ProbeError};
use crate::retry::RetryPolicy;

/// HTTP-style reply to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub body: Option<Value>,
}

impl ProbeResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// 200, 301 and 302 all count as reachable.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code, 200 | 301 | 302)
    }
}

/// Bounded-timeout request against one endpoint of one service.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(
        &self,
        base_url: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError>;

    /// Longest a single `probe` call with `timeout` may take, retries
    /// included. Callers bound the call with this, not with `timeout`.
    fn time_budget(&self, timeout: Duration) -> Duration {
        timeout
    }
}

pub fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Plain GET probe. Redirects are not followed so 301/302 reach the checker.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn classify_request_error(e: &reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_connect() {
        ProbeError::ConnectionRefused(e.to_string())
    } else {
        ProbeError::Other(e.to_string())
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(
        &self,
        base_url: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let url = join_url(base_url, path);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(&e, timeout))?;

        let status_code = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::MalformedResponse(e.to_string())
            }
        })?;

        // Non-JSON bodies are fine; only the status code is required.
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice::<Value>(&bytes).ok()
        };
        debug!(url = %url, status_code, "Probe completed");
        Ok(ProbeResponse { status_code, body })
    }
}

/// Slack on top of the retry budget so the last attempt's own timeout
/// settles before the caller's deadline.
const BUDGET_GRACE: Duration = Duration::from_millis(50);

type BreakerObserver = Arc<dyn Fn(&BreakerSnapshot) -> Result<(), String> + Send + Sync>;

/// Wraps another probe with a circuit breaker per base URL and a retry
/// policy for transient failures. An open breaker surfaces as
/// [`ProbeError::CircuitOpen`] without touching the network.
pub struct GuardedProbe {
    inner: Arc<dyn Probe>,
    breaker_config: BreakerConfig,
    retry: RetryPolicy,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    observers: Mutex<Vec<BreakerObserver>>,
}

impl GuardedProbe {
    pub fn new(inner: Arc<dyn Probe>, breaker_config: BreakerConfig, retry: RetryPolicy) -> Self {
        Self {
            inner,
            breaker_config,
            retry,
            breakers: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Observe state transitions of every breaker, including ones created
    /// later.
    pub fn on_breaker_change<F>(&self, observer: F)
    where
        F: Fn(&BreakerSnapshot) -> Result<(), String> + Send + Sync + 'static,
    {
        let observer: BreakerObserver = Arc::new(observer);
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        for breaker in breakers.values() {
            attach(breaker, &observer);
        }
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn breaker_for(&self, base_url: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = breakers.get(base_url) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(base_url, self.breaker_config.clone()));
        for observer in self.observers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            attach(&breaker, observer);
        }
        breakers.insert(base_url.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut snaps: Vec<BreakerSnapshot> = breakers.values().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    /// Administrative reset of one breaker. Returns false if unknown.
    pub fn reset(&self, base_url: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        match breakers.get(base_url) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

fn attach(breaker: &CircuitBreaker, observer: &BreakerObserver) {
    let observer = Arc::clone(observer);
    breaker.on_state_change(move |snapshot| observer(snapshot));
}

#[async_trait]
impl Probe for GuardedProbe {
    async fn probe(
        &self,
        base_url: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, ProbeError> {
        let breaker = self.breaker_for(base_url);
        let inner = &self.inner;
        let result = breaker
            .call(|| {
                self.retry.execute(
                    || async move {
                        match tokio::time::timeout(timeout, inner.probe(base_url, path, timeout))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ProbeError::Timeout(timeout)),
                        }
                    },
                    ProbeError::is_transient,
                )
            })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(BreakerError::Open { remaining, .. }) => Err(ProbeError::CircuitOpen(remaining)),
            Err(BreakerError::Inner(err)) => {
                if err.is_exhausted() && err.attempts() > 1 {
                    warn!(
                        base_url,
                        path,
                        attempts = err.attempts(),
                        "Probe retries exhausted"
                    );
                }
                Err(err.into_inner())
            }
        }
    }

    fn time_budget(&self, timeout: Duration) -> Duration {
        timeout * self.retry.max_attempts() + self.retry.max_total_delay() + BUDGET_GRACE
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{join_url, Probe, ProbeResponse};
    use crate::error::ProbeError;

    pub type Outcome = Result<ProbeResponse, ProbeError>;

    pub fn ok(code: u16) -> Outcome {
        Ok(ProbeResponse::new(code))
    }

    pub fn refused() -> Outcome {
        Err(ProbeError::ConnectionRefused("connection refused".to_string()))
    }

    /// Replays scripted outcomes per URL. The last outcome in a script
    /// repeats; URLs without a script are refused.
    #[derive(Default)]
    pub struct ScriptedProbe {
        scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
        delays: Mutex<HashMap<String, Duration>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, url: &str, outcomes: Vec<Outcome>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), outcomes.into());
        }

        pub fn delay(&self, url: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(url.to_string(), delay);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
        }

        fn next(&self, url: &str) -> Outcome {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or_else(refused),
                None => refused(),
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(
            &self,
            base_url: &str,
            path: &str,
            _timeout: Duration,
        ) -> Result<ProbeResponse, ProbeError> {
            let url = join_url(base_url, path);
            self.calls.lock().unwrap().push(url.clone());
            let delay = self.delays.lock().unwrap().get(&url).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.next(&url)
        }
    }
}
