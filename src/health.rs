//! Adaptive multi-service health checker.
//!
//! Each cycle probes every enabled, auto-probed service concurrently,
//! commits one [`HealthRecord`] per service and publishes a
//! [`StatusChange`] for every service whose status moved. The next cycle
//! is scheduled at the fast interval while any service is in the problem
//! set, at the base interval otherwise.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ProbeError;
use crate::events::{event_names, EventBus, SubscriptionId};
use crate::probe::{join_url, Probe};
use crate::scheduler::{next_interval, Timer};
use crate::types::config::{HealthSettings, ServiceDescriptor};
use crate::types::health::{Details, HealthRecord, ServiceStatus, StatusChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckerConfig {
    pub base_interval: Duration,
    pub fast_interval: Duration,
    pub probe_timeout: Duration,
    pub history_limit: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthCheckerConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            base_interval: settings.base_interval(),
            fast_interval: settings.fast_interval(),
            probe_timeout: settings.probe_timeout(),
            history_limit: settings.history_limit.max(1),
        }
    }
}

struct CheckerState {
    services: Vec<ServiceDescriptor>,
    probe: Arc<dyn Probe>,
    config: HealthCheckerConfig,
    statuses: RwLock<HashMap<String, HealthRecord>>,
    history: Mutex<HashMap<String, VecDeque<HealthRecord>>>,
    changes: EventBus<StatusChange>,
    timer: Timer,
    running: AtomicBool,
    /// Bumped by `stop`; results from an older epoch are discarded.
    epoch: AtomicU64,
    interval: Mutex<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share the same status map and loop.
#[derive(Clone)]
pub struct HealthChecker {
    state: Arc<CheckerState>,
}

impl HealthChecker {
    pub fn new(
        services: Vec<ServiceDescriptor>,
        probe: Arc<dyn Probe>,
        config: HealthCheckerConfig,
    ) -> Self {
        let interval = config.base_interval;
        Self {
            state: Arc::new(CheckerState {
                services,
                probe,
                config,
                statuses: RwLock::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                changes: EventBus::new(event_names::HEALTH_STATUS_CHANGE),
                timer: Timer::new(),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                interval: Mutex::new(interval),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.state.services
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.state.config
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Spawn the polling loop. The first cycle runs immediately. Calling
    /// `start` on a running checker does nothing.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            debug!("Health checker already running");
            return;
        }
        let epoch = self.state.epoch.load(Ordering::SeqCst);
        self.state.timer.disarm();

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            loop {
                let interval = state.run_cycle(epoch).await;
                if state.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                state.timer.arm(interval);
                if !state.timer.wait().await {
                    break;
                }
            }
            debug!("Health check loop exited");
        });

        let mut task = self.state.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
        info!(
            services = self.state.services.len(),
            base_interval_secs = self.state.config.base_interval.as_secs(),
            fast_interval_secs = self.state.config.fast_interval.as_secs(),
            "Health checker started"
        );
    }

    /// Cancel the pending tick and discard any cycle still in flight.
    /// Safe to call more than once.
    pub fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            // Held so no commit can slip in between the epoch check and insert.
            let _statuses = self.state.statuses.write().unwrap_or_else(|e| e.into_inner());
            self.state.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.state.timer.cancel();
        if let Some(handle) = self
            .state
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        info!("Health checker stopped");
    }

    /// Run one full cycle now and return the interval it chose.
    pub async fn check_all(&self) -> Duration {
        let epoch = self.state.epoch.load(Ordering::SeqCst);
        self.state.run_cycle(epoch).await
    }

    /// Probe one service on demand, including ones with `autoProbe` off.
    /// Returns `None` for unknown or disabled services.
    pub async fn check_service(&self, name: &str) -> Option<HealthRecord> {
        let service = self
            .state
            .services
            .iter()
            .find(|s| s.name == name && s.enabled)?
            .clone();
        let epoch = self.state.epoch.load(Ordering::SeqCst);
        let record =
            evaluate_service(self.state.probe.as_ref(), &service, self.state.config.probe_timeout)
                .await;
        self.state.commit(epoch, &service.name, record.clone());
        self.state.refresh_interval(epoch);
        Some(record)
    }

    pub fn get_status(&self, name: &str) -> Option<HealthRecord> {
        self.state
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Snapshot of every recorded status. Later cycles do not affect it.
    pub fn get_all_statuses(&self) -> HashMap<String, HealthRecord> {
        self.state
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Oldest first, bounded by `history_limit`.
    pub fn get_history(&self, name: &str) -> Vec<HealthRecord> {
        self.state
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Interval the loop will use for its next tick.
    pub fn current_interval(&self) -> Duration {
        *self.state.interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_status_change<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&StatusChange) -> Result<(), String> + Send + Sync + 'static,
    {
        self.state.changes.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.changes.unsubscribe(id)
    }
}

impl CheckerState {
    async fn run_cycle(&self, epoch: u64) -> Duration {
        let mut probes = JoinSet::new();
        let targets = self.services.iter().filter(|s| s.enabled && s.auto_probe);
        for (index, service) in targets.enumerate() {
            let probe = Arc::clone(&self.probe);
            let service = service.clone();
            let timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let record = evaluate_service(probe.as_ref(), &service, timeout).await;
                (index, service.name, record)
            });
        }

        let mut results = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Probe task failed"),
            }
        }
        // Commit in configuration order so events are deterministic.
        results.sort_by_key(|(index, _, _)| *index);
        for (_, name, record) in results {
            self.commit(epoch, &name, record);
        }
        self.refresh_interval(epoch)
    }

    fn commit(&self, epoch: u64, name: &str, record: HealthRecord) {
        let change = {
            let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!(service = name, "Discarding result from stopped checker");
                return;
            }
            let previous = statuses
                .get(name)
                .map(|r| r.status)
                .unwrap_or(ServiceStatus::Unknown);
            statuses.insert(name.to_string(), record.clone());

            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let entries = history.entry(name.to_string()).or_default();
            entries.push_back(record.clone());
            while entries.len() > self.config.history_limit {
                entries.pop_front();
            }

            (previous != record.status).then(|| StatusChange {
                service: name.to_string(),
                previous,
                status: record.status,
                details: record.details,
                observed_at: record.observed_at,
            })
        };

        if let Some(change) = change {
            if change.status.is_problem() {
                warn!(
                    service = %change.service,
                    from = %change.previous,
                    to = %change.status,
                    "Service status changed"
                );
            } else {
                info!(
                    service = %change.service,
                    from = %change.previous,
                    to = %change.status,
                    "Service status changed"
                );
            }
            self.changes.publish(&change);
        }
    }

    /// Decided from the services the loop itself polls.
    fn refresh_interval(&self, epoch: u64) -> Duration {
        let statuses = self.statuses.read().unwrap_or_else(|e| e.into_inner());
        let polled = self
            .services
            .iter()
            .filter(|s| s.enabled && s.auto_probe)
            .filter_map(|s| statuses.get(&s.name));
        let next = next_interval(
            polled.map(|r| &r.status),
            self.config.base_interval,
            self.config.fast_interval,
        );
        drop(statuses);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            let mut current = self.interval.lock().unwrap_or_else(|e| e.into_inner());
            if *current != next {
                debug!(
                    from_secs = current.as_secs(),
                    to_secs = next.as_secs(),
                    "Polling interval changed"
                );
            }
            *current = next;
        }
        next
    }
}

fn reports_degraded(body: Option<&Value>) -> bool {
    body.and_then(|b| b.get("status"))
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("degraded"))
}

/// Walk the endpoints in order. The first reachable one decides the
/// status; a refused connection or timeout ends the walk at once.
async fn evaluate_service(
    probe: &dyn Probe,
    service: &ServiceDescriptor,
    timeout: Duration,
) -> HealthRecord {
    if service.endpoints.is_empty() {
        let mut details = Details::new();
        details.insert("reason".into(), json!("no endpoints configured"));
        return HealthRecord::new(ServiceStatus::Unknown, details);
    }

    let base_url = service.base_url();
    let deadline = probe.time_budget(timeout);
    let mut fallback: Option<(ServiceStatus, Details)> = None;

    for endpoint in &service.endpoints {
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(deadline, probe.probe(&base_url, &endpoint.path, timeout))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            };

        let mut details = Details::new();
        details.insert("endpoint".into(), json!(endpoint.path));
        details.insert("url".into(), json!(join_url(&base_url, &endpoint.path)));
        details.insert(
            "latencyMs".into(),
            json!(started.elapsed().as_millis() as u64),
        );

        match outcome {
            Ok(response) if response.is_success() => {
                details.insert("statusCode".into(), json!(response.status_code));
                let status = if endpoint.info_only {
                    ServiceStatus::Available
                } else if reports_degraded(response.body.as_ref()) {
                    ServiceStatus::Degraded
                } else {
                    ServiceStatus::Healthy
                };
                if let Some(body) = response.body {
                    details.insert("body".into(), body);
                }
                return HealthRecord::new(status, details);
            }
            Ok(response) => {
                details.insert("statusCode".into(), json!(response.status_code));
                fallback = Some((ServiceStatus::Unhealthy, details));
            }
            Err(ProbeError::ConnectionRefused(reason)) => {
                details.insert("error".into(), json!(reason));
                return HealthRecord::new(ServiceStatus::Down, details);
            }
            Err(ProbeError::CircuitOpen(remaining)) => {
                details.insert("reason".into(), json!("circuit_open"));
                details.insert("retryInMs".into(), json!(remaining.as_millis() as u64));
                return HealthRecord::new(ServiceStatus::Down, details);
            }
            Err(ProbeError::Timeout(after)) => {
                details.insert("timeoutMs".into(), json!(after.as_millis() as u64));
                return HealthRecord::new(ServiceStatus::Timeout, details);
            }
            Err(e @ (ProbeError::MalformedResponse(_) | ProbeError::Other(_))) => {
                details.insert("error".into(), json!(e.to_string()));
                fallback = Some((ServiceStatus::Error, details));
            }
        }
    }

    match fallback {
        Some((status, details)) => HealthRecord::new(status, details),
        None => HealthRecord::new(ServiceStatus::Unknown, Details::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{ok, refused, ScriptedProbe};
    use crate::probe::ProbeResponse;
    use crate::types::config::ProbeEndpoint;

    const BASE: Duration = Duration::from_secs(30);
    const FAST: Duration = Duration::from_secs(5);

    fn config() -> HealthCheckerConfig {
        HealthCheckerConfig {
            base_interval: BASE,
            fast_interval: FAST,
            probe_timeout: Duration::from_secs(3),
            history_limit: 3,
        }
    }

    fn checker(services: Vec<ServiceDescriptor>, probe: &Arc<ScriptedProbe>) -> HealthChecker {
        let probe: Arc<dyn Probe> = Arc::clone(probe) as Arc<dyn Probe>;
        HealthChecker::new(services, probe, config())
    }

    fn record_changes(checker: &HealthChecker) -> Arc<Mutex<Vec<StatusChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        checker.on_status_change(move |change| {
            sink.lock().unwrap().push(change.clone());
            Ok(())
        });
        seen
    }

    fn status_of(checker: &HealthChecker, name: &str) -> ServiceStatus {
        checker.get_status(name).unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_service_keeps_base_interval() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8001/health", vec![ok(200)]);
        let checker = checker(vec![ServiceDescriptor::new("api", 8001, &["/health"])], &probe);

        assert_eq!(checker.check_all().await, BASE);
        let record = checker.get_status("api").unwrap();
        assert_eq!(record.status, ServiceStatus::Healthy);
        assert_eq!(record.details["endpoint"], "/health");
        assert_eq!(record.details["statusCode"], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_down_then_recovered() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8002/health", vec![refused(), ok(200)]);
        let checker = checker(
            vec![ServiceDescriptor::new("api", 8002, &["/health", "/ready"])],
            &probe,
        );
        let changes = record_changes(&checker);

        assert_eq!(checker.check_all().await, FAST);
        assert_eq!(checker.current_interval(), FAST);
        assert_eq!(status_of(&checker, "api"), ServiceStatus::Down);
        // Refused ends the walk; /ready is never tried.
        assert_eq!(probe.call_count("http://127.0.0.1:8002/ready"), 0);

        assert_eq!(checker.check_all().await, BASE);
        assert_eq!(status_of(&checker, "api"), ServiceStatus::Healthy);

        let changes = changes.lock().unwrap();
        let transitions: Vec<(ServiceStatus, ServiceStatus)> =
            changes.iter().map(|c| (c.previous, c.status)).collect();
        assert_eq!(
            transitions,
            vec![
                (ServiceStatus::Unknown, ServiceStatus::Down),
                (ServiceStatus::Down, ServiceStatus::Healthy),
            ]
        );
        assert!(changes.iter().all(|c| c.service == "api"));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_status_emits_nothing() {
        let probe = Arc::new(ScriptedProbe::new());
        let checker = checker(vec![ServiceDescriptor::new("db", 8003, &["/health"])], &probe);
        let changes = record_changes(&checker);

        for _ in 0..3 {
            checker.check_all().await;
        }
        assert_eq!(changes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_timeout_not_down() {
        let probe = Arc::new(ScriptedProbe::new());
        let url = "http://127.0.0.1:8004/health";
        probe.script(url, vec![ok(200)]);
        probe.delay(url, Duration::from_secs(10));
        let checker = checker(vec![ServiceDescriptor::new("slow", 8004, &["/health"])], &probe);

        assert_eq!(checker.check_all().await, FAST);
        let record = checker.get_status("slow").unwrap();
        assert_eq!(record.status, ServiceStatus::Timeout);
        assert_eq!(record.details["timeoutMs"], 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_endpoint_after_http_error() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8005/health", vec![ok(503)]);
        probe.script("http://127.0.0.1:8005/ready", vec![ok(302)]);
        let checker = checker(
            vec![ServiceDescriptor::new("web", 8005, &["/health", "/ready"])],
            &probe,
        );

        checker.check_all().await;
        let record = checker.get_status("web").unwrap();
        assert_eq!(record.status, ServiceStatus::Healthy);
        assert_eq!(record.details["endpoint"], "/ready");
    }

    #[tokio::test(start_paused = true)]
    async fn all_http_errors_are_unhealthy() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8006/health", vec![ok(500)]);
        probe.script("http://127.0.0.1:8006/ready", vec![ok(404)]);
        let checker = checker(
            vec![ServiceDescriptor::new("web", 8006, &["/health", "/ready"])],
            &probe,
        );

        assert_eq!(checker.check_all().await, FAST);
        let record = checker.get_status("web").unwrap();
        assert_eq!(record.status, ServiceStatus::Unhealthy);
        assert_eq!(record.details["statusCode"], 404);
    }

    #[tokio::test(start_paused = true)]
    async fn other_probe_errors_are_error_status() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script(
            "http://127.0.0.1:8007/health",
            vec![Err(ProbeError::MalformedResponse("truncated".into()))],
        );
        let checker = checker(vec![ServiceDescriptor::new("q", 8007, &["/health"])], &probe);

        checker.check_all().await;
        assert_eq!(status_of(&checker, "q"), ServiceStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_reads_as_down() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script(
            "http://127.0.0.1:8008/health",
            vec![Err(ProbeError::CircuitOpen(Duration::from_secs(42)))],
        );
        let checker = checker(vec![ServiceDescriptor::new("c", 8008, &["/health"])], &probe);

        checker.check_all().await;
        let record = checker.get_status("c").unwrap();
        assert_eq!(record.status, ServiceStatus::Down);
        assert_eq!(record.details["reason"], "circuit_open");
        assert_eq!(record.details["retryInMs"], 42_000);
    }

    #[tokio::test(start_paused = true)]
    async fn info_endpoint_and_degraded_body() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8009/info", vec![ok(200)]);
        probe.script(
            "http://127.0.0.1:8010/health",
            vec![Ok(ProbeResponse::new(200).with_body(json!({"status": "degraded"})))],
        );
        let mut info = ServiceDescriptor::new("info", 8009, &[]);
        info.endpoints = vec![ProbeEndpoint::info("/info")];
        let checker = checker(
            vec![info, ServiceDescriptor::new("cache", 8010, &["/health"])],
            &probe,
        );

        assert_eq!(checker.check_all().await, BASE);
        assert_eq!(status_of(&checker, "info"), ServiceStatus::Available);
        let cache = checker.get_status("cache").unwrap();
        assert_eq!(cache.status, ServiceStatus::Degraded);
        assert_eq!(cache.details["body"]["status"], "degraded");
    }

    #[tokio::test(start_paused = true)]
    async fn no_endpoints_is_unknown_without_event() {
        let probe = Arc::new(ScriptedProbe::new());
        let checker = checker(vec![ServiceDescriptor::new("bare", 8011, &[])], &probe);
        let changes = record_changes(&checker);

        checker.check_all().await;
        assert_eq!(status_of(&checker, "bare"), ServiceStatus::Unknown);
        assert!(changes.lock().unwrap().is_empty());
        assert!(probe.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_and_manual_services_skip_cycles() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8013/health", vec![ok(200)]);
        let mut disabled = ServiceDescriptor::new("off", 8012, &["/health"]);
        disabled.enabled = false;
        let mut manual = ServiceDescriptor::new("manual", 8013, &["/health"]);
        manual.auto_probe = false;
        let checker = checker(vec![disabled, manual], &probe);

        checker.check_all().await;
        assert!(checker.get_all_statuses().is_empty());
        assert!(probe.calls().is_empty());

        assert!(checker.check_service("off").await.is_none());
        assert!(checker.check_service("missing").await.is_none());
        let record = checker.check_service("manual").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Healthy);
        assert_eq!(status_of(&checker, "manual"), ServiceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_service_problems_do_not_speed_up_loop() {
        let scripted = Arc::new(ScriptedProbe::new());
        scripted.script("http://127.0.0.1:8020/health", vec![ok(200)]);
        let mut manual = ServiceDescriptor::new("manual", 8021, &["/health"]);
        manual.auto_probe = false;
        let checker = checker(
            vec![ServiceDescriptor::new("api", 8020, &["/health"]), manual],
            &scripted,
        );

        assert_eq!(checker.check_all().await, BASE);
        let record = checker.check_service("manual").await.unwrap();
        assert_eq!(record.status, ServiceStatus::Down);
        assert_eq!(checker.current_interval(), BASE);
        assert_eq!(checker.check_all().await, BASE);
        assert_eq!(scripted.call_count("http://127.0.0.1:8021/health"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_statuses_is_a_copy() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("http://127.0.0.1:8014/health", vec![ok(200)]);
        let checker = checker(vec![ServiceDescriptor::new("api", 8014, &["/health"])], &probe);
        checker.check_all().await;

        let mut snapshot = checker.get_all_statuses();
        snapshot.get_mut("api").unwrap().status = ServiceStatus::Down;
        snapshot.insert(
            "ghost".into(),
            HealthRecord::new(ServiceStatus::Error, Details::new()),
        );

        assert_eq!(status_of(&checker, "api"), ServiceStatus::Healthy);
        assert!(checker.get_status("ghost").is_none());
        assert_eq!(checker.check_all().await, BASE);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script(
            "http://127.0.0.1:8015/health",
            vec![refused(), ok(200), ok(500), ok(200)],
        );
        let checker = checker(vec![ServiceDescriptor::new("api", 8015, &["/health"])], &probe);
        for _ in 0..4 {
            checker.check_all().await;
        }
        let history: Vec<ServiceStatus> =
            checker.get_history("api").iter().map(|r| r.status).collect();
        assert_eq!(
            history,
            vec![
                ServiceStatus::Healthy,
                ServiceStatus::Unhealthy,
                ServiceStatus::Healthy
            ]
        );
        assert!(checker.get_history("other").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_adapts_interval_between_cycles() {
        let probe = Arc::new(ScriptedProbe::new());
        let url = "http://127.0.0.1:8016/health";
        probe.script(url, vec![refused(), ok(200)]);
        let checker = checker(vec![ServiceDescriptor::new("api", 8016, &["/health"])], &probe);

        checker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.call_count(url), 1);
        assert_eq!(checker.current_interval(), FAST);

        // Second cycle after the fast interval recovers the service.
        tokio::time::sleep(FAST).await;
        assert_eq!(probe.call_count(url), 2);
        assert_eq!(checker.current_interval(), BASE);

        // Nothing more until the base interval has passed.
        tokio::time::sleep(FAST).await;
        assert_eq!(probe.call_count(url), 2);
        tokio::time::sleep(BASE).await;
        assert_eq!(probe.call_count(url), 3);

        checker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let probe = Arc::new(ScriptedProbe::new());
        let url = "http://127.0.0.1:8017/health";
        probe.script(url, vec![ok(200)]);
        let checker = checker(vec![ServiceDescriptor::new("api", 8017, &["/health"])], &probe);

        checker.start();
        checker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.call_count(url), 1);
        checker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timer_and_discards_in_flight_results() {
        let probe = Arc::new(ScriptedProbe::new());
        let url = "http://127.0.0.1:8018/health";
        probe.script(url, vec![ok(200)]);
        probe.delay(url, Duration::from_secs(2));
        let checker = checker(vec![ServiceDescriptor::new("api", 8018, &["/health"])], &probe);
        let changes = record_changes(&checker);

        checker.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        checker.stop();
        checker.stop();
        assert!(!checker.is_running());

        tokio::time::sleep(BASE * 2).await;
        assert_eq!(probe.call_count(url), 1);
        assert!(checker.get_status("api").is_none());
        assert!(changes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_resumes_polling() {
        let probe = Arc::new(ScriptedProbe::new());
        let url = "http://127.0.0.1:8019/health";
        probe.script(url, vec![ok(200)]);
        let checker = checker(vec![ServiceDescriptor::new("api", 8019, &["/health"])], &probe);

        checker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        checker.stop();
        checker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.call_count(url), 2);
        assert_eq!(status_of(&checker, "api"), ServiceStatus::Healthy);
        checker.stop();
    }
}
