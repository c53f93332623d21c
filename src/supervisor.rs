//! Owns one instance of every supervision component and wires their
//! outputs together: status changes and stream payloads feed the alert
//! rules, and everything is re-broadcast as [`SupervisorEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot};
use crate::config;
use crate::error::SupervisorError;
use crate::events::event_names;
use crate::health::{HealthChecker, HealthCheckerConfig};
use crate::probe::{GuardedProbe, HttpProbe, Probe};
use crate::retry::RetryPolicy;
use crate::stream::{
    HttpLineTransport, ReconnectingStreamClient, StreamConnectionState, StreamTransport,
};
use crate::types::alert::{Alert, AlertFilter};
use crate::types::config::SupervisorConfig;
use crate::types::health::{HealthRecord, StatusChange};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum SupervisorEvent {
    StatusChanged(StatusChange),
    AlertCreated(Alert),
    BreakerChanged(BreakerSnapshot),
    StreamState(StreamConnectionState),
    StreamPayload(Value),
}

impl SupervisorEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SupervisorEvent::StatusChanged(_) => event_names::HEALTH_STATUS_CHANGE,
            SupervisorEvent::AlertCreated(_) => event_names::ALERT_CREATED,
            SupervisorEvent::BreakerChanged(_) => event_names::BREAKER_STATE,
            SupervisorEvent::StreamState(_) => event_names::STREAM_STATE,
            SupervisorEvent::StreamPayload(_) => event_names::STREAM_PAYLOAD,
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    checker: HealthChecker,
    alerts: Arc<AlertEngine>,
    probe: Arc<GuardedProbe>,
    stream: Option<ReconnectingStreamClient>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Build with the HTTP probe and HTTP line transport.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new()?);
        let transport: Arc<dyn StreamTransport> = Arc::new(HttpLineTransport::new()?);
        Self::with_collaborators(config, probe, transport)
    }

    pub fn with_collaborators(
        config: SupervisorConfig,
        probe: Arc<dyn Probe>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, SupervisorError> {
        config::validate(&config)?;
        let retry = RetryPolicy::from_settings(&config.retry)?;
        let guarded = Arc::new(GuardedProbe::new(
            probe,
            BreakerConfig::from(&config.breaker),
            retry,
        ));
        let checker_probe: Arc<dyn Probe> = Arc::clone(&guarded) as Arc<dyn Probe>;
        let checker = HealthChecker::new(
            config.service_descriptors(),
            checker_probe,
            HealthCheckerConfig::from(&config.health),
        );
        let alerts = Arc::new(AlertEngine::from_settings(&config.alerts)?);
        let stream = config
            .stream
            .as_ref()
            .map(|settings| ReconnectingStreamClient::from_settings(settings, transport));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let supervisor = Self {
            config,
            checker,
            alerts,
            probe: guarded,
            stream,
            events,
        };
        supervisor.wire();
        Ok(supervisor)
    }

    fn wire(&self) {
        {
            let alerts = Arc::clone(&self.alerts);
            let events = self.events.clone();
            self.checker.on_status_change(move |change| {
                let _ = events.send(SupervisorEvent::StatusChanged(change.clone()));
                alerts.check_rules(&change.to_payload(), "health");
                Ok(())
            });
        }
        {
            let events = self.events.clone();
            self.alerts.on_alert(move |alert| {
                let _ = events.send(SupervisorEvent::AlertCreated(alert.clone()));
                Ok(())
            });
        }
        {
            let events = self.events.clone();
            self.probe.on_breaker_change(move |snapshot| {
                let _ = events.send(SupervisorEvent::BreakerChanged(snapshot.clone()));
                Ok(())
            });
        }
        if let Some(stream) = &self.stream {
            let alerts = Arc::clone(&self.alerts);
            let events = self.events.clone();
            stream.on_payload(move |payload| {
                let _ = events.send(SupervisorEvent::StreamPayload(payload.clone()));
                alerts.check_rules(payload, "stream");
                Ok(())
            });
            let events = self.events.clone();
            stream.on_state_change(move |state| {
                let _ = events.send(SupervisorEvent::StreamState(*state));
                Ok(())
            });
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    pub fn alert_engine(&self) -> &AlertEngine {
        &self.alerts
    }

    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.checker.start();
        if let Some(stream) = &self.stream {
            stream.start();
        }
        info!(
            services = self.config.services.len(),
            stream = self.stream.is_some(),
            "Supervisor started"
        );
    }

    pub fn stop(&self) {
        self.checker.stop();
        if let Some(stream) = &self.stream {
            stream.stop();
        }
        info!("Supervisor stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Run one health cycle now; returns the interval chosen for the next.
    pub async fn check_now(&self) -> Duration {
        self.checker.check_all().await
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthRecord> {
        self.checker.get_all_statuses()
    }

    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.get_alerts(filter)
    }

    pub fn acknowledge_alert(&self, id: &str) -> bool {
        self.alerts.acknowledge(id)
    }

    pub fn acknowledge_all(&self) -> usize {
        self.alerts.acknowledge_all()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.probe.snapshots()
    }

    /// Administrative reset of the breaker guarding `base_url`.
    pub fn reset_breaker(&self, base_url: &str) -> bool {
        self.probe.reset(base_url)
    }

    pub fn stream_state(&self) -> Option<StreamConnectionState> {
        self.stream.as_ref().map(|s| s.state())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.checker.stop();
        if let Some(stream) = &self.stream {
            stream.stop();
        }
    }
}
