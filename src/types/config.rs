use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::alert::Severity;

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// One probe target on a service. Accepts either `"/health"` or
/// `{"path": "/info", "infoOnly": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "EndpointRepr")]
pub struct ProbeEndpoint {
    pub path: String,
    pub info_only: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Path(String),
    Full {
        path: String,
        #[serde(default, rename = "infoOnly")]
        info_only: bool,
    },
}

impl From<EndpointRepr> for ProbeEndpoint {
    fn from(repr: EndpointRepr) -> Self {
        match repr {
            EndpointRepr::Path(path) => Self {
                path,
                info_only: false,
            },
            EndpointRepr::Full { path, info_only } => Self { path, info_only },
        }
    }
}

impl ProbeEndpoint {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            info_only: false,
        }
    }

    pub fn info(path: &str) -> Self {
        Self {
            path: path.to_string(),
            info_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Filled from the key of the `services` map when loaded from config.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub endpoints: Vec<ProbeEndpoint>,
    #[serde(default = "default_true")]
    pub auto_probe: bool,
}

impl ServiceDescriptor {
    pub fn new(name: &str, port: u16, endpoints: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            host: default_host(),
            port,
            endpoints: endpoints.iter().map(|p| ProbeEndpoint::new(p)).collect(),
            auto_probe: true,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    pub base_interval_secs: u64,
    pub fast_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 30,
            fast_interval_secs: 5,
            probe_timeout_secs: 3,
            history_limit: 100,
        }
    }
}

impl HealthSettings {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.fast_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_base: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 250,
            max_delay_ms: 2000,
            backoff_base: 2.0,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOp {
    Eq,
    Ne,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Declarative alert rule: `field` is a dotted path into the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub name: String,
    pub field: String,
    pub op: RuleOp,
    pub value: Value,
    pub severity: Severity,
    pub message: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertSettings {
    pub capacity: usize,
    pub suppression_secs: Option<u64>,
    pub default_rules: bool,
    pub rules: Vec<RuleConfig>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            suppression_secs: None,
            default_rules: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub url: String,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_interval_secs: u64,
}

fn default_reconnect_secs() -> u64 {
    5
}

impl StreamSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    pub services: BTreeMap<String, ServiceDescriptor>,
    pub health: HealthSettings,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub alerts: AlertSettings,
    pub stream: Option<StreamSettings>,
}

impl SupervisorConfig {
    /// Descriptors in name order, each carrying its map key as `name`.
    pub fn service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|(name, svc)| {
                let mut svc = svc.clone();
                svc.name = name.clone();
                svc
            })
            .collect()
    }
}
