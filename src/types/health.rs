use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form key/value details attached to a health observation.
pub type Details = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    /// Reachable through an info-only endpoint.
    Available,
    Degraded,
    Unhealthy,
    Down,
    Timeout,
    Error,
    Unknown,
}

impl ServiceStatus {
    /// Statuses that switch the checker to its fast polling interval.
    pub fn is_problem(self) -> bool {
        match self {
            ServiceStatus::Unhealthy
            | ServiceStatus::Down
            | ServiceStatus::Timeout
            | ServiceStatus::Error => true,
            ServiceStatus::Healthy
            | ServiceStatus::Available
            | ServiceStatus::Degraded
            | ServiceStatus::Unknown => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Available => "available",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Down => "down",
            ServiceStatus::Timeout => "timeout",
            ServiceStatus::Error => "error",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known status snapshot for one monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: ServiceStatus,
    pub details: Details,
    pub observed_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn new(status: ServiceStatus, details: Details) -> Self {
        Self {
            status,
            details,
            observed_at: Utc::now(),
        }
    }
}

/// Emitted once per status transition of a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub service: String,
    pub previous: ServiceStatus,
    pub status: ServiceStatus,
    pub details: Details,
    pub observed_at: DateTime<Utc>,
}

impl StatusChange {
    /// JSON shape handed to alert rules.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
