use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub acknowledged: bool,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFilter {
    pub severities: Option<Vec<Severity>>,
    pub min_severity: Option<Severity>,
    pub source: Option<String>,
    #[serde(default)]
    pub unacknowledged_only: bool,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn unacknowledged() -> Self {
        Self {
            unacknowledged_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if self.unacknowledged_only && alert.acknowledged {
            return false;
        }
        if let Some(ref severities) = self.severities {
            if !severities.contains(&alert.severity) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if alert.severity < min {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &alert.source != source {
                return false;
            }
        }
        true
    }
}
