//! Alert rule engine and bounded alert store.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, RuleEvaluationError};
use crate::events::{event_names, EventBus, SubscriptionId};
use crate::types::alert::{Alert, AlertFilter, Severity};
use crate::types::config::{AlertSettings, RuleConfig, RuleOp};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Returns `Ok(true)` when the payload should raise an alert. An `Err` is
/// logged and treated as no match.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

struct AlertRule {
    name: String,
    predicate: Predicate,
    severity: Severity,
    message: String,
    enabled: bool,
    last_fired: Option<Instant>,
}

pub struct AlertEngine {
    rules: Mutex<Vec<AlertRule>>,
    store: Mutex<VecDeque<Alert>>,
    capacity: usize,
    suppression: Option<Duration>,
    next_id: AtomicU64,
    observers: EventBus<Alert>,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AlertEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            store: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            suppression: None,
            next_id: AtomicU64::new(1),
            observers: EventBus::new(event_names::ALERT_CREATED),
        }
    }

    /// Suppress a rule from firing again within `window` of its last alert.
    pub fn with_suppression(mut self, window: Duration) -> Self {
        self.suppression = Some(window);
        self
    }

    pub fn from_settings(settings: &AlertSettings) -> Result<Self, ConfigError> {
        if settings.capacity == 0 {
            return Err(ConfigError::Invalid("alerts.capacity must be positive".into()));
        }
        let mut engine = Self::new(settings.capacity);
        if let Some(secs) = settings.suppression_secs {
            engine = engine.with_suppression(Duration::from_secs(secs));
        }
        if settings.default_rules {
            engine.install_default_rules();
        }
        for rule in &settings.rules {
            engine.add_rule_config(rule);
        }
        Ok(engine)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a rule. Re-using a name replaces that rule in place.
    pub fn add_rule<F>(&self, name: &str, predicate: F, severity: Severity, message: &str)
    where
        F: Fn(&Value) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.insert_rule(AlertRule {
            name: name.to_string(),
            predicate: Arc::new(predicate),
            severity,
            message: message.to_string(),
            enabled: true,
            last_fired: None,
        });
    }

    pub fn add_rule_config(&self, config: &RuleConfig) {
        self.insert_rule(AlertRule {
            name: config.name.clone(),
            predicate: field_predicate(config),
            severity: config.severity,
            message: config.message.clone(),
            enabled: config.enabled,
            last_fired: None,
        });
    }

    fn insert_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => {
                debug!(rule = %rule.name, "Replacing alert rule");
                *existing = rule;
            }
            None => {
                debug!(rule = %rule.name, "Registered alert rule");
                rules.push(rule);
            }
        }
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn enable_rule(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_rule(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Rule names in registration order.
    pub fn rule_names(&self) -> Vec<String> {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Evaluate every enabled rule against `payload` in registration order
    /// and raise one alert per match. Returns the alerts raised.
    pub fn check_rules(&self, payload: &Value, source: &str) -> Vec<Alert> {
        let candidates: Vec<(String, Predicate, Severity, String)> = {
            let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            rules
                .iter()
                .filter(|r| r.enabled)
                .map(|r| {
                    (
                        r.name.clone(),
                        Arc::clone(&r.predicate),
                        r.severity,
                        r.message.clone(),
                    )
                })
                .collect()
        };

        let mut raised = Vec::new();
        for (name, predicate, severity, template) in candidates {
            match evaluate(&name, &predicate, payload) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(rule = %e.rule, reason = %e.reason, "Alert rule evaluation failed");
                    continue;
                }
            }
            if self.suppressed(&name) {
                debug!(rule = %name, "Alert suppressed");
                continue;
            }
            let mut metadata = Map::new();
            metadata.insert("rule".into(), json!(name));
            metadata.insert("payload".into(), payload.clone());
            let message = render_template(&template, payload);
            raised.push(self.generate_alert(&name, &message, severity, source, metadata));
        }
        raised
    }

    fn suppressed(&self, name: &str) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rule) = rules.iter_mut().find(|r| r.name == name) else {
            return false;
        };
        let now = Instant::now();
        if let (Some(window), Some(last)) = (self.suppression, rule.last_fired) {
            if now.duration_since(last) < window {
                return true;
            }
        }
        rule.last_fired = Some(now);
        false
    }

    /// Store an alert directly and notify observers.
    pub fn generate_alert(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        source: &str,
        metadata: Map<String, Value>,
    ) -> Alert {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let alert = Alert {
            id: format!("alert-{:010}", seq),
            title: title.to_string(),
            message: message.to_string(),
            severity,
            timestamp: Utc::now(),
            source: source.to_string(),
            acknowledged: false,
            metadata,
        };

        {
            let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            while store.len() >= self.capacity {
                if let Some(evicted) = store.pop_front() {
                    debug!(id = %evicted.id, "Evicted oldest alert");
                }
            }
            store.push_back(alert.clone());
        }

        match severity {
            Severity::Critical | Severity::Error => {
                error!(id = %alert.id, source, severity = %severity, "{}", message)
            }
            Severity::Warning => warn!(id = %alert.id, source, "{}", message),
            Severity::Info => info!(id = %alert.id, source, "{}", message),
        }
        self.observers.publish(&alert);
        alert
    }

    /// Matching alerts, newest first.
    pub fn get_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let matching = store.iter().rev().filter(|a| filter.matches(a)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match store.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Acknowledge everything outstanding. Returns how many changed.
    pub fn acknowledge_all(&self) -> usize {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for alert in store.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            changed += 1;
        }
        changed
    }

    pub fn unacknowledged_count(&self) -> usize {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.iter().filter(|a| !a.acknowledged).count()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_alert<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Alert) -> Result<(), String> + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Rules for the status-change payloads published by the health checker.
    pub fn install_default_rules(&self) {
        self.add_rule(
            "service_down",
            |p| Ok(p.get("status") == Some(&json!("down"))),
            Severity::Error,
            "Service {service} is down",
        );
        self.add_rule(
            "service_timeout",
            |p| Ok(p.get("status") == Some(&json!("timeout"))),
            Severity::Warning,
            "Service {service} timed out",
        );
        self.add_rule(
            "service_unhealthy",
            |p| {
                Ok(matches!(
                    p.get("status").and_then(Value::as_str),
                    Some("unhealthy" | "error")
                ))
            },
            Severity::Warning,
            "Service {service} is {status}",
        );
        self.add_rule(
            "service_recovered",
            |p| {
                let now = p.get("status").and_then(Value::as_str);
                let before = p.get("previous").and_then(Value::as_str);
                Ok(matches!(now, Some("healthy" | "available"))
                    && matches!(before, Some("unhealthy" | "down" | "timeout" | "error")))
            },
            Severity::Info,
            "Service {service} recovered ({previous} -> {status})",
        );
    }
}

fn evaluate(name: &str, predicate: &Predicate, payload: &Value) -> Result<bool, RuleEvaluationError> {
    match catch_unwind(AssertUnwindSafe(|| predicate(payload))) {
        Ok(Ok(matched)) => Ok(matched),
        Ok(Err(reason)) => Err(RuleEvaluationError {
            rule: name.to_string(),
            reason,
        }),
        Err(_) => Err(RuleEvaluationError {
            rule: name.to_string(),
            reason: "predicate panicked".to_string(),
        }),
    }
}

/// Resolve a dotted path such as `details.statusCode`.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, key| match value {
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => value.get(key),
        })
}

fn field_predicate(config: &RuleConfig) -> Predicate {
    let field = config.field.clone();
    let op = config.op;
    let expected = config.value.clone();
    Arc::new(move |payload: &Value| {
        let Some(actual) = lookup(payload, &field) else {
            return Ok(false);
        };
        match op {
            RuleOp::Eq => Ok(actual == &expected),
            RuleOp::Ne => Ok(actual != &expected),
            RuleOp::In => match &expected {
                Value::Array(options) => Ok(options.contains(actual)),
                _ => Err(format!("'in' expects an array for field '{}'", field)),
            },
            RuleOp::Gt | RuleOp::Gte | RuleOp::Lt | RuleOp::Lte => {
                let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
                    return Err(format!("field '{}' is not numeric", field));
                };
                Ok(match op {
                    RuleOp::Gt => a > b,
                    RuleOp::Gte => a >= b,
                    RuleOp::Lt => a < b,
                    _ => a <= b,
                })
            }
        }
    })
}

/// Replace `{path}` placeholders with values from the payload. Unknown
/// placeholders are left untouched.
pub fn render_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        match lookup(payload, key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) if !key.is_empty() => out.push_str(&other.to_string()),
            _ => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
