pub mod conditions;
pub mod notifications;
pub mod service;

pub use conditions::*;
pub use notifications::*;
pub use service::*;

use crate::adapter::{DatabaseMemoryMetrics, DeadlockInfo};
use crate::config::{ensure_cooldown, ensure_percentage};
use crate::error::{DebuggerError, Result};
use crate::monitoring::ConnectionPoolMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    QueryTime,
    ConnectionPool,
    Deadlock,
    Memory,
    Custom,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::QueryTime => "query_time",
            RuleType::ConnectionPool => "connection_pool",
            RuleType::Deadlock => "deadlock",
            RuleType::Memory => "memory",
            RuleType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogActionConfig {
    /// Defaults to a level derived from the alert severity
    #[serde(default)]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailActionConfig {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookActionConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlackActionConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// One step executed when a rule fires. Serialises as `{type, config}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum AlertAction {
    Log(LogActionConfig),
    Email(EmailActionConfig),
    Webhook(WebhookActionConfig),
    Slack(SlackActionConfig),
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertAction::Log(_) => "log",
            AlertAction::Email(_) => "email",
            AlertAction::Webhook(_) => "webhook",
            AlertAction::Slack(_) => "slack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub condition: RuleCondition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_minutes: u64,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        rule_type: RuleType,
        condition: RuleCondition,
        threshold: f64,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rule_type,
            condition,
            threshold,
            severity,
            enabled: true,
            cooldown_minutes: 5,
            last_triggered: None,
            actions: vec![AlertAction::Log(LogActionConfig::default())],
        }
    }

    pub fn with_cooldown(mut self, minutes: u64) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_actions(mut self, actions: Vec<AlertAction>) -> Self {
        self.actions = actions;
        self
    }

    /// `true` while `now - last_triggered` is shorter than the cooldown.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        within_cooldown(self.last_triggered, self.cooldown_minutes, now)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DebuggerError::Configuration(
                "Alert rule id must not be empty".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(DebuggerError::Configuration(format!(
                "Alert rule '{}' has a non-finite threshold",
                self.id
            )));
        }

        ensure_cooldown(
            &format!("alert rule '{}' cooldown_minutes", self.id),
            self.cooldown_minutes,
        )?;

        let metrics = self.condition.referenced_metrics().map_err(|reason| {
            DebuggerError::Configuration(format!(
                "Alert rule '{}' has an invalid condition: {reason}",
                self.id
            ))
        })?;

        if metrics.iter().any(|m| is_percentage_metric(m)) {
            ensure_percentage(&format!("alert rule '{}' threshold", self.id), self.threshold)?;
        }

        Ok(())
    }
}

pub(crate) fn within_cooldown(
    last_triggered: Option<DateTime<Utc>>,
    cooldown_minutes: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_triggered {
        Some(last) if cooldown_minutes > 0 => {
            // A window too large for chrono never elapses.
            match i64::try_from(cooldown_minutes)
                .ok()
                .and_then(chrono::Duration::try_minutes)
            {
                Some(window) => now.signed_duration_since(last) < window,
                None => true,
            }
        }
        _ => false,
    }
}

/// Partial update applied by `AlertService::update_alert_rule`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRuleUpdate {
    pub name: Option<String>,
    pub condition: Option<RuleCondition>,
    pub threshold: Option<f64>,
    pub severity: Option<AlertSeverity>,
    pub enabled: Option<bool>,
    pub cooldown_minutes: Option<u64>,
    pub actions: Option<Vec<AlertAction>>,
}

impl AlertRuleUpdate {
    pub(crate) fn apply_to(self, rule: &mut AlertRule) {
        if let Some(name) = self.name {
            rule.name = name;
        }
        if let Some(condition) = self.condition {
            rule.condition = condition;
        }
        if let Some(threshold) = self.threshold {
            rule.threshold = threshold;
        }
        if let Some(severity) = self.severity {
            rule.severity = severity;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(cooldown) = self.cooldown_minutes {
            rule.cooldown_minutes = cooldown;
        }
        if let Some(actions) = self.actions {
            rule.actions = actions;
        }
    }
}

/// What the alert was raised about, one variant per event source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AlertMetadata {
    Query {
        query_id: String,
        query: String,
        execution_time_ms: u64,
        database: Option<String>,
    },
    ConnectionPool {
        metrics: ConnectionPoolMetrics,
    },
    Memory {
        metrics: DatabaseMemoryMetrics,
    },
    Deadlock {
        deadlocks: Vec<DeadlockInfo>,
    },
    Custom {
        #[serde(default)]
        values: HashMap<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseAlert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric: String,
    pub observed_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub metadata: AlertMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AlertStatistics {
    pub total_alerts: usize,
    pub active_alerts: usize,
    pub resolved_alerts: usize,
    pub alerts_by_type: HashMap<String, usize>,
    pub alerts_by_severity: HashMap<String, usize>,
}
