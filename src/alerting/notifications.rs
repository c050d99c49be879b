use super::{
    AlertAction, AlertSeverity, DatabaseAlert, EmailActionConfig, LogActionConfig, LogLevel,
    SlackActionConfig, WebhookActionConfig,
};
use crate::error::{DebuggerError, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Executes rule actions. Outbound delivery is off unless enabled in the
/// alerting config; in that mode the payload is only logged.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    client: Client,
    deliver: bool,
}

impl NotificationDispatcher {
    pub fn new(deliver: bool, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, deliver })
    }

    pub fn delivers(&self) -> bool {
        self.deliver
    }

    pub async fn execute(&self, action: &AlertAction, alert: &DatabaseAlert) -> Result<()> {
        match action {
            AlertAction::Log(config) => {
                log_alert(config, alert);
                Ok(())
            }
            AlertAction::Email(config) => self.send_email(config, alert),
            AlertAction::Webhook(config) => self.send_webhook(config, alert).await,
            AlertAction::Slack(config) => self.send_slack(config, alert).await,
        }
    }

    fn send_email(&self, config: &EmailActionConfig, alert: &DatabaseAlert) -> Result<()> {
        if config.recipients.is_empty() {
            return Err(DebuggerError::ActionExecution {
                action: "email".to_string(),
                reason: "no recipients configured".to_string(),
            });
        }

        // No SMTP transport is bundled.
        let payload = email_payload(config, alert);
        info!(
            alert_id = %alert.id,
            recipients = config.recipients.len(),
            subject = %payload["subject"].as_str().unwrap_or_default(),
            "Would send email notification"
        );
        Ok(())
    }

    async fn send_webhook(&self, config: &WebhookActionConfig, alert: &DatabaseAlert) -> Result<()> {
        let payload = webhook_payload(alert);

        if config.url.is_empty() || !self.deliver {
            info!(alert_id = %alert.id, url = %config.url, "Would send webhook notification");
            return Ok(());
        }

        let mut request = self.client.post(&config.url).json(&payload);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        self.dispatch("webhook", request).await
    }

    async fn send_slack(&self, config: &SlackActionConfig, alert: &DatabaseAlert) -> Result<()> {
        let payload = slack_payload(config, alert);

        if config.webhook_url.is_empty() || !self.deliver {
            info!(alert_id = %alert.id, channel = ?config.channel, "Would send Slack notification");
            return Ok(());
        }

        let request = self.client.post(&config.webhook_url).json(&payload);
        self.dispatch("slack", request).await
    }

    async fn dispatch(&self, action: &str, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request
            .send()
            .await
            .map_err(|e| DebuggerError::ActionExecution {
                action: action.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DebuggerError::ActionExecution {
                action: action.to_string(),
                reason: format!("endpoint returned {status}"),
            });
        }

        debug!(action, %status, "Notification delivered");
        Ok(())
    }
}

fn log_alert(config: &LogActionConfig, alert: &DatabaseAlert) {
    let level = config.level.unwrap_or(match alert.severity {
        AlertSeverity::Critical | AlertSeverity::Error => LogLevel::Error,
        AlertSeverity::Warning => LogLevel::Warn,
        AlertSeverity::Info => LogLevel::Info,
    });

    match level {
        LogLevel::Error => error!(
            alert_id = %alert.id,
            rule = %alert.rule_name,
            severity = alert.severity.as_str(),
            "[ALERT] {}",
            alert.message
        ),
        LogLevel::Warn => warn!(
            alert_id = %alert.id,
            rule = %alert.rule_name,
            severity = alert.severity.as_str(),
            "[ALERT] {}",
            alert.message
        ),
        LogLevel::Info => info!(
            alert_id = %alert.id,
            rule = %alert.rule_name,
            severity = alert.severity.as_str(),
            "[ALERT] {}",
            alert.message
        ),
        LogLevel::Debug => debug!(
            alert_id = %alert.id,
            rule = %alert.rule_name,
            severity = alert.severity.as_str(),
            "[ALERT] {}",
            alert.message
        ),
    }
}

pub fn webhook_payload(alert: &DatabaseAlert) -> Value {
    json!({
        "event": "alert",
        "alert": {
            "id": alert.id,
            "rule_id": alert.rule_id,
            "rule_name": alert.rule_name,
            "type": alert.rule_type.as_str(),
            "severity": alert.severity.as_str(),
            "message": alert.message,
            "metric": alert.metric,
            "value": alert.observed_value,
            "threshold": alert.threshold,
            "timestamp": alert.timestamp.to_rfc3339(),
            "metadata": alert.metadata,
        },
    })
}

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "#d00000",
        AlertSeverity::Error => "#e85d04",
        AlertSeverity::Warning => "#ffba08",
        AlertSeverity::Info => "#3a86ff",
    }
}

pub fn slack_payload(config: &SlackActionConfig, alert: &DatabaseAlert) -> Value {
    let mut payload = json!({
        "text": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.rule_name),
        "attachments": [{
            "color": severity_color(alert.severity),
            "text": alert.message,
            "fields": [
                { "title": "Metric", "value": alert.metric, "short": true },
                { "title": "Value", "value": alert.observed_value.to_string(), "short": true },
                { "title": "Threshold", "value": alert.threshold.to_string(), "short": true },
                { "title": "Type", "value": alert.rule_type.as_str(), "short": true },
            ],
            "ts": alert.timestamp.timestamp(),
        }],
    });

    if let Some(channel) = &config.channel {
        payload["channel"] = json!(channel);
    }
    if let Some(username) = &config.username {
        payload["username"] = json!(username);
    }
    payload
}

pub fn email_payload(config: &EmailActionConfig, alert: &DatabaseAlert) -> Value {
    let prefix = config.subject_prefix.as_deref().unwrap_or("[DB Alert]");
    json!({
        "to": config.recipients,
        "subject": format!("{prefix} {} - {}", alert.severity.as_str().to_uppercase(), alert.rule_name),
        "body": format!(
            "{}\n\nRule: {} ({})\nMetric: {} = {} (threshold {})\nTime: {}",
            alert.message,
            alert.rule_name,
            alert.rule_id,
            alert.metric,
            alert.observed_value,
            alert.threshold,
            alert.timestamp.to_rfc3339(),
        ),
    })
}
