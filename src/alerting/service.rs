use super::{
    within_cooldown, AlertMetadata, AlertRule, AlertRuleUpdate, AlertSeverity, AlertStatistics,
    ConditionEvaluator, ConditionMatch, DatabaseAlert, DefaultConditionEvaluator, MetricSample,
    NotificationDispatcher, RuleCondition, RuleType,
};
use crate::alerting::is_percentage_metric;
use crate::config::{AlertingConfig, DebuggerConfig};
use crate::error::{DebuggerError, Result};
use crate::monitoring::lifecycle::BackgroundTask;
use crate::monitoring::{
    display_value, BoundedHistory, EventBus, EventPayload, MonitoringEvent, QueryStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
struct AlertState {
    rules: Vec<AlertRule>,
    active: HashMap<String, DatabaseAlert>,
    /// Insertion order of `active`, used to evict the oldest when full
    active_order: VecDeque<String>,
    history: BoundedHistory<DatabaseAlert>,
    last_rule_execution: HashMap<String, DateTime<Utc>>,
    max_active: usize,
}

impl AlertState {
    fn rule_in_cooldown(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let last = self
            .last_rule_execution
            .get(&rule.id)
            .copied()
            .or(rule.last_triggered);
        within_cooldown(last, rule.cooldown_minutes, now)
    }

    fn insert_active(&mut self, alert: DatabaseAlert) {
        self.active_order.push_back(alert.id.clone());
        self.active.insert(alert.id.clone(), alert);

        while self.active.len() > self.max_active {
            match self.active_order.pop_front() {
                Some(oldest) => {
                    if self.active.remove(&oldest).is_some() {
                        debug!(alert_id = %oldest, "Evicted oldest active alert");
                    }
                }
                None => break,
            }
        }
    }
}

/// Rule engine: turns monitoring events into cooldown-gated alerts, runs each
/// rule's actions and owns the active/resolved alert lifecycle.
#[derive(Debug, Clone)]
pub struct AlertService {
    state: Arc<RwLock<AlertState>>,
    evaluator: Arc<dyn ConditionEvaluator>,
    dispatcher: NotificationDispatcher,
    bus: EventBus,
    listener: Arc<BackgroundTask>,
    enabled: bool,
}

impl AlertService {
    pub fn new(config: &AlertingConfig, bus: EventBus) -> Result<Self> {
        let dispatcher = NotificationDispatcher::new(
            config.deliver_notifications,
            Duration::from_millis(config.notification_timeout_ms),
        )?;

        Ok(Self {
            state: Arc::new(RwLock::new(AlertState {
                rules: Vec::new(),
                active: HashMap::new(),
                active_order: VecDeque::new(),
                history: BoundedHistory::new(config.history_size),
                last_rule_execution: HashMap::new(),
                max_active: config.max_active_alerts.max(1),
            })),
            evaluator: Arc::new(DefaultConditionEvaluator),
            dispatcher,
            bus,
            listener: Arc::new(BackgroundTask::new("alert_service")),
            enabled: config.enabled,
        })
    }

    /// Replace the condition evaluator. Rules keep their shape.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Load the configured rules, or the built-in set when none are configured.
    pub async fn initialize_alert_rules(&self, config: &DebuggerConfig) -> Result<usize> {
        let rules = if config.alerting.rules.is_empty() {
            default_alert_rules(config.query_monitor.slow_query.threshold_ms)
        } else {
            config.alerting.rules.clone()
        };

        for rule in &rules {
            rule.validate()?;
        }

        let mut state = self.state.write().await;
        state.last_rule_execution = rules
            .iter()
            .filter_map(|r| r.last_triggered.map(|t| (r.id.clone(), t)))
            .collect();
        state.rules = rules;

        info!(rules = state.rules.len(), "Alert rules initialized");
        Ok(state.rules.len())
    }

    /// Subscribe to the event bus and evaluate rules as events arrive.
    pub async fn start(&self) -> bool {
        if !self.enabled {
            info!("Alerting disabled, listener not started");
            return false;
        }

        let mut events = self.bus.subscribe();
        let service = self.clone();

        self.listener
            .spawn(move |mut shutdown| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        received = events.recv() => match received {
                            Ok(event) => {
                                service.handle_event(&event).await;
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Alert listener fell behind, events dropped");
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
            .await
    }

    pub async fn stop(&self) -> bool {
        self.listener.stop().await
    }

    pub async fn is_active(&self) -> bool {
        self.listener.is_running().await
    }

    pub async fn handle_event(&self, event: &MonitoringEvent) -> Vec<DatabaseAlert> {
        self.handle_event_at(event, Utc::now()).await
    }

    /// Evaluate every enabled rule whose type matches the event (plus custom
    /// rules) and trigger those that match.
    #[instrument(skip(self, event), fields(event = event.kind()))]
    pub(crate) async fn handle_event_at(
        &self,
        event: &MonitoringEvent,
        now: DateTime<Utc>,
    ) -> Vec<DatabaseAlert> {
        let Some((rule_type, sample, metadata)) = route_event(&event.payload) else {
            return Vec::new();
        };

        let candidates: Vec<AlertRule> = {
            let state = self.state.read().await;
            state
                .rules
                .iter()
                .filter(|r| r.enabled && (r.rule_type == rule_type || r.rule_type == RuleType::Custom))
                .cloned()
                .collect()
        };

        let mut raised = Vec::new();
        for rule in candidates {
            if self.should_skip_rule_at(&rule, now).await {
                debug!(rule_id = %rule.id, "Rule in cooldown, skipped");
                continue;
            }

            match self.evaluator.evaluate(&rule, &sample) {
                Ok(Some(matched)) => {
                    if let Some(alert) = self
                        .trigger_alert_at(&rule, matched, metadata.clone(), now)
                        .await
                    {
                        raised.push(alert);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Rule evaluation failed, treating as no match");
                }
            }
        }

        raised
    }

    pub async fn should_skip_rule(&self, rule: &AlertRule) -> bool {
        self.should_skip_rule_at(rule, Utc::now()).await
    }

    async fn should_skip_rule_at(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        self.state.read().await.rule_in_cooldown(rule, now)
    }

    pub async fn trigger_alert(
        &self,
        rule: &AlertRule,
        matched: ConditionMatch,
        metadata: AlertMetadata,
    ) -> Option<DatabaseAlert> {
        self.trigger_alert_at(rule, matched, metadata, Utc::now())
            .await
    }

    /// Record an alert for `rule` and run its actions. Returns `None` when the
    /// rule is unknown, disabled, or still cooling down.
    async fn trigger_alert_at(
        &self,
        rule: &AlertRule,
        matched: ConditionMatch,
        metadata: AlertMetadata,
        now: DateTime<Utc>,
    ) -> Option<DatabaseAlert> {
        let (alert, actions) = {
            let mut state = self.state.write().await;

            // Cooldown is re-checked under the write lock so concurrent
            // handlers cannot both fire the same rule.
            let current = state.rules.iter().find(|r| r.id == rule.id)?.clone();
            if !current.enabled || state.rule_in_cooldown(&current, now) {
                return None;
            }

            let alert = DatabaseAlert {
                id: Uuid::new_v4().to_string(),
                rule_id: current.id.clone(),
                rule_name: current.name.clone(),
                rule_type: current.rule_type,
                severity: current.severity,
                message: format_alert_message(&current, &matched, &metadata),
                metric: matched.metric,
                observed_value: matched.observed,
                threshold: current.threshold,
                timestamp: now,
                resolved: false,
                resolved_at: None,
                resolution_note: None,
                metadata,
            };

            if let Some(stored) = state.rules.iter_mut().find(|r| r.id == current.id) {
                stored.last_triggered = Some(now);
            }
            state.last_rule_execution.insert(current.id.clone(), now);
            state.insert_active(alert.clone());
            state.history.push(alert.clone());

            (alert, current.actions)
        };

        info!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            severity = alert.severity.as_str(),
            "Alert triggered"
        );

        for action in &actions {
            if let Err(e) = self.dispatcher.execute(action, &alert).await {
                warn!(
                    alert_id = %alert.id,
                    action = action.kind(),
                    error = %e,
                    "Alert action failed"
                );
            }
        }

        self.bus.publish(EventPayload::Alert(alert.clone()));
        Some(alert)
    }

    /// Mark an active alert resolved. `false` if it is unknown or no longer active.
    pub async fn resolve_alert(&self, alert_id: &str, note: Option<String>) -> bool {
        let resolved = {
            let mut state = self.state.write().await;
            let Some(mut alert) = state.active.remove(alert_id) else {
                return false;
            };
            state.active_order.retain(|id| id != alert_id);

            let now = Utc::now();
            alert.resolved = true;
            alert.resolved_at = Some(now);
            alert.resolution_note = note;

            if let Some(entry) = state.history.iter_mut().find(|a| a.id == alert_id) {
                *entry = alert.clone();
            }
            alert
        };

        info!(alert_id, rule_id = %resolved.rule_id, "Alert resolved");
        self.bus.publish(EventPayload::AlertResolved(resolved));
        true
    }

    pub async fn add_alert_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;

        let mut state = self.state.write().await;
        if state.rules.iter().any(|r| r.id == rule.id) {
            return Err(DebuggerError::Configuration(format!(
                "Alert rule '{}' already exists",
                rule.id
            )));
        }

        info!(rule_id = %rule.id, "Added alert rule");
        if let Some(last) = rule.last_triggered {
            state.last_rule_execution.insert(rule.id.clone(), last);
        }
        state.rules.push(rule);
        Ok(())
    }

    pub async fn update_alert_rule(&self, rule_id: &str, update: AlertRuleUpdate) -> Result<AlertRule> {
        let mut state = self.state.write().await;
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| DebuggerError::NotFound {
                id: rule_id.to_string(),
            })?;

        let mut updated = rule.clone();
        update.apply_to(&mut updated);
        updated.validate()?;
        *rule = updated.clone();

        info!(rule_id, "Updated alert rule");
        Ok(updated)
    }

    /// Remove a rule together with its cooldown entry.
    pub async fn remove_alert_rule(&self, rule_id: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.rules.len();
        state.rules.retain(|r| r.id != rule_id);
        let removed = state.rules.len() != before;

        if removed {
            state.last_rule_execution.remove(rule_id);
            info!(rule_id, "Removed alert rule");
        }
        removed
    }

    /// Oldest first.
    pub async fn get_active_alerts(&self) -> Vec<DatabaseAlert> {
        let state = self.state.read().await;
        state
            .active_order
            .iter()
            .filter_map(|id| state.active.get(id).cloned())
            .collect()
    }

    /// Newest first.
    pub async fn get_alert_history(&self, limit: Option<usize>) -> Vec<DatabaseAlert> {
        self.state.read().await.history.recent(limit)
    }

    pub async fn get_alert_rules(&self) -> Vec<AlertRule> {
        self.state.read().await.rules.clone()
    }

    pub async fn get_alert_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.state
            .read()
            .await
            .rules
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
    }

    pub async fn get_alert_statistics(&self) -> AlertStatistics {
        let state = self.state.read().await;
        let mut stats = AlertStatistics {
            total_alerts: state.history.len(),
            active_alerts: state.active.len(),
            ..Default::default()
        };

        for alert in state.history.iter() {
            if alert.resolved {
                stats.resolved_alerts += 1;
            }
            *stats
                .alerts_by_type
                .entry(alert.rule_type.as_str().to_string())
                .or_default() += 1;
            *stats
                .alerts_by_severity
                .entry(alert.severity.as_str().to_string())
                .or_default() += 1;
        }

        stats
    }

    /// Drop all alerts and cooldowns. Rules are kept.
    pub async fn clear_alert_history(&self) {
        let mut state = self.state.write().await;
        state.active.clear();
        state.active_order.clear();
        state.history.clear();
        state.last_rule_execution.clear();
        for rule in &mut state.rules {
            rule.last_triggered = None;
        }
        info!("Alert state cleared");
    }
}

/// Which rules an event feeds, the metrics it exposes to them, and the
/// metadata attached to resulting alerts.
fn route_event(payload: &EventPayload) -> Option<(RuleType, MetricSample, AlertMetadata)> {
    match payload {
        EventPayload::QueryCompleted(query) => {
            let failed = matches!(query.status, QueryStatus::Error | QueryStatus::Timeout);
            let mut sample = MetricSample::new()
                .with("execution_time", query.execution_time_ms as f64)
                .with("failed", if failed { 1.0 } else { 0.0 });
            if let Some(rows) = query.rows_returned {
                sample.insert("rows_returned", rows as f64);
            }
            if let Some(rows) = query.rows_affected {
                sample.insert("rows_affected", rows as f64);
            }

            Some((
                RuleType::QueryTime,
                sample,
                AlertMetadata::Query {
                    query_id: query.id.clone(),
                    query: query.query.clone(),
                    execution_time_ms: query.execution_time_ms,
                    database: query.database.clone(),
                },
            ))
        }
        EventPayload::ConnectionPoolMetricsUpdate(metrics) => {
            let sample = MetricSample::new()
                .with("utilization", metrics.utilization)
                .with("active_connections", metrics.active_connections as f64)
                .with("idle_connections", metrics.idle_connections as f64)
                .with("waiting_connections", metrics.waiting_connections as f64)
                .with("total_connections", metrics.total_connections as f64)
                .with("max_connections", metrics.max_connections as f64)
                .with("connection_errors", metrics.connection_errors as f64)
                .with("connection_timeouts", metrics.connection_timeouts as f64);

            Some((
                RuleType::ConnectionPool,
                sample,
                AlertMetadata::ConnectionPool {
                    metrics: metrics.clone(),
                },
            ))
        }
        EventPayload::MemoryMetricsUpdate(metrics) => {
            let mut sample = MetricSample::new()
                .with("buffer_hit_ratio", metrics.buffer_hit_ratio)
                .with("temp_bytes", metrics.temp_bytes as f64)
                .with("total_bytes", metrics.total_bytes as f64);
            if let Some(used) = metrics.used_bytes {
                sample.insert("used_bytes", used as f64);
            }
            if let Some(percent) = metrics.usage_percent {
                sample.insert("usage_percent", percent);
            }

            Some((
                RuleType::Memory,
                sample,
                AlertMetadata::Memory {
                    metrics: metrics.clone(),
                },
            ))
        }
        EventPayload::DeadlockDetected(deadlocks) => Some((
            RuleType::Deadlock,
            MetricSample::new().with("deadlock_count", deadlocks.len() as f64),
            AlertMetadata::Deadlock {
                deadlocks: deadlocks.clone(),
            },
        )),
        _ => None,
    }
}

fn format_metric(metric: &str, value: f64) -> String {
    if is_percentage_metric(metric) {
        format!("{}%", display_value(value))
    } else {
        format!("{}", display_value(value))
    }
}

fn format_alert_message(rule: &AlertRule, matched: &ConditionMatch, metadata: &AlertMetadata) -> String {
    let observed = format_metric(&matched.metric, matched.observed);
    let threshold = format_metric(&matched.metric, rule.threshold);

    match (rule.rule_type, metadata) {
        (RuleType::QueryTime, AlertMetadata::Query { query_id, .. }) if matched.metric == "execution_time" => {
            format!("Query {query_id} took {observed}ms (threshold: {threshold}ms)")
        }
        (RuleType::QueryTime, AlertMetadata::Query { query_id, .. }) => {
            format!("Query {query_id}: {} is {observed} (threshold: {threshold})", matched.metric)
        }
        (RuleType::ConnectionPool, _) if matched.metric == "utilization" => {
            format!("Connection pool utilization at {observed} (threshold: {threshold})")
        }
        (RuleType::ConnectionPool, _) => format!(
            "Connection pool {} at {observed} (threshold: {threshold})",
            matched.metric.replace('_', " ")
        ),
        (RuleType::Memory, _) if matched.metric == "buffer_hit_ratio" => {
            format!("Buffer cache hit ratio at {observed} (threshold: {threshold})")
        }
        (RuleType::Memory, _) => format!(
            "Database memory {} at {observed} (threshold: {threshold})",
            matched.metric.replace('_', " ")
        ),
        (RuleType::Deadlock, _) => format!("{observed} deadlock(s) detected"),
        _ => format!(
            "{}: {} = {observed} (threshold: {threshold})",
            rule.name, matched.metric
        ),
    }
}

/// Rules used when the configuration names none.
pub fn default_alert_rules(slow_query_threshold_ms: u64) -> Vec<AlertRule> {
    let text = |s: &str| RuleCondition::Text(s.to_string());

    vec![
        AlertRule::new(
            "slow_query",
            "Slow query",
            RuleType::QueryTime,
            text("execution_time > threshold"),
            slow_query_threshold_ms as f64,
            AlertSeverity::Warning,
        ),
        AlertRule::new(
            "connection_pool_saturation",
            "Connection pool saturation",
            RuleType::ConnectionPool,
            text("utilization >= threshold"),
            90.0,
            AlertSeverity::Critical,
        ),
        AlertRule::new(
            "connection_errors",
            "Connection errors",
            RuleType::ConnectionPool,
            text("connection_errors > threshold"),
            0.0,
            AlertSeverity::Error,
        )
        .with_cooldown(2),
        AlertRule::new(
            "low_buffer_hit_ratio",
            "Low buffer cache hit ratio",
            RuleType::Memory,
            text("buffer_hit_ratio < threshold"),
            90.0,
            AlertSeverity::Warning,
        )
        .with_cooldown(15),
        AlertRule::new(
            "deadlock_detected",
            "Deadlock detected",
            RuleType::Deadlock,
            text("deadlock_count > threshold"),
            0.0,
            AlertSeverity::Critical,
        )
        .with_cooldown(1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{AlertAction, EmailActionConfig, LogActionConfig};
    use crate::monitoring::{ConnectionPoolMetrics, QueryMetrics};
    use tracing_test::traced_test;

    fn pool_event(active: u32, max: u32) -> MonitoringEvent {
        MonitoringEvent::new(EventPayload::ConnectionPoolMetricsUpdate(
            ConnectionPoolMetrics::from_counts(active, active, 0, 0, max),
        ))
    }

    async fn service_with_defaults() -> (AlertService, EventBus) {
        let bus = EventBus::new(64);
        let config = DebuggerConfig::default();
        let service = AlertService::new(&config.alerting, bus.clone()).unwrap();
        service.initialize_alert_rules(&config).await.unwrap();
        (service, bus)
    }

    #[tokio::test]
    async fn test_saturated_pool_raises_one_critical_alert() {
        let (service, _bus) = service_with_defaults().await;
        let now = Utc::now();

        let alerts = service.handle_event_at(&pool_event(96, 100), now).await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert!(alerts[0].message.contains("96%"), "{}", alerts[0].message);
        assert_eq!(service.get_active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_then_allows() {
        let (service, _bus) = service_with_defaults().await;
        let start = Utc::now();

        service.handle_event_at(&pool_event(96, 100), start).await;
        let repeat = service
            .handle_event_at(&pool_event(96, 100), start + chrono::Duration::minutes(1))
            .await;
        assert!(repeat.is_empty());
        assert_eq!(service.get_alert_history(None).await.len(), 1);

        let later = service
            .handle_event_at(&pool_event(96, 100), start + chrono::Duration::minutes(6))
            .await;
        assert_eq!(later.len(), 1);
        assert_eq!(service.get_alert_history(None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_is_one_way() {
        let (service, bus) = service_with_defaults().await;
        let mut events = bus.subscribe();

        let alert = service
            .handle_event_at(&pool_event(96, 100), Utc::now())
            .await
            .remove(0);

        assert!(service
            .resolve_alert(&alert.id, Some("scaled pool".to_string()))
            .await);
        assert!(!service.resolve_alert(&alert.id, None).await);
        assert!(!service.resolve_alert("unknown", None).await);
        assert!(service.get_active_alerts().await.is_empty());

        let history = service.get_alert_history(None).await;
        assert!(history[0].resolved);
        assert_eq!(history[0].resolution_note.as_deref(), Some("scaled pool"));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["alert", "alert.resolved"]);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failing_action_does_not_block_others() {
        let bus = EventBus::new(16);
        let config = DebuggerConfig::default();
        let service = AlertService::new(&config.alerting, bus).unwrap();

        let rule = AlertRule::new(
            "pool",
            "Pool",
            RuleType::ConnectionPool,
            RuleCondition::Text("utilization >= threshold".to_string()),
            80.0,
            AlertSeverity::Warning,
        )
        .with_actions(vec![
            AlertAction::Email(EmailActionConfig {
                recipients: vec![],
                subject_prefix: None,
            }),
            AlertAction::Log(LogActionConfig::default()),
        ]);
        service.add_alert_rule(rule).await.unwrap();

        let alerts = service.handle_event_at(&pool_event(90, 100), Utc::now()).await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(service.get_active_alerts().await.len(), 1);
        assert!(logs_contain("Alert action failed"));
        assert!(logs_contain("[ALERT]"));
    }

    #[derive(Debug)]
    struct BrokenEvaluator;

    impl ConditionEvaluator for BrokenEvaluator {
        fn evaluate(&self, rule: &AlertRule, _sample: &MetricSample) -> Result<Option<ConditionMatch>> {
            Err(DebuggerError::RuleEvaluation {
                rule_id: rule.id.clone(),
                reason: "unparseable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_evaluation_errors_fail_closed() {
        let bus = EventBus::new(16);
        let config = DebuggerConfig::default();
        let service = AlertService::new(&config.alerting, bus)
            .unwrap()
            .with_evaluator(Arc::new(BrokenEvaluator));
        service.initialize_alert_rules(&config).await.unwrap();

        let alerts = service.handle_event_at(&pool_event(100, 100), Utc::now()).await;
        assert!(alerts.is_empty());
        assert_eq!(service.get_alert_statistics().await.total_alerts, 0);
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let (service, _bus) = service_with_defaults().await;
        let count = service.get_alert_rules().await.len();

        let duplicate = AlertRule::new(
            "slow_query",
            "Duplicate",
            RuleType::QueryTime,
            RuleCondition::Text("execution_time > threshold".to_string()),
            10.0,
            AlertSeverity::Info,
        );
        assert!(service.add_alert_rule(duplicate).await.is_err());

        let malformed = AlertRule::new(
            "broken",
            "Broken",
            RuleType::Custom,
            RuleCondition::Text("utilization is very high".to_string()),
            10.0,
            AlertSeverity::Info,
        );
        assert!(service.add_alert_rule(malformed).await.is_err());

        let updated = service
            .update_alert_rule(
                "slow_query",
                AlertRuleUpdate {
                    threshold: Some(250.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.threshold, 250.0);

        let bad_update = service
            .update_alert_rule(
                "connection_pool_saturation",
                AlertRuleUpdate {
                    threshold: Some(180.0),
                    ..Default::default()
                },
            )
            .await;
        assert!(bad_update.is_err());
        assert_eq!(
            service
                .get_alert_rule("connection_pool_saturation")
                .await
                .unwrap()
                .threshold,
            90.0
        );

        assert!(matches!(
            service.update_alert_rule("missing", AlertRuleUpdate::default()).await,
            Err(DebuggerError::NotFound { .. })
        ));

        assert!(service.remove_alert_rule("slow_query").await);
        assert!(!service.remove_alert_rule("slow_query").await);
        assert_eq!(service.get_alert_rules().await.len(), count - 1);
    }

    #[tokio::test]
    async fn test_removing_rule_clears_its_cooldown() {
        let (service, _bus) = service_with_defaults().await;
        let now = Utc::now();
        service.handle_event_at(&pool_event(96, 100), now).await;

        let rule = service
            .get_alert_rule("connection_pool_saturation")
            .await
            .unwrap();
        assert!(service.remove_alert_rule(&rule.id).await);

        let mut fresh = rule.clone();
        fresh.last_triggered = None;
        service.add_alert_rule(fresh).await.unwrap();

        let again = service
            .handle_event_at(&pool_event(96, 100), now + chrono::Duration::seconds(10))
            .await;
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_completed_query_routes_to_query_rules() {
        let (service, _bus) = service_with_defaults().await;
        let mut query = QueryMetrics::new("q1", "SELECT pg_sleep(6)").with_execution_time(6000);
        query.finalize(Utc::now());

        let alerts = service
            .handle_event_at(
                &MonitoringEvent::new(EventPayload::QueryCompleted(query)),
                Utc::now(),
            )
            .await;

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "slow_query");
        assert!(alerts[0].message.contains("6000ms"));
        assert!(matches!(alerts[0].metadata, AlertMetadata::Query { .. }));
    }

    #[tokio::test]
    async fn test_custom_rules_see_every_routed_event() {
        let bus = EventBus::new(16);
        let config = DebuggerConfig::default();
        let service = AlertService::new(&config.alerting, bus).unwrap();
        service
            .add_alert_rule(AlertRule::new(
                "waiting",
                "Clients waiting",
                RuleType::Custom,
                RuleCondition::Text("waiting_connections > 3".to_string()),
                0.0,
                AlertSeverity::Info,
            ))
            .await
            .unwrap();

        let queued = MonitoringEvent::new(EventPayload::ConnectionPoolMetricsUpdate(
            ConnectionPoolMetrics::from_counts(10, 10, 0, 5, 10),
        ));
        let alerts = service.handle_event_at(&queued, Utc::now()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_type, RuleType::Custom);
    }

    #[tokio::test]
    async fn test_statistics_and_clear() {
        let (service, _bus) = service_with_defaults().await;
        let now = Utc::now();

        let errors = MonitoringEvent::new(EventPayload::ConnectionPoolMetricsUpdate(
            ConnectionPoolMetrics::from_counts(96, 96, 0, 0, 100).with_failures(3, 0),
        ));
        let alerts = service.handle_event_at(&errors, now).await;
        assert_eq!(alerts.len(), 2);
        service.resolve_alert(&alerts[0].id, None).await;

        let stats = service.get_alert_statistics().await;
        assert_eq!(stats.total_alerts, 2);
        assert_eq!(stats.active_alerts, 1);
        assert_eq!(stats.resolved_alerts, 1);
        assert_eq!(stats.alerts_by_type.get("connection_pool"), Some(&2));
        assert_eq!(stats.alerts_by_severity.get("critical"), Some(&1));
        assert_eq!(stats.alerts_by_severity.get("error"), Some(&1));

        service.clear_alert_history().await;
        assert_eq!(service.get_alert_statistics().await, AlertStatistics::default());
        assert!(!service.get_alert_rules().await.is_empty());
        assert_eq!(service.handle_event_at(&errors, now).await.len(), 2);
    }

    #[tokio::test]
    async fn test_active_alerts_are_bounded() {
        let bus = EventBus::new(16);
        let mut config = DebuggerConfig::default();
        config.alerting.max_active_alerts = 2;
        let service = AlertService::new(&config.alerting, bus).unwrap();
        service
            .add_alert_rule(
                AlertRule::new(
                    "pool",
                    "Pool",
                    RuleType::ConnectionPool,
                    RuleCondition::Text("utilization >= threshold".to_string()),
                    50.0,
                    AlertSeverity::Warning,
                )
                .with_cooldown(0),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let alerts = service.handle_event_at(&pool_event(60, 100), Utc::now()).await;
            ids.push(alerts[0].id.clone());
        }

        let active: Vec<_> = service
            .get_active_alerts()
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(active, ids[1..].to_vec());
        assert!(!service.resolve_alert(&ids[0], None).await);
        assert_eq!(service.get_alert_history(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_listener_consumes_bus_events() {
        let (service, bus) = service_with_defaults().await;
        let mut observer = bus.subscribe();

        assert!(service.start().await);
        assert!(!service.start().await);

        bus.publish(pool_event(96, 100).payload);

        let alert = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match observer.recv().await {
                    Ok(MonitoringEvent {
                        payload: EventPayload::Alert(alert),
                        ..
                    }) => break alert,
                    Ok(_) => continue,
                    Err(e) => panic!("bus closed: {e}"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(alert.rule_id, "connection_pool_saturation");
        assert!(service.stop().await);
        assert!(!service.stop().await);
    }
}
