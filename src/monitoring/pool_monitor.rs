use super::lifecycle::{run_polling_loop, BackgroundTask};
use super::{
    display_value, BottleneckKind, BottleneckSeverity, BoundedHistory, ConnectionPoolMetrics,
    EventBus, EventPayload, PerformanceBottleneck,
};
use crate::adapter::{with_timeout, DatabaseAdapter};
use crate::alerting::{within_cooldown, AlertSeverity};
use crate::config::ConnectionPoolConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const SATURATION_UTILIZATION: f64 = 90.0;
const CRITICAL_UTILIZATION: f64 = 95.0;
const HIGH_UTILIZATION: f64 = 80.0;
/// Waiting clients above this share of `max_connections` count as a queue.
const QUEUE_SHARE: f64 = 0.1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoolAlertKind {
    HighUtilization,
    ConnectionErrors,
    ConnectionTimeouts,
}

impl PoolAlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolAlertKind::HighUtilization => "high_utilization",
            PoolAlertKind::ConnectionErrors => "connection_errors",
            PoolAlertKind::ConnectionTimeouts => "connection_timeouts",
        }
    }
}

/// Alert raised directly by the pool monitor, deduplicated per kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolAlert {
    pub id: String,
    pub kind: PoolAlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub metrics: ConnectionPoolMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPoolStatistics {
    pub sample_count: usize,
    pub average_utilization: f64,
    pub peak_utilization: f64,
    pub average_active_connections: f64,
    pub peak_active_connections: u32,
    pub total_errors: u64,
    pub total_timeouts: u64,
    /// Share of samples that reported no connection errors
    pub uptime_percentage: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPoolHealth {
    pub score: u32,
    pub status: PoolHealthStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub utilization: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UtilizationTrend {
    pub timestamps: Vec<DateTime<Utc>>,
    pub utilization: Vec<f64>,
    pub active_connections: Vec<u32>,
}

#[derive(Debug)]
struct PoolState {
    config: ConnectionPoolConfig,
    history: BoundedHistory<ConnectionPoolMetrics>,
    recent_alerts: BoundedHistory<PoolAlert>,
    last_fired: HashMap<PoolAlertKind, DateTime<Utc>>,
}

impl PoolState {
    fn new(config: ConnectionPoolConfig) -> Self {
        Self {
            history: BoundedHistory::new(config.history_size),
            recent_alerts: BoundedHistory::new(config.max_recent_alerts),
            last_fired: HashMap::new(),
            config,
        }
    }

    fn check_alerts(&mut self, metrics: &ConnectionPoolMetrics, now: DateTime<Utc>) -> Vec<PoolAlert> {
        let mut candidates = Vec::new();

        if metrics.utilization >= self.config.alert_threshold {
            let severity = if metrics.utilization >= CRITICAL_UTILIZATION {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            candidates.push((
                PoolAlertKind::HighUtilization,
                severity,
                self.config.utilization_cooldown_minutes,
                format!(
                    "Connection pool utilization at {}% (threshold: {}%) - {} active of {} max connections",
                    display_value(metrics.utilization),
                    display_value(self.config.alert_threshold),
                    metrics.active_connections,
                    metrics.max_connections
                ),
            ));
        }

        if metrics.connection_errors > 0 {
            candidates.push((
                PoolAlertKind::ConnectionErrors,
                AlertSeverity::Error,
                self.config.error_cooldown_minutes,
                format!("{} connection errors reported by the pool", metrics.connection_errors),
            ));
        }

        if metrics.connection_timeouts > 0 {
            candidates.push((
                PoolAlertKind::ConnectionTimeouts,
                AlertSeverity::Warning,
                self.config.timeout_cooldown_minutes,
                format!(
                    "{} connection acquisition timeouts reported by the pool",
                    metrics.connection_timeouts
                ),
            ));
        }

        let mut alerts = Vec::new();
        for (kind, severity, cooldown, message) in candidates {
            if within_cooldown(self.last_fired.get(&kind).copied(), cooldown, now) {
                continue;
            }
            self.last_fired.insert(kind, now);

            let alert = PoolAlert {
                id: Uuid::new_v4().to_string(),
                kind,
                severity,
                message,
                metrics: metrics.clone(),
                timestamp: now,
            };
            self.recent_alerts.push(alert.clone());
            alerts.push(alert);
        }
        alerts
    }
}

/// Stateless per-sample diagnosis.
pub fn detect_pool_bottlenecks(metrics: &ConnectionPoolMetrics) -> Vec<PerformanceBottleneck> {
    let mut bottlenecks = Vec::new();
    let now = Utc::now();

    if metrics.utilization >= SATURATION_UTILIZATION {
        bottlenecks.push(PerformanceBottleneck {
            kind: BottleneckKind::ConnectionPoolSaturation,
            severity: if metrics.utilization >= CRITICAL_UTILIZATION {
                BottleneckSeverity::Critical
            } else {
                BottleneckSeverity::High
            },
            description: format!(
                "Connection pool is {}% utilized",
                display_value(metrics.utilization)
            ),
            recommendation: "Increase max connections or shorten connection hold times".to_string(),
            query_id: None,
            detected_at: now,
        });
    }

    if metrics.max_connections > 0
        && metrics.waiting_connections as f64 > metrics.max_connections as f64 * QUEUE_SHARE
    {
        bottlenecks.push(PerformanceBottleneck {
            kind: BottleneckKind::ConnectionQueue,
            severity: BottleneckSeverity::Medium,
            description: format!(
                "{} clients waiting for a connection (max {})",
                metrics.waiting_connections, metrics.max_connections
            ),
            recommendation: "Check for long transactions holding connections".to_string(),
            query_id: None,
            detected_at: now,
        });
    }

    if metrics.connection_errors > 0 {
        bottlenecks.push(PerformanceBottleneck {
            kind: BottleneckKind::ConnectionErrors,
            severity: BottleneckSeverity::High,
            description: format!("{} connection errors", metrics.connection_errors),
            recommendation: "Verify database availability and network stability".to_string(),
            query_id: None,
            detected_at: now,
        });
    }

    bottlenecks
}

/// Samples pool metrics on a fixed interval, keeps a bounded history and
/// raises cooldown-gated utilization/error/timeout alerts.
#[derive(Debug, Clone)]
pub struct ConnectionPoolMonitor {
    state: Arc<RwLock<PoolState>>,
    bus: EventBus,
    task: Arc<BackgroundTask>,
    adapter_timeout: Duration,
}

impl ConnectionPoolMonitor {
    pub fn new(config: &ConnectionPoolConfig, bus: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(PoolState::new(config.clone()))),
            bus,
            task: Arc::new(BackgroundTask::new("connection_pool_monitor")),
            adapter_timeout: Duration::from_millis(5000),
        }
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    pub async fn start_monitoring(
        &self,
        adapter: Arc<dyn DatabaseAdapter>,
        config: &ConnectionPoolConfig,
    ) -> bool {
        if self.task.is_running().await {
            warn!("Connection pool monitoring already active");
            return false;
        }

        {
            let mut state = self.state.write().await;
            if state.history.capacity() != config.history_size {
                let mut history = BoundedHistory::new(config.history_size);
                for sample in state.history.iter() {
                    history.push(sample.clone());
                }
                state.history = history;
            }
            state.config = config.clone();
        }

        let period = Duration::from_millis(config.poll_interval_ms.max(1));
        let monitor = self.clone();

        let started = self
            .task
            .spawn(move |shutdown| async move {
                run_polling_loop("connection_pool_monitor", period, shutdown, || {
                    let monitor = monitor.clone();
                    let adapter = adapter.clone();
                    async move {
                        if let Err(e) = monitor.poll_once(adapter.as_ref()).await {
                            warn!(error = %e, "Connection pool monitor tick skipped");
                        }
                    }
                })
                .await
            })
            .await;

        if started {
            info!(
                interval_ms = period.as_millis() as u64,
                alert_threshold = config.alert_threshold,
                "Connection pool monitoring started"
            );
        }
        started
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.task.stop().await
    }

    pub async fn is_active(&self) -> bool {
        self.task.is_running().await
    }

    #[instrument(skip_all, name = "connection_pool_tick")]
    pub async fn poll_once(&self, adapter: &dyn DatabaseAdapter) -> Result<()> {
        let metrics = with_timeout(
            "get_connection_pool_metrics",
            self.adapter_timeout,
            adapter.get_connection_pool_metrics(),
        )
        .await?;

        self.record_metrics(metrics).await;
        Ok(())
    }

    /// Feed one sample through history, alert checks and bottleneck detection,
    /// then publish. Returns the alerts that fired.
    pub async fn record_metrics(&self, metrics: ConnectionPoolMetrics) -> Vec<PoolAlert> {
        self.record_metrics_at(metrics, Utc::now()).await
    }

    pub(crate) async fn record_metrics_at(
        &self,
        metrics: ConnectionPoolMetrics,
        now: DateTime<Utc>,
    ) -> Vec<PoolAlert> {
        let (alerts, bottlenecks) = {
            let mut state = self.state.write().await;
            state.history.push(metrics.clone());
            let alerts = state.check_alerts(&metrics, now);
            (alerts, detect_pool_bottlenecks(&metrics))
        };

        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Critical | AlertSeverity::Error => {
                    error!(kind = ?alert.kind, "POOL ALERT: {}", alert.message)
                }
                _ => warn!(kind = ?alert.kind, "POOL ALERT: {}", alert.message),
            }
        }

        let mut events: Vec<EventPayload> = alerts
            .iter()
            .cloned()
            .map(EventPayload::ConnectionPoolAlert)
            .collect();
        if !bottlenecks.is_empty() {
            events.push(EventPayload::ConnectionPoolBottlenecks(bottlenecks));
        }
        events.push(EventPayload::ConnectionPoolMetricsUpdate(metrics));
        self.bus.publish_all(events);

        alerts
    }

    pub async fn get_current_metrics(&self) -> Option<ConnectionPoolMetrics> {
        self.state.read().await.history.latest().cloned()
    }

    /// Newest first.
    pub async fn get_metrics_history(&self, limit: Option<usize>) -> Vec<ConnectionPoolMetrics> {
        self.state.read().await.history.recent(limit)
    }

    /// Newest first.
    pub async fn get_recent_alerts(&self, limit: Option<usize>) -> Vec<PoolAlert> {
        self.state.read().await.recent_alerts.recent(limit)
    }

    pub async fn get_connection_pool_statistics(&self) -> ConnectionPoolStatistics {
        let state = self.state.read().await;
        let samples = state.history.len();

        if samples == 0 {
            return ConnectionPoolStatistics {
                sample_count: 0,
                average_utilization: 0.0,
                peak_utilization: 0.0,
                average_active_connections: 0.0,
                peak_active_connections: 0,
                total_errors: 0,
                total_timeouts: 0,
                uptime_percentage: 100.0,
            };
        }

        let mut utilization_sum = 0.0;
        let mut peak_utilization = f64::MIN;
        let mut active_sum = 0u64;
        let mut peak_active = 0u32;
        let mut total_errors = 0u64;
        let mut total_timeouts = 0u64;
        let mut clean_samples = 0usize;

        for sample in state.history.iter() {
            utilization_sum += sample.utilization;
            peak_utilization = peak_utilization.max(sample.utilization);
            active_sum += sample.active_connections as u64;
            peak_active = peak_active.max(sample.active_connections);
            total_errors += sample.connection_errors;
            total_timeouts += sample.connection_timeouts;
            if sample.connection_errors == 0 {
                clean_samples += 1;
            }
        }

        let n = samples as f64;
        ConnectionPoolStatistics {
            sample_count: samples,
            average_utilization: utilization_sum / n,
            peak_utilization,
            average_active_connections: active_sum as f64 / n,
            peak_active_connections: peak_active,
            total_errors,
            total_timeouts,
            uptime_percentage: clean_samples as f64 / n * 100.0,
        }
    }

    /// Score the latest sample out of 100.
    pub async fn get_connection_pool_health(&self) -> ConnectionPoolHealth {
        let latest = self.get_current_metrics().await;
        let checked_at = Utc::now();

        let Some(metrics) = latest else {
            return ConnectionPoolHealth {
                score: 100,
                status: PoolHealthStatus::Healthy,
                issues: vec!["No connection pool samples collected yet".to_string()],
                recommendations: Vec::new(),
                utilization: 0.0,
                checked_at,
            };
        };

        let mut score: i32 = 100;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let utilization = display_value(metrics.utilization);

        if metrics.utilization >= CRITICAL_UTILIZATION {
            score -= 40;
            issues.push(format!("Connection pool critically utilized at {utilization}%"));
            recommendations.push("Increase max connections or reduce connection hold time".to_string());
        } else if metrics.utilization >= HIGH_UTILIZATION {
            score -= 20;
            issues.push(format!("Connection pool highly utilized at {utilization}%"));
            recommendations.push("Plan for additional pool capacity".to_string());
        }

        if metrics.waiting_connections > 0 {
            score -= 15;
            issues.push(format!(
                "{} clients waiting for a connection",
                metrics.waiting_connections
            ));
            recommendations.push("Look for long-running transactions holding connections".to_string());
        }

        if metrics.connection_errors > 0 {
            score -= 25;
            issues.push(format!("{} connection errors", metrics.connection_errors));
            recommendations.push("Check database availability and network stability".to_string());
        }

        if metrics.connection_timeouts > 0 {
            score -= 10;
            issues.push(format!("{} connection timeouts", metrics.connection_timeouts));
            recommendations.push("Raise the acquire timeout or reduce pool contention".to_string());
        }

        let score = score.max(0) as u32;
        let status = if score >= 80 {
            PoolHealthStatus::Healthy
        } else if score >= 60 {
            PoolHealthStatus::Warning
        } else {
            PoolHealthStatus::Critical
        };

        ConnectionPoolHealth {
            score,
            status,
            issues,
            recommendations,
            utilization: metrics.utilization,
            checked_at,
        }
    }

    /// Samples from the trailing `minutes`, oldest first. A window beyond what
    /// chrono can represent covers the whole retained history.
    pub async fn get_utilization_trend(&self, minutes: u64) -> UtilizationTrend {
        let cutoff = i64::try_from(minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let state = self.state.read().await;

        let mut trend = UtilizationTrend::default();
        let in_window = |s: &&ConnectionPoolMetrics| cutoff.map_or(true, |c| s.timestamp >= c);
        for sample in state.history.iter().filter(in_window) {
            trend.timestamps.push(sample.timestamp);
            trend.utilization.push(sample.utilization);
            trend.active_connections.push(sample.active_connections);
        }
        trend
    }
}
