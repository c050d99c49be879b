use super::{ConnectionPoolMetrics, PerformanceBottleneck, QueryMetrics};
use crate::adapter::{DatabaseMemoryMetrics, DeadlockInfo};
use crate::alerting::DatabaseAlert;
use crate::monitoring::analysis::OptimizationSuggestion;
use crate::monitoring::pool_monitor::PoolAlert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Envelope published on the bus; serialises as `{type, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "query.started")]
    QueryStarted(QueryMetrics),
    #[serde(rename = "query.completed")]
    QueryCompleted(QueryMetrics),
    #[serde(rename = "query.slow")]
    QuerySlow(QueryMetrics),
    #[serde(rename = "query.optimization_suggestions")]
    QueryOptimizationSuggestions {
        query_id: String,
        suggestions: Vec<OptimizationSuggestion>,
    },
    #[serde(rename = "query.error")]
    QueryError {
        query_id: String,
        query: String,
        error: String,
    },
    #[serde(rename = "query.killed")]
    QueryKilled { query_id: String },
    #[serde(rename = "connection_pool.metrics_update")]
    ConnectionPoolMetricsUpdate(ConnectionPoolMetrics),
    #[serde(rename = "connection_pool.bottlenecks")]
    ConnectionPoolBottlenecks(Vec<PerformanceBottleneck>),
    #[serde(rename = "connection_pool.alert")]
    ConnectionPoolAlert(PoolAlert),
    #[serde(rename = "memory.metrics_update")]
    MemoryMetricsUpdate(DatabaseMemoryMetrics),
    #[serde(rename = "deadlock.detected")]
    DeadlockDetected(Vec<DeadlockInfo>),
    #[serde(rename = "alert")]
    Alert(DatabaseAlert),
    #[serde(rename = "alert.resolved")]
    AlertResolved(DatabaseAlert),
    #[serde(rename = "monitoring_started")]
    MonitoringStarted { components: Vec<String> },
    #[serde(rename = "monitoring_stopped")]
    MonitoringStopped { components: Vec<String> },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::QueryStarted(_) => "query.started",
            EventPayload::QueryCompleted(_) => "query.completed",
            EventPayload::QuerySlow(_) => "query.slow",
            EventPayload::QueryOptimizationSuggestions { .. } => "query.optimization_suggestions",
            EventPayload::QueryError { .. } => "query.error",
            EventPayload::QueryKilled { .. } => "query.killed",
            EventPayload::ConnectionPoolMetricsUpdate(_) => "connection_pool.metrics_update",
            EventPayload::ConnectionPoolBottlenecks(_) => "connection_pool.bottlenecks",
            EventPayload::ConnectionPoolAlert(_) => "connection_pool.alert",
            EventPayload::MemoryMetricsUpdate(_) => "memory.metrics_update",
            EventPayload::DeadlockDetected(_) => "deadlock.detected",
            EventPayload::Alert(_) => "alert",
            EventPayload::AlertResolved(_) => "alert.resolved",
            EventPayload::MonitoringStarted { .. } => "monitoring_started",
            EventPayload::MonitoringStopped { .. } => "monitoring_stopped",
        }
    }
}

impl MonitoringEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// In-process publish/subscribe channel. Publishing never waits on subscribers:
/// a subscriber that falls more than `capacity` events behind loses the oldest
/// ones and receives `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitoringEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, payload: EventPayload) {
        let event = MonitoringEvent::new(payload);
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = kind, receivers, "Published event"),
            Err(_) => debug!(event = kind, "Published event with no subscribers"),
        }
    }

    pub fn publish_all(&self, payloads: impl IntoIterator<Item = EventPayload>) {
        for payload in payloads {
            self.publish(payload);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
