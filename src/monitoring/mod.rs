pub mod analysis;
pub mod events;
pub mod history;
pub mod lifecycle;
pub mod metrics;
pub mod pool_monitor;
pub mod query_monitor;
pub mod resource_monitor;

pub use analysis::*;
pub use events::*;
pub use history::BoundedHistory;
pub use metrics::MetricsRecorder;
pub use pool_monitor::*;
pub use query_monitor::*;
pub use resource_monitor::*;

use crate::adapter::QueryPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Running,
    Success,
    Error,
    Timeout,
}

/// A single query as observed through the adapter, either still running
/// (from a poll snapshot) or finished and recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMetrics {
    pub id: String,
    pub query: String,
    pub execution_time_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub rows_affected: Option<u64>,
    pub rows_returned: Option<u64>,
    pub status: QueryStatus,
    pub error: Option<String>,
    pub database: Option<String>,
    pub connection_id: Option<String>,
    pub plan: Option<QueryPlan>,
}

impl QueryMetrics {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            execution_time_ms: 0,
            start_time: Utc::now(),
            end_time: None,
            rows_affected: None,
            rows_returned: None,
            status: QueryStatus::Running,
            error: None,
            database: None,
            connection_id: None,
            plan: None,
        }
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn is_slow(&self, threshold_ms: u64) -> bool {
        self.execution_time_ms > threshold_ms
    }

    /// Close out a query that disappeared from the active snapshot.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(now);
        }
        if self.status == QueryStatus::Running {
            self.status = QueryStatus::Success;
        }
    }
}

/// Point-in-time connection pool snapshot. Utilization is a percentage in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPoolMetrics {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub waiting_connections: u32,
    pub max_connections: u32,
    pub utilization: f64,
    pub connection_errors: u64,
    pub connection_timeouts: u64,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionPoolMetrics {
    pub fn from_counts(
        total_connections: u32,
        active_connections: u32,
        idle_connections: u32,
        waiting_connections: u32,
        max_connections: u32,
    ) -> Self {
        let utilization = if max_connections > 0 {
            (active_connections as f64 * 100.0 / max_connections as f64).clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            total_connections,
            active_connections,
            idle_connections,
            waiting_connections,
            max_connections,
            utilization,
            connection_errors: 0,
            connection_timeouts: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_failures(mut self, connection_errors: u64, connection_timeouts: u64) -> Self {
        self.connection_errors = connection_errors;
        self.connection_timeouts = connection_timeouts;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    SlowQuery,
    IndexMissing,
    ConnectionPoolSaturation,
    ConnectionQueue,
    ConnectionErrors,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Derived diagnostic of a current resource constraint. Recomputed on demand,
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceBottleneck {
    pub kind: BottleneckKind,
    pub severity: BottleneckSeverity,
    pub description: String,
    pub recommendation: String,
    pub query_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Round a percentage or duration to one decimal for human-facing messages.
/// `96.0` renders as `96`, `96.44` as `96.4`.
pub(crate) fn display_value(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
