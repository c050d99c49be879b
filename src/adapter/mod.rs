pub mod mock;
pub mod postgres;

pub use mock::MockDatabaseAdapter;
pub use postgres::PostgresAdapter;

use crate::error::{DebuggerError, Result};
use crate::monitoring::{ConnectionPoolMetrics, QueryMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Engine-specific access to a live database. The monitors only ever see
/// "what is active right now"; start/completion is inferred by diffing polls.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync + std::fmt::Debug {
    /// Short engine label used in logs, e.g. `postgres`.
    fn engine(&self) -> &str;

    async fn get_active_queries(&self) -> Result<Vec<QueryMetrics>>;
    async fn get_connection_pool_metrics(&self) -> Result<ConnectionPoolMetrics>;
    async fn execute_query(&self, query: &str, params: &[Value]) -> Result<QueryMetrics>;
    async fn get_query_plan(&self, query: &str, params: &[Value]) -> Result<QueryPlan>;
    async fn kill_query(&self, query_id: &str) -> Result<bool>;
    async fn get_memory_metrics(&self) -> Result<DatabaseMemoryMetrics>;

    /// No adapter implements deadlock detection yet.
    async fn detect_deadlocks(&self) -> Result<Vec<DeadlockInfo>> {
        Ok(Vec::new())
    }
}

/// Run an adapter future under a bounded timeout.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DebuggerError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Execution plan as returned by the engine (Postgres `EXPLAIN (FORMAT JSON)` shape),
/// with the node types flattened out for the heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPlan {
    pub plan: Value,
    pub node_types: Vec<String>,
    pub total_cost: Option<f64>,
}

impl QueryPlan {
    pub fn from_explain_json(plan: Value) -> Self {
        let mut node_types = Vec::new();
        collect_node_types(&plan, &mut node_types);

        let root = match &plan {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        let total_cost = root
            .and_then(|r| r.get("Plan"))
            .and_then(|p| p.get("Total Cost"))
            .and_then(Value::as_f64);

        Self {
            plan,
            node_types,
            total_cost,
        }
    }

    pub fn has_sequential_scan(&self) -> bool {
        self.node_types
            .iter()
            .any(|node| node.eq_ignore_ascii_case("seq scan"))
    }
}

fn collect_node_types(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(node_type)) = map.get("Node Type") {
                out.push(node_type.clone());
            }
            for child in map.values() {
                collect_node_types(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_node_types(item, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseMemoryMetrics {
    pub total_bytes: u64,
    pub used_bytes: Option<u64>,
    pub usage_percent: Option<f64>,
    /// Percentage of block reads served from the buffer cache.
    pub buffer_hit_ratio: f64,
    pub temp_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadlockInfo {
    pub id: String,
    pub process_ids: Vec<i64>,
    pub blocked_query: Option<String>,
    pub blocking_query: Option<String>,
    pub detected_at: DateTime<Utc>,
}
