use super::{DatabaseAdapter, DatabaseMemoryMetrics, DeadlockInfo, QueryPlan};
use crate::error::{DebuggerError, Result};
use crate::monitoring::{ConnectionPoolMetrics, QueryMetrics, QueryStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// In-memory adapter driven by scripted snapshots. Used by the test suite and
/// the `demo` command.
#[derive(Debug)]
pub struct MockDatabaseAdapter {
    state: Mutex<MockState>,
    active_query_calls: AtomicU64,
    pool_metrics_calls: AtomicU64,
}

#[derive(Debug)]
struct MockState {
    snapshots: VecDeque<Vec<QueryMetrics>>,
    current_snapshot: Vec<QueryMetrics>,
    pool_samples: VecDeque<ConnectionPoolMetrics>,
    current_pool: ConnectionPoolMetrics,
    memory: DatabaseMemoryMetrics,
    deadlocks: Vec<DeadlockInfo>,
    kill_result: bool,
    killed: Vec<String>,
    execute_latency_ms: u64,
    plan: Option<QueryPlan>,
    fail_polls: bool,
    fail_execute: Option<String>,
    next_execution_id: u64,
}

impl Default for MockDatabaseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabaseAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                snapshots: VecDeque::new(),
                current_snapshot: Vec::new(),
                pool_samples: VecDeque::new(),
                current_pool: ConnectionPoolMetrics::from_counts(10, 2, 8, 0, 20),
                memory: DatabaseMemoryMetrics {
                    total_bytes: 128 * 1024 * 1024,
                    used_bytes: Some(64 * 1024 * 1024),
                    usage_percent: Some(50.0),
                    buffer_hit_ratio: 99.0,
                    temp_bytes: 0,
                    timestamp: Utc::now(),
                },
                deadlocks: Vec::new(),
                kill_result: true,
                killed: Vec::new(),
                execute_latency_ms: 5,
                plan: None,
                fail_polls: false,
                fail_execute: None,
                next_execution_id: 1,
            }),
            active_query_calls: AtomicU64::new(0),
            pool_metrics_calls: AtomicU64::new(0),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Queue a snapshot for the next `get_active_queries` call. Once the queue is
    /// drained the last snapshot keeps being returned.
    pub fn push_snapshot(&self, queries: Vec<QueryMetrics>) {
        self.with_state(|s| s.snapshots.push_back(queries));
    }

    pub fn set_active_queries(&self, queries: Vec<QueryMetrics>) {
        self.with_state(|s| {
            s.snapshots.clear();
            s.current_snapshot = queries;
        });
    }

    pub fn push_pool_metrics(&self, metrics: ConnectionPoolMetrics) {
        self.with_state(|s| s.pool_samples.push_back(metrics));
    }

    pub fn set_pool_metrics(&self, metrics: ConnectionPoolMetrics) {
        self.with_state(|s| {
            s.pool_samples.clear();
            s.current_pool = metrics;
        });
    }

    pub fn set_memory_metrics(&self, metrics: DatabaseMemoryMetrics) {
        self.with_state(|s| s.memory = metrics);
    }

    pub fn set_deadlocks(&self, deadlocks: Vec<DeadlockInfo>) {
        self.with_state(|s| s.deadlocks = deadlocks);
    }

    pub fn set_kill_result(&self, result: bool) {
        self.with_state(|s| s.kill_result = result);
    }

    pub fn set_query_plan(&self, plan: QueryPlan) {
        self.with_state(|s| s.plan = Some(plan));
    }

    pub fn set_execute_latency_ms(&self, latency_ms: u64) {
        self.with_state(|s| s.execute_latency_ms = latency_ms);
    }

    /// Make every poll call fail with an adapter error.
    pub fn set_fail_polls(&self, fail: bool) {
        self.with_state(|s| s.fail_polls = fail);
    }

    pub fn set_execute_failure(&self, message: Option<&str>) {
        self.with_state(|s| s.fail_execute = message.map(str::to_string));
    }

    pub fn killed_queries(&self) -> Vec<String> {
        self.with_state(|s| s.killed.clone())
    }

    pub fn active_query_calls(&self) -> u64 {
        self.active_query_calls.load(Ordering::SeqCst)
    }

    pub fn pool_metrics_calls(&self) -> u64 {
        self.pool_metrics_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseAdapter for MockDatabaseAdapter {
    fn engine(&self) -> &str {
        "mock"
    }

    async fn get_active_queries(&self) -> Result<Vec<QueryMetrics>> {
        self.active_query_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if s.fail_polls {
                return Err(DebuggerError::adapter(
                    "get_active_queries",
                    "mock adapter unavailable",
                ));
            }
            if let Some(next) = s.snapshots.pop_front() {
                s.current_snapshot = next;
            }
            Ok(s.current_snapshot.clone())
        })
    }

    async fn get_connection_pool_metrics(&self) -> Result<ConnectionPoolMetrics> {
        self.pool_metrics_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if s.fail_polls {
                return Err(DebuggerError::adapter(
                    "get_connection_pool_metrics",
                    "mock adapter unavailable",
                ));
            }
            if let Some(next) = s.pool_samples.pop_front() {
                s.current_pool = next;
            }
            let mut sample = s.current_pool.clone();
            sample.timestamp = Utc::now();
            Ok(sample)
        })
    }

    async fn execute_query(&self, query: &str, _params: &[Value]) -> Result<QueryMetrics> {
        let (latency_ms, failure, id) = self.with_state(|s| {
            let id = s.next_execution_id;
            s.next_execution_id += 1;
            (s.execute_latency_ms, s.fail_execute.clone(), id)
        });

        if latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
        }

        if let Some(message) = failure {
            return Err(DebuggerError::adapter("execute_query", message));
        }

        let mut metrics = QueryMetrics::new(format!("exec-{id}"), query);
        metrics.execution_time_ms = latency_ms;
        metrics.status = QueryStatus::Success;
        metrics.end_time = Some(Utc::now());
        metrics.rows_returned = Some(1);
        metrics.database = Some("mock".to_string());
        Ok(metrics)
    }

    async fn get_query_plan(&self, _query: &str, _params: &[Value]) -> Result<QueryPlan> {
        Ok(self.with_state(|s| {
            s.plan.clone().unwrap_or_else(|| {
                QueryPlan::from_explain_json(json!([{
                    "Plan": { "Node Type": "Result", "Total Cost": 0.01 }
                }]))
            })
        }))
    }

    async fn kill_query(&self, query_id: &str) -> Result<bool> {
        Ok(self.with_state(|s| {
            if s.kill_result {
                s.killed.push(query_id.to_string());
                s.current_snapshot.retain(|q| q.id != query_id);
            }
            s.kill_result
        }))
    }

    async fn get_memory_metrics(&self) -> Result<DatabaseMemoryMetrics> {
        self.with_state(|s| {
            if s.fail_polls {
                return Err(DebuggerError::adapter(
                    "get_memory_metrics",
                    "mock adapter unavailable",
                ));
            }
            let mut metrics = s.memory.clone();
            metrics.timestamp = Utc::now();
            Ok(metrics)
        })
    }

    async fn detect_deadlocks(&self) -> Result<Vec<DeadlockInfo>> {
        Ok(self.with_state(|s| std::mem::take(&mut s.deadlocks)))
    }
}
