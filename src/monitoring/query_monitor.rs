use super::lifecycle::{run_polling_loop, BackgroundTask};
use super::{
    BoundedHistory, EventBus, EventPayload, HeuristicWeights, PerformanceBottleneck, QueryAnalysis,
    QueryAnalyzer, QueryMetrics, QueryStatus,
};
use crate::adapter::{with_timeout, DatabaseAdapter};
use crate::config::QueryMonitorConfig;
use crate::error::{DebuggerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryStatistics {
    pub total_queries: usize,
    pub average_execution_time: f64,
    pub slow_query_count: usize,
    pub error_count: usize,
    pub active_query_count: usize,
}

#[derive(Debug)]
struct QueryState {
    config: QueryMonitorConfig,
    active: HashMap<String, QueryMetrics>,
    history: BoundedHistory<QueryMetrics>,
    slow_queries: BoundedHistory<QueryMetrics>,
    /// Ids already reported slow. Kept while the query is still active even if
    /// its entry has been evicted, so it is never reported twice.
    slow_ids: HashSet<String>,
}

impl QueryState {
    fn new(config: QueryMonitorConfig) -> Self {
        Self {
            history: BoundedHistory::new(config.history_size),
            slow_queries: BoundedHistory::new(config.slow_query.max_slow_queries),
            active: HashMap::new(),
            slow_ids: HashSet::new(),
            config,
        }
    }

    fn apply_config(&mut self, config: &QueryMonitorConfig) {
        if config.history_size != self.history.capacity() {
            self.history = resized(&self.history, config.history_size);
        }
        if config.slow_query.max_slow_queries != self.slow_queries.capacity() {
            self.slow_queries = resized(&self.slow_queries, config.slow_query.max_slow_queries);
            let retained: HashSet<&str> = self.slow_queries.iter().map(|q| q.id.as_str()).collect();
            let active = &self.active;
            self.slow_ids
                .retain(|id| retained.contains(id.as_str()) || active.contains_key(id));
        }
        self.config = config.clone();
    }

    /// Record `query` as slow if it crosses the threshold and was not reported
    /// before. Returns `true` when newly recorded.
    fn record_slow(&mut self, query: &QueryMetrics) -> bool {
        if !query.is_slow(self.config.slow_query.threshold_ms) {
            return false;
        }

        if self.slow_ids.contains(&query.id) {
            if let Some(entry) = self.slow_queries.iter_mut().find(|q| q.id == query.id) {
                *entry = query.clone();
            }
            return false;
        }

        self.slow_ids.insert(query.id.clone());
        if let Some(evicted) = self.slow_queries.push(query.clone()) {
            if !self.active.contains_key(&evicted.id) {
                self.slow_ids.remove(&evicted.id);
            }
        }
        true
    }

    /// Drop the dedup key of a finished query whose slow entry is gone.
    fn release_slow_id(&mut self, id: &str) {
        if self.slow_ids.contains(id) && !self.slow_queries.iter().any(|q| q.id == id) {
            self.slow_ids.remove(id);
        }
    }
}

fn resized<T: Clone>(history: &BoundedHistory<T>, capacity: usize) -> BoundedHistory<T> {
    let mut next = BoundedHistory::new(capacity);
    for entry in history.iter() {
        next.push(entry.clone());
    }
    next
}

/// Tracks running queries by diffing successive adapter snapshots: ids that
/// appear are started, ids that vanish are completed and moved into history.
#[derive(Debug, Clone)]
pub struct QueryMonitor {
    state: Arc<RwLock<QueryState>>,
    analyzer: Arc<QueryAnalyzer>,
    bus: EventBus,
    task: Arc<BackgroundTask>,
    adapter_timeout: Duration,
}

impl QueryMonitor {
    pub fn new(config: &QueryMonitorConfig, weights: HeuristicWeights, bus: EventBus) -> Result<Self> {
        Ok(Self {
            state: Arc::new(RwLock::new(QueryState::new(config.clone()))),
            analyzer: Arc::new(QueryAnalyzer::new(weights)?),
            bus,
            task: Arc::new(BackgroundTask::new("query_monitor")),
            adapter_timeout: Duration::from_millis(5000),
        })
    }

    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    /// Begin polling `adapter`. Returns `false` (and changes nothing) if the
    /// monitor is already running.
    pub async fn start_monitoring(
        &self,
        adapter: Arc<dyn DatabaseAdapter>,
        config: &QueryMonitorConfig,
    ) -> bool {
        if self.task.is_running().await {
            warn!("Query monitoring already active");
            return false;
        }

        self.state.write().await.apply_config(config);
        let period = Duration::from_millis(config.poll_interval_ms.max(1));
        let monitor = self.clone();

        let started = self
            .task
            .spawn(move |shutdown| async move {
                run_polling_loop("query_monitor", period, shutdown, || {
                    let monitor = monitor.clone();
                    let adapter = adapter.clone();
                    async move {
                        if let Err(e) = monitor.poll_once(adapter.as_ref()).await {
                            warn!(error = %e, "Query monitor tick skipped");
                        }
                    }
                })
                .await
            })
            .await;

        if started {
            info!(
                interval_ms = period.as_millis() as u64,
                slow_threshold_ms = config.slow_query.threshold_ms,
                "Query monitoring started"
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

    /// One tick: fetch the active list, reconcile it against tracked state and
    /// publish the resulting events.
    #[instrument(skip_all, name = "query_monitor_tick")]
    pub async fn poll_once(&self, adapter: &dyn DatabaseAdapter) -> Result<()> {
        let snapshot = with_timeout(
            "get_active_queries",
            self.adapter_timeout,
            adapter.get_active_queries(),
        )
        .await?;

        let events = self.reconcile(snapshot, Utc::now()).await;
        self.bus.publish_all(events);
        Ok(())
    }

    async fn reconcile(&self, snapshot: Vec<QueryMetrics>, now: DateTime<Utc>) -> Vec<EventPayload> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let mut seen = HashSet::with_capacity(snapshot.len());

        for query in snapshot {
            seen.insert(query.id.clone());
            let is_new = state
                .active
                .insert(query.id.clone(), query.clone())
                .is_none();
            if is_new {
                debug!(query_id = %query.id, "Query started");
                events.push(EventPayload::QueryStarted(query.clone()));
            }
            if state.record_slow(&query) {
                self.slow_events(&state.config, &query, &mut events);
            }
        }

        let finished: Vec<String> = state
            .active
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();

        for id in finished {
            let Some(mut query) = state.active.remove(&id) else {
                continue;
            };
            query.finalize(now);

            if state.record_slow(&query) {
                self.slow_events(&state.config, &query, &mut events);
            }
            state.release_slow_id(&id);
            state.history.push(query.clone());

            debug!(query_id = %id, execution_time_ms = query.execution_time_ms, "Query completed");
            events.push(EventPayload::QueryCompleted(query));
        }

        events
    }

    fn slow_events(&self, config: &QueryMonitorConfig, query: &QueryMetrics, events: &mut Vec<EventPayload>) {
        if config.slow_query.log_queries {
            warn!(
                query_id = %query.id,
                execution_time_ms = query.execution_time_ms,
                threshold_ms = config.slow_query.threshold_ms,
                query = %query.query,
                "Slow query detected"
            );
        } else {
            warn!(
                query_id = %query.id,
                execution_time_ms = query.execution_time_ms,
                threshold_ms = config.slow_query.threshold_ms,
                "Slow query detected"
            );
        }

        events.push(EventPayload::QuerySlow(query.clone()));

        let suggestions = self.analyzer.suggest(&query.query, query.execution_time_ms);
        if !suggestions.is_empty() {
            events.push(EventPayload::QueryOptimizationSuggestions {
                query_id: query.id.clone(),
                suggestions,
            });
        }
    }

    /// Run a query through the adapter, timing and recording it. Failures are
    /// recorded in history and published before the error is returned.
    pub async fn execute_and_monitor_query(
        &self,
        adapter: &dyn DatabaseAdapter,
        query: &str,
        params: &[Value],
    ) -> Result<QueryMetrics> {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();

        let result = with_timeout(
            "execute_query",
            self.adapter_timeout,
            adapter.execute_query(query, params),
        )
        .await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let mut state = self.state.write().await;
        let mut events = Vec::new();

        let outcome = match result {
            Ok(mut metrics) => {
                metrics.start_time = started_at;
                metrics.execution_time_ms = elapsed_ms;
                metrics.finalize(Utc::now());

                if state.record_slow(&metrics) {
                    self.slow_events(&state.config, &metrics, &mut events);
                }
                state.release_slow_id(&metrics.id);
                state.history.push(metrics.clone());
                events.push(EventPayload::QueryCompleted(metrics.clone()));
                Ok(metrics)
            }
            Err(e) => {
                let mut failed = QueryMetrics::new(Uuid::new_v4().to_string(), query);
                failed.start_time = started_at;
                failed.execution_time_ms = elapsed_ms;
                failed.end_time = Some(Utc::now());
                failed.status = match &e {
                    DebuggerError::Timeout { .. } => QueryStatus::Timeout,
                    _ => QueryStatus::Error,
                };
                failed.error = Some(e.to_string());

                warn!(query_id = %failed.id, error = %e, "Monitored query failed");
                events.push(EventPayload::QueryError {
                    query_id: failed.id.clone(),
                    query: failed.query.clone(),
                    error: e.to_string(),
                });
                state.history.push(failed);
                Err(e)
            }
        };

        drop(state);
        self.bus.publish_all(events);
        outcome
    }

    /// Ask the adapter to cancel a query. Local tracking is only cleared when
    /// the adapter confirms.
    pub async fn kill_query(&self, adapter: &dyn DatabaseAdapter, query_id: &str) -> Result<bool> {
        let killed = with_timeout("kill_query", self.adapter_timeout, adapter.kill_query(query_id)).await?;

        if !killed {
            warn!(query_id, "Adapter did not confirm query cancellation");
            return Ok(false);
        }

        {
            let mut state = self.state.write().await;
            state.active.remove(query_id);
            state.release_slow_id(query_id);
        }

        info!(query_id, "Query killed");
        self.bus.publish(EventPayload::QueryKilled {
            query_id: query_id.to_string(),
        });
        Ok(true)
    }

    /// Heuristic analysis of `query` with its plan attached. The execution
    /// time comes from the most recent recorded run of the same text.
    pub async fn analyze_query(
        &self,
        adapter: &dyn DatabaseAdapter,
        query: &str,
        params: &[Value],
    ) -> Result<QueryAnalysis> {
        let plan = with_timeout("get_query_plan", self.adapter_timeout, adapter.get_query_plan(query, params)).await?;

        let mut metrics = {
            let state = self.state.read().await;
            state
                .active
                .values()
                .find(|q| q.query == query)
                .or_else(|| state.history.iter().rev().find(|q| q.query == query))
                .cloned()
                .unwrap_or_else(|| QueryMetrics::new("adhoc", query))
        };
        metrics.plan = Some(plan);

        Ok(self.analyzer.analyze(&metrics))
    }

    /// Bottlenecks among the currently running queries.
    pub async fn get_query_bottlenecks(&self) -> Vec<PerformanceBottleneck> {
        let state = self.state.read().await;
        state
            .active
            .values()
            .flat_map(|q| self.analyzer.bottlenecks(q))
            .collect()
    }

    /// Oldest first.
    pub async fn get_active_queries(&self) -> Vec<QueryMetrics> {
        let state = self.state.read().await;
        let mut queries: Vec<_> = state.active.values().cloned().collect();
        queries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        queries
    }

    /// Newest first.
    pub async fn get_query_history(&self, limit: Option<usize>) -> Vec<QueryMetrics> {
        self.state.read().await.history.recent(limit)
    }

    /// Slowest first.
    pub async fn get_slow_queries(&self, limit: Option<usize>) -> Vec<QueryMetrics> {
        let state = self.state.read().await;
        let mut slow = state.slow_queries.to_vec();
        slow.sort_by(|a, b| b.execution_time_ms.cmp(&a.execution_time_ms));
        if let Some(limit) = limit {
            slow.truncate(limit);
        }
        slow
    }

    pub async fn get_query_statistics(&self) -> QueryStatistics {
        let state = self.state.read().await;
        let total = state.history.len();
        let total_time: u64 = state.history.iter().map(|q| q.execution_time_ms).sum();

        QueryStatistics {
            total_queries: total,
            average_execution_time: if total > 0 {
                total_time as f64 / total as f64
            } else {
                0.0
            },
            slow_query_count: state.slow_queries.len(),
            error_count: state
                .history
                .iter()
                .filter(|q| matches!(q.status, QueryStatus::Error | QueryStatus::Timeout))
                .count(),
            active_query_count: state.active.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockDatabaseAdapter;
    use crate::config::SlowQueryConfig;
    use crate::monitoring::{MonitoringEvent, SuggestionKind};
    use tokio::sync::broadcast;

    fn config(threshold_ms: u64) -> QueryMonitorConfig {
        QueryMonitorConfig {
            slow_query: SlowQueryConfig {
                threshold_ms,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn monitor(config: &QueryMonitorConfig) -> (QueryMonitor, broadcast::Receiver<MonitoringEvent>) {
        let bus = EventBus::new(256);
        let rx = bus.subscribe();
        let monitor = QueryMonitor::new(config, HeuristicWeights::default(), bus).unwrap();
        (monitor, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<MonitoringEvent>) -> Vec<EventPayload> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.payload)
            .collect()
    }

    fn ids_of(events: &[EventPayload], kind: &str) -> Vec<String> {
        let mut ids: Vec<String> = events
            .iter()
            .filter(|e| e.kind() == kind)
            .filter_map(|e| match e {
                EventPayload::QueryStarted(q)
                | EventPayload::QueryCompleted(q)
                | EventPayload::QuerySlow(q) => Some(q.id.clone()),
                EventPayload::QueryKilled { query_id } => Some(query_id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    fn q(id: &str, ms: u64) -> QueryMetrics {
        QueryMetrics::new(id, format!("SELECT id FROM t WHERE k = '{id}' LIMIT 1")).with_execution_time(ms)
    }

    #[tokio::test]
    async fn test_snapshot_diff() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.push_snapshot(vec![q("a", 10), q("b", 10)]);
        adapter.push_snapshot(vec![q("b", 20), q("c", 10)]);

        monitor.poll_once(&adapter).await.unwrap();
        let first = drain(&mut rx);
        assert_eq!(ids_of(&first, "query.started"), vec!["a", "b"]);
        assert!(ids_of(&first, "query.completed").is_empty());

        monitor.poll_once(&adapter).await.unwrap();
        let second = drain(&mut rx);
        assert_eq!(ids_of(&second, "query.started"), vec!["c"]);
        assert_eq!(ids_of(&second, "query.completed"), vec!["a"]);

        let history: Vec<_> = monitor
            .get_query_history(None)
            .await
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(history, vec!["a"]);

        let mut active: Vec<_> = monitor
            .get_active_queries()
            .await
            .into_iter()
            .map(|q| q.id)
            .collect();
        active.sort();
        assert_eq!(active, vec!["b", "c"]);
        assert_eq!(
            monitor
                .get_active_queries()
                .await
                .iter()
                .find(|q| q.id == "b")
                .unwrap()
                .execution_time_ms,
            20
        );
    }

    #[tokio::test]
    async fn test_slow_query_reported_once() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_active_queries(vec![q("q1", 6000)]);

        monitor.poll_once(&adapter).await.unwrap();
        monitor.poll_once(&adapter).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(ids_of(&events, "query.slow"), vec!["q1"]);
        assert_eq!(monitor.get_slow_queries(None).await.len(), 1);

        // Completion does not re-report.
        adapter.set_active_queries(vec![]);
        monitor.poll_once(&adapter).await.unwrap();
        let events = drain(&mut rx);
        assert!(ids_of(&events, "query.slow").is_empty());
        assert_eq!(ids_of(&events, "query.completed"), vec!["q1"]);

        let slow = monitor.get_slow_queries(None).await;
        assert_eq!(slow[0].status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_slow_query_emits_suggestions() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_active_queries(vec![
            QueryMetrics::new("q1", "SELECT * FROM orders ORDER BY id").with_execution_time(1500),
        ]);

        monitor.poll_once(&adapter).await.unwrap();

        let suggestions = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                EventPayload::QueryOptimizationSuggestions { suggestions, .. } => Some(suggestions),
                _ => None,
            })
            .unwrap();
        let kinds: Vec<_> = suggestions.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&SuggestionKind::SelectStar));
        assert!(kinds.contains(&SuggestionKind::MissingLimit));
    }

    #[tokio::test]
    async fn test_kill_query_requires_confirmation() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_active_queries(vec![q("q1", 10)]);
        monitor.poll_once(&adapter).await.unwrap();
        drain(&mut rx);

        adapter.set_kill_result(false);
        assert!(!monitor.kill_query(&adapter, "q1").await.unwrap());
        assert_eq!(monitor.get_active_queries().await.len(), 1);
        assert!(ids_of(&drain(&mut rx), "query.killed").is_empty());

        adapter.set_kill_result(true);
        assert!(monitor.kill_query(&adapter, "q1").await.unwrap());
        assert!(monitor.get_active_queries().await.is_empty());
        assert_eq!(ids_of(&drain(&mut rx), "query.killed"), vec!["q1"]);
        assert_eq!(adapter.killed_queries(), vec!["q1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_records_and_times_queries() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_execute_latency_ms(1500);

        let metrics = monitor
            .execute_and_monitor_query(&adapter, "SELECT * FROM orders ORDER BY id", &[])
            .await
            .unwrap();

        assert!(metrics.execution_time_ms >= 1500);
        assert_eq!(metrics.status, QueryStatus::Success);

        let events = drain(&mut rx);
        assert_eq!(ids_of(&events, "query.slow"), vec![metrics.id.clone()]);
        assert_eq!(ids_of(&events, "query.completed"), vec![metrics.id.clone()]);
        assert_eq!(monitor.get_query_statistics().await.total_queries, 1);
    }

    #[tokio::test]
    async fn test_execute_failure_is_recorded_then_propagated() {
        let (monitor, mut rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_execute_failure(Some("relation \"missing\" does not exist"));

        let err = monitor
            .execute_and_monitor_query(&adapter, "SELECT 1 FROM missing", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DebuggerError::Adapter { .. }));

        let history = monitor.get_query_history(None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, QueryStatus::Error);
        assert!(history[0].error.as_deref().unwrap().contains("missing"));
        assert!(drain(&mut rx).iter().any(|e| e.kind() == "query.error"));
        assert_eq!(monitor.get_query_statistics().await.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout_marks_status() {
        let (monitor, _rx) = monitor(&config(1000));
        let monitor = monitor.with_adapter_timeout(Duration::from_millis(100));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_execute_latency_ms(10_000);

        let err = monitor
            .execute_and_monitor_query(&adapter, "SELECT pg_sleep(10)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DebuggerError::Timeout { .. }));
        assert_eq!(
            monitor.get_query_history(None).await[0].status,
            QueryStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_poll_error_leaves_state_untouched() {
        let (monitor, _rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_active_queries(vec![q("a", 10)]);
        monitor.poll_once(&adapter).await.unwrap();

        adapter.set_fail_polls(true);
        assert!(monitor.poll_once(&adapter).await.is_err());
        assert_eq!(monitor.get_active_queries().await.len(), 1);
        assert!(monitor.get_query_history(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_statistics_and_bounded_history() {
        let mut cfg = config(100);
        cfg.history_size = 3;
        let (monitor, _rx) = monitor(&cfg);
        let adapter = MockDatabaseAdapter::new();

        for (i, ms) in [10u64, 20, 30, 200, 40].iter().enumerate() {
            adapter.set_active_queries(vec![q(&format!("q{i}"), *ms)]);
            monitor.poll_once(&adapter).await.unwrap();
        }
        adapter.set_active_queries(vec![]);
        monitor.poll_once(&adapter).await.unwrap();

        let history = monitor.get_query_history(None).await;
        let ids: Vec<_> = history.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q4", "q3", "q2"]);

        let stats = monitor.get_query_statistics().await;
        assert_eq!(stats.total_queries, 3);
        approx::assert_relative_eq!(stats.average_execution_time, 90.0);
        assert_eq!(stats.slow_query_count, 1);
        assert_eq!(stats.active_query_count, 0);
        assert_eq!(monitor.get_query_history(Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_list_sorted_and_bounded() {
        let mut cfg = config(100);
        cfg.slow_query.max_slow_queries = 2;
        let (monitor, _rx) = monitor(&cfg);
        let adapter = MockDatabaseAdapter::new();

        adapter.set_active_queries(vec![q("a", 500), q("b", 900), q("c", 700)]);
        monitor.poll_once(&adapter).await.unwrap();

        let slow = monitor.get_slow_queries(None).await;
        assert_eq!(slow.len(), 2);
        assert!(slow[0].execution_time_ms >= slow[1].execution_time_ms);
        assert_eq!(monitor.get_slow_queries(Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_bottlenecks_for_long_running_queries() {
        let (monitor, _rx) = monitor(&config(1000));
        let adapter = MockDatabaseAdapter::new();
        adapter.set_active_queries(vec![q("long", 20_000), q("short", 50)]);
        monitor.poll_once(&adapter).await.unwrap();

        let bottlenecks = monitor.get_query_bottlenecks().await;
        assert_eq!(bottlenecks.len(), 1);
        assert_eq!(bottlenecks[0].query_id.as_deref(), Some("long"));
    }
}
