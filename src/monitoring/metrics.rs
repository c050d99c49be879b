use super::lifecycle::BackgroundTask;
use super::{EventBus, EventPayload, MonitoringEvent};
use crate::error::Result;
use prometheus::{
    exponential_buckets, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Prometheus view of the event stream.
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,

    pub queries_started_total: IntCounter,
    pub queries_completed_total: IntCounter,
    pub slow_queries_total: IntCounter,
    pub query_errors_total: IntCounter,
    pub queries_killed_total: IntCounter,
    pub query_duration_seconds: Histogram,
    pub active_queries: IntGauge,

    pub pool_utilization_percent: Gauge,
    pub pool_active_connections: IntGauge,
    pub pool_waiting_connections: IntGauge,
    pub pool_max_connections: IntGauge,
    pub pool_alerts_total: IntCounterVec,

    pub buffer_hit_ratio_percent: Gauge,
    pub deadlocks_total: IntCounter,

    pub alerts_total: IntCounterVec,
    pub alerts_resolved_total: IntCounter,

    running_ids: Arc<Mutex<HashSet<String>>>,
    listener: Arc<BackgroundTask>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("queries_started_total", &self.queries_started_total.get())
            .field("alerts_resolved_total", &self.alerts_resolved_total.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let metric = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let metric = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let metric = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsRecorder {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let query_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "db_debugger_query_duration_seconds",
                "Execution time of completed queries in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 18)?),
        )?;
        registry.register(Box::new(query_duration_seconds.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            queries_started_total: counter(
                &registry,
                "db_debugger_queries_started_total",
                "Queries first seen in an active snapshot",
            )?,
            queries_completed_total: counter(
                &registry,
                "db_debugger_queries_completed_total",
                "Queries recorded as completed",
            )?,
            slow_queries_total: counter(
                &registry,
                "db_debugger_slow_queries_total",
                "Queries that crossed the slow query threshold",
            )?,
            query_errors_total: counter(
                &registry,
                "db_debugger_query_errors_total",
                "Monitored query executions that failed",
            )?,
            queries_killed_total: counter(
                &registry,
                "db_debugger_queries_killed_total",
                "Queries cancelled through the monitor",
            )?,
            query_duration_seconds,
            active_queries: int_gauge(
                &registry,
                "db_debugger_active_queries",
                "Queries currently tracked as running",
            )?,
            pool_utilization_percent: gauge(
                &registry,
                "db_debugger_pool_utilization_percent",
                "Latest connection pool utilization",
            )?,
            pool_active_connections: int_gauge(
                &registry,
                "db_debugger_pool_active_connections",
                "Latest active connection count",
            )?,
            pool_waiting_connections: int_gauge(
                &registry,
                "db_debugger_pool_waiting_connections",
                "Latest count of clients waiting for a connection",
            )?,
            pool_max_connections: int_gauge(
                &registry,
                "db_debugger_pool_max_connections",
                "Configured maximum connections",
            )?,
            pool_alerts_total: counter_vec(
                &registry,
                "db_debugger_pool_alerts_total",
                "Connection pool alerts by kind",
                "kind",
            )?,
            buffer_hit_ratio_percent: gauge(
                &registry,
                "db_debugger_buffer_hit_ratio_percent",
                "Latest buffer cache hit ratio",
            )?,
            deadlocks_total: counter(
                &registry,
                "db_debugger_deadlocks_total",
                "Deadlocks reported by the adapter",
            )?,
            alerts_total: counter_vec(
                &registry,
                "db_debugger_alerts_total",
                "Rule alerts by severity",
                "severity",
            )?,
            alerts_resolved_total: counter(
                &registry,
                "db_debugger_alerts_resolved_total",
                "Alerts marked resolved",
            )?,
            registry,
            running_ids: Arc::new(Mutex::new(HashSet::new())),
            listener: Arc::new(BackgroundTask::new("metrics_recorder")),
        })
    }

    pub fn record(&self, event: &MonitoringEvent) {
        match &event.payload {
            EventPayload::QueryStarted(query) => {
                self.queries_started_total.inc();
                self.track_running(&query.id, true);
            }
            EventPayload::QueryCompleted(query) => {
                self.queries_completed_total.inc();
                self.query_duration_seconds
                    .observe(query.execution_time_ms as f64 / 1000.0);
                self.track_running(&query.id, false);
            }
            EventPayload::QuerySlow(_) => self.slow_queries_total.inc(),
            EventPayload::QueryError { .. } => self.query_errors_total.inc(),
            EventPayload::QueryKilled { query_id } => {
                self.queries_killed_total.inc();
                self.track_running(query_id, false);
            }
            EventPayload::ConnectionPoolMetricsUpdate(metrics) => {
                self.pool_utilization_percent.set(metrics.utilization);
                self.pool_active_connections
                    .set(metrics.active_connections as i64);
                self.pool_waiting_connections
                    .set(metrics.waiting_connections as i64);
                self.pool_max_connections.set(metrics.max_connections as i64);
            }
            EventPayload::ConnectionPoolAlert(alert) => {
                self.pool_alerts_total
                    .with_label_values(&[alert.kind.as_str()])
                    .inc();
            }
            EventPayload::MemoryMetricsUpdate(memory) => {
                self.buffer_hit_ratio_percent.set(memory.buffer_hit_ratio);
            }
            EventPayload::DeadlockDetected(deadlocks) => {
                self.deadlocks_total.inc_by(deadlocks.len() as u64);
            }
            EventPayload::Alert(alert) => {
                self.alerts_total
                    .with_label_values(&[alert.severity.as_str()])
                    .inc();
            }
            EventPayload::AlertResolved(_) => self.alerts_resolved_total.inc(),
            EventPayload::ConnectionPoolBottlenecks(_)
            | EventPayload::QueryOptimizationSuggestions { .. }
            | EventPayload::MonitoringStarted { .. }
            | EventPayload::MonitoringStopped { .. } => {}
        }
    }

    fn track_running(&self, query_id: &str, running: bool) {
        let mut ids = self.running_ids.lock().unwrap_or_else(|e| e.into_inner());
        if running {
            ids.insert(query_id.to_string());
        } else {
            ids.remove(query_id);
        }
        self.active_queries.set(ids.len() as i64);
    }

    /// Dropped events may include completions, so the running set can no longer
    /// be trusted. Start over; queries still running drop out of the gauge until
    /// they are observed again.
    fn forget_running(&self, skipped: u64) {
        warn!(skipped, "Metrics recorder fell behind, events dropped");
        let mut ids = self.running_ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.clear();
        self.active_queries.set(0);
    }

    pub async fn start(&self, bus: &EventBus) -> bool {
        let mut events = bus.subscribe();
        let recorder = self.clone();

        self.listener
            .spawn(move |mut shutdown| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        received = events.recv() => match received {
                            Ok(event) => recorder.record(&event),
                            Err(RecvError::Lagged(skipped)) => recorder.forget_running(skipped),
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

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        Ok(TextEncoder::new().encode_to_string(&families)?)
    }
}
