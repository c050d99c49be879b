use crate::adapter::DatabaseAdapter;
use crate::alerting::AlertService;
use crate::config::DebuggerConfig;
use crate::error::Result;
use crate::monitoring::{
    ConnectionPoolMonitor, EventBus, EventPayload, MetricsRecorder, QueryAnalysis, QueryMetrics,
    QueryMonitor, ResourceMonitor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Which components are currently running.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebuggerStatus {
    pub query_monitor: bool,
    pub connection_pool_monitor: bool,
    pub resource_monitor: bool,
    pub alert_service: bool,
    pub metrics_recorder: bool,
}

impl DebuggerStatus {
    pub fn any_running(&self) -> bool {
        self.query_monitor
            || self.connection_pool_monitor
            || self.resource_monitor
            || self.alert_service
            || self.metrics_recorder
    }
}

/// Composition root: owns the event bus and wires one adapter into every
/// monitor and the alert service.
#[derive(Debug)]
pub struct DbDebugger {
    config: DebuggerConfig,
    adapter: Arc<dyn DatabaseAdapter>,
    bus: EventBus,
    query_monitor: QueryMonitor,
    pool_monitor: ConnectionPoolMonitor,
    resource_monitor: ResourceMonitor,
    alert_service: AlertService,
    metrics: MetricsRecorder,
    // Serialises start/stop so concurrent callers see a consistent component set.
    lifecycle: Mutex<()>,
}

impl DbDebugger {
    pub async fn new(adapter: Arc<dyn DatabaseAdapter>, config: DebuggerConfig) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.event_buffer_size);
        let timeout = config.adapter_timeout();

        let query_monitor = QueryMonitor::new(&config.query_monitor, config.heuristics.clone(), bus.clone())?
            .with_adapter_timeout(timeout);
        let pool_monitor =
            ConnectionPoolMonitor::new(&config.connection_pool, bus.clone()).with_adapter_timeout(timeout);
        let resource_monitor =
            ResourceMonitor::new(&config.resource_monitor, bus.clone()).with_adapter_timeout(timeout);

        let alert_service = AlertService::new(&config.alerting, bus.clone())?;
        alert_service.initialize_alert_rules(&config).await?;

        let metrics = MetricsRecorder::new()?;

        info!(engine = adapter.engine(), "Database debugger initialized");

        Ok(Self {
            config,
            adapter,
            bus,
            query_monitor,
            pool_monitor,
            resource_monitor,
            alert_service,
            metrics,
            lifecycle: Mutex::new(()),
        })
    }

    /// Start every enabled component that is not already running and return
    /// the names of those that started. Subscribers start before the
    /// monitors so the first tick is not missed.
    pub async fn start(&self) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;
        let mut started = Vec::new();

        if self.alert_service.start().await {
            started.push("alert_service".to_string());
        }
        if self.metrics.start(&self.bus).await {
            started.push("metrics_recorder".to_string());
        }

        if self.config.query_monitor.enabled
            && self
                .query_monitor
                .start_monitoring(self.adapter.clone(), &self.config.query_monitor)
                .await
        {
            started.push("query_monitor".to_string());
        }
        if self.config.connection_pool.enabled
            && self
                .pool_monitor
                .start_monitoring(self.adapter.clone(), &self.config.connection_pool)
                .await
        {
            started.push("connection_pool_monitor".to_string());
        }
        if self.config.resource_monitor.enabled
            && self
                .resource_monitor
                .start_monitoring(self.adapter.clone(), &self.config.resource_monitor)
                .await
        {
            started.push("resource_monitor".to_string());
        }

        if started.is_empty() {
            warn!("Start requested but no component was started");
        } else {
            info!(components = ?started, "Monitoring started");
            self.bus.publish(EventPayload::MonitoringStarted {
                components: started.clone(),
            });
        }
        started
    }

    /// Stop all running components. Monitors stop first; the stop event is
    /// published before the listeners shut down.
    pub async fn stop(&self) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;
        let mut stopped = Vec::new();

        if self.query_monitor.stop_monitoring().await {
            stopped.push("query_monitor".to_string());
        }
        if self.pool_monitor.stop_monitoring().await {
            stopped.push("connection_pool_monitor".to_string());
        }
        if self.resource_monitor.stop_monitoring().await {
            stopped.push("resource_monitor".to_string());
        }

        let alert_running = self.alert_service.is_active().await;
        let metrics_running = self.metrics.is_active().await;
        if alert_running {
            stopped.push("alert_service".to_string());
        }
        if metrics_running {
            stopped.push("metrics_recorder".to_string());
        }

        if !stopped.is_empty() {
            self.bus.publish(EventPayload::MonitoringStopped {
                components: stopped.clone(),
            });
            info!(components = ?stopped, "Monitoring stopped");
        }

        self.alert_service.stop().await;
        self.metrics.stop().await;
        stopped
    }

    pub async fn status(&self) -> DebuggerStatus {
        DebuggerStatus {
            query_monitor: self.query_monitor.is_active().await,
            connection_pool_monitor: self.pool_monitor.is_active().await,
            resource_monitor: self.resource_monitor.is_active().await,
            alert_service: self.alert_service.is_active().await,
            metrics_recorder: self.metrics.is_active().await,
        }
    }

    pub async fn execute_and_monitor_query(&self, query: &str, params: &[Value]) -> Result<QueryMetrics> {
        self.query_monitor
            .execute_and_monitor_query(self.adapter.as_ref(), query, params)
            .await
    }

    pub async fn kill_query(&self, query_id: &str) -> Result<bool> {
        self.query_monitor.kill_query(self.adapter.as_ref(), query_id).await
    }

    pub async fn analyze_query(&self, query: &str, params: &[Value]) -> Result<QueryAnalysis> {
        self.query_monitor
            .analyze_query(self.adapter.as_ref(), query, params)
            .await
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn query_monitor(&self) -> &QueryMonitor {
        &self.query_monitor
    }

    pub fn pool_monitor(&self) -> &ConnectionPoolMonitor {
        &self.pool_monitor
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.resource_monitor
    }

    pub fn alert_service(&self) -> &AlertService {
        &self.alert_service
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }
}
