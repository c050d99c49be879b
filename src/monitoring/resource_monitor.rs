use super::lifecycle::{run_polling_loop, BackgroundTask};
use super::{BoundedHistory, EventBus, EventPayload};
use crate::adapter::{with_timeout, DatabaseAdapter, DatabaseMemoryMetrics};
use crate::config::ResourceMonitorConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

#[derive(Debug)]
struct ResourceState {
    memory_history: BoundedHistory<DatabaseMemoryMetrics>,
    deadlocks_detected: u64,
}

/// Samples database memory and checks for deadlocks, feeding the memory and
/// deadlock alert rules.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    state: Arc<RwLock<ResourceState>>,
    bus: EventBus,
    task: Arc<BackgroundTask>,
    adapter_timeout: Duration,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceMonitorConfig, bus: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(ResourceState {
                memory_history: BoundedHistory::new(config.history_size),
                deadlocks_detected: 0,
            })),
            bus,
            task: Arc::new(BackgroundTask::new("resource_monitor")),
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
        config: &ResourceMonitorConfig,
    ) -> bool {
        let period = Duration::from_millis(config.poll_interval_ms.max(1));
        let monitor = self.clone();

        let started = self
            .task
            .spawn(move |shutdown| async move {
                run_polling_loop("resource_monitor", period, shutdown, || {
                    let monitor = monitor.clone();
                    let adapter = adapter.clone();
                    async move {
                        if let Err(e) = monitor.poll_once(adapter.as_ref()).await {
                            warn!(error = %e, "Resource monitor tick skipped");
                        }
                    }
                })
                .await
            })
            .await;

        if started {
            info!(interval_ms = period.as_millis() as u64, "Resource monitoring started");
        }
        started
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.task.stop().await
    }

    pub async fn is_active(&self) -> bool {
        self.task.is_running().await
    }

    #[instrument(skip_all, name = "resource_monitor_tick")]
    pub async fn poll_once(&self, adapter: &dyn DatabaseAdapter) -> Result<()> {
        let memory = with_timeout(
            "get_memory_metrics",
            self.adapter_timeout,
            adapter.get_memory_metrics(),
        )
        .await?;

        // A failed deadlock check does not discard the memory sample.
        let deadlocks = match with_timeout(
            "detect_deadlocks",
            self.adapter_timeout,
            adapter.detect_deadlocks(),
        )
        .await
        {
            Ok(deadlocks) => deadlocks,
            Err(e) => {
                warn!(error = %e, "Deadlock detection failed");
                Vec::new()
            }
        };

        {
            let mut state = self.state.write().await;
            state.memory_history.push(memory.clone());
            state.deadlocks_detected += deadlocks.len() as u64;
        }

        self.bus.publish(EventPayload::MemoryMetricsUpdate(memory));
        if !deadlocks.is_empty() {
            warn!(count = deadlocks.len(), "Deadlocks detected");
            self.bus.publish(EventPayload::DeadlockDetected(deadlocks));
        }
        Ok(())
    }

    pub async fn get_current_memory_metrics(&self) -> Option<DatabaseMemoryMetrics> {
        self.state.read().await.memory_history.latest().cloned()
    }

    /// Newest first.
    pub async fn get_memory_history(&self, limit: Option<usize>) -> Vec<DatabaseMemoryMetrics> {
        self.state.read().await.memory_history.recent(limit)
    }

    pub async fn total_deadlocks_detected(&self) -> u64 {
        self.state.read().await.deadlocks_detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DeadlockInfo, MockDatabaseAdapter};
    use chrono::Utc;

    fn deadlock(id: &str) -> DeadlockInfo {
        DeadlockInfo {
            id: id.to_string(),
            process_ids: vec![101, 202],
            blocked_query: Some("UPDATE accounts SET balance = balance - 1 WHERE id = 1".to_string()),
            blocking_query: Some("UPDATE accounts SET balance = balance + 1 WHERE id = 2".to_string()),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sample_published_each_tick() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let monitor = ResourceMonitor::new(&ResourceMonitorConfig::default(), bus);
        let adapter = MockDatabaseAdapter::new();

        monitor.poll_once(&adapter).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), "memory.metrics_update");
        assert!(rx.try_recv().is_err());
        assert_eq!(
            monitor.get_current_memory_metrics().await.unwrap().buffer_hit_ratio,
            99.0
        );
    }

    #[tokio::test]
    async fn test_deadlocks_published_when_found() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let monitor = ResourceMonitor::new(&ResourceMonitorConfig::default(), bus);
        let adapter = MockDatabaseAdapter::new();
        adapter.set_deadlocks(vec![deadlock("d1"), deadlock("d2")]);

        monitor.poll_once(&adapter).await.unwrap();
        monitor.poll_once(&adapter).await.unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "memory.metrics_update",
                "deadlock.detected",
                "memory.metrics_update"
            ]
        );
        assert_eq!(monitor.total_deadlocks_detected().await, 2);
    }

    #[tokio::test]
    async fn test_memory_history_bounded() {
        let config = ResourceMonitorConfig {
            history_size: 2,
            ..Default::default()
        };
        let monitor = ResourceMonitor::new(&config, EventBus::new(16));
        let adapter = MockDatabaseAdapter::new();

        for _ in 0..4 {
            monitor.poll_once(&adapter).await.unwrap();
        }
        assert_eq!(monitor.get_memory_history(None).await.len(), 2);

        adapter.set_fail_polls(true);
        assert!(monitor.poll_once(&adapter).await.is_err());
        assert_eq!(monitor.get_memory_history(None).await.len(), 2);
    }
}
