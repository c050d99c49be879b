pub mod adapter;
pub mod alerting;
pub mod config;
pub mod debugger;
pub mod error;
pub mod monitoring;

pub use config::DebuggerConfig;
pub use debugger::{DbDebugger, DebuggerStatus};
pub use error::{DebuggerError, Result};

// Re-export adapter types
pub use adapter::{DatabaseAdapter, MockDatabaseAdapter, PostgresAdapter};

// Re-export alerting types
pub use alerting::{
    AlertAction, AlertRule, AlertService, AlertSeverity, AlertStatistics, DatabaseAlert,
    RuleCondition, RuleType,
};

// Re-export monitoring types
pub use monitoring::{
    BoundedHistory, ConnectionPoolMetrics, ConnectionPoolMonitor, EventBus, EventPayload,
    MetricsRecorder, MonitoringEvent, PerformanceBottleneck, QueryMetrics, QueryMonitor,
    ResourceMonitor,
};
