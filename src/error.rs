use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Adapter error during {operation}: {message}")]
    Adapter { operation: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Operation timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Alert action '{action}' failed: {reason}")]
    ActionExecution { action: String, reason: String },

    #[error("Rule '{rule_id}' could not be evaluated: {reason}")]
    RuleEvaluation { rule_id: String, reason: String },

    #[error("Not found: {id}")]
    NotFound { id: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl DebuggerError {
    pub fn adapter(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Adapter {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Errors that are handled where they occur (tick skipped, action skipped,
    /// rule treated as non-matching) rather than aborting startup.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DebuggerError::Configuration(_) | DebuggerError::ConfigParse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DebuggerError>;
