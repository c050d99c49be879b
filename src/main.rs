use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db_debugger::adapter::{DatabaseAdapter, MockDatabaseAdapter, PostgresAdapter};
use db_debugger::{ConnectionPoolMetrics, DbDebugger, DebuggerConfig, QueryMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "db-debugger")]
#[command(about = "Database telemetry and alerting - slow queries, pool saturation, rule-based alerts")]
#[command(version)]
struct Cli {
    /// TOML configuration file (otherwise DB_DEBUGGER_* environment variables)
    #[arg(long, global = true, env = "DB_DEBUGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a PostgreSQL database until interrupted
    Run {
        /// Print every event as JSON on stdout
        #[arg(long)]
        print_events: bool,
    },
    /// Load and validate the configuration, then print the active rule set
    CheckConfig,
    /// Take one connection pool sample and print its health report
    Health,
    /// Run the monitors against a scripted in-memory database
    Demo {
        /// How long to run before printing the summary
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<DebuggerConfig> {
    match path {
        Some(path) => DebuggerConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => DebuggerConfig::from_env().context("Failed to load configuration from environment"),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_postgres(config: &DebuggerConfig) -> Result<Arc<dyn DatabaseAdapter>> {
    let adapter = PostgresAdapter::connect(
        &config.database_url,
        config.max_db_connections,
        config.adapter_timeout(),
    )
    .await
    .context("Failed to connect to PostgreSQL")?;
    Ok(Arc::new(adapter))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.log_level, cli.json_logs);

    match cli.command {
        Commands::Run { print_events } => run(config, print_events).await,
        Commands::CheckConfig => check_config(config).await,
        Commands::Health => health(config).await,
        Commands::Demo { seconds } => demo(config, seconds).await,
    }
}

async fn run(config: DebuggerConfig, print_events: bool) -> Result<()> {
    let adapter = connect_postgres(&config).await?;
    let debugger = DbDebugger::new(adapter, config).await?;

    let mut events = debugger.bus().subscribe();
    debugger.start().await;

    let printer = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if print_events {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => warn!(error = %e, "Failed to serialise event"),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        _ = wait_for_shutdown() => {},
        _ = printer => {},
    }

    debugger.stop().await;
    info!("Database debugger stopped");
    Ok(())
}

async fn check_config(config: DebuggerConfig) -> Result<()> {
    let debugger = DbDebugger::new(Arc::new(MockDatabaseAdapter::new()), config).await?;
    let rules = debugger.alert_service().get_alert_rules().await;

    println!("Configuration is valid");
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}

async fn health(config: DebuggerConfig) -> Result<()> {
    let adapter = connect_postgres(&config).await?;
    let debugger = DbDebugger::new(adapter.clone(), config).await?;

    debugger
        .pool_monitor()
        .poll_once(adapter.as_ref())
        .await
        .context("Failed to sample connection pool")?;

    let report = debugger.pool_monitor().get_connection_pool_health().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn demo(mut config: DebuggerConfig, seconds: u64) -> Result<()> {
    config.query_monitor.poll_interval_ms = 250;
    config.connection_pool.poll_interval_ms = 500;
    config.resource_monitor.poll_interval_ms = 1000;

    let adapter = Arc::new(MockDatabaseAdapter::new());
    let threshold = config.query_monitor.slow_query.threshold_ms;

    adapter.push_snapshot(vec![
        QueryMetrics::new("demo-1", "SELECT * FROM orders ORDER BY created_at")
            .with_execution_time(threshold * 3),
        QueryMetrics::new("demo-2", "SELECT id FROM customers WHERE email = $1")
            .with_execution_time(40),
    ]);
    adapter.push_snapshot(vec![QueryMetrics::new(
        "demo-3",
        "UPDATE inventory SET stock = stock - 1 WHERE sku LIKE '%-XL'",
    )
    .with_execution_time(threshold * 2)]);
    adapter.push_snapshot(Vec::new());
    adapter.set_pool_metrics(ConnectionPoolMetrics::from_counts(100, 96, 4, 3, 100));

    let debugger = DbDebugger::new(adapter, config).await?;
    debugger.start().await;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {},
        _ = wait_for_shutdown() => {},
    }
    debugger.stop().await;

    let summary = serde_json::json!({
        "query_statistics": debugger.query_monitor().get_query_statistics().await,
        "slow_queries": debugger.query_monitor().get_slow_queries(Some(5)).await,
        "pool_statistics": debugger.pool_monitor().get_connection_pool_statistics().await,
        "pool_health": debugger.pool_monitor().get_connection_pool_health().await,
        "active_alerts": debugger.alert_service().get_active_alerts().await,
        "alert_statistics": debugger.alert_service().get_alert_statistics().await,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", debugger.metrics().render()?);
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
