use super::{DatabaseAdapter, DatabaseMemoryMetrics, QueryPlan};
use crate::error::{DebuggerError, Result};
use crate::monitoring::{ConnectionPoolMetrics, QueryMetrics, QueryStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, Postgres};
use sqlx::query::Query;
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const ACTIVE_QUERIES_SQL: &str = r#"
    SELECT pid,
           query,
           datname,
           query_start,
           (EXTRACT(EPOCH FROM (clock_timestamp() - query_start)) * 1000)::float8 AS elapsed_ms
    FROM pg_stat_activity
    WHERE state = 'active'
      AND pid <> pg_backend_pid()
      AND query_start IS NOT NULL
      AND backend_type = 'client backend'
"#;

const LOCK_WAITERS_SQL: &str = r#"
    SELECT COUNT(*)::int8 AS waiting
    FROM pg_stat_activity
    WHERE wait_event_type = 'Lock'
      AND datname = current_database()
"#;

const MEMORY_SQL: &str = r#"
    SELECT pg_size_bytes(current_setting('shared_buffers'))::int8 AS shared_buffers_bytes,
           COALESCE(SUM(blks_hit), 0)::float8 AS blks_hit,
           COALESCE(SUM(blks_read), 0)::float8 AS blks_read,
           COALESCE(SUM(temp_bytes), 0)::int8 AS temp_bytes
    FROM pg_stat_database
"#;

const CANCEL_STATEMENT_SQL: &str = r#"
    SELECT COALESCE(bool_or(pg_cancel_backend(pid)), false)
    FROM pg_stat_activity
    WHERE pid = $1 AND query_start = $2
"#;

/// PostgreSQL adapter backed by a sqlx pool. Active queries come from
/// `pg_stat_activity`; ids are `<pid>:<query_start micros>` so successive
/// statements on one backend are tracked separately.
#[derive(Debug)]
pub struct PostgresAdapter {
    pool: PgPool,
    connection_errors: AtomicU64,
    connection_timeouts: AtomicU64,
}

impl PostgresAdapter {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            connection_errors: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
        }
    }

    /// Count connection-level failures so the next pool sample reports them.
    fn track<T>(&self, operation: &str, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            match &e {
                sqlx::Error::PoolTimedOut => {
                    self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                    self.connection_errors.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            DebuggerError::adapter(operation, e)
        })
    }

    /// Split `<pid>:<query_start micros>` into the backend pid and the statement
    /// start it was observed with. A bare pid carries no start.
    fn parse_query_id(query_id: &str) -> Result<(i32, Option<DateTime<Utc>>)> {
        let invalid =
            || DebuggerError::adapter("kill_query", format!("invalid query id '{query_id}'"));
        let (pid, started) = match query_id.split_once(':') {
            Some((pid, micros)) => {
                let started = micros
                    .parse::<i64>()
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_micros)
                    .ok_or_else(invalid)?;
                (pid, Some(started))
            }
            None => (query_id, None),
        };
        let pid = pid.parse::<i32>().map_err(|_| invalid())?;
        Ok((pid, started))
    }
}

fn bind_params<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.clone()),
        };
    }
    query
}

fn returns_rows(sql: &str) -> bool {
    let first_word = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first_word.as_str(),
        "SELECT" | "WITH" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> &str {
        "postgres"
    }

    async fn get_active_queries(&self) -> Result<Vec<QueryMetrics>> {
        let rows = self.track(
            "get_active_queries",
            sqlx::query(ACTIVE_QUERIES_SQL).fetch_all(&self.pool).await,
        )?;

        let mut queries = Vec::with_capacity(rows.len());
        for row in rows {
            let pid: i32 = self.track("get_active_queries", row.try_get("pid"))?;
            let text: Option<String> = self.track("get_active_queries", row.try_get("query"))?;
            let database: Option<String> =
                self.track("get_active_queries", row.try_get("datname"))?;
            let started: DateTime<Utc> =
                self.track("get_active_queries", row.try_get("query_start"))?;
            let elapsed_ms: f64 = self.track("get_active_queries", row.try_get("elapsed_ms"))?;

            let mut metrics = QueryMetrics::new(
                format!("{pid}:{}", started.timestamp_micros()),
                text.unwrap_or_default(),
            );
            metrics.start_time = started;
            metrics.execution_time_ms = elapsed_ms.max(0.0) as u64;
            metrics.database = database;
            metrics.connection_id = Some(pid.to_string());
            queries.push(metrics);
        }

        debug!(count = queries.len(), "Fetched active queries");
        Ok(queries)
    }

    async fn get_connection_pool_metrics(&self) -> Result<ConnectionPoolMetrics> {
        let waiting: i64 = self.track(
            "get_connection_pool_metrics",
            sqlx::query_scalar::<_, i64>(LOCK_WAITERS_SQL)
                .fetch_one(&self.pool)
                .await,
        )?;

        let total = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let max = self.pool.options().get_max_connections();

        Ok(ConnectionPoolMetrics::from_counts(
            total,
            total.saturating_sub(idle),
            idle,
            waiting.max(0) as u32,
            max,
        )
        .with_failures(
            self.connection_errors.swap(0, Ordering::Relaxed),
            self.connection_timeouts.swap(0, Ordering::Relaxed),
        ))
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<QueryMetrics> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut metrics = QueryMetrics::new(uuid::Uuid::new_v4().to_string(), sql);
        metrics.start_time = started_at;

        if returns_rows(sql) {
            let rows = self.track(
                "execute_query",
                bind_params(sql, params).fetch_all(&self.pool).await,
            )?;
            metrics.rows_returned = Some(rows.len() as u64);
        } else {
            let done = self.track(
                "execute_query",
                bind_params(sql, params).execute(&self.pool).await,
            )?;
            metrics.rows_affected = Some(done.rows_affected());
        }

        metrics.execution_time_ms = start.elapsed().as_millis() as u64;
        metrics.end_time = Some(Utc::now());
        metrics.status = QueryStatus::Success;
        Ok(metrics)
    }

    async fn get_query_plan(&self, sql: &str, params: &[Value]) -> Result<QueryPlan> {
        let explain = format!("EXPLAIN (FORMAT JSON) {sql}");
        let row = self.track(
            "get_query_plan",
            bind_params(&explain, params).fetch_one(&self.pool).await,
        )?;
        let plan: Value = self.track("get_query_plan", row.try_get(0))?;
        Ok(QueryPlan::from_explain_json(plan))
    }

    async fn kill_query(&self, query_id: &str) -> Result<bool> {
        let (pid, started) = Self::parse_query_id(query_id)?;
        // Only cancel while the backend is still running the statement that was
        // polled; a newer statement on the same pid has a different start.
        let cancelled = match started {
            Some(started) => sqlx::query_scalar::<_, bool>(CANCEL_STATEMENT_SQL)
                .bind(pid)
                .bind(started)
                .fetch_one(&self.pool)
                .await,
            None => sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .fetch_one(&self.pool)
                .await,
        };
        self.track("kill_query", cancelled)
    }

    async fn get_memory_metrics(&self) -> Result<DatabaseMemoryMetrics> {
        let row = self.track(
            "get_memory_metrics",
            sqlx::query(MEMORY_SQL).fetch_one(&self.pool).await,
        )?;

        let shared_buffers: i64 =
            self.track("get_memory_metrics", row.try_get("shared_buffers_bytes"))?;
        let hits: f64 = self.track("get_memory_metrics", row.try_get("blks_hit"))?;
        let reads: f64 = self.track("get_memory_metrics", row.try_get("blks_read"))?;
        let temp_bytes: i64 = self.track("get_memory_metrics", row.try_get("temp_bytes"))?;

        let buffer_hit_ratio = if hits + reads > 0.0 {
            hits / (hits + reads) * 100.0
        } else {
            100.0
        };

        Ok(DatabaseMemoryMetrics {
            total_bytes: shared_buffers.max(0) as u64,
            used_bytes: None,
            usage_percent: None,
            buffer_hit_ratio,
            temp_bytes: temp_bytes.max(0) as u64,
            timestamp: Utc::now(),
        })
    }
}
