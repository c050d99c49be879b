//! Lifecycle and snapshot-diff tests driven through the public API with the
//! mock adapter.


use anyhow::Result;
use db_debugger::config::QueryMonitorConfig;
use db_debugger::monitoring::{HeuristicWeights, SuggestionKind};
use db_debugger::{EventBus, MockDatabaseAdapter, QueryMonitor};
use std::time::Duration;
use test_helpers::{drain, query, query_events, TestEnvironment};

#[tokio::test(start_paused = true)]
async fn test_second_start_creates_no_second_loop() -> Result<()> {
    let env = TestEnvironment::new().await?;

    let first = env.debugger.start().await;
    assert_eq!(
        first,
        vec![
            "alert_service",
            "metrics_recorder",
            "query_monitor",
            "connection_pool_monitor",
            "resource_monitor"
        ]
    );
    assert!(env.debugger.start().await.is_empty());

    // Query loop ticks immediately, then once per second.
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert_eq!(env.adapter.active_query_calls(), 5);

    let stopped = env.debugger.stop().await;
    assert_eq!(stopped.len(), 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_polling_after_stop() -> Result<()> {
    let env = TestEnvironment::new().await?;
    env.debugger.start().await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    env.debugger.stop().await;
    let query_calls = env.adapter.active_query_calls();
    let pool_calls = env.adapter.pool_metrics_calls();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(env.adapter.active_query_calls(), query_calls);
    assert_eq!(env.adapter.pool_metrics_calls(), pool_calls);
    assert!(!env.debugger.status().await.any_running());

    // Stopping an idle debugger is a no-op.
    assert!(env.debugger.stop().await.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_name_components() -> Result<()> {
    let env = TestEnvironment::listeners_only().await?;
    let mut rx = env.debugger.bus().subscribe();

    env.debugger.start().await;
    env.debugger.stop().await;

    let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["monitoring_started", "monitoring_stopped"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failing_adapter_skips_ticks_without_stopping() -> Result<()> {
    let env = TestEnvironment::new().await?;
    env.adapter.set_fail_polls(true);
    env.debugger.start().await;

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(env.debugger.status().await.query_monitor);
    assert!(env.debugger.query_monitor().get_query_history(None).await.is_empty());

    env.adapter.set_fail_polls(false);
    env.adapter.push_snapshot(vec![query("q1", 10)]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(env.debugger.query_monitor().get_active_queries().await.len(), 1);

    env.debugger.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_diff_through_event_stream() -> Result<()> {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let monitor = QueryMonitor::new(&QueryMonitorConfig::default(), HeuristicWeights::default(), bus)?;
    let adapter = MockDatabaseAdapter::new();

    adapter.push_snapshot(vec![query("a", 10), query("b", 10)]);
    adapter.push_snapshot(vec![query("b", 20), query("c", 10)]);

    monitor.poll_once(&adapter).await?;
    monitor.poll_once(&adapter).await?;

    let observed = query_events(&drain(&mut rx));
    let expected = vec![
        ("query.started", "a".to_string()),
        ("query.started", "b".to_string()),
        ("query.started", "c".to_string()),
        ("query.completed", "a".to_string()),
    ];
    assert_eq!(observed, expected);

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
    Ok(())
}

#[tokio::test]
async fn test_slow_query_reported_once() -> Result<()> {
    let env = TestEnvironment::new().await?;
    let mut rx = env.debugger.bus().subscribe();
    let monitor = env.debugger.query_monitor();

    env.adapter.push_snapshot(vec![query("q1", 6000)]);
    env.adapter.push_snapshot(vec![query("q1", 6000)]);
    monitor.poll_once(env.adapter.as_ref()).await?;
    monitor.poll_once(env.adapter.as_ref()).await?;

    let slow: Vec<_> = query_events(&drain(&mut rx))
        .into_iter()
        .filter(|(kind, _)| *kind == "query.slow")
        .collect();
    assert_eq!(slow, vec![("query.slow", "q1".to_string())]);
    assert_eq!(monitor.get_slow_queries(None).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_kill_query_requires_confirmation() -> Result<()> {
    let env = TestEnvironment::new().await?;
    let mut rx = env.debugger.bus().subscribe();
    let monitor = env.debugger.query_monitor();

    env.adapter.push_snapshot(vec![query("q1", 200)]);
    monitor.poll_once(env.adapter.as_ref()).await?;
    drain(&mut rx);

    env.adapter.set_kill_result(false);
    assert!(!env.debugger.kill_query("q1").await?);
    assert_eq!(monitor.get_active_queries().await.len(), 1);
    assert!(drain(&mut rx).is_empty());

    env.adapter.set_kill_result(true);
    assert!(env.debugger.kill_query("q1").await?);
    assert!(monitor.get_active_queries().await.is_empty());
    assert_eq!(
        query_events(&drain(&mut rx)),
        vec![("query.killed", "q1".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn test_analyze_query_suggests_select_star_and_limit() -> Result<()> {
    let env = TestEnvironment::new().await?;

    let analysis = env
        .debugger
        .analyze_query("SELECT * FROM orders ORDER BY id", &[])
        .await?;
    let kinds: Vec<_> = analysis.suggestions.iter().map(|s| s.kind).collect();
    assert!(kinds.contains(&SuggestionKind::SelectStar));
    assert!(kinds.contains(&SuggestionKind::MissingLimit));
    Ok(())
}
