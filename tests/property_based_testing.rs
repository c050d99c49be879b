//! Property-based tests for the bounded buffers and the statistics computed
//! over them.


use approx::assert_relative_eq;
use db_debugger::config::{ConnectionPoolConfig, QueryMonitorConfig};
use db_debugger::monitoring::HeuristicWeights;
use db_debugger::{
    BoundedHistory, ConnectionPoolMonitor, EventBus, MockDatabaseAdapter, QueryMonitor,
};
use proptest::prelude::*;
use test_helpers::{pool_sample, query};
use tokio::runtime::Runtime;

prop_compose! {
    fn arb_pool_sample()(max in 1u32..500)(active in 0..=max, max in Just(max)) -> (u32, u32) {
        (active, max)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn history_keeps_most_recent_entries(
        capacity in 1usize..64,
        entries in prop::collection::vec(any::<u32>(), 0..256),
    ) {
        let mut history = BoundedHistory::new(capacity);
        for entry in &entries {
            history.push(*entry);
        }

        let expected_len = entries.len().min(capacity);
        prop_assert_eq!(history.len(), expected_len);
        prop_assert_eq!(history.to_vec(), entries[entries.len() - expected_len..].to_vec());
        prop_assert_eq!(history.latest().copied(), entries.last().copied());
    }

    #[test]
    fn pool_statistics_cover_retained_history(
        capacity in 1usize..32,
        samples in prop::collection::vec(arb_pool_sample(), 1..96),
    ) {
        let rt = Runtime::new().unwrap();
        let config = ConnectionPoolConfig { history_size: capacity, ..Default::default() };
        let monitor = ConnectionPoolMonitor::new(&config, EventBus::new(16));

        let stats = rt.block_on(async {
            for (active, max) in &samples {
                monitor.record_metrics(pool_sample(*active, *max)).await;
            }
            monitor.get_connection_pool_statistics().await
        });

        let retained: Vec<f64> = samples[samples.len().saturating_sub(capacity)..]
            .iter()
            .map(|(active, max)| *active as f64 * 100.0 / *max as f64)
            .collect();
        let peak = retained.iter().cloned().fold(f64::MIN, f64::max);
        let mean = retained.iter().sum::<f64>() / retained.len() as f64;

        prop_assert_eq!(stats.sample_count, retained.len());
        assert_relative_eq!(stats.peak_utilization, peak, epsilon = 1e-9);
        assert_relative_eq!(stats.average_utilization, mean, epsilon = 1e-9);
        assert_relative_eq!(stats.uptime_percentage, 100.0);
    }

    #[test]
    fn average_execution_time_is_mean_of_history(
        times in prop::collection::vec(0u64..20_000, 1..40),
    ) {
        let rt = Runtime::new().unwrap();
        let config = QueryMonitorConfig { history_size: 1000, ..Default::default() };
        let monitor = QueryMonitor::new(&config, HeuristicWeights::default(), EventBus::new(16)).unwrap();
        let adapter = MockDatabaseAdapter::new();

        let stats = rt.block_on(async {
            for (i, ms) in times.iter().enumerate() {
                adapter.push_snapshot(vec![query(&format!("q{i}"), *ms)]);
                adapter.push_snapshot(Vec::new());
                monitor.poll_once(&adapter).await.unwrap();
                monitor.poll_once(&adapter).await.unwrap();
            }
            monitor.get_query_statistics().await
        });

        let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
        prop_assert_eq!(stats.total_queries, times.len());
        prop_assert_eq!(stats.active_query_count, 0);
        assert_relative_eq!(stats.average_execution_time, mean, epsilon = 1e-9);

        let slow = times.iter().filter(|ms| **ms > config.slow_query.threshold_ms).count();
        prop_assert_eq!(stats.slow_query_count, slow.min(config.slow_query.max_slow_queries));
    }
}
