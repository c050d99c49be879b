use super::{display_value, BottleneckKind, BottleneckSeverity, PerformanceBottleneck, QueryMetrics};
use crate::error::{DebuggerError, Result};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const SELECT_STAR_CONFIDENCE: f64 = 0.9;
pub const MISSING_LIMIT_CONFIDENCE: f64 = 0.7;
pub const LEADING_WILDCARD_CONFIDENCE: f64 = 0.8;
pub const SUBQUERY_IN_CONFIDENCE: f64 = 0.6;
pub const MISSING_INDEX_CONFIDENCE: f64 = 0.5;
pub const INDEX_SUGGESTION_MIN_MS: u64 = 1000;
pub const SLOW_QUERY_BOTTLENECK_MS: u64 = 5000;
pub const SEQ_SCAN_BOTTLENECK_MS: u64 = 1000;

/// Advisory weights for the query heuristics. None of these are derived from
/// measurements; they only rank suggestions against each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeuristicWeights {
    pub select_star_confidence: f64,
    pub missing_limit_confidence: f64,
    pub leading_wildcard_confidence: f64,
    pub subquery_in_confidence: f64,
    pub missing_index_confidence: f64,
    /// Equality filters only produce an index suggestion above this duration.
    pub index_suggestion_min_ms: u64,
    pub slow_query_bottleneck_ms: u64,
    pub seq_scan_bottleneck_ms: u64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            select_star_confidence: SELECT_STAR_CONFIDENCE,
            missing_limit_confidence: MISSING_LIMIT_CONFIDENCE,
            leading_wildcard_confidence: LEADING_WILDCARD_CONFIDENCE,
            subquery_in_confidence: SUBQUERY_IN_CONFIDENCE,
            missing_index_confidence: MISSING_INDEX_CONFIDENCE,
            index_suggestion_min_ms: INDEX_SUGGESTION_MIN_MS,
            slow_query_bottleneck_ms: SLOW_QUERY_BOTTLENECK_MS,
            seq_scan_bottleneck_ms: SEQ_SCAN_BOTTLENECK_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    SelectStar,
    MissingLimit,
    LeadingWildcard,
    SubqueryIn,
    MissingIndex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationSuggestion {
    pub kind: SuggestionKind,
    pub description: String,
    pub suggested_change: Option<String>,
    pub confidence: f64,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnalysis {
    pub query_id: String,
    pub execution_time_ms: u64,
    pub suggestions: Vec<OptimizationSuggestion>,
    pub bottlenecks: Vec<PerformanceBottleneck>,
}

/// Pattern-based query heuristics. Cheap, textual and deliberately conservative:
/// they flag shapes worth a second look, not proven problems.
#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    weights: HeuristicWeights,
    select_star: Regex,
    order_by: Regex,
    limit: Regex,
    leading_wildcard: Regex,
    subquery_in: Regex,
    equality_filter: Regex,
}

impl QueryAnalyzer {
    pub fn new(weights: HeuristicWeights) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                DebuggerError::Configuration(format!("Failed to compile heuristic pattern: {e}"))
            })
        };

        Ok(Self {
            weights,
            select_star: compile(r"(?i)\bselect\s+(?:distinct\s+)?\*")?,
            order_by: compile(r"(?i)\border\s+by\b")?,
            limit: compile(r"(?i)\b(?:limit|fetch\s+first|top)\b")?,
            leading_wildcard: compile(r"(?i)\b(?:i?like)\s+'%")?,
            subquery_in: compile(r"(?i)\bin\s*\(\s*select\b")?,
            equality_filter: compile(
                r"(?i)\b(?:where|and)\s+([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?)\s*=\s*[^=]",
            )?,
        })
    }

    pub fn weights(&self) -> &HeuristicWeights {
        &self.weights
    }

    pub fn analyze(&self, metrics: &QueryMetrics) -> QueryAnalysis {
        QueryAnalysis {
            query_id: metrics.id.clone(),
            execution_time_ms: metrics.execution_time_ms,
            suggestions: self.suggest(&metrics.query, metrics.execution_time_ms),
            bottlenecks: self.bottlenecks(metrics),
        }
    }

    pub fn suggest(&self, query: &str, execution_time_ms: u64) -> Vec<OptimizationSuggestion> {
        let mut suggestions = Vec::new();

        if self.select_star.is_match(query) {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::SelectStar,
                description: "Query uses SELECT *, which fetches every column".to_string(),
                suggested_change: Some("List only the columns the caller needs".to_string()),
                confidence: self.weights.select_star_confidence,
                impact: ImpactLevel::Medium,
            });
        }

        if self.order_by.is_match(query) && !self.limit.is_match(query) {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::MissingLimit,
                description: "ORDER BY without LIMIT sorts the full result set".to_string(),
                suggested_change: Some("Add a LIMIT clause or paginate the results".to_string()),
                confidence: self.weights.missing_limit_confidence,
                impact: ImpactLevel::Medium,
            });
        }

        if self.leading_wildcard.is_match(query) {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::LeadingWildcard,
                description: "LIKE pattern starts with a wildcard and cannot use a B-tree index"
                    .to_string(),
                suggested_change: Some(
                    "Use a trigram or full-text index, or anchor the pattern".to_string(),
                ),
                confidence: self.weights.leading_wildcard_confidence,
                impact: ImpactLevel::High,
            });
        }

        if self.subquery_in.is_match(query) {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::SubqueryIn,
                description: "IN (SELECT ...) subquery may be re-evaluated per row".to_string(),
                suggested_change: Some("Rewrite as EXISTS or a JOIN".to_string()),
                confidence: self.weights.subquery_in_confidence,
                impact: ImpactLevel::Medium,
            });
        }

        if execution_time_ms > self.weights.index_suggestion_min_ms {
            let mut seen = HashSet::new();
            let columns: Vec<String> = self
                .equality_filter
                .captures_iter(query)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .filter(|column| seen.insert(column.clone()))
                .collect();

            if !columns.is_empty() {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::MissingIndex,
                    description: format!(
                        "Slow query ({execution_time_ms}ms) filters by equality on {}",
                        columns.join(", ")
                    ),
                    suggested_change: Some(format!(
                        "Consider an index on ({})",
                        columns.join(", ")
                    )),
                    confidence: self.weights.missing_index_confidence,
                    impact: ImpactLevel::High,
                });
            }
        }

        suggestions
    }

    pub fn bottlenecks(&self, metrics: &QueryMetrics) -> Vec<PerformanceBottleneck> {
        let mut bottlenecks = Vec::new();
        let elapsed = metrics.execution_time_ms;

        if elapsed > self.weights.slow_query_bottleneck_ms {
            let severity = if elapsed > 30_000 {
                BottleneckSeverity::Critical
            } else if elapsed > 15_000 {
                BottleneckSeverity::High
            } else {
                BottleneckSeverity::Medium
            };
            bottlenecks.push(PerformanceBottleneck {
                kind: BottleneckKind::SlowQuery,
                severity,
                description: format!(
                    "Query {} has been running for {}s",
                    metrics.id,
                    display_value(elapsed as f64 / 1000.0)
                ),
                recommendation: "Review the execution plan and consider cancelling the query"
                    .to_string(),
                query_id: Some(metrics.id.clone()),
                detected_at: Utc::now(),
            });
        }

        let seq_scan = metrics
            .plan
            .as_ref()
            .map(|plan| plan.has_sequential_scan())
            .unwrap_or(false);
        if seq_scan && elapsed > self.weights.seq_scan_bottleneck_ms {
            bottlenecks.push(PerformanceBottleneck {
                kind: BottleneckKind::IndexMissing,
                severity: BottleneckSeverity::High,
                description: format!(
                    "Query {} performs a sequential scan and took {elapsed}ms",
                    metrics.id
                ),
                recommendation: "Add an index covering the filtered columns".to_string(),
                query_id: Some(metrics.id.clone()),
                detected_at: Utc::now(),
            });
        }

        bottlenecks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::QueryPlan;
    use serde_json::json;

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(HeuristicWeights::default()).unwrap()
    }

    fn kinds(suggestions: &[OptimizationSuggestion]) -> Vec<SuggestionKind> {
        suggestions.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_select_star_and_missing_limit() {
        let suggestions = analyzer().suggest("SELECT * FROM orders ORDER BY id", 1500);
        let kinds = kinds(&suggestions);
        assert!(kinds.contains(&SuggestionKind::SelectStar));
        assert!(kinds.contains(&SuggestionKind::MissingLimit));
        assert!(!kinds.contains(&SuggestionKind::MissingIndex));
    }

    #[test]
    fn test_limit_suppresses_order_by_hint() {
        let suggestions = analyzer().suggest("SELECT id FROM orders ORDER BY id LIMIT 10", 10);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn test_leading_wildcard_and_subquery() {
        let suggestions = analyzer().suggest(
            "SELECT id FROM users WHERE name LIKE '%smith%' AND team_id IN (SELECT id FROM teams)",
            50,
        );
        let kinds = kinds(&suggestions);
        assert_eq!(
            kinds,
            vec![SuggestionKind::LeadingWildcard, SuggestionKind::SubqueryIn]
        );
    }

    #[test]
    fn test_index_hint_requires_slow_query() {
        let query = "SELECT id FROM orders WHERE customer_id = $1 AND status = 'open'";
        assert!(analyzer().suggest(query, 200).is_empty());

        let slow = analyzer().suggest(query, 2500);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].kind, SuggestionKind::MissingIndex);
        assert!(slow[0].description.contains("customer_id, status"));
        assert_eq!(slow[0].confidence, MISSING_INDEX_CONFIDENCE);
    }

    #[test]
    fn test_index_hint_lists_each_column_once() {
        let slow = analyzer().suggest(
            "SELECT id FROM orders WHERE a = 1 AND b = 2 AND a = 3",
            2500,
        );
        assert_eq!(slow.len(), 1);
        assert_eq!(
            slow[0].suggested_change.as_deref(),
            Some("Consider an index on (a, b)")
        );
    }

    #[test]
    fn test_range_filter_is_not_equality() {
        let suggestions = analyzer().suggest("SELECT id FROM orders WHERE total >= 100", 5000);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn test_slow_query_bottleneck_severity_scales() {
        let analyzer = analyzer();
        let medium = QueryMetrics::new("q1", "SELECT 1").with_execution_time(6_000);
        let high = QueryMetrics::new("q2", "SELECT 1").with_execution_time(20_000);
        let critical = QueryMetrics::new("q3", "SELECT 1").with_execution_time(45_000);
        let fast = QueryMetrics::new("q4", "SELECT 1").with_execution_time(4_000);

        assert_eq!(analyzer.bottlenecks(&medium)[0].severity, BottleneckSeverity::Medium);
        assert_eq!(analyzer.bottlenecks(&high)[0].severity, BottleneckSeverity::High);
        assert_eq!(analyzer.bottlenecks(&critical)[0].severity, BottleneckSeverity::Critical);
        assert!(analyzer.bottlenecks(&fast).is_empty());
    }

    #[test]
    fn test_sequential_scan_bottleneck() {
        let mut metrics = QueryMetrics::new("q1", "SELECT id FROM orders").with_execution_time(1200);
        metrics.plan = Some(QueryPlan::from_explain_json(json!([
            { "Plan": { "Node Type": "Seq Scan", "Relation Name": "orders" } }
        ])));

        let bottlenecks = analyzer().bottlenecks(&metrics);
        assert_eq!(bottlenecks.len(), 1);
        assert_eq!(bottlenecks[0].kind, BottleneckKind::IndexMissing);

        metrics.execution_time_ms = 800;
        assert!(analyzer().bottlenecks(&metrics).is_empty());
    }

    #[test]
    fn test_weights_are_configurable() {
        let analyzer = QueryAnalyzer::new(HeuristicWeights {
            select_star_confidence: 0.25,
            ..Default::default()
        })
        .unwrap();
        let suggestions = analyzer.suggest("SELECT * FROM t", 1);
        assert_eq!(suggestions[0].confidence, 0.25);
    }
}
