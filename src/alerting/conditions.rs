use super::AlertRule;
use crate::error::{DebuggerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
        }
    }

    pub fn compare(&self, observed: f64, expected: f64) -> bool {
        match self {
            Comparator::Gt => observed > expected,
            Comparator::Ge => observed >= expected,
            Comparator::Lt => observed < expected,
            Comparator::Le => observed <= expected,
            Comparator::Eq => (observed - expected).abs() < f64::EPSILON,
        }
    }
}

/// A rule condition. The textual form (`"utilization >= threshold"`) is the
/// default; a structured expression tree can be supplied instead without
/// changing the rule's shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RuleCondition {
    Text(String),
    Expression(ConditionExpr),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionExpr {
    /// `value` defaults to the rule threshold.
    Compare {
        metric: String,
        comparator: Comparator,
        #[serde(default)]
        value: Option<f64>,
    },
    All {
        conditions: Vec<ConditionExpr>,
    },
    Any {
        conditions: Vec<ConditionExpr>,
    },
    Not {
        condition: Box<ConditionExpr>,
    },
}

impl ConditionExpr {
    fn collect_metrics<'a>(&'a self, out: &mut Vec<&'a str>) -> std::result::Result<(), String> {
        match self {
            ConditionExpr::Compare { metric, value, .. } => {
                if metric.trim().is_empty() {
                    return Err("comparison without a metric".to_string());
                }
                if let Some(v) = value {
                    if !v.is_finite() {
                        return Err(format!("non-finite literal for '{metric}'"));
                    }
                }
                out.push(metric.as_str());
            }
            ConditionExpr::All { conditions } | ConditionExpr::Any { conditions } => {
                if conditions.is_empty() {
                    return Err("empty condition group".to_string());
                }
                for condition in conditions {
                    condition.collect_metrics(out)?;
                }
            }
            ConditionExpr::Not { condition } => condition.collect_metrics(out)?,
        }
        Ok(())
    }

    fn evaluate(&self, threshold: f64, sample: &MetricSample) -> bool {
        match self {
            ConditionExpr::Compare {
                metric,
                comparator,
                value,
            } => sample
                .get(metric)
                .map(|observed| comparator.compare(observed, value.unwrap_or(threshold)))
                .unwrap_or(false),
            ConditionExpr::All { conditions } => {
                conditions.iter().all(|c| c.evaluate(threshold, sample))
            }
            ConditionExpr::Any { conditions } => {
                conditions.iter().any(|c| c.evaluate(threshold, sample))
            }
            ConditionExpr::Not { condition } => !condition.evaluate(threshold, sample),
        }
    }
}

/// `<metric> <op> <threshold|number>`
#[derive(Debug, Clone, PartialEq)]
pub struct TextCondition {
    pub metric: String,
    pub comparator: Comparator,
    pub value: Option<f64>,
}

pub fn parse_text_condition(text: &str) -> std::result::Result<TextCondition, String> {
    let pos = text
        .find(['<', '>', '='])
        .ok_or_else(|| format!("no comparison operator in '{text}'"))?;

    let rest = &text[pos..];
    let (comparator, len) = if rest.starts_with(">=") {
        (Comparator::Ge, 2)
    } else if rest.starts_with("<=") {
        (Comparator::Le, 2)
    } else if rest.starts_with("==") {
        (Comparator::Eq, 2)
    } else if rest.starts_with('>') {
        (Comparator::Gt, 1)
    } else if rest.starts_with('<') {
        (Comparator::Lt, 1)
    } else {
        return Err(format!("unsupported operator in '{text}'"));
    };

    let metric = text[..pos].trim();
    if metric.is_empty()
        || !metric
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(format!("invalid metric name '{metric}'"));
    }

    let rhs = text[pos + len..].trim();
    let value = if rhs.is_empty() || rhs.eq_ignore_ascii_case("threshold") {
        None
    } else {
        let parsed = rhs
            .parse::<f64>()
            .map_err(|_| format!("right-hand side '{rhs}' is neither 'threshold' nor a number"))?;
        if !parsed.is_finite() {
            return Err(format!("non-finite literal '{rhs}'"));
        }
        Some(parsed)
    };

    Ok(TextCondition {
        metric: metric.to_string(),
        comparator,
        value,
    })
}

impl RuleCondition {
    /// Metrics this condition reads, or why it cannot be evaluated.
    pub fn referenced_metrics(&self) -> std::result::Result<Vec<String>, String> {
        match self {
            RuleCondition::Text(text) => Ok(vec![parse_text_condition(text)?.metric]),
            RuleCondition::Expression(expr) => {
                let mut metrics = Vec::new();
                expr.collect_metrics(&mut metrics)?;
                Ok(metrics.into_iter().map(str::to_string).collect())
            }
        }
    }
}

const PERCENTAGE_METRICS: &[&str] = &["utilization", "usage_percent", "buffer_hit_ratio"];

pub fn is_percentage_metric(metric: &str) -> bool {
    PERCENTAGE_METRICS.contains(&metric)
}

/// Named numeric values extracted from one event, visible to rule conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSample {
    values: HashMap<String, f64>,
}

impl MetricSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionMatch {
    pub metric: String,
    pub observed: f64,
}

/// Decides whether a rule matches a sample. `Ok(None)` means "no match";
/// errors are reported by the caller and treated as no match.
pub trait ConditionEvaluator: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, rule: &AlertRule, sample: &MetricSample) -> Result<Option<ConditionMatch>>;
}

/// Minimal matcher: a single textual comparison, or an expression tree.
/// A condition naming a metric the sample does not carry does not match.
#[derive(Debug, Clone, Default)]
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(&self, rule: &AlertRule, sample: &MetricSample) -> Result<Option<ConditionMatch>> {
        let evaluation_error = |reason: String| DebuggerError::RuleEvaluation {
            rule_id: rule.id.clone(),
            reason,
        };

        if !rule.threshold.is_finite() {
            return Err(evaluation_error("non-finite threshold".to_string()));
        }

        match &rule.condition {
            RuleCondition::Text(text) => {
                let condition = parse_text_condition(text).map_err(evaluation_error)?;
                let Some(observed) = sample.get(&condition.metric) else {
                    return Ok(None);
                };
                let expected = condition.value.unwrap_or(rule.threshold);
                Ok(condition
                    .comparator
                    .compare(observed, expected)
                    .then(|| ConditionMatch {
                        metric: condition.metric,
                        observed,
                    }))
            }
            RuleCondition::Expression(expr) => {
                let mut metrics = Vec::new();
                expr.collect_metrics(&mut metrics).map_err(evaluation_error)?;

                if metrics.iter().any(|m| sample.get(m).is_none()) {
                    return Ok(None);
                }

                if !expr.evaluate(rule.threshold, sample) {
                    return Ok(None);
                }

                let primary = metrics[0];
                Ok(Some(ConditionMatch {
                    metric: primary.to_string(),
                    observed: sample.get(primary).unwrap_or_default(),
                }))
            }
        }
    }
}
