use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A directed connection from a producer node to a consumer node.
///
/// When the consumer is a join, the order of its incoming edges in the flow
/// definition fixes the port ordinals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold for the source's result to travel this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    /// Evaluated against the run context.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl Edge {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::Always)
    }

    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::OnSuccess)
    }

    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::OnFailure)
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::with_condition(from, to, EdgeCondition::Conditional { expr: expr.into() })
    }

    fn with_condition(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }

    /// Whether a result from `self.from` travels this edge.
    pub fn fires(&self, succeeded: bool, context: &HashMap<String, serde_json::Value>) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => succeeded,
            EdgeCondition::OnFailure => !succeeded,
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, context),
        }
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Expressions have the form `key OP value` where OP is `==`, `!=` or
/// `contains`. Comparisons are exact, so `==` and `!=` never agree.
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let Some((key, op, value)) = parse_expression(expr) else {
        return false;
    };
    let Some(actual) = context.get(key).and_then(|v| v.as_str()) else {
        return false;
    };
    match op {
        Operator::Equals => actual == value,
        Operator::NotEquals => actual != value,
        Operator::Contains => actual.contains(value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Contains,
}

/// Split `key OP "value"` into its parts. The operator is read right after
/// the key token, so the value may itself contain operator text.
fn parse_expression(expr: &str) -> Option<(&str, Operator, &str)> {
    let expr = expr.trim();
    let key_end = expr
        .find(|c: char| c.is_whitespace() || c == '=' || c == '!')
        .unwrap_or(expr.len());
    let key = &expr[..key_end];
    if key.is_empty() {
        return None;
    }

    let rest = expr[key_end..].trim_start();
    let (op, value) = if let Some(v) = rest.strip_prefix("==") {
        (Operator::Equals, v)
    } else if let Some(v) = rest.strip_prefix("!=") {
        (Operator::NotEquals, v)
    } else if let Some(v) = rest.strip_prefix("contains") {
        if !v.starts_with(char::is_whitespace) {
            return None;
        }
        (Operator::Contains, v)
    } else {
        return None;
    };
    Some((key, op, value.trim().trim_matches(|c: char| c == '"' || c == '\'')))
}
