//! Query compiler - event expressions to PromQL
//!
//! Expressions are comparisons joined by `&&` / `||`:
//!
//! ```text
//! cpu_usage > 80 && memory_usage >= 70 || disk_free < 5
//! ```
//!
//! Each comparison becomes a `bool` comparison on the prefixed metric, scoped
//! to the configured metric index and the agent's own node, so the compiled
//! query always evaluates to 0 or 1. `&&` binds tighter than `||`.
//! Expressions starting with `promql:` are passed through verbatim.

use crate::config::ProposalRule;
use crate::ledger::ActionValue;

/// Placeholder the agent's device name is substituted into
pub const IDENTITY_PLACEHOLDER: &str = "\"replace\"";

const OPERATORS: [&str; 6] = [">=", "<=", "==", "!=", ">", "<"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Empty expression")]
    Empty,

    #[error("No comparison operator in '{0}'")]
    MissingOperator(String),

    #[error("Invalid metric name '{0}'")]
    InvalidMetric(String),

    #[error("Invalid threshold '{0}'")]
    InvalidThreshold(String),
}

/// Compiles configured event expressions into query strings
pub trait QueryCompiler: Send + Sync {
    fn compile(&self, metric_index: &str, expression: &str) -> Result<String, QueryError>;
}

/// A rule ready for evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub message: String,
    pub action_value: ActionValue,
    pub trigger_query: String,
    pub vote_query: Option<String>,
}

impl CompiledRule {
    pub fn compile(
        compiler: &dyn QueryCompiler,
        metric_index: &str,
        rule: &ProposalRule,
    ) -> Result<Self, QueryError> {
        let trigger_query = compiler.compile(metric_index, &rule.event)?;
        let vote_query = rule
            .vote_condition
            .as_deref()
            .map(|expr| compiler.compile(metric_index, expr))
            .transpose()?;

        Ok(Self {
            message: rule.message.clone(),
            action_value: rule.action_value,
            trigger_query,
            vote_query,
        })
    }
}

/// Substitute the device identity into a compiled query
pub fn bind_identity(query: &str, device_name: &str) -> String {
    query.replace(IDENTITY_PLACEHOLDER, &format!("\"{}\"", device_name))
}

/// Default compiler producing PromQL against `<prefix><metric>` series
#[derive(Debug, Clone)]
pub struct PromQlCompiler {
    metric_prefix: String,
    identity_label: String,
}

impl PromQlCompiler {
    pub fn new(metric_prefix: impl Into<String>) -> Self {
        Self {
            metric_prefix: metric_prefix.into(),
            identity_label: "node".to_string(),
        }
    }

    pub fn with_identity_label(mut self, label: impl Into<String>) -> Self {
        self.identity_label = label.into();
        self
    }

    fn compile_term(&self, metric_index: &str, term: &str) -> Result<String, QueryError> {
        let (pos, op) = OPERATORS
            .iter()
            .filter_map(|op| term.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
            .ok_or_else(|| QueryError::MissingOperator(term.to_string()))?;

        let metric = term[..pos].trim();
        let threshold = term[pos + op.len()..].trim();

        if !is_metric_name(metric) {
            return Err(QueryError::InvalidMetric(metric.to_string()));
        }
        let threshold: f64 = threshold
            .parse()
            .map_err(|_| QueryError::InvalidThreshold(threshold.to_string()))?;

        Ok(format!(
            "{}{}{{metric_index=\"{}\",{}={}}} {} bool {}",
            self.metric_prefix, metric, metric_index, self.identity_label, IDENTITY_PLACEHOLDER, op, threshold
        ))
    }
}

impl Default for PromQlCompiler {
    fn default() -> Self {
        Self::new("oasees_")
    }
}

impl QueryCompiler for PromQlCompiler {
    fn compile(&self, metric_index: &str, expression: &str) -> Result<String, QueryError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(QueryError::Empty);
        }
        if let Some(raw) = expression.strip_prefix("promql:") {
            return Ok(raw.trim().to_string());
        }

        let mut groups = Vec::new();
        for group in expression.split("||") {
            let terms = group
                .split("&&")
                .map(|term| self.compile_term(metric_index, term))
                .collect::<Result<Vec<_>, _>>()?;
            groups.push(join(terms, |parts| parts.join(" * ")));
        }

        Ok(join(groups, |parts| {
            format!("clamp_max({}, 1)", parts.join(" + "))
        }))
    }
}

/// Single parts are used as-is; multiple parts are parenthesised and combined
fn join(parts: Vec<String>, combine: impl Fn(&[String]) -> String) -> String {
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap_or_default();
    }
    let wrapped: Vec<String> = parts.into_iter().map(|p| format!("({})", p)).collect();
    combine(&wrapped)
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
