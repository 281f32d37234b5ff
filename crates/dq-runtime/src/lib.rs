#![forbid(unsafe_code)]

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage, used to tag diagnostics and fatal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Fetch,
    PreFilter,
    Group,
    Calculate,
    PostFilter,
    Sort,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Fetch => "fetch",
            Self::PreFilter => "pre_filter",
            Self::Group => "group",
            Self::Calculate => "calculate",
            Self::PostFilter => "post_filter",
            Self::Sort => "sort",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Filter field is neither a dimension nor a measure; applied before grouping.
    UnknownFilterField,
    /// Filter operator is not recognised; the rule passes every row.
    UnknownOperator,
    /// Filter operand has the wrong shape for its operator; the rule passes every row.
    MalformedFilterValue,
    /// An OR tree was split across the grouping boundary.
    MixedDisjunction,
    /// A calculated measure failed; the affected field is null.
    ExpressionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub ts_unix_ms: u64,
    pub stage: Stage,
    pub kind: DiagnosticKind,
    pub subject: String,
    pub detail: String,
}

/// Collects non-fatal diagnostics for one pipeline run.
///
/// Every record is also emitted as a `tracing` warning, so hosts that only
/// attach a subscriber still see them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLedger {
    records: Vec<Diagnostic>,
}

impl DiagnosticLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        stage: Stage,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let diagnostic = Diagnostic {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            stage,
            kind,
            subject: subject.into(),
            detail: detail.into(),
        };
        tracing::warn!(
            stage = %diagnostic.stage,
            kind = ?diagnostic.kind,
            subject = %diagnostic.subject,
            "{}",
            diagnostic.detail
        );
        self.records.push(diagnostic);
    }

    #[must_use]
    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.iter().filter(|d| d.kind == kind).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<Diagnostic> {
        self.records
    }
}

/// How a `limit` of zero is interpreted by the sort/limit stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroLimitMode {
    /// `limit: 0` behaves like an absent limit.
    #[default]
    NoLimit,
    /// `limit: 0` returns zero rows.
    Empty,
}

/// Named policy presets, as selected by fixtures and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Permissive,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub max_expression_len: usize,
    pub max_expression_depth: usize,
    pub zero_limit: ZeroLimitMode,
}

pub const DEFAULT_MAX_EXPRESSION_LEN: usize = 500;
pub const DEFAULT_MAX_EXPRESSION_DEPTH: usize = 64;

impl RuntimePolicy {
    /// Dashboard-compatible defaults: `limit: 0` means no limit.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            max_expression_len: DEFAULT_MAX_EXPRESSION_LEN,
            max_expression_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
            zero_limit: ZeroLimitMode::NoLimit,
        }
    }

    /// Literal semantics: `limit: 0` means zero rows.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            zero_limit: ZeroLimitMode::Empty,
            ..Self::permissive()
        }
    }

    #[must_use]
    pub fn for_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::Permissive => Self::permissive(),
            RuntimeMode::Strict => Self::strict(),
        }
    }

    #[must_use]
    pub fn with_max_expression_len(mut self, max: usize) -> Self {
        self.max_expression_len = max;
        self
    }

    #[must_use]
    pub fn with_zero_limit(mut self, mode: ZeroLimitMode) -> Self {
        self.zero_limit = mode;
        self
    }

    /// Effective row cap for a requested limit, or `None` for "keep everything".
    #[must_use]
    pub fn effective_limit(&self, limit: Option<usize>) -> Option<usize> {
        match (limit, self.zero_limit) {
            (None, _) | (Some(0), ZeroLimitMode::NoLimit) => None,
            (Some(n), _) => Some(n),
        }
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::permissive()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
}

pub fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticKind, DiagnosticLedger, RuntimeMode, RuntimePolicy, Stage, ZeroLimitMode};

    #[test]
    fn ledger_keeps_records_in_order() {
        let mut ledger = DiagnosticLedger::new();
        ledger.record(
            Stage::PreFilter,
            DiagnosticKind::UnknownFilterField,
            "colour",
            "field is neither a dimension nor a measure",
        );
        ledger.record(
            Stage::Calculate,
            DiagnosticKind::ExpressionFailure,
            "margin",
            "unknown field: profit",
        );

        assert_eq!(ledger.records().len(), 2);
        assert_eq!(ledger.records()[0].subject, "colour");
        assert_eq!(ledger.count(DiagnosticKind::ExpressionFailure), 1);
    }

    #[test]
    fn permissive_policy_treats_zero_limit_as_absent() {
        let policy = RuntimePolicy::permissive();
        assert_eq!(policy.effective_limit(Some(0)), None);
        assert_eq!(policy.effective_limit(Some(3)), Some(3));
        assert_eq!(policy.effective_limit(None), None);
    }

    #[test]
    fn strict_policy_treats_zero_limit_literally() {
        let policy = RuntimePolicy::strict();
        assert_eq!(policy.zero_limit, ZeroLimitMode::Empty);
        assert_eq!(policy.effective_limit(Some(0)), Some(0));
        assert_eq!(policy.effective_limit(None), None);
    }

    #[test]
    fn mode_selects_the_matching_preset() {
        assert_eq!(
            RuntimePolicy::for_mode(RuntimeMode::Strict),
            RuntimePolicy::strict()
        );
        assert_eq!(
            RuntimePolicy::for_mode(RuntimeMode::Permissive),
            RuntimePolicy::default()
        );
        assert_ne!(RuntimePolicy::strict(), RuntimePolicy::permissive());
    }

    #[test]
    fn diagnostics_serialize_with_snake_case_tags() {
        let mut ledger = DiagnosticLedger::new();
        ledger.record(Stage::PostFilter, DiagnosticKind::UnknownOperator, "x", "op=~=");
        let json = serde_json::to_value(ledger.records()).expect("serialize");
        assert_eq!(json[0]["stage"], "post_filter");
        assert_eq!(json[0]["kind"], "unknown_operator");
    }
}
