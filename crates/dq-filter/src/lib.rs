#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use dq_runtime::{DiagnosticKind, DiagnosticLedger, Stage};
use dq_types::{Row, Scalar};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextOp {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Compare(ComparisonOp),
    In,
    NotIn,
    Text(TextOp),
    Between,
    IsNull,
    IsNotNull,
    /// Anything not recognised; kept verbatim so it can be reported.
    Unknown(String),
}

impl FilterOperator {
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Self::Compare(ComparisonOp::Eq),
            "!=" | "<>" | "ne" | "neq" => Self::Compare(ComparisonOp::Ne),
            "<" | "lt" => Self::Compare(ComparisonOp::Lt),
            ">" | "gt" => Self::Compare(ComparisonOp::Gt),
            "<=" | "lte" | "le" => Self::Compare(ComparisonOp::Le),
            ">=" | "gte" | "ge" => Self::Compare(ComparisonOp::Ge),
            "in" => Self::In,
            "not-in" | "not_in" | "nin" => Self::NotIn,
            "contains" => Self::Text(TextOp::Contains),
            "starts-with" | "starts_with" => Self::Text(TextOp::StartsWith),
            "ends-with" | "ends_with" => Self::Text(TextOp::EndsWith),
            "between" => Self::Between,
            "is-null" | "is_null" => Self::IsNull,
            "is-not-null" | "is_not_null" => Self::IsNotNull,
            _ => Self::Unknown(token.to_owned()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Compare(ComparisonOp::Eq) => "=",
            Self::Compare(ComparisonOp::Ne) => "!=",
            Self::Compare(ComparisonOp::Lt) => "<",
            Self::Compare(ComparisonOp::Gt) => ">",
            Self::Compare(ComparisonOp::Le) => "<=",
            Self::Compare(ComparisonOp::Ge) => ">=",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Text(TextOp::Contains) => "contains",
            Self::Text(TextOp::StartsWith) => "starts-with",
            Self::Text(TextOp::EndsWith) => "ends-with",
            Self::Between => "between",
            Self::IsNull => "is-null",
            Self::IsNotNull => "is-not-null",
            Self::Unknown(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FilterOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FilterOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Right-hand side of a rule, read from plain JSON: arrays become `List`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    One(Scalar),
    List(Vec<Scalar>),
}

impl Serialize for FilterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::One(value) => value.to_json().serialize(serializer),
            Self::List(values) => values
                .iter()
                .map(Scalar::to_json)
                .collect::<Vec<_>>()
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FilterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Array(items) => items
                .iter()
                .map(Scalar::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List)
                .map_err(D::Error::custom),
            other => Scalar::from_json(other)
                .map(Self::One)
                .map_err(D::Error::custom),
        }
    }
}

impl From<Scalar> for FilterValue {
    fn from(value: Scalar) -> Self {
        Self::One(value)
    }
}

impl From<Vec<Scalar>> for FilterValue {
    fn from(values: Vec<Scalar>) -> Self {
        Self::List(values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FilterValue>,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, operator: &str, value: impl Into<FilterValue>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::parse(operator),
            value: Some(value.into()),
        }
    }

    pub fn unary(field: impl Into<String>, operator: &str) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::parse(operator),
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterTree {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default, alias = "conditions")]
    pub rules: Vec<FilterRule>,
}

impl FilterTree {
    #[must_use]
    pub fn and(rules: Vec<FilterRule>) -> Self {
        Self {
            combinator: Combinator::And,
            rules,
        }
    }

    #[must_use]
    pub fn or(rules: Vec<FilterRule>) -> Self {
        Self {
            combinator: Combinator::Or,
            rules,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A filter tree split at the grouping boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassifiedFilters {
    /// Applied to raw rows before grouping (WHERE).
    pub pre: FilterTree,
    /// Applied to aggregated rows after calculated measures (HAVING).
    pub post: FilterTree,
}

/// Split `filters` into pre- and post-aggregation trees.
///
/// A rule is post-aggregation iff its field is a measure output name. Rules on
/// dimensions are pre-aggregation, and so are rules on unknown fields, which
/// additionally record `UnknownFilterField`. Both halves keep the original
/// combinator.
pub fn classify(
    filters: &FilterTree,
    dimension_names: &BTreeSet<String>,
    measure_names: &BTreeSet<String>,
    ledger: &mut DiagnosticLedger,
) -> ClassifiedFilters {
    let mut pre = Vec::new();
    let mut post = Vec::new();

    for rule in &filters.rules {
        if measure_names.contains(&rule.field) {
            post.push(rule.clone());
        } else {
            if !dimension_names.contains(&rule.field) {
                ledger.record(
                    Stage::Validate,
                    DiagnosticKind::UnknownFilterField,
                    rule.field.clone(),
                    "field is neither a dimension nor a measure; filtering before aggregation",
                );
            }
            pre.push(rule.clone());
        }
    }

    if filters.combinator == Combinator::Or && !pre.is_empty() && !post.is_empty() {
        ledger.record(
            Stage::Validate,
            DiagnosticKind::MixedDisjunction,
            "filters",
            format!(
                "OR tree split into {} pre-aggregation and {} post-aggregation rules; each side is applied separately",
                pre.len(),
                post.len()
            ),
        );
    }

    ClassifiedFilters {
        pre: FilterTree {
            combinator: filters.combinator,
            rules: pre,
        },
        post: FilterTree {
            combinator: filters.combinator,
            rules: post,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Compare(ComparisonOp, Scalar),
    Membership { values: Vec<Scalar>, negate: bool },
    Text(TextOp, String),
    Between(Scalar, Scalar),
    IsNull,
    IsNotNull,
    /// Fail-open: unknown operator or unusable operand.
    PassThrough,
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledRule {
    field: String,
    predicate: Predicate,
}

/// A filter tree with operands checked once, ready to test rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    combinator: Combinator,
    rules: Vec<CompiledRule>,
}

impl CompiledFilter {
    /// Check every rule's operator and operand, recording a diagnostic for each
    /// rule that will pass every row.
    pub fn compile(tree: &FilterTree, stage: Stage, ledger: &mut DiagnosticLedger) -> Self {
        let rules = tree
            .rules
            .iter()
            .map(|rule| CompiledRule {
                field: rule.field.clone(),
                predicate: compile_rule(rule, stage, ledger),
            })
            .collect();
        Self {
            combinator: tree.combinator,
            rules,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let mut results = self
            .rules
            .iter()
            .map(|rule| eval_predicate(&rule.predicate, row.value(&rule.field)));
        match self.combinator {
            Combinator::And => results.all(|pass| pass),
            Combinator::Or => results.any(|pass| pass),
        }
    }
}

/// Keep the rows of `rows` that satisfy `tree`. Input rows are not modified.
pub fn apply(
    rows: &[Row],
    tree: &FilterTree,
    stage: Stage,
    ledger: &mut DiagnosticLedger,
) -> Vec<Row> {
    let filter = CompiledFilter::compile(tree, stage, ledger);
    rows.iter()
        .filter(|row| filter.matches(row))
        .cloned()
        .collect()
}

fn compile_rule(rule: &FilterRule, stage: Stage, ledger: &mut DiagnosticLedger) -> Predicate {
    let malformed = |ledger: &mut DiagnosticLedger, detail: String| {
        ledger.record(
            stage,
            DiagnosticKind::MalformedFilterValue,
            rule.field.clone(),
            detail,
        );
        Predicate::PassThrough
    };

    match (&rule.operator, &rule.value) {
        (FilterOperator::Unknown(raw), _) => {
            ledger.record(
                stage,
                DiagnosticKind::UnknownOperator,
                rule.field.clone(),
                format!("unknown operator {raw:?}; rule passes every row"),
            );
            Predicate::PassThrough
        }
        (FilterOperator::IsNull, _) => Predicate::IsNull,
        (FilterOperator::IsNotNull, _) => Predicate::IsNotNull,
        (FilterOperator::Compare(op), Some(FilterValue::One(value))) => {
            Predicate::Compare(*op, value.clone())
        }
        (FilterOperator::In, Some(FilterValue::List(values))) => Predicate::Membership {
            values: values.clone(),
            negate: false,
        },
        (FilterOperator::NotIn, Some(FilterValue::List(values))) => Predicate::Membership {
            values: values.clone(),
            negate: true,
        },
        (FilterOperator::In, Some(FilterValue::One(value))) => Predicate::Membership {
            values: vec![value.clone()],
            negate: false,
        },
        (FilterOperator::NotIn, Some(FilterValue::One(value))) => Predicate::Membership {
            values: vec![value.clone()],
            negate: true,
        },
        (FilterOperator::Text(op), Some(FilterValue::One(Scalar::Utf8(needle)))) => {
            Predicate::Text(*op, needle.clone())
        }
        (FilterOperator::Between, Some(FilterValue::List(bounds))) if bounds.len() == 2 => {
            Predicate::Between(bounds[0].clone(), bounds[1].clone())
        }
        (operator, Some(value)) => malformed(
            ledger,
            format!("operator {operator} cannot use operand {value:?}; rule passes every row"),
        ),
        (operator, None) => malformed(
            ledger,
            format!("operator {operator} requires a value; rule passes every row"),
        ),
    }
}

/// Timestamp fields compare against date strings by instant.
fn coerce_operand(field: &Scalar, operand: &Scalar) -> Scalar {
    match (field, operand) {
        (Scalar::Timestamp(_), Scalar::Utf8(raw)) => {
            dq_types::parse_timestamp(raw).map_or_else(|| operand.clone(), Scalar::Timestamp)
        }
        _ => operand.clone(),
    }
}

/// Numbers compare with numbers; every other kind only with itself.
fn same_kind(left: &Scalar, right: &Scalar) -> bool {
    (left.is_numeric() && right.is_numeric()) || left.dtype() == right.dtype()
}

/// Type-mismatched comparisons are false for every operator, `!=` included.
fn eval_compare(op: ComparisonOp, field: &Scalar, operand: &Scalar) -> bool {
    if field.is_null() || operand.is_null() {
        return false;
    }
    let operand = coerce_operand(field, operand);
    if !same_kind(field, &operand) {
        return false;
    }
    match op {
        ComparisonOp::Eq => field.semantic_eq(&operand),
        ComparisonOp::Ne => !field.semantic_eq(&operand),
        ComparisonOp::Lt => field.compare(&operand) == Some(Ordering::Less),
        ComparisonOp::Gt => field.compare(&operand) == Some(Ordering::Greater),
        ComparisonOp::Le => matches!(
            field.compare(&operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ComparisonOp::Ge => matches!(
            field.compare(&operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

fn eval_predicate(predicate: &Predicate, field: &Scalar) -> bool {
    match predicate {
        Predicate::PassThrough => true,
        Predicate::IsNull => field.is_null(),
        Predicate::IsNotNull => !field.is_null(),
        _ if field.is_null() => false,
        Predicate::Compare(op, operand) => eval_compare(*op, field, operand),
        Predicate::Membership { values, negate: false } => values
            .iter()
            .any(|candidate| eval_compare(ComparisonOp::Eq, field, candidate)),
        Predicate::Membership { values, negate: true } => values
            .iter()
            .all(|candidate| eval_compare(ComparisonOp::Ne, field, candidate)),
        Predicate::Text(op, needle) => match field.as_str() {
            Some(haystack) => match op {
                TextOp::Contains => haystack.contains(needle.as_str()),
                TextOp::StartsWith => haystack.starts_with(needle.as_str()),
                TextOp::EndsWith => haystack.ends_with(needle.as_str()),
            },
            None => false,
        },
        Predicate::Between(low, high) => {
            eval_compare(ComparisonOp::Ge, field, low) && eval_compare(ComparisonOp::Le, field, high)
        }
    }
}
