#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use dq_expr::{EvalContext, Expr, ExpressionError, evaluate, parse_expr};
use dq_filter::{ClassifiedFilters, CompiledFilter, FilterTree, classify};
use dq_groupby::{AggregateFunction, AggregateSpec, AggregationError, Dimension, group_rows};
use dq_runtime::{DiagnosticKind, DiagnosticLedger, RuntimePolicy, Stage};
use dq_types::{Row, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Wire format ─────────────────────────────────────────────────────────

/// A measure as written by dashboard authors: either `column` + `aggregation`
/// or `expression`, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl MeasureSpec {
    pub fn aggregated(
        column: impl Into<String>,
        aggregation: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: Some(column.into()),
            aggregation: Some(aggregation.into()),
            expression: None,
        }
    }

    pub fn calculated(expression: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: None,
            aggregation: None,
            expression: Some(expression.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Fully resolved pipeline definition (no parameter placeholders).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub measures: Vec<MeasureSpec>,
    #[serde(default)]
    pub filters: FilterTree,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("dimension or measure has an empty name")]
    EmptyName,
    #[error("output name {0:?} is declared more than once")]
    DuplicateName(String),
    #[error("measure {measure:?} has neither `column` nor `expression`")]
    MissingSource { measure: String },
    #[error("measure {measure:?} has both `column` and `expression`")]
    AmbiguousSource { measure: String },
    #[error("measure {measure:?} has a `column` but no `aggregation`")]
    MissingAggregation { measure: String },
    #[error("measure {measure:?} references {field:?}, which is declared at or after it")]
    ForwardReference { measure: String, field: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

// ── Validated form ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedMeasure {
    pub name: String,
    pub expression: String,
    /// Parse result; a formula that does not parse degrades to `null`.
    pub compiled: Result<Expr, ExpressionError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Measure {
    Aggregated(AggregateSpec),
    Calculated(CalculatedMeasure),
}

impl Measure {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Aggregated(spec) => &spec.name,
            Self::Calculated(calc) => &calc.name,
        }
    }
}

/// A pipeline that passed validation; executing it cannot fail.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPipeline {
    pub dimensions: Vec<Dimension>,
    pub measures: Vec<Measure>,
    pub filters: ClassifiedFilters,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl PipelineSpec {
    #[must_use]
    pub fn dimension_names(&self) -> BTreeSet<String> {
        self.dimensions.iter().map(|d| d.name().to_owned()).collect()
    }

    #[must_use]
    pub fn measure_names(&self) -> BTreeSet<String> {
        self.measures.iter().map(|m| m.name.clone()).collect()
    }

    /// Resolve measures into their tagged form, check names and references,
    /// and classify filters. Unknown filter fields are reported to `ledger`.
    pub fn validate(
        &self,
        policy: &RuntimePolicy,
        ledger: &mut DiagnosticLedger,
    ) -> Result<ValidatedPipeline, PipelineError> {
        let mut seen = BTreeSet::new();
        for name in self
            .dimensions
            .iter()
            .map(Dimension::name)
            .chain(self.measures.iter().map(|m| m.name.as_str()))
        {
            if name.trim().is_empty() {
                return Err(SpecError::EmptyName.into());
            }
            if !seen.insert(name) {
                return Err(SpecError::DuplicateName(name.to_owned()).into());
            }
        }

        let positions = self
            .measures
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.name.as_str(), idx))
            .collect::<BTreeMap<_, _>>();

        let mut measures = Vec::with_capacity(self.measures.len());
        for (idx, spec) in self.measures.iter().enumerate() {
            measures.push(resolve_measure(spec, idx, &positions, policy)?);
        }

        let filters = classify(
            &self.filters,
            &self.dimension_names(),
            &self.measure_names(),
            ledger,
        );

        Ok(ValidatedPipeline {
            dimensions: self.dimensions.clone(),
            measures,
            filters,
            sort: self.sort.clone(),
            limit: self.limit,
        })
    }
}

fn resolve_measure(
    spec: &MeasureSpec,
    idx: usize,
    positions: &BTreeMap<&str, usize>,
    policy: &RuntimePolicy,
) -> Result<Measure, PipelineError> {
    match (&spec.column, &spec.expression) {
        (None, None) => Err(SpecError::MissingSource {
            measure: spec.name.clone(),
        }
        .into()),
        (Some(_), Some(_)) => Err(SpecError::AmbiguousSource {
            measure: spec.name.clone(),
        }
        .into()),
        (Some(column), None) => {
            let Some(aggregation) = &spec.aggregation else {
                return Err(SpecError::MissingAggregation {
                    measure: spec.name.clone(),
                }
                .into());
            };
            let function = aggregation.parse::<AggregateFunction>()?;
            Ok(Measure::Aggregated(AggregateSpec::new(
                column.clone(),
                function,
                spec.name.clone(),
            )))
        }
        (None, Some(expression)) => {
            let compiled = parse_expr(expression, policy);
            if let Ok(expr) = &compiled {
                for field in expr.field_refs() {
                    if positions.get(field.as_str()).is_some_and(|pos| *pos >= idx) {
                        return Err(SpecError::ForwardReference {
                            measure: spec.name.clone(),
                            field,
                        }
                        .into());
                    }
                }
            }
            Ok(Measure::Calculated(CalculatedMeasure {
                name: spec.name.clone(),
                expression: expression.clone(),
                compiled,
            }))
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────

impl ValidatedPipeline {
    fn aggregate_specs(&self) -> Vec<AggregateSpec> {
        self.measures
            .iter()
            .filter_map(|m| match m {
                Measure::Aggregated(spec) => Some(spec.clone()),
                Measure::Calculated(_) => None,
            })
            .collect()
    }

    /// Filter, group, resolve calculated measures, filter again, sort and limit.
    ///
    /// `rows` is read-only; every output row is freshly built.
    pub fn execute(
        &self,
        rows: &[Row],
        policy: &RuntimePolicy,
        ledger: &mut DiagnosticLedger,
    ) -> Vec<Row> {
        let derived;
        let base = if self.dimensions.iter().any(Dimension::is_computed) {
            derived = dq_groupby::materialize_dimensions(rows, &self.dimensions);
            derived.as_slice()
        } else {
            rows
        };

        let pre = CompiledFilter::compile(&self.filters.pre, Stage::PreFilter, ledger);
        let kept = base.iter().filter(|row| pre.matches(row));
        let aggregates = self.aggregate_specs();
        let grouped = group_rows(kept, &self.dimensions, &aggregates);
        tracing::debug!(
            input_rows = rows.len(),
            groups = grouped.len(),
            "grouped rows"
        );

        let mut resolved = resolve_measures(grouped, &self.dimensions, &self.measures, ledger);

        let post = CompiledFilter::compile(&self.filters.post, Stage::PostFilter, ledger);
        if !post.is_empty() {
            resolved.retain(|row| post.matches(row));
        }

        sort_rows(&mut resolved, &self.sort);
        apply_limit(&mut resolved, self.limit, policy);
        tracing::debug!(output_rows = resolved.len(), "pipeline finished");
        resolved
    }
}

/// Validate `spec` and run it over `rows`.
pub fn run_pipeline(
    rows: &[Row],
    spec: &PipelineSpec,
    policy: &RuntimePolicy,
    ledger: &mut DiagnosticLedger,
) -> Result<Vec<Row>, PipelineError> {
    let pipeline = spec.validate(policy, ledger)?;
    Ok(pipeline.execute(rows, policy, ledger))
}

struct MeasureFailure {
    error: ExpressionError,
    rows: usize,
}

/// Evaluate calculated measures in declaration order and lay each row out as
/// dimensions followed by measures.
///
/// An expression sees the row's dimension values and the measures declared
/// before it. A failing expression leaves `null` in that row; each failing
/// measure is reported once with the number of affected rows.
pub fn resolve_measures(
    grouped: Vec<Row>,
    dimensions: &[Dimension],
    measures: &[Measure],
    ledger: &mut DiagnosticLedger,
) -> Vec<Row> {
    let total = grouped.len();
    let mut failures = BTreeMap::<&str, MeasureFailure>::new();

    let out = grouped
        .into_iter()
        .map(|row| {
            let mut out = Row::with_capacity(dimensions.len() + measures.len());
            let mut context = EvalContext::new();
            for dimension in dimensions {
                let value = row.value(dimension.name());
                context.insert_scalar(dimension.name(), value);
                out.insert(dimension.name(), value.clone());
            }

            for measure in measures {
                let value = match measure {
                    Measure::Aggregated(spec) => row.value(&spec.name).clone(),
                    Measure::Calculated(calc) => {
                        let result = calc
                            .compiled
                            .as_ref()
                            .map_err(Clone::clone)
                            .and_then(|expr| evaluate(expr, &context));
                        match result {
                            Ok(number) => Scalar::Float64(number),
                            Err(error) => {
                                failures
                                    .entry(calc.name.as_str())
                                    .or_insert(MeasureFailure { error, rows: 0 })
                                    .rows += 1;
                                Scalar::Null
                            }
                        }
                    }
                };
                context.insert_scalar(measure.name(), &value);
                out.insert(measure.name(), value);
            }
            out
        })
        .collect::<Vec<_>>();

    for (name, failure) in failures {
        ledger.record(
            Stage::Calculate,
            DiagnosticKind::ExpressionFailure,
            name,
            format!(
                "{} (first failure); null in {} of {} rows",
                failure.error, failure.rows, total
            ),
        );
    }
    out
}

fn compare_for_sort(left: &Scalar, right: &Scalar, direction: SortDirection) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = left.total_cmp(right);
            match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }
    }
}

/// Stable multi-key sort; nulls go last whatever the direction.
pub fn sort_rows(rows: &mut [Row], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        keys.iter()
            .map(|key| compare_for_sort(a.value(&key.field), b.value(&key.field), key.direction))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

/// Keep the head of `rows`. How `limit: 0` behaves is a policy choice.
pub fn apply_limit(rows: &mut Vec<Row>, limit: Option<usize>, policy: &RuntimePolicy) {
    if let Some(cap) = policy.effective_limit(limit) {
        rows.truncate(cap);
    }
}
