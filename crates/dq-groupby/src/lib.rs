#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Timelike, Utc};
use dq_types::{DType, Row, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("unknown aggregation function: {0}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
    First,
    Last,
}

impl AggregateFunction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = AggregationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" | "mean" | "average" => Ok(Self::Avg),
            "count" => Ok(Self::Count),
            "count_distinct" | "count-distinct" | "distinct" => Ok(Self::CountDistinct),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            _ => Err(AggregationError::UnknownFunction(name.to_owned())),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub column: String,
    pub function: AggregateFunction,
    pub name: String,
}

impl AggregateSpec {
    pub fn new(column: impl Into<String>, function: AggregateFunction, name: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            function,
            name: name.into(),
        }
    }
}

// ── Dimensions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Hour,
    Day,
    /// ISO week, starting Monday.
    Week,
    Month,
    Quarter,
    Year,
}

/// Truncate an instant to the start of its `grain` bucket (UTC).
#[must_use]
pub fn truncate_timestamp(ts: DateTime<Utc>, grain: TimeGrain) -> Option<DateTime<Utc>> {
    let date = ts.date_naive();
    let start = match grain {
        TimeGrain::Hour => return date.and_hms_opt(ts.hour(), 0, 0).map(|n| n.and_utc()),
        TimeGrain::Day => date,
        TimeGrain::Week => {
            date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))?
        }
        TimeGrain::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?,
        TimeGrain::Quarter => {
            let month = ((date.month() - 1) / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), month, 1)?
        }
        TimeGrain::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
    };
    start.and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DimensionSource {
    DateTrunc { field: String, grain: TimeGrain },
}

fn default_output_type() -> DType {
    DType::Timestamp
}

/// A group-by key: a plain field, or a named field computed from the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    Field(String),
    Computed {
        name: String,
        source: DimensionSource,
        #[serde(default = "default_output_type")]
        output_type: DType,
    },
}

impl Dimension {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn date_trunc(name: impl Into<String>, field: impl Into<String>, grain: TimeGrain) -> Self {
        Self::Computed {
            name: name.into(),
            source: DimensionSource::DateTrunc {
                field: field.into(),
                grain,
            },
            output_type: DType::Timestamp,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Field(name) | Self::Computed { name, .. } => name,
        }
    }

    #[must_use]
    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed { .. })
    }

    /// The dimension's value for `row`. Unparseable computed inputs give `null`.
    #[must_use]
    pub fn evaluate(&self, row: &Row) -> Scalar {
        match self {
            Self::Field(name) => row.value(name).clone(),
            Self::Computed {
                source: DimensionSource::DateTrunc { field, grain },
                output_type,
                ..
            } => row
                .value(field)
                .as_timestamp()
                .and_then(|ts| truncate_timestamp(ts, *grain))
                .map_or(Scalar::Null, |start| render_bucket(start, *grain, *output_type)),
        }
    }
}

fn render_bucket(start: DateTime<Utc>, grain: TimeGrain, output_type: DType) -> Scalar {
    match output_type {
        DType::Utf8 => {
            let pattern = match grain {
                TimeGrain::Hour => "%Y-%m-%dT%H:00:00Z",
                _ => "%Y-%m-%d",
            };
            Scalar::Utf8(start.format(pattern).to_string())
        }
        DType::Int64 => Scalar::Int64(start.timestamp_millis()),
        _ => Scalar::Timestamp(start),
    }
}

/// Append computed dimension values to each row (plain fields are already
/// present). Returns copies; the input is untouched.
#[must_use]
pub fn materialize_dimensions(rows: &[Row], dimensions: &[Dimension]) -> Vec<Row> {
    let computed = dimensions
        .iter()
        .filter(|d| d.is_computed())
        .collect::<Vec<_>>();
    rows.iter()
        .map(|row| {
            let mut out = row.clone();
            for dimension in &computed {
                out.insert(dimension.name(), dimension.evaluate(row));
            }
            out
        })
        .collect()
}

// ── Grouping ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum GroupKey {
    Null,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(String),
    Timestamp(i64, u32),
}

impl GroupKey {
    /// Keys compare by value: integral floats fold onto ints, NaNs share one
    /// key, timestamps compare by instant.
    fn from_scalar(value: &Scalar) -> Self {
        match value {
            Scalar::Null => Self::Null,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => {
                if v.is_nan() {
                    Self::FloatBits(f64::NAN.to_bits())
                } else if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                    Self::Int64(*v as i64)
                } else {
                    Self::FloatBits(v.to_bits())
                }
            }
            Scalar::Utf8(v) => Self::Utf8(v.clone()),
            Scalar::Timestamp(v) => Self::Timestamp(v.timestamp(), v.timestamp_subsec_nanos()),
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(f64),
    Avg { sum: f64, rows: usize },
    Count(i64),
    CountDistinct(HashSet<GroupKey>),
    /// Skips nulls; null only when every value in the group is null.
    Min(Option<Scalar>),
    /// Skips nulls like `Min`. `First` and `Last` keep nulls.
    Max(Option<Scalar>),
    First(Option<Scalar>),
    Last(Scalar),
}

fn numeric_or_zero(value: &Scalar) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Sum => Self::Sum(0.0),
            AggregateFunction::Avg => Self::Avg { sum: 0.0, rows: 0 },
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::CountDistinct => Self::CountDistinct(HashSet::new()),
            AggregateFunction::Min => Self::Min(None),
            AggregateFunction::Max => Self::Max(None),
            AggregateFunction::First => Self::First(None),
            AggregateFunction::Last => Self::Last(Scalar::Null),
        }
    }

    fn push(&mut self, value: &Scalar) {
        match self {
            Self::Sum(sum) => *sum += numeric_or_zero(value),
            Self::Avg { sum, rows } => {
                *sum += numeric_or_zero(value);
                *rows += 1;
            }
            Self::Count(count) => *count += 1,
            Self::CountDistinct(seen) => {
                if !value.is_null() {
                    seen.insert(GroupKey::from_scalar(value));
                }
            }
            Self::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|best| value.total_cmp(best).is_lt())
                {
                    *current = Some(value.clone());
                }
            }
            Self::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|best| value.total_cmp(best).is_gt())
                {
                    *current = Some(value.clone());
                }
            }
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(value.clone());
                }
            }
            Self::Last(current) => *current = value.clone(),
        }
    }

    fn finish(self) -> Scalar {
        match self {
            Self::Sum(sum) => Scalar::Float64(sum),
            Self::Avg { sum, rows } => {
                if rows == 0 {
                    Scalar::Null
                } else {
                    Scalar::Float64(sum / rows as f64)
                }
            }
            Self::Count(count) => Scalar::Int64(count),
            Self::CountDistinct(seen) => Scalar::Int64(seen.len() as i64),
            Self::Min(value) | Self::Max(value) | Self::First(value) => {
                value.unwrap_or(Scalar::Null)
            }
            Self::Last(value) => value,
        }
    }
}

struct Group {
    key_values: Vec<Scalar>,
    accumulators: Vec<Accumulator>,
}

/// Group `rows` by the dimension tuple and compute each aggregate per group.
///
/// Output has one flat row per distinct key, in first-seen order, holding the
/// dimension fields followed by the aggregate outputs. With no dimensions the
/// whole input is one group, and empty input yields no rows.
#[must_use]
pub fn group_rows<'a, I>(rows: I, dimensions: &[Dimension], aggregates: &[AggregateSpec]) -> Vec<Row>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut slot = HashMap::<Vec<GroupKey>, usize>::new();
    let mut groups = Vec::<Group>::new();

    for row in rows {
        let key_values = dimensions
            .iter()
            .map(|dimension| dimension.evaluate(row))
            .collect::<Vec<_>>();
        let key = key_values.iter().map(GroupKey::from_scalar).collect::<Vec<_>>();

        let index = *slot.entry(key).or_insert_with(|| {
            groups.push(Group {
                key_values,
                accumulators: aggregates
                    .iter()
                    .map(|spec| Accumulator::new(spec.function))
                    .collect(),
            });
            groups.len() - 1
        });

        let group = &mut groups[index];
        for (spec, accumulator) in aggregates.iter().zip(group.accumulators.iter_mut()) {
            accumulator.push(row.value(&spec.column));
        }
    }

    groups
        .into_iter()
        .map(|group| {
            let mut out = Row::with_capacity(dimensions.len() + aggregates.len());
            for (dimension, value) in dimensions.iter().zip(group.key_values) {
                out.insert(dimension.name(), value);
            }
            for (spec, accumulator) in aggregates.iter().zip(group.accumulators) {
                out.insert(spec.name.clone(), accumulator.finish());
            }
            out
        })
        .collect()
}
