#![forbid(unsafe_code)]

//! Declarative dashboard queries over in-memory rows.
//!
//! A [`PipelineSpec`] names group-by dimensions, aggregated and calculated
//! measures, a filter tree, sort keys and a limit. [`run_pipeline`] evaluates
//! it synchronously; [`QueryEngine`] wraps the same pipeline with a TTL cache
//! and coalesces concurrent identical requests.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

pub use dq_cache::{
    CacheConfig, CacheKey, CacheStats, CachedResult, EngineError, FetchError, FetchFuture,
    FnSource, InlineSource, OutputMetadata, PipelineFailure, PipelineOutput, PipelineRequest,
    QueryCache, QueryEngine, RowSource, SourceRows,
};
pub use dq_expr::{
    BinaryOp, EvalContext, Expr, ExpressionError, eval_str, evaluate, parse_expr, validate_source,
};
pub use dq_filter::{
    ClassifiedFilters, Combinator, ComparisonOp, CompiledFilter, FilterOperator, FilterRule,
    FilterTree, FilterValue, TextOp, classify,
};
pub use dq_groupby::{
    AggregateFunction, AggregateSpec, AggregationError, Dimension, DimensionSource, TimeGrain,
    group_rows,
};
pub use dq_io::{IoError, read_csv_str, read_json_rows_str, write_csv_string};
pub use dq_pipeline::{
    CalculatedMeasure, Measure, MeasureSpec, PipelineError, PipelineSpec, SortDirection, SortKey,
    SpecError, ValidatedPipeline, run_pipeline,
};
pub use dq_runtime::{
    Diagnostic, DiagnosticKind, DiagnosticLedger, RuntimeMode, RuntimePolicy, Stage,
    ZeroLimitMode,
};
pub use dq_types::{DType, Row, Scalar, TypeError};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Rows(#[from] IoError),
    #[error("request for {source_id:?} has both `rows` and `csv`")]
    AmbiguousRows { source_id: String },
    #[error("request for {source_id:?} has neither `rows` nor `csv`")]
    MissingRows { source_id: String },
}

/// A self-contained request as read by the `dashquery` binary: inline data
/// plus a resolved pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryRequest {
    /// Data-source identity; part of the cache key.
    pub source: String,
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
    #[serde(default)]
    pub csv: Option<String>,
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub bypass_cache: bool,
}

impl QueryRequest {
    pub fn from_json_str(input: &str) -> Result<Self, RequestError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, RequestError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn load_rows(&self) -> Result<Vec<Row>, RequestError> {
        match (&self.rows, &self.csv) {
            (Some(rows), None) => Ok(rows.clone()),
            (None, Some(csv)) => Ok(read_csv_str(csv)?),
            (Some(_), Some(_)) => Err(RequestError::AmbiguousRows {
                source_id: self.source.clone(),
            }),
            (None, None) => Err(RequestError::MissingRows {
                source_id: self.source.clone(),
            }),
        }
    }

    pub fn into_pipeline_request(self) -> Result<PipelineRequest, RequestError> {
        let rows = self.load_rows()?;
        let source: Arc<dyn RowSource> = Arc::new(InlineSource::new(self.source, rows));
        let mut request = PipelineRequest::new(source, self.pipeline);
        request.bypass_cache = self.bypass_cache;
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    PrettyJson,
    /// Rows only, as CSV.
    Csv,
}

pub fn render_output(output: &PipelineOutput, format: OutputFormat) -> Result<String, RequestError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string(output)?),
        OutputFormat::PrettyJson => Ok(serde_json::to_string_pretty(output)?),
        OutputFormat::Csv => Ok(write_csv_string(&output.rows)?),
    }
}
