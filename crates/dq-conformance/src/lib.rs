#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dq_pipeline::{PipelineError, PipelineSpec, run_pipeline};
use dq_runtime::{DiagnosticKind, DiagnosticLedger, RuntimeMode, RuntimePolicy, now_unix_ms};
use dq_types::{Row, Scalar};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Relative tolerance for float cells; aggregated sums are not always
/// bit-identical to a hand-written expectation.
const FLOAT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub artifact_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let crate_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        Self {
            fixture_root: crate_root.join("fixtures"),
            artifact_root: crate_root.join("../../artifacts/conformance"),
        }
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.artifact_root.join("report.json")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    pub case_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedErrorKind {
    Spec,
    Aggregation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedError {
    pub kind: ExpectedErrorKind,
    /// Substring the rendered error must contain.
    #[serde(default)]
    pub contains: Option<String>,
}

fn default_mode() -> RuntimeMode {
    RuntimeMode::Permissive
}

fn default_ordered() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFixture {
    pub case_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mode")]
    pub mode: RuntimeMode,
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
    #[serde(default)]
    pub csv: Option<String>,
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub expected_rows: Option<Vec<Row>>,
    /// When false, expected rows may appear in any order.
    #[serde(default = "default_ordered")]
    pub ordered: bool,
    #[serde(default)]
    pub expected_error: Option<ExpectedError>,
    /// Diagnostic kinds the run must record, as a multiset. Absent means none.
    #[serde(default)]
    pub expected_diagnostics: Vec<DiagnosticKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub mode: RuntimeMode,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    pub diagnostic_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub case_filter: Option<String>,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }

    #[must_use]
    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results
            .iter()
            .filter(|result| result.status == CaseStatus::Fail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenReport {
    pub path: PathBuf,
    pub report_hash: String,
    pub generated_unix_ms: u64,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Load(#[from] dq_io::IoError),
    #[error(transparent)]
    Runtime(#[from] dq_runtime::RuntimeError),
    #[error("fixture {path}: {message}")]
    FixtureFormat { path: String, message: String },
    #[error("{failed} of {total} conformance cases failed")]
    NotGreen { failed: usize, total: usize },
}

pub fn run_fixture_suite(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, options.case_filter.as_deref())?;
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in &fixtures {
        results.push(run_fixture(fixture)?);
    }

    let failed = results
        .iter()
        .filter(|result| result.status == CaseStatus::Fail)
        .count();
    tracing::debug!(cases = results.len(), failed, "conformance suite finished");

    Ok(SuiteReport {
        suite: "pipeline".to_owned(),
        case_filter: options.case_filter.clone(),
        fixture_count: results.len(),
        passed: results.len().saturating_sub(failed),
        failed,
        results,
    })
}

/// Fail with [`HarnessError::NotGreen`] unless every case passed.
pub fn enforce_green(report: &SuiteReport) -> Result<(), HarnessError> {
    if report.is_green() {
        Ok(())
    } else {
        Err(HarnessError::NotGreen {
            failed: report.failed,
            total: report.fixture_count,
        })
    }
}

/// Write `report` as pretty JSON under the artifact root.
pub fn write_report(
    config: &HarnessConfig,
    report: &SuiteReport,
) -> Result<WrittenReport, HarnessError> {
    let body = serde_json::to_vec_pretty(report)?;
    let path = config.report_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, &body)?;
    Ok(WrittenReport {
        path,
        report_hash: format!("sha256:{}", hash_bytes(&body)),
        generated_unix_ms: now_unix_ms()?,
    })
}

pub fn run_fixture(fixture: &PipelineFixture) -> Result<CaseResult, HarnessError> {
    let policy = RuntimePolicy::for_mode(fixture.mode);
    let rows = fixture_rows(fixture)?;

    let mut ledger = DiagnosticLedger::new();
    let outcome = run_pipeline(&rows, &fixture.pipeline, &policy, &mut ledger);
    let mismatch = check_outcome(fixture, outcome, &ledger).err();

    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        mode: fixture.mode,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        diagnostic_records: ledger.records().len(),
    })
}

fn fixture_rows(fixture: &PipelineFixture) -> Result<Vec<Row>, HarnessError> {
    match (&fixture.rows, &fixture.csv) {
        (Some(rows), None) => Ok(rows.clone()),
        (None, Some(csv)) => Ok(dq_io::read_csv_str(csv)?),
        (None, None) => Ok(Vec::new()),
        (Some(_), Some(_)) => Err(HarnessError::FixtureFormat {
            path: fixture.case_id.clone(),
            message: "`rows` and `csv` are mutually exclusive".to_owned(),
        }),
    }
}

fn check_outcome(
    fixture: &PipelineFixture,
    outcome: Result<Vec<Row>, PipelineError>,
    ledger: &DiagnosticLedger,
) -> Result<(), String> {
    match (outcome, &fixture.expected_error) {
        (Ok(actual), None) => {
            if let Some(expected) = &fixture.expected_rows {
                compare_rows(&actual, expected, fixture.ordered)?;
            }
            compare_diagnostics(ledger, &fixture.expected_diagnostics)
        }
        (Ok(actual), Some(expected)) => Err(format!(
            "expected {:?} error, pipeline returned {} rows",
            expected.kind,
            actual.len()
        )),
        (Err(err), None) => Err(format!("unexpected error: {err}")),
        (Err(err), Some(expected)) => {
            let kind = match err {
                PipelineError::Spec(_) => ExpectedErrorKind::Spec,
                PipelineError::Aggregation(_) => ExpectedErrorKind::Aggregation,
            };
            if kind != expected.kind {
                return Err(format!(
                    "error kind mismatch: actual={kind:?}, expected={:?} ({err})",
                    expected.kind
                ));
            }
            let rendered = err.to_string();
            match &expected.contains {
                Some(needle) if !rendered.contains(needle.as_str()) => Err(format!(
                    "error message {rendered:?} does not contain {needle:?}"
                )),
                _ => Ok(()),
            }
        }
    }
}

fn compare_rows(actual: &[Row], expected: &[Row], ordered: bool) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "row count mismatch: actual={}, expected={}",
            actual.len(),
            expected.len()
        ));
    }

    if ordered {
        for (idx, (left, right)) in actual.iter().zip(expected).enumerate() {
            rows_match(left, right).map_err(|detail| format!("row {idx}: {detail}"))?;
        }
        return Ok(());
    }

    let mut unused = (0..actual.len()).collect::<Vec<_>>();
    for (idx, wanted) in expected.iter().enumerate() {
        let Some(slot) = unused
            .iter()
            .position(|&candidate| rows_match(&actual[candidate], wanted).is_ok())
        else {
            return Err(format!("expected row {idx} not found: {}", wanted.to_json()));
        };
        unused.swap_remove(slot);
    }
    Ok(())
}

fn rows_match(actual: &Row, expected: &Row) -> Result<(), String> {
    let actual_names = actual.field_names().collect::<Vec<_>>();
    let expected_names = expected.field_names().collect::<Vec<_>>();
    if actual_names != expected_names {
        return Err(format!(
            "field mismatch: actual={actual_names:?}, expected={expected_names:?}"
        ));
    }
    for (name, want) in expected.iter() {
        let got = actual.value(name);
        if !scalars_match(got, want) {
            return Err(format!("value mismatch for {name}: actual={got}, expected={want}"));
        }
    }
    Ok(())
}

fn scalars_match(actual: &Scalar, expected: &Scalar) -> bool {
    if actual.semantic_eq(expected) {
        return true;
    }
    match (actual, expected) {
        (Scalar::Float64(_) | Scalar::Int64(_), Scalar::Float64(_) | Scalar::Int64(_)) => {
            let (Ok(a), Ok(b)) = (actual.to_f64(), expected.to_f64()) else {
                return false;
            };
            (a - b).abs() <= FLOAT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
        }
        // Expected timestamps arrive from JSON as strings.
        (Scalar::Timestamp(a), Scalar::Utf8(_)) => expected.as_timestamp() == Some(*a),
        _ => false,
    }
}

fn tally(kinds: impl Iterator<Item = DiagnosticKind>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for kind in kinds {
        *counts.entry(format!("{kind:?}")).or_default() += 1;
    }
    counts
}

fn compare_diagnostics(
    ledger: &DiagnosticLedger,
    expected: &[DiagnosticKind],
) -> Result<(), String> {
    let actual = tally(ledger.records().iter().map(|record| record.kind));
    let wanted = tally(expected.iter().copied());
    if actual == wanted {
        Ok(())
    } else {
        Err(format!(
            "diagnostic mismatch: actual={actual:?}, expected={wanted:?}"
        ))
    }
}

fn load_fixtures(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<PipelineFixture>, HarnessError> {
    let mut fixtures = Vec::new();
    for path in list_fixture_files(&config.fixture_root)? {
        let fixture = load_fixture(&path)?;
        if case_filter.is_none_or(|case| fixture.case_id == case) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

fn load_fixture(path: &Path) -> Result<PipelineFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    serde_json::from_str(&body).map_err(|err| HarnessError::FixtureFormat {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use dq_runtime::DiagnosticKind;
    use dq_types::{Row, Scalar};

    use super::{
        CaseStatus, HarnessConfig, PipelineFixture, SuiteOptions, compare_rows, enforce_green,
        run_fixture, run_fixture_suite, scalars_match, write_report,
    };

    fn fixture(json: serde_json::Value) -> PipelineFixture {
        serde_json::from_value(json).expect("fixture")
    }

    #[test]
    fn bundled_suite_is_green() {
        let cfg = HarnessConfig::default_paths();
        let report = run_fixture_suite(&cfg, &SuiteOptions::default()).expect("suite should run");
        assert!(report.fixture_count >= 10, "expected bundled fixtures");
        assert!(report.is_green(), "expected green report: {report:#?}");
        enforce_green(&report).expect("green");
    }

    #[test]
    fn case_filter_runs_one_case() {
        let cfg = HarnessConfig::default_paths();
        let options = SuiteOptions {
            case_filter: Some("revenue_by_region".to_owned()),
        };
        let report = run_fixture_suite(&cfg, &options).expect("suite");
        assert_eq!(report.fixture_count, 1);
        assert_eq!(report.results[0].case_id, "revenue_by_region");
    }

    #[test]
    fn wrong_expectation_is_reported_not_raised() {
        let case = fixture(serde_json::json!({
            "case_id": "wrong",
            "rows": [{ "region": "North", "revenue": 10 }],
            "pipeline": {
                "dimensions": ["region"],
                "measures": [{ "column": "revenue", "aggregation": "sum", "name": "total" }]
            },
            "expected_rows": [{ "region": "North", "total": 11 }]
        }));
        let result = run_fixture(&case).expect("runs");
        assert_eq!(result.status, CaseStatus::Fail);
        assert!(result.mismatch.expect("mismatch").contains("value mismatch for total"));
    }

    #[test]
    fn missing_diagnostic_fails_the_case() {
        let mut case = fixture(serde_json::json!({
            "case_id": "diag",
            "rows": [{ "region": "North", "revenue": 10 }],
            "pipeline": {
                "dimensions": ["region"],
                "measures": [{ "column": "revenue", "aggregation": "sum", "name": "total" }]
            },
            "expected_rows": [{ "region": "North", "total": 10 }]
        }));
        assert_eq!(run_fixture(&case).expect("runs").status, CaseStatus::Pass);

        case.expected_diagnostics = vec![DiagnosticKind::UnknownFilterField];
        assert_eq!(run_fixture(&case).expect("runs").status, CaseStatus::Fail);
    }

    #[test]
    fn unordered_comparison_ignores_order_but_not_multiplicity() {
        let a = Row::from_pairs([("k", Scalar::Int64(1))]);
        let b = Row::from_pairs([("k", Scalar::Int64(2))]);
        assert!(compare_rows(&[a.clone(), b.clone()], &[b.clone(), a.clone()], false).is_ok());
        assert!(compare_rows(&[a.clone(), b.clone()], &[b.clone(), a.clone()], true).is_err());
        assert!(compare_rows(&[a.clone(), a.clone()], &[a, b], false).is_err());
    }

    #[test]
    fn float_cells_compare_with_tolerance() {
        assert!(scalars_match(&Scalar::Float64(0.1 + 0.2), &Scalar::Float64(0.3)));
        assert!(scalars_match(&Scalar::Float64(2500.0), &Scalar::Int64(2500)));
        assert!(!scalars_match(&Scalar::Float64(2500.1), &Scalar::Int64(2500)));
        assert!(!scalars_match(&Scalar::from("1"), &Scalar::Int64(1)));
    }

    #[test]
    fn report_is_written_with_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = HarnessConfig {
            artifact_root: dir.path().join("out"),
            ..HarnessConfig::default_paths()
        };
        let report = run_fixture_suite(&cfg, &SuiteOptions::default()).expect("suite");
        let written = write_report(&cfg, &report).expect("write");
        assert!(written.path.exists());
        assert!(written.report_hash.starts_with("sha256:"));
        assert_eq!(written.report_hash.len(), "sha256:".len() + 64);
    }
}
