#![forbid(unsafe_code)]

use dq_conformance::{HarnessConfig, SuiteOptions, enforce_green, run_fixture_suite, write_report};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut case_filter: Option<String> = None;
    let mut fixture_root: Option<String> = None;
    let mut write_artifacts = false;
    let mut require_green = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case" => {
                let value = args
                    .next()
                    .ok_or("--case requires a value (e.g. revenue_by_region)")?;
                case_filter = Some(value);
            }
            "--fixtures" => {
                fixture_root = Some(args.next().ok_or("--fixtures requires a directory")?);
            }
            "--write-report" => {
                write_artifacts = true;
            }
            "--require-green" => {
                require_green = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config.fixture_root = root.into();
    }
    let options = SuiteOptions { case_filter };

    let report = run_fixture_suite(&config, &options)?;
    for result in &report.results {
        match &result.mismatch {
            None => println!("case={} mode={:?} status=pass", result.case_id, result.mode),
            Some(mismatch) => println!(
                "case={} mode={:?} status=fail mismatch={mismatch}",
                result.case_id, result.mode
            ),
        }
    }
    println!(
        "suite={} fixtures={} passed={} failed={} green={}",
        report.suite,
        report.fixture_count,
        report.passed,
        report.failed,
        report.is_green()
    );

    if write_artifacts {
        let written = write_report(&config, &report)?;
        println!(
            "wrote report={} hash={}",
            written.path.display(),
            written.report_hash
        );
    }

    if require_green {
        enforce_green(&report)?;
    }

    Ok(())
}

fn print_help() {
    println!(
        "dq-conformance-cli\n\
         Usage:\n\
         \tdq-conformance-cli [--case <id>] [--fixtures <dir>] [--write-report] [--require-green]\n\
         Options:\n\
         \t--case <id>        Run only one fixture case\n\
         \t--fixtures <dir>   Read fixtures from <dir> instead of the bundled set\n\
         \t--write-report     Write artifacts/conformance/report.json\n\
         \t--require-green    Fail with non-zero exit when any case fails\n\
         \t-h, --help         Show this help"
    );
}
