#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use dashquery::{OutputFormat, QueryCache, QueryEngine, QueryRequest, RuntimePolicy, render_output};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut request_path: Option<PathBuf> = None;
    let mut format = OutputFormat::Json;
    let mut policy = RuntimePolicy::permissive();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--request" => {
                let value = args.next().ok_or("--request requires a file path")?;
                request_path = Some(PathBuf::from(value));
            }
            "--pretty" => {
                format = OutputFormat::PrettyJson;
            }
            "--csv" => {
                format = OutputFormat::Csv;
            }
            "--strict" => {
                policy = RuntimePolicy::strict();
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

    let path = request_path.ok_or("--request is required (see --help)")?;
    let request = QueryRequest::from_path(&path)?.into_pipeline_request()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let engine = QueryEngine::new(Arc::new(QueryCache::default()), policy);
    let output = runtime.block_on(engine.execute(request))?;

    tracing::debug!(
        rows = output.rows.len(),
        diagnostics = output.diagnostics.len(),
        "request finished"
    );
    println!("{}", render_output(&output, format)?);
    Ok(())
}

fn print_help() {
    println!(
        "dashquery\n\
         Usage:\n\
         \tdashquery --request <file.json> [--pretty | --csv] [--strict]\n\
         Request file:\n\
         \t{{ \"source\": \"<id>\", \"rows\": [...] | \"csv\": \"...\", \"pipeline\": {{ ... }} }}\n\
         Options:\n\
         \t--request <file>   Request to run\n\
         \t--pretty           Pretty-print the JSON output\n\
         \t--csv              Print result rows as CSV instead of JSON\n\
         \t--strict           Treat `limit: 0` as zero rows\n\
         \t-h, --help         Show this help"
    );
}
