#![no_main]

use dq_pipeline::{PipelineSpec, run_pipeline};
use dq_runtime::{DiagnosticLedger, RuntimePolicy};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(spec) = serde_json::from_slice::<PipelineSpec>(data) else {
        return;
    };
    let rows = dq_io::read_csv_str(
        "region,revenue,cost,ts\nNorth,1000,400,2024-01-15T00:00:00Z\nSouth,1200,,2024-02-01T00:00:00Z\n,3,1,bad\n",
    )
    .unwrap_or_default();
    let mut ledger = DiagnosticLedger::new();
    let _ = run_pipeline(&rows, &spec, &RuntimePolicy::permissive(), &mut ledger);
});
