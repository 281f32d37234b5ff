use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashquery::{
    DiagnosticKind, DiagnosticLedger, Dimension, FetchError, FilterRule, FilterTree, FnSource,
    InlineSource, MeasureSpec, OutputFormat, PipelineRequest, PipelineSpec, QueryEngine,
    QueryRequest, Row, RowSource, RuntimePolicy, Scalar, SortKey, render_output, run_pipeline,
};
use proptest::prelude::*;

fn row(region: &str, revenue: i64, cost: i64) -> Row {
    Row::from_pairs([
        ("region", Scalar::from(region)),
        ("revenue", Scalar::Int64(revenue)),
        ("cost", Scalar::Int64(cost)),
    ])
}

fn sales() -> Vec<Row> {
    vec![
        row("North", 1000, 400),
        row("North", 1500, 900),
        row("South", 1200, 1000),
        row("East", 300, 100),
    ]
}

fn revenue_by_region() -> PipelineSpec {
    PipelineSpec {
        dimensions: vec![Dimension::field("region")],
        measures: vec![MeasureSpec::aggregated("revenue", "sum", "total_revenue")],
        ..PipelineSpec::default()
    }
}

fn run(rows: &[Row], spec: &PipelineSpec) -> Vec<Row> {
    let mut ledger = DiagnosticLedger::new();
    run_pipeline(rows, spec, &RuntimePolicy::default(), &mut ledger).expect("pipeline")
}

#[test]
fn worked_example_from_three_rows() {
    let rows = vec![
        Row::from_pairs([("region", Scalar::from("North")), ("revenue", Scalar::Int64(1000))]),
        Row::from_pairs([("region", Scalar::from("North")), ("revenue", Scalar::Int64(1500))]),
        Row::from_pairs([("region", Scalar::from("South")), ("revenue", Scalar::Int64(1200))]),
    ];
    let out = run(&rows, &revenue_by_region());

    let mut pairs = out
        .iter()
        .map(|r| {
            (
                r.value("region").as_str().expect("region").to_owned(),
                r.value("total_revenue").to_f64().expect("total"),
            )
        })
        .collect::<Vec<_>>();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        pairs,
        vec![("North".to_owned(), 2500.0), ("South".to_owned(), 1200.0)]
    );
    assert!(out.iter().all(|r| r.len() == 2));
}

#[test]
fn filter_placement_changes_the_answer() {
    // Region rule before grouping, total rule after: North survives with 2500.
    let classified = PipelineSpec {
        filters: FilterTree::and(vec![
            FilterRule::new("region", "=", Scalar::from("North")),
            FilterRule::new("total_revenue", ">", Scalar::Int64(2000)),
        ]),
        ..revenue_by_region()
    };
    let out = run(&sales(), &classified);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value("total_revenue"), &Scalar::Float64(2500.0));

    // Had the total rule been applied per raw row, no single row exceeds 2000.
    let per_row = PipelineSpec {
        filters: FilterTree::and(vec![
            FilterRule::new("region", "=", Scalar::from("North")),
            FilterRule::new("revenue", ">", Scalar::Int64(2000)),
        ]),
        ..revenue_by_region()
    };
    assert!(run(&sales(), &per_row).is_empty());
}

#[test]
fn chained_margin_matches_manual_arithmetic() {
    let spec = PipelineSpec {
        dimensions: vec![Dimension::field("region")],
        measures: vec![
            MeasureSpec::aggregated("revenue", "sum", "revenue"),
            MeasureSpec::aggregated("cost", "sum", "cost"),
            MeasureSpec::calculated("revenue - cost", "profit"),
            MeasureSpec::calculated("profit / revenue", "margin"),
        ],
        ..PipelineSpec::default()
    };
    for out in run(&sales(), &spec) {
        let revenue = out.value("revenue").to_f64().expect("revenue");
        let cost = out.value("cost").to_f64().expect("cost");
        assert_eq!(out.value("profit"), &Scalar::Float64(revenue - cost));
        assert_eq!(out.value("margin"), &Scalar::Float64((revenue - cost) / revenue));
    }
}

#[test]
fn sort_then_limit_two_regions() {
    let spec = PipelineSpec {
        sort: vec![SortKey::asc("region")],
        limit: Some(2),
        ..revenue_by_region()
    };
    let out = run(&sales(), &spec);
    let regions = out
        .iter()
        .map(|r| r.value("region").as_str().expect("region").to_owned())
        .collect::<Vec<_>>();
    assert_eq!(regions, vec!["East", "North"]);
}

#[test]
fn groups_keep_discovery_order_without_sort_keys() {
    let out = run(&sales(), &revenue_by_region());
    let regions = out
        .iter()
        .map(|r| r.value("region").as_str().expect("region").to_owned())
        .collect::<Vec<_>>();
    assert_eq!(regions, vec!["North", "South", "East"]);
}

#[test]
fn bad_filter_and_bad_formula_do_not_blank_the_chart() {
    let spec = PipelineSpec {
        filters: FilterTree::and(vec![FilterRule::new("region", "like", Scalar::from("N%"))]),
        measures: vec![
            MeasureSpec::aggregated("revenue", "sum", "total_revenue"),
            MeasureSpec::calculated("total_revenue / missing", "broken"),
        ],
        ..revenue_by_region()
    };
    let mut ledger = DiagnosticLedger::new();
    let out = run_pipeline(&sales(), &spec, &RuntimePolicy::default(), &mut ledger)
        .expect("pipeline");

    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|r| r.value("broken").is_null()));
    assert_eq!(ledger.count(DiagnosticKind::UnknownOperator), 1);
    assert_eq!(ledger.count(DiagnosticKind::ExpressionFailure), 1);
}

#[test]
fn request_file_round_trip_through_the_engine() {
    let request = QueryRequest::from_json_str(
        r#"{
            "source": "sales-csv",
            "csv": "region,revenue\nNorth,1000\nNorth,1500\nSouth,1200\n",
            "pipeline": {
                "dimensions": ["region"],
                "measures": [{ "column": "revenue", "aggregation": "sum", "name": "total_revenue" }],
                "sort": [{ "field": "total_revenue", "direction": "desc" }]
            }
        }"#,
    )
    .expect("request")
    .into_pipeline_request()
    .expect("pipeline request");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let engine = QueryEngine::default();
    let output = runtime
        .block_on(engine.execute(request))
        .expect("output");

    let json: serde_json::Value =
        serde_json::from_str(&render_output(&output, OutputFormat::Json).expect("render"))
            .expect("json");
    assert_eq!(json["rows"][0]["region"], "North");
    assert_eq!(json["rows"][0]["total_revenue"], 2500.0);
    assert_eq!(json["metadata"]["cacheHit"], false);
    assert!(json["metadata"]["refreshedAt"].is_string());

    let csv = render_output(&output, OutputFormat::Csv).expect("csv");
    assert_eq!(csv, "region,total_revenue\nNorth,2500\nSouth,1200\n");
}

#[tokio::test]
async fn repeated_request_is_identical_and_cached() {
    let engine = QueryEngine::default();
    let source: Arc<dyn RowSource> = Arc::new(InlineSource::new("sales", sales()));
    let request = PipelineRequest::new(source, revenue_by_region());

    let first = engine.execute(request.clone()).await.expect("first");
    let second = engine.execute(request).await.expect("second");
    assert_eq!(first.rows, second.rows);
    assert!(!first.metadata.cache_hit);
    assert!(second.metadata.cache_hit);
}

#[tokio::test(start_paused = true)]
async fn concurrent_renders_share_one_slow_fetch() {
    let engine = QueryEngine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let source: Arc<dyn RowSource> = Arc::new(FnSource::new("slow-sales", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, FetchError>(sales())
        }
    }));
    let request = PipelineRequest::new(source, revenue_by_region());

    let (a, b, c) = tokio::join!(
        engine.execute(request.clone()),
        engine.execute(request.clone()),
        engine.execute(request.clone())
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let a = a.expect("a");
    assert_eq!(a.rows, b.expect("b").rows);
    assert_eq!(a.rows, c.expect("c").rows);
    assert_eq!(engine.cache().stats().coalesced, 2);
}

proptest! {
    #[test]
    fn group_sums_add_up_to_the_filtered_total(
        values in proptest::collection::vec((0_u8..4, -1_000_i64..1_000), 0..60),
    ) {
        let rows = values
            .iter()
            .map(|(region, revenue)| {
                Row::from_pairs([
                    ("region", Scalar::Int64(i64::from(*region))),
                    ("revenue", Scalar::Int64(*revenue)),
                ])
            })
            .collect::<Vec<_>>();
        let spec = PipelineSpec {
            dimensions: vec![Dimension::field("region")],
            measures: vec![MeasureSpec::aggregated("revenue", "sum", "total")],
            filters: FilterTree::and(vec![FilterRule::new("region", ">=", Scalar::Int64(1))]),
            ..PipelineSpec::default()
        };
        let out = run(&rows, &spec);
        let grouped: i64 = out
            .iter()
            .map(|r| r.value("total").to_f64().expect("total") as i64)
            .sum();
        let expected: i64 = values
            .iter()
            .filter(|(region, _)| *region >= 1)
            .map(|(_, revenue)| revenue)
            .sum();
        prop_assert_eq!(grouped, expected);

        // Same spec, same rows, same output.
        prop_assert_eq!(run(&rows, &spec), out);
    }
}
