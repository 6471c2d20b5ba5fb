//! Parallel fan-out, cancellation, and report round-trip
//!
//! Exercises the scheduler's bounded concurrency through a mock engine
//! that records its high-water mark, races cancellation against in-flight
//! work, and verifies the report survives a serialize/deserialize cycle
//! byte for byte.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use waza::engine::{MockEngine, MockEngineBuilder, SharedEngineFactory};
use waza::report::{BenchmarkReport, ReportStore, RunStatus};
use waza::runner::LifecycleController;
use waza::spec::{BenchmarkSpec, loader};

fn fanout_spec(extra_config: &str) -> Arc<BenchmarkSpec> {
    let tasks: String = (0..10)
        .map(|i| {
            format!(
                "  - id: task-{i:02}\n    inputs: {{ prompt: \"task {i}\" }}\n    graders:\n      - name: check\n        kind: regex\n        must_match: [\"ok\"]\n"
            )
        })
        .collect();
    let yaml = format!(
        r#"
name: fan-out
skill: demo
config:
  runs_per_task: 3
  parallel: true
  parallel_shape: flat
  workers: 4
{extra_config}
tasks:
{tasks}
"#
    );
    let spec: BenchmarkSpec = serde_yaml::from_str(&yaml).expect("spec should parse");
    loader::validate_spec(&spec).expect("spec should validate");
    Arc::new(spec)
}

fn controller(
    spec: Arc<BenchmarkSpec>,
    engine: Arc<MockEngine>,
    cancel: CancellationToken,
    fixtures: &tempfile::TempDir,
) -> LifecycleController {
    LifecycleController::new(
        spec,
        Arc::new(SharedEngineFactory::new(engine)),
        fixtures.path().to_path_buf(),
        cancel,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_flat_fanout_bounds_concurrency_and_orders_results() {
    let engine = MockEngineBuilder::new()
        .with_output("ok")
        .with_latency(Duration::from_millis(20))
        .build_shared();
    let fixtures = tempfile::tempdir().unwrap();

    let report = controller(
        fanout_spec(""),
        Arc::clone(&engine),
        CancellationToken::new(),
        &fixtures,
    )
    .run(&[])
    .await
    .unwrap();

    // All 30 runs completed, never more than `workers` outstanding.
    assert_eq!(engine.execute_calls(), 30);
    assert!(
        engine.high_water_mark() <= 4,
        "high water mark {} exceeds workers",
        engine.high_water_mark()
    );

    let outcomes = &report.outcomes[0].task_outcomes;
    let ids: Vec<&str> = outcomes.iter().map(|o| o.task_id.as_str()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("task-{i:02}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());

    for outcome in outcomes {
        assert_eq!(outcome.runs.len(), 3);
        let indices: Vec<u32> = outcome.runs.iter().map(|r| r.run_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(outcome.pass_rate, 1.0);
    }
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_cancellation_mid_benchmark_yields_wellformed_report() {
    let engine = MockEngineBuilder::new()
        .with_output("ok")
        .with_latency(Duration::from_millis(60))
        .build_shared();
    let fixtures = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_clone.cancel();
    });

    let report = controller(fanout_spec(""), Arc::clone(&engine), cancel, &fixtures)
        .run(&[])
        .await
        .unwrap();

    // Shutdown ran exactly once for the single model, under the cleanup
    // context.
    assert_eq!(engine.shutdown_calls(), 1);

    let runs: Vec<_> = report.outcomes[0]
        .task_outcomes
        .iter()
        .flat_map(|t| t.runs.iter())
        .collect();
    assert_eq!(runs.len(), 30, "every (task, run) pair is accounted for");

    let cancelled = runs
        .iter()
        .filter(|r| r.status == RunStatus::Cancelled)
        .count();
    assert!(cancelled > 0, "cancellation should strand some work");

    for run in &runs {
        // No workspace outlives its run.
        if !run.workspace_dir.is_empty() {
            assert!(
                !std::path::Path::new(&run.workspace_dir).exists(),
                "workspace {} leaked",
                run.workspace_dir
            );
        }
        assert!(run.aggregate_score >= 0.0 && run.aggregate_score <= 1.0);
    }

    // Still serializable after being cut short.
    let json = serde_json::to_string_pretty(&report).unwrap();
    let reparsed: BenchmarkReport = serde_json::from_str(&json).unwrap();
    assert_eq!(reparsed.run_id, report.run_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_same_seed_reproduces_status_mapping() {
    let run_once = || async {
        let engine = MockEngineBuilder::new()
            .with_output("ok")
            .with_task_output("task-03", "broken")
            .build_shared();
        let fixtures = tempfile::tempdir().unwrap();
        let report = controller(
            fanout_spec("  seed: 42\n"),
            engine,
            CancellationToken::new(),
            &fixtures,
        )
        .run(&[])
        .await
        .unwrap();

        report.outcomes[0]
            .task_outcomes
            .iter()
            .flat_map(|t| {
                t.runs
                    .iter()
                    .map(|r| (t.task_id.clone(), r.run_index, r.status))
            })
            .collect::<Vec<_>>()
    };

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_report_round_trip_through_store_is_a_fixed_point() {
    let engine = MockEngineBuilder::new().with_output("ok").build_shared();
    let fixtures = tempfile::tempdir().unwrap();
    let results = tempfile::tempdir().unwrap();

    let report = controller(fanout_spec(""), engine, CancellationToken::new(), &fixtures)
        .run(&[])
        .await
        .unwrap();

    let store = ReportStore::new(results.path());
    let path = store.save(&report).await.unwrap();
    let loaded = store.load(&path).await.unwrap();

    let first = serde_json::to_string_pretty(&loaded).unwrap();
    let reparsed: BenchmarkReport = serde_json::from_str(&first).unwrap();
    let second = serde_json::to_string_pretty(&reparsed).unwrap();
    assert_eq!(first, second);

    // The on-disk bytes equal the re-serialized form too.
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert_eq!(on_disk, first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_model_runs_are_sequential_and_isolated() {
    let engine = MockEngineBuilder::new().with_output("ok").build_shared();
    let fixtures = tempfile::tempdir().unwrap();

    let report = controller(
        fanout_spec(""),
        Arc::clone(&engine),
        CancellationToken::new(),
        &fixtures,
    )
    .run(&["model-a".to_string(), "model-b".to_string()])
    .await
    .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].model, "model-a");
    assert_eq!(report.outcomes[1].model, "model-b");
    assert_eq!(engine.execute_calls(), 60);
    assert_eq!(engine.shutdown_calls(), 2);

    // Model passes do not overlap: the second pass starts after the first
    // finishes.
    assert!(report.outcomes[1].started_at >= report.outcomes[0].started_at);
    for outcome in &report.outcomes {
        assert_eq!(outcome.aggregate.total_runs, 30);
        assert_eq!(outcome.aggregate.pass_rate, 1.0);
    }
}
