//! Result model and report storage
//!
//! Everything a benchmark produces lands here: per-run results with their
//! transcript and digest, per-task roll-ups, per-model outcomes, and the
//! top-level report. The report is always serializable; a cancelled
//! benchmark still writes a well-formed file describing what ran, what did
//! not, and why.
//!
//! # Storage
//!
//! Reports are pretty JSON written atomically: the payload goes to
//! `<name>.json.tmp` first and is renamed into place, so readers never see
//! a partial file. Serialization round-trips: loading a written report and
//! re-serializing reproduces it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WazaError;
use crate::events::{SessionDigest, TranscriptEvent};
use crate::graders::GraderResult;
use crate::stats;

/// Terminal status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every positively weighted grader passed.
    Passed,

    /// At least one positively weighted grader failed.
    Failed,

    /// The per-run deadline elapsed before the engine returned.
    TimedOut,

    /// Staging, engine, or grader fault.
    Error,

    /// Cancellation observed before or during the run.
    Cancelled,

    /// Short-circuited by stop-on-error before dispatch.
    Skipped,
}

impl RunStatus {
    /// Anything other than `Passed` counts against the exit code.
    pub fn is_passed(&self) -> bool {
        matches!(self, RunStatus::Passed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Output of one run of one task against one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Index within the task, `0..runs_per_task`.
    pub run_index: u32,

    /// Model the run executed against.
    pub model: String,

    /// Terminal status.
    pub status: RunStatus,

    /// Wall clock from staging to grading.
    pub duration_ms: u64,

    /// Workspace path the run used. The directory is gone by the time the
    /// result is observable.
    pub workspace_dir: String,

    /// The agent's final message.
    pub output: String,

    /// Ordered event stream captured during execution.
    #[serde(default)]
    pub transcript: Vec<TranscriptEvent>,

    /// Rolling aggregates over the transcript.
    #[serde(default)]
    pub session_digest: SessionDigest,

    /// Grader results keyed by grader name, in declared grader order.
    #[serde(default)]
    pub validations: IndexMap<String, GraderResult>,

    /// Weighted mean over positively weighted graders.
    pub aggregate_score: f64,

    /// Failure explanation for non-passing statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl RunResult {
    /// Result for a run that never dispatched (skipped or cancelled before
    /// acquire). Carries no transcript and no grader results.
    pub fn undispatched(run_index: u32, model: &str, status: RunStatus) -> Self {
        Self {
            run_index,
            model: model.to_string(),
            status,
            duration_ms: 0,
            workspace_dir: String::new(),
            output: String::new(),
            transcript: Vec::new(),
            session_digest: SessionDigest::default(),
            validations: IndexMap::new(),
            aggregate_score: 0.0,
            feedback: None,
        }
    }
}

/// All runs of one task against one model, with roll-up statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub display_name: String,
    pub model: String,

    /// Ordered by `run_index`.
    pub runs: Vec<RunResult>,

    /// Fraction of runs that passed.
    pub pass_rate: f64,

    /// Mean aggregate score across runs.
    pub mean_score: f64,

    /// Sample standard deviation of aggregate scores; 0.0 for a single run.
    pub stddev: f64,
}

impl TaskOutcome {
    pub fn new(task_id: &str, display_name: &str, model: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            display_name: display_name.to_string(),
            model: model.to_string(),
            runs: Vec::new(),
            pass_rate: 0.0,
            mean_score: 0.0,
            stddev: 0.0,
        }
    }

    /// Order runs by index and recompute the roll-ups.
    pub fn finalize(&mut self) {
        self.runs.sort_by_key(|run| run.run_index);
        let passed = self.runs.iter().filter(|r| r.status.is_passed()).count();
        self.pass_rate = stats::pass_rate(passed, self.runs.len());

        let scores: Vec<f64> = self.runs.iter().map(|r| r.aggregate_score).collect();
        self.mean_score = stats::mean(&scores);
        self.stddev = stats::stddev(&scores);
    }
}

/// Roll-up metrics across a model's task outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total_tasks: usize,
    pub total_runs: usize,
    pub runs_passed: usize,
    pub pass_rate: f64,
    pub mean_score: f64,
}

impl AggregateMetrics {
    pub fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        let total_runs: usize = outcomes.iter().map(|o| o.runs.len()).sum();
        let runs_passed: usize = outcomes
            .iter()
            .flat_map(|o| o.runs.iter())
            .filter(|r| r.status.is_passed())
            .count();
        let scores: Vec<f64> = outcomes
            .iter()
            .flat_map(|o| o.runs.iter().map(|r| r.aggregate_score))
            .collect();

        Self {
            total_tasks: outcomes.len(),
            total_runs,
            runs_passed,
            pass_rate: stats::pass_rate(runs_passed, total_runs),
            mean_score: stats::mean(&scores),
        }
    }
}

/// Everything produced for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkOutcome {
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Spec-task order, regardless of completion order.
    pub task_outcomes: Vec<TaskOutcome>,

    pub aggregate: AggregateMetrics,

    /// Model-level infrastructure failure (engine construction, missing
    /// skills). When set, `task_outcomes` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BenchmarkOutcome {
    /// Outcome for a model whose engine never came up.
    pub fn construction_failure(model: &str, message: String) -> Self {
        let now = Utc::now();
        Self {
            model: model.to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            task_outcomes: Vec::new(),
            aggregate: AggregateMetrics::default(),
            error: Some(message),
        }
    }
}

/// The complete benchmark report handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub spec_name: String,
    pub skill: String,
    pub version: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// One outcome per model, in model-list order.
    pub outcomes: Vec<BenchmarkOutcome>,
}

impl BenchmarkReport {
    /// Unique id for a new report.
    pub fn generate_run_id() -> String {
        format!("run-{}", Uuid::new_v4())
    }

    /// True when every run across every model passed and no model failed
    /// at the infrastructure level.
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|outcome| {
            outcome.error.is_none()
                && outcome
                    .task_outcomes
                    .iter()
                    .flat_map(|t| t.runs.iter())
                    .all(|r| r.status.is_passed())
        })
    }

    /// True when every model failed at the infrastructure level, so the
    /// benchmark never evaluated anything.
    pub fn infrastructure_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.error.is_some())
    }

    /// CLI exit code: 0 all passed, 1 completed with failures, 2 when no
    /// model could even be constructed.
    pub fn exit_code(&self) -> i32 {
        if self.infrastructure_failed() {
            2
        } else if self.all_passed() {
            0
        } else {
            1
        }
    }
}

/// Report persistence with atomic writes.
pub struct ReportStore {
    results_dir: PathBuf,
}

impl ReportStore {
    pub fn new<P: AsRef<Path>>(results_dir: P) -> Self {
        Self {
            results_dir: results_dir.as_ref().to_path_buf(),
        }
    }

    /// Write the report as pretty JSON, write-then-rename, and return the
    /// final path.
    pub async fn save(&self, report: &BenchmarkReport) -> Result<PathBuf, WazaError> {
        tokio::fs::create_dir_all(&self.results_dir).await?;

        let filename = format!("{}-{}.json", sanitize(&report.spec_name), report.run_id);
        let final_path = self.results_dir.join(&filename);
        let tmp_path = self.results_dir.join(format!("{filename}.tmp"));

        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        tracing::info!(path = %final_path.display(), "report written");
        Ok(final_path)
    }

    /// Load a previously written report.
    pub async fn load(&self, path: &Path) -> Result<BenchmarkReport, WazaError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(run_index: u32, status: RunStatus, score: f64) -> RunResult {
        RunResult {
            run_index,
            model: "mock".into(),
            status,
            duration_ms: 100,
            workspace_dir: "/tmp/waza-dead".into(),
            output: "hi".into(),
            transcript: vec![],
            session_digest: SessionDigest::default(),
            validations: IndexMap::new(),
            aggregate_score: score,
            feedback: None,
        }
    }

    fn sample_report() -> BenchmarkReport {
        let mut outcome = TaskOutcome::new("t1", "First", "mock");
        outcome.runs.push(run(1, RunStatus::Failed, 0.5));
        outcome.runs.push(run(0, RunStatus::Passed, 1.0));
        outcome.finalize();

        let task_outcomes = vec![outcome];
        let aggregate = AggregateMetrics::from_outcomes(&task_outcomes);
        let now = Utc::now();

        BenchmarkReport {
            spec_name: "smoke".into(),
            skill: "greeter".into(),
            version: "1.0".into(),
            run_id: BenchmarkReport::generate_run_id(),
            started_at: now,
            finished_at: now,
            duration_ms: 1234,
            outcomes: vec![BenchmarkOutcome {
                model: "mock".into(),
                started_at: now,
                finished_at: now,
                duration_ms: 1234,
                task_outcomes,
                aggregate,
                error: None,
            }],
        }
    }

    #[test]
    fn test_finalize_orders_runs_and_computes_rollups() {
        let mut outcome = TaskOutcome::new("t1", "First", "mock");
        outcome.runs.push(run(2, RunStatus::Passed, 1.0));
        outcome.runs.push(run(0, RunStatus::Passed, 1.0));
        outcome.runs.push(run(1, RunStatus::Failed, 0.0));
        outcome.finalize();

        let indices: Vec<u32> = outcome.runs.iter().map(|r| r.run_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!((outcome.pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((outcome.mean_score - 2.0 / 3.0).abs() < 1e-9);
        assert!(outcome.stddev > 0.0);
    }

    #[test]
    fn test_single_run_stddev_is_zero() {
        let mut outcome = TaskOutcome::new("t1", "First", "mock");
        outcome.runs.push(run(0, RunStatus::Passed, 1.0));
        outcome.finalize();
        assert_eq!(outcome.stddev, 0.0);
    }

    #[test]
    fn test_exit_codes() {
        let mut report = sample_report();
        assert_eq!(report.exit_code(), 1);

        report.outcomes[0].task_outcomes[0].runs[1].status = RunStatus::Passed;
        assert_eq!(report.exit_code(), 0);

        report.outcomes[0].error = Some("engine down".into());
        assert!(!report.all_passed());
    }

    #[test]
    fn test_serialization_round_trip_is_fixed_point() {
        let report = sample_report();
        let first = serde_json::to_string_pretty(&report).unwrap();
        let reloaded: BenchmarkReport = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&reloaded).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path());
        let report = sample_report();

        let path = store.save(&report).await.unwrap();
        assert!(path.exists());
        assert!(!path.to_string_lossy().ends_with(".tmp"));

        let loaded = store.load(&path).await.unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.outcomes.len(), 1);
        assert_eq!(loaded.outcomes[0].task_outcomes[0].runs.len(), 2);
    }

    #[test]
    fn test_filename_sanitization() {
        assert_eq!(sanitize("a b/c"), "a-b-c");
        assert_eq!(sanitize("ok-name_1"), "ok-name_1");
    }
}
