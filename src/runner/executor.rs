//! Run executor: one task run from staging to cleanup
//!
//! Drives a single run through its lifecycle:
//!
//! ```text
//! Pending -> Staging -> Executing -> Collected -> Grading -> Cleaning -> Done
//!                 \-> Error           \-> TimedOut / EngineError / Cancelled
//! ```
//!
//! `run_one` never returns an error; every failure mode is encoded in the
//! result's status. Workspace cleanup runs on all exit paths under its own
//! clock, independent of run cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineError, ExecuteOutcome, ExecuteRequest};
use crate::events::EventCollector;
use crate::graders::{
    self, Grader, GradingContext, PipelineEnd,
};
use crate::report::{RunResult, RunStatus};
use crate::runner::hooks::{HookError, HookRunner, HookScope};
use crate::spec::TaskSpec;
use crate::workspace::Workspace;

/// One unit of work: a task, a run index, a model, and a deadline.
#[derive(Clone)]
pub struct RunRequest {
    pub task: Arc<TaskSpec>,
    pub run_index: u32,
    pub model: String,
    pub timeout: Duration,
}

/// Executes runs against one engine instance.
pub struct RunExecutor {
    engine: Arc<dyn Engine>,
    hooks: Arc<HookRunner>,
    fixtures_root: std::path::PathBuf,
}

enum ExecEnd {
    Done(Result<ExecuteOutcome, EngineError>),
    TimedOut,
    Cancelled,
}

impl RunExecutor {
    pub fn new(
        engine: Arc<dyn Engine>,
        hooks: Arc<HookRunner>,
        fixtures_root: std::path::PathBuf,
    ) -> Self {
        Self {
            engine,
            hooks,
            fixtures_root,
        }
    }

    /// Execute one run to completion. Never fails; all failures are
    /// statuses.
    pub async fn run_one(
        &self,
        cancel: &CancellationToken,
        request: &RunRequest,
        graders: &[Arc<dyn Grader>],
    ) -> RunResult {
        let started = Instant::now();
        let task = &request.task;
        let mut result = RunResult::undispatched(request.run_index, &request.model, RunStatus::Error);

        tracing::debug!(
            task = %task.id,
            run_index = request.run_index,
            model = %request.model,
            "run starting"
        );

        // Staging.
        let workspace = match Workspace::create().await {
            Ok(workspace) => workspace,
            Err(e) => {
                result.feedback = Some(format!("workspace creation failed: {e}"));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        result.workspace_dir = workspace.root().display().to_string();

        if let Err(e) = workspace.stage(&self.fixtures_root, task.resources()).await {
            result.feedback = Some(format!("staging failed: {e}"));
            result.duration_ms = started.elapsed().as_millis() as u64;
            workspace.cleanup().await;
            return result;
        }

        let run_env = vec![(
            "WAZA_WORKSPACE_DIR".to_string(),
            workspace.root().display().to_string(),
        )];
        if let Err(e) = self
            .hooks
            .run_scope(cancel, HookScope::BeforeRun, &run_env)
            .await
        {
            result.status = match e {
                HookError::Cancelled { .. } => RunStatus::Cancelled,
                _ => RunStatus::Error,
            };
            result.feedback = Some(e.to_string());
            result.duration_ms = started.elapsed().as_millis() as u64;
            workspace.cleanup().await;
            return result;
        }

        // Executing: attach the collector, then hand off to the engine.
        let session_id = self.engine.new_session();
        let collector = EventCollector::new();
        self.engine.subscribe(&session_id, collector.sink());

        let exec_request = ExecuteRequest {
            session_id: session_id.clone(),
            task_id: task.id.clone(),
            prompt: task.prompt().to_string(),
            model: request.model.clone(),
            workspace_dir: workspace.root().to_path_buf(),
            resources_hint: task.resources().iter().map(|r| r.dest.clone()).collect(),
        };

        let run_token = cancel.child_token();
        let exec_future = {
            let engine = Arc::clone(&self.engine);
            let token = run_token.clone();
            async move { engine.execute(&token, exec_request).await }
        };

        let end = tokio::select! {
            biased;
            outcome = exec_future => ExecEnd::Done(outcome),
            _ = tokio::time::sleep(request.timeout) => {
                // Best-effort interrupt so the engine stops burning work.
                run_token.cancel();
                ExecEnd::TimedOut
            }
            _ = cancel.cancelled() => ExecEnd::Cancelled,
        };

        self.engine.unsubscribe(&session_id);
        let (transcript, digest) = collector.snapshot().await;
        result.transcript = transcript;
        result.session_digest = digest;

        let timed_out = matches!(end, ExecEnd::TimedOut);
        let grade = match end {
            ExecEnd::Done(Ok(outcome)) => {
                result.output = outcome.output;
                true
            }
            ExecEnd::Done(Err(EngineError::Cancelled)) | ExecEnd::Cancelled => {
                result.status = RunStatus::Cancelled;
                false
            }
            ExecEnd::Done(Err(e)) => {
                result.status = RunStatus::Error;
                result.feedback = Some(format!("engine failure: {e}"));
                false
            }
            // A timed-out run still grades: partial workspaces can yield
            // meaningful file and diff scores.
            ExecEnd::TimedOut => {
                result.status = RunStatus::TimedOut;
                result.feedback = Some(format!(
                    "run exceeded timeout of {:?}",
                    request.timeout
                ));
                true
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;

        if grade {
            self.grade(cancel, request, graders, &workspace, &mut result, timed_out)
                .await;
        }

        if let Err(e) = self
            .hooks
            .run_scope(cancel, HookScope::AfterRun, &run_env)
            .await
        {
            match e {
                HookError::Cancelled { .. } => {}
                e => {
                    result.status = RunStatus::Error;
                    result.feedback = Some(e.to_string());
                }
            }
        }

        workspace.cleanup().await;

        tracing::debug!(
            task = %task.id,
            run_index = request.run_index,
            status = %result.status,
            score = result.aggregate_score,
            "run finished"
        );
        result
    }

    async fn grade(
        &self,
        cancel: &CancellationToken,
        request: &RunRequest,
        graders: &[Arc<dyn Grader>],
        workspace: &Workspace,
        result: &mut RunResult,
        timed_out: bool,
    ) {
        let ctx = GradingContext {
            task: &request.task,
            output: &result.output,
            transcript: &result.transcript,
            digest: &result.session_digest,
            workspace_dir: workspace.root(),
            duration_ms: result.duration_ms,
        };

        let outcome = graders::run_pipeline(cancel, graders, &ctx).await;
        result.validations = outcome.validations;
        let aggregate = graders::aggregate_score(&result.validations);
        result.aggregate_score = aggregate.unwrap_or(0.0);

        // A timed-out run keeps its status no matter what the graders say.
        if timed_out {
            return;
        }

        match outcome.end {
            PipelineEnd::Completed => {
                if aggregate.is_none() {
                    result.status = RunStatus::Error;
                    result.feedback =
                        Some("no positively weighted graders produced results".to_string());
                } else if graders::all_weighted_passed(&result.validations) {
                    result.status = RunStatus::Passed;
                } else {
                    result.status = RunStatus::Failed;
                }
            }
            PipelineEnd::Cancelled => {
                result.status = RunStatus::Cancelled;
            }
            PipelineEnd::Fault(e) => {
                result.status = RunStatus::Error;
                result.feedback = Some(e.to_string());
            }
        }
    }
}
