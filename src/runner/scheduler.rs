//! Task scheduler: fan-out with bounded parallelism
//!
//! Multiplexes (task, run) work across workers gated by a counting
//! semaphore. Three modes:
//!
//! - **Sequential** (`parallel = false`): one task at a time, one run at a
//!   time. Deterministic and the default.
//! - **Task-parallel** (`parallel_shape: task`): workers pop whole tasks;
//!   each task's runs stay sequential. Required when a task's runs have
//!   ordering-relevant side effects.
//! - **Flat** (`parallel_shape: flat`): every (task, run_index) pair is an
//!   independent work item. Maximum parallelism when `runs_per_task > 1`.
//!
//! Whatever the execution order, the final outcome list is in spec-task
//! order and each task's runs are ordered by `run_index`.
//!
//! # Stop on failure
//!
//! With `stop_on_error`, the first non-passing run sets a sticky flag.
//! Work items check it at acquisition time and short-circuit with
//! `skipped`; work already executing is left to finish and record its
//! result. The flag is never cleared.
//!
//! # Cancellation
//!
//! Workers observe the token before acquiring the semaphore and again
//! before engine dispatch. Items cancelled before dispatch are recorded as
//! `cancelled` with no grader results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::graders::Grader;
use crate::report::{RunResult, RunStatus, TaskOutcome};
use crate::runner::executor::{RunExecutor, RunRequest};
use crate::runner::hooks::{HookError, HookRunner, HookScope};
use crate::spec::{BenchConfig, ParallelShape, TaskSpec};

/// A task plus its pre-built graders. Graders are constructed once per
/// task and shared read-only by every run.
#[derive(Clone)]
pub struct TaskPlan {
    pub task: Arc<TaskSpec>,
    pub graders: Arc<Vec<Arc<dyn Grader>>>,
}

/// Schedules all tasks for one model against one engine.
#[derive(Clone)]
pub struct TaskScheduler {
    config: Arc<BenchConfig>,
    executor: Arc<RunExecutor>,
    hooks: Arc<HookRunner>,
}

impl TaskScheduler {
    pub fn new(config: Arc<BenchConfig>, executor: Arc<RunExecutor>, hooks: Arc<HookRunner>) -> Self {
        Self {
            config,
            executor,
            hooks,
        }
    }

    /// Run every task `runs_per_task` times and return outcomes in
    /// spec-task order.
    pub async fn run_tasks(
        &self,
        cancel: &CancellationToken,
        plans: &[TaskPlan],
        model: &str,
    ) -> Vec<TaskOutcome> {
        // The optional benchmark deadline cancels a child token so the
        // caller's token is untouched.
        let work_token = cancel.child_token();
        let deadline_timer = self.config.benchmark_deadline.map(|limit| {
            let token = work_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!("benchmark deadline reached, cancelling remaining work");
                token.cancel();
            })
        });

        let outcomes = if !self.config.parallel {
            self.run_sequential(&work_token, plans, model).await
        } else {
            match self.config.parallel_shape {
                ParallelShape::Task => self.run_parallel_tasks(&work_token, plans, model).await,
                ParallelShape::Flat => self.run_parallel_flat(&work_token, plans, model).await,
            }
        };

        if let Some(timer) = deadline_timer {
            timer.abort();
        }
        outcomes
    }

    async fn run_sequential(
        &self,
        cancel: &CancellationToken,
        plans: &[TaskPlan],
        model: &str,
    ) -> Vec<TaskOutcome> {
        let had_failure = AtomicBool::new(false);
        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in plans {
            let runs = self.run_task_runs(cancel, plan, model, &had_failure).await;
            outcomes.push(finalize(plan, model, runs));
        }
        outcomes
    }

    /// All runs of one task, sequentially, with task-scope hooks around
    /// them. Shared by sequential mode and the task-parallel shape.
    async fn run_task_runs(
        &self,
        cancel: &CancellationToken,
        plan: &TaskPlan,
        model: &str,
        had_failure: &AtomicBool,
    ) -> Vec<RunResult> {
        let runs_per_task = self.config.runs_per_task;
        let mut runs = Vec::with_capacity(runs_per_task as usize);

        match self
            .hooks
            .run_scope(cancel, HookScope::BeforeTask, &[])
            .await
        {
            Ok(()) => {}
            Err(HookError::Cancelled { .. }) => {
                for run_index in 0..runs_per_task {
                    runs.push(RunResult::undispatched(run_index, model, RunStatus::Cancelled));
                }
                return runs;
            }
            Err(e) => {
                tracing::error!(task = %plan.task.id, "before_task hook failed, task skipped: {e}");
                if self.config.stop_on_error {
                    had_failure.store(true, Ordering::SeqCst);
                }
                for run_index in 0..runs_per_task {
                    let mut result =
                        RunResult::undispatched(run_index, model, RunStatus::Skipped);
                    result.feedback = Some(e.to_string());
                    runs.push(result);
                }
                return runs;
            }
        }

        let timeout = plan
            .task
            .timeout_override
            .unwrap_or_else(|| self.config.run_timeout());

        for run_index in 0..runs_per_task {
            if cancel.is_cancelled() {
                runs.push(RunResult::undispatched(run_index, model, RunStatus::Cancelled));
                continue;
            }
            if self.config.stop_on_error && had_failure.load(Ordering::SeqCst) {
                runs.push(RunResult::undispatched(run_index, model, RunStatus::Skipped));
                continue;
            }

            let request = RunRequest {
                task: Arc::clone(&plan.task),
                run_index,
                model: model.to_string(),
                timeout,
            };
            let result = self.executor.run_one(cancel, &request, &plan.graders).await;
            if !result.status.is_passed() {
                had_failure.store(true, Ordering::SeqCst);
            }
            runs.push(result);
        }

        if let Err(e) = self
            .hooks
            .run_scope(cancel, HookScope::AfterTask, &[])
            .await
        {
            if !matches!(e, HookError::Cancelled { .. }) {
                tracing::error!(task = %plan.task.id, "after_task hook failed: {e}");
            }
        }

        runs
    }

    async fn run_parallel_tasks(
        &self,
        cancel: &CancellationToken,
        plans: &[TaskPlan],
        model: &str,
    ) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let had_failure = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Vec<RunResult>)>();

        let mut handles = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            let this = self.clone();
            let plan = plan.clone();
            let model = model.to_string();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let had_failure = Arc::clone(&had_failure);
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let all_cancelled = |count: u32| {
                    (0..count)
                        .map(|i| RunResult::undispatched(i, &model, RunStatus::Cancelled))
                        .collect::<Vec<_>>()
                };

                if cancel.is_cancelled() {
                    let _ = tx.send((index, all_cancelled(this.config.runs_per_task)));
                    return;
                }
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    let _ = tx.send((index, all_cancelled(this.config.runs_per_task)));
                    return;
                };

                let runs = this.run_task_runs(&cancel, &plan, &model, &had_failure).await;
                let _ = tx.send((index, runs));
            }));
        }
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!("scheduler worker panicked: {e}");
            }
        }

        let mut slots: Vec<Option<Vec<RunResult>>> = (0..plans.len()).map(|_| None).collect();
        while let Some((index, runs)) = rx.recv().await {
            slots[index] = Some(runs);
        }

        plans
            .iter()
            .zip(slots)
            .map(|(plan, slot)| {
                let runs = slot.unwrap_or_else(|| {
                    lost_runs(self.config.runs_per_task, model)
                });
                finalize(plan, model, runs)
            })
            .collect()
    }

    async fn run_parallel_flat(
        &self,
        cancel: &CancellationToken,
        plans: &[TaskPlan],
        model: &str,
    ) -> Vec<TaskOutcome> {
        // Task-scope hooks fire at task boundaries even in flat mode:
        // before hooks ahead of the fan-out, after hooks once everything
        // has drained.
        let mut gates = Vec::with_capacity(plans.len());
        for plan in plans {
            let gate = match self
                .hooks
                .run_scope(cancel, HookScope::BeforeTask, &[])
                .await
            {
                Ok(()) => Gate::Run,
                Err(HookError::Cancelled { .. }) => Gate::Cancelled,
                Err(e) => {
                    tracing::error!(task = %plan.task.id, "before_task hook failed, task skipped: {e}");
                    Gate::Skipped(e.to_string())
                }
            };
            gates.push(gate);
        }

        let mut items: Vec<(usize, u32)> = Vec::new();
        for (index, gate) in gates.iter().enumerate() {
            if matches!(gate, Gate::Run) {
                for run_index in 0..self.config.runs_per_task {
                    items.push((index, run_index));
                }
            }
        }
        if let Some(seed) = self.config.seed {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            items.shuffle(&mut rng);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let had_failure = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, RunResult)>();

        let mut handles = Vec::with_capacity(items.len());
        for (index, run_index) in items {
            let this = self.clone();
            let plan = plans[index].clone();
            let model = model.to_string();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let had_failure = Arc::clone(&had_failure);
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                if cancel.is_cancelled() {
                    let _ = tx.send((
                        index,
                        RunResult::undispatched(run_index, &model, RunStatus::Cancelled),
                    ));
                    return;
                }
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    let _ = tx.send((
                        index,
                        RunResult::undispatched(run_index, &model, RunStatus::Cancelled),
                    ));
                    return;
                };

                if this.config.stop_on_error && had_failure.load(Ordering::SeqCst) {
                    let _ = tx.send((
                        index,
                        RunResult::undispatched(run_index, &model, RunStatus::Skipped),
                    ));
                    return;
                }

                let timeout = plan
                    .task
                    .timeout_override
                    .unwrap_or_else(|| this.config.run_timeout());
                let request = RunRequest {
                    task: Arc::clone(&plan.task),
                    run_index,
                    model: model.clone(),
                    timeout,
                };
                let result = this.executor.run_one(&cancel, &request, &plan.graders).await;
                if !result.status.is_passed() {
                    had_failure.store(true, Ordering::SeqCst);
                }
                let _ = tx.send((index, result));
            }));
        }
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!("scheduler worker panicked: {e}");
            }
        }

        let mut per_task: Vec<Vec<RunResult>> = (0..plans.len()).map(|_| Vec::new()).collect();
        while let Some((index, result)) = rx.recv().await {
            per_task[index].push(result);
        }

        let outcomes = plans
            .iter()
            .zip(gates.iter())
            .zip(per_task)
            .map(|((plan, gate), mut runs)| {
                match gate {
                    Gate::Run => {
                        fill_missing_runs(&mut runs, self.config.runs_per_task, model);
                    }
                    Gate::Cancelled => {
                        runs = (0..self.config.runs_per_task)
                            .map(|i| RunResult::undispatched(i, model, RunStatus::Cancelled))
                            .collect();
                    }
                    Gate::Skipped(reason) => {
                        runs = (0..self.config.runs_per_task)
                            .map(|i| {
                                let mut result =
                                    RunResult::undispatched(i, model, RunStatus::Skipped);
                                result.feedback = Some(reason.clone());
                                result
                            })
                            .collect();
                    }
                }
                finalize(plan, model, runs)
            })
            .collect();

        for plan in plans {
            if let Err(e) = self
                .hooks
                .run_scope(cancel, HookScope::AfterTask, &[])
                .await
            {
                if !matches!(e, HookError::Cancelled { .. }) {
                    tracing::error!(task = %plan.task.id, "after_task hook failed: {e}");
                }
            }
        }

        outcomes
    }
}

enum Gate {
    Run,
    Skipped(String),
    Cancelled,
}

fn finalize(plan: &TaskPlan, model: &str, runs: Vec<RunResult>) -> TaskOutcome {
    let mut outcome = TaskOutcome::new(&plan.task.id, plan.task.title(), model);
    outcome.runs = runs;
    outcome.finalize();
    outcome
}

fn lost_runs(count: u32, model: &str) -> Vec<RunResult> {
    (0..count)
        .map(|i| {
            let mut result = RunResult::undispatched(i, model, RunStatus::Error);
            result.feedback = Some("scheduler worker failed before reporting".to_string());
            result
        })
        .collect()
}

/// A panicked worker can lose single results in flat mode; the report
/// still accounts for every (task, run_index) pair.
fn fill_missing_runs(runs: &mut Vec<RunResult>, count: u32, model: &str) {
    for run_index in 0..count {
        if !runs.iter().any(|r| r.run_index == run_index) {
            let mut result = RunResult::undispatched(run_index, model, RunStatus::Error);
            result.feedback = Some("scheduler worker failed before reporting".to_string());
            runs.push(result);
        }
    }
}
