//! Model driver: sequential per-model execution
//!
//! Applies the task scheduler once per target model. Models run strictly
//! sequentially even when task execution is parallel, which keeps
//! model-to-model resource contention and per-model billing predictable.
//! Each model gets a fresh engine from the factory and a deferred shutdown
//! under the cleanup context; engine construction failures are confined to
//! their model while the rest of the benchmark proceeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineFactory};
use crate::error::WazaError;
use crate::graders::build_graders;
use crate::report::{AggregateMetrics, BenchmarkOutcome};
use crate::runner::executor::RunExecutor;
use crate::runner::hooks::HookRunner;
use crate::runner::scheduler::{TaskPlan, TaskScheduler};
use crate::spec::BenchmarkSpec;

/// Bound on engine shutdown under the cleanup context.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ModelDriver {
    spec: Arc<BenchmarkSpec>,
    factory: Arc<dyn EngineFactory>,
    fixtures_root: PathBuf,
    cleanup: CancellationToken,
}

impl ModelDriver {
    pub fn new(
        spec: Arc<BenchmarkSpec>,
        factory: Arc<dyn EngineFactory>,
        fixtures_root: PathBuf,
        cleanup: CancellationToken,
    ) -> Self {
        Self {
            spec,
            factory,
            fixtures_root,
            cleanup,
        }
    }

    /// Run the benchmark once per model, in list order. An empty list
    /// falls back to `config.model`.
    pub async fn run_models(
        &self,
        cancel: &CancellationToken,
        models: &[String],
    ) -> Result<Vec<BenchmarkOutcome>, WazaError> {
        // Graders compile once per task and are shared read-only by every
        // run of that task, across all models.
        let mut plans = Vec::with_capacity(self.spec.tasks.len());
        for task in &self.spec.tasks {
            let graders = build_graders(&self.spec.global_graders, task)
                .map_err(|e| WazaError::Spec(e.to_string()))?;
            plans.push(TaskPlan {
                task: Arc::new(task.clone()),
                graders: Arc::new(graders),
            });
        }

        let models: Vec<String> = if models.is_empty() {
            vec![self.spec.config.model.clone()]
        } else {
            models.to_vec()
        };

        let config = Arc::new(self.spec.config.clone());
        let hooks = Arc::new(HookRunner::new(self.spec.hooks.clone()));
        let mut outcomes = Vec::with_capacity(models.len());

        for model in &models {
            if let Err(message) = self.check_required_skills() {
                tracing::error!(%model, "model skipped: {message}");
                outcomes.push(BenchmarkOutcome::construction_failure(model, message));
                continue;
            }

            let engine = match self.factory.new_engine(model) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(%model, "engine construction failed: {e}");
                    outcomes.push(BenchmarkOutcome::construction_failure(model, e.to_string()));
                    continue;
                }
            };

            tracing::info!(%model, tasks = plans.len(), "starting model pass");
            let started_at = Utc::now();
            let started = Instant::now();

            let executor = Arc::new(RunExecutor::new(
                Arc::clone(&engine),
                Arc::clone(&hooks),
                self.fixtures_root.clone(),
            ));
            let scheduler =
                TaskScheduler::new(Arc::clone(&config), executor, Arc::clone(&hooks));
            let task_outcomes = scheduler.run_tasks(cancel, &plans, model).await;

            // Deferred shutdown: exactly once per model, on every path.
            self.shutdown_engine(model, engine).await;

            let aggregate = AggregateMetrics::from_outcomes(&task_outcomes);
            tracing::info!(
                %model,
                pass_rate = aggregate.pass_rate,
                runs = aggregate.total_runs,
                "model pass finished"
            );
            outcomes.push(BenchmarkOutcome {
                model: model.clone(),
                started_at,
                finished_at: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                task_outcomes,
                aggregate,
                error: None,
            });
        }

        Ok(outcomes)
    }

    /// Shutdown never uses the run cancellation token: the signal that
    /// cancelled the benchmark must not be able to abort its own cleanup.
    async fn shutdown_engine(&self, model: &str, engine: Arc<dyn Engine>) {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown(&self.cleanup)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%model, "engine shutdown failed: {e}"),
            Err(_) => tracing::warn!(%model, "engine shutdown timed out after {SHUTDOWN_TIMEOUT:?}"),
        }
    }

    fn check_required_skills(&self) -> Result<(), String> {
        for skill in &self.spec.required_skills {
            let found = self
                .spec
                .skill_directories
                .iter()
                .any(|dir| dir.join(skill).exists());
            if !found {
                return Err(format!(
                    "required skill '{skill}' not found under any skill directory"
                ));
            }
        }
        Ok(())
    }
}
