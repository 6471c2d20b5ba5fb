//! Lifecycle controller: signals, shutdown, and report assembly
//!
//! Owns the whole benchmark bracket: signal handlers cancel the root
//! context so in-flight runs observe cancellation promptly, while engine
//! shutdown and workspace cleanup run under an independent cleanup context
//! that the same signal cannot abort. Whatever happens in between, the
//! controller hands back a complete, serializable report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineFactory;
use crate::error::WazaError;
use crate::report::BenchmarkReport;
use crate::runner::driver::ModelDriver;
use crate::runner::hooks::{HookError, HookRunner, HookScope};
use crate::spec::BenchmarkSpec;

pub struct LifecycleController {
    spec: Arc<BenchmarkSpec>,
    factory: Arc<dyn EngineFactory>,
    fixtures_root: PathBuf,
    cancel: CancellationToken,
}

impl LifecycleController {
    pub fn new(
        spec: Arc<BenchmarkSpec>,
        factory: Arc<dyn EngineFactory>,
        fixtures_root: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            factory,
            fixtures_root,
            cancel,
        }
    }

    /// The root cancellation token. Cancelling it stops the benchmark;
    /// cleanup still runs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install interrupt and terminate handlers that cancel the root
    /// context.
    pub fn install_signal_handlers(&self) {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling benchmark");
                token.cancel();
            }
        });

        #[cfg(unix)]
        {
            let token = self.cancel.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{SignalKind, signal};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        if term.recv().await.is_some() {
                            tracing::info!("terminate received, cancelling benchmark");
                            token.cancel();
                        }
                    }
                    Err(e) => tracing::warn!("could not install SIGTERM handler: {e}"),
                }
            });
        }
    }

    /// Run the benchmark against `models` (empty falls back to the spec's
    /// default model) and return the report.
    ///
    /// Only spec errors, grader construction failures, and fatal
    /// `before_benchmark` hooks propagate. Cancellation does not: a
    /// benchmark cancelled halfway still returns a well-formed report
    /// describing what ran, what did not, and why.
    pub async fn run(&self, models: &[String]) -> Result<BenchmarkReport, WazaError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = BenchmarkReport::generate_run_id();
        tracing::info!(
            benchmark = %self.spec.name,
            %run_id,
            "benchmark starting"
        );

        // The cleanup context is deliberately not a child of the root
        // token. Engine shutdown gets this one.
        let cleanup = CancellationToken::new();

        let hooks = HookRunner::new(self.spec.hooks.clone());
        let mut outcomes = Vec::new();
        match hooks
            .run_scope(&self.cancel, HookScope::BeforeBenchmark, &[])
            .await
        {
            Ok(()) => {
                let driver = ModelDriver::new(
                    Arc::clone(&self.spec),
                    Arc::clone(&self.factory),
                    self.fixtures_root.clone(),
                    cleanup.clone(),
                );
                outcomes = driver.run_models(&self.cancel, models).await?;
            }
            // Cancelled before anything ran: the report still completes,
            // empty.
            Err(HookError::Cancelled { .. }) => {
                tracing::info!("benchmark cancelled before start");
            }
            Err(e) => {
                return Err(WazaError::Hook {
                    scope: HookScope::BeforeBenchmark.to_string(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = hooks
            .run_scope(&self.cancel, HookScope::AfterBenchmark, &[])
            .await
        {
            if !matches!(e, HookError::Cancelled { .. }) {
                tracing::error!("after_benchmark hook failed: {e}");
            }
        }

        let report = BenchmarkReport {
            spec_name: self.spec.name.clone(),
            skill: self.spec.skill_name.clone(),
            version: self.spec.version.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            outcomes,
        };
        tracing::info!(
            benchmark = %self.spec.name,
            exit_code = report.exit_code(),
            "benchmark finished"
        );
        Ok(report)
    }
}
