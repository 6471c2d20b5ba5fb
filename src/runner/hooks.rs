//! Scoped shell hooks
//!
//! Benchmarks may declare hooks at benchmark, task, and run scope. Hooks in
//! a scope run sequentially in declared order under the ambient
//! cancellation context; a hook whose exit code is not in its
//! `acceptable_exit_codes` either aborts the surrounding scope
//! (`error_on_fail`) or is logged and skipped.

use std::process::Stdio;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::spec::{HookSpec, Hooks};

/// Where in the benchmark lifecycle a hook list fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    BeforeBenchmark,
    AfterBenchmark,
    BeforeTask,
    AfterTask,
    BeforeRun,
    AfterRun,
}

impl std::fmt::Display for HookScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HookScope::BeforeBenchmark => "before_benchmark",
            HookScope::AfterBenchmark => "after_benchmark",
            HookScope::BeforeTask => "before_task",
            HookScope::AfterTask => "after_task",
            HookScope::BeforeRun => "before_run",
            HookScope::AfterRun => "after_run",
        };
        f.write_str(label)
    }
}

/// Hook failures that abort their surrounding scope.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook '{command}' at {scope} exited with {code:?}")]
    UnacceptableExit {
        scope: HookScope,
        command: String,
        code: Option<i32>,
    },

    #[error("hook '{command}' at {scope} could not run: {message}")]
    Spawn {
        scope: HookScope,
        command: String,
        message: String,
    },

    #[error("hook execution cancelled at {scope}")]
    Cancelled { scope: HookScope },
}

/// Executes a benchmark's declared hooks.
pub struct HookRunner {
    hooks: Hooks,
}

impl HookRunner {
    pub fn new(hooks: Hooks) -> Self {
        Self { hooks }
    }

    /// Runner with no hooks declared. Handy for tests.
    pub fn empty() -> Self {
        Self {
            hooks: Hooks::default(),
        }
    }

    fn list(&self, scope: HookScope) -> &[HookSpec] {
        match scope {
            HookScope::BeforeBenchmark => &self.hooks.before_benchmark,
            HookScope::AfterBenchmark => &self.hooks.after_benchmark,
            HookScope::BeforeTask => &self.hooks.before_task,
            HookScope::AfterTask => &self.hooks.after_task,
            HookScope::BeforeRun => &self.hooks.before_run,
            HookScope::AfterRun => &self.hooks.after_run,
        }
    }

    /// Run the scope's hooks in declared order.
    ///
    /// `env` is exported into every hook invocation; run-scope callers pass
    /// `WAZA_WORKSPACE_DIR` pointing at the live workspace. Only
    /// `error_on_fail` failures and cancellation propagate; every other
    /// failure is logged and the next hook proceeds.
    pub async fn run_scope(
        &self,
        cancel: &CancellationToken,
        scope: HookScope,
        env: &[(String, String)],
    ) -> Result<(), HookError> {
        for hook in self.list(scope) {
            if cancel.is_cancelled() {
                return Err(HookError::Cancelled { scope });
            }
            match run_hook(cancel, scope, hook, env).await {
                Ok(()) => {}
                Err(e @ HookError::Cancelled { .. }) => return Err(e),
                Err(e) if hook.error_on_fail => return Err(e),
                Err(e) => {
                    tracing::warn!(%scope, "non-fatal hook failure: {e}");
                }
            }
        }
        Ok(())
    }
}

async fn run_hook(
    cancel: &CancellationToken,
    scope: HookScope,
    hook: &HookSpec,
    env: &[(String, String)],
) -> Result<(), HookError> {
    tracing::debug!(%scope, command = %hook.command, "running hook");

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&hook.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|e| HookError::Spawn {
        scope,
        command: hook.command.clone(),
        message: e.to_string(),
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| HookError::Spawn {
            scope,
            command: hook.command.clone(),
            message: e.to_string(),
        })?,
        _ = cancel.cancelled() => return Err(HookError::Cancelled { scope }),
    };

    let code = output.status.code();
    let acceptable = match code {
        Some(code) => hook.acceptable_exit_codes.contains(&code),
        None => false,
    };
    if acceptable {
        Ok(())
    } else {
        Err(HookError::UnacceptableExit {
            scope,
            command: hook.command.clone(),
            code,
        })
    }
}
