//! Spec loading and validation
//!
//! Loads a benchmark spec from YAML, resolves glob references to task files,
//! and validates the result before the execution engine ever sees it.
//! Validation failures are fatal and map to exit code 2.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;

use crate::engine::EngineKind;
use crate::error::WazaError;
use crate::spec::{BenchmarkSpec, GraderSpec, TaskSpec};

/// Load a benchmark spec from a YAML file.
///
/// Entries under `tasks` may be inline task mappings or glob strings
/// resolved relative to the spec file's directory. Task files matched by a
/// glob are loaded in sorted path order so enumeration stays deterministic.
pub fn load_spec(path: &Path) -> Result<BenchmarkSpec, WazaError> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read spec file {}", path.display()))
        .map_err(|e| WazaError::Spec(format!("{e:#}")))?;

    let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)
        .map_err(|e| WazaError::Spec(format!("invalid YAML in {}: {e}", path.display())))?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_task_refs(&mut doc, base_dir)?;

    let spec: BenchmarkSpec = serde_yaml::from_value(doc)
        .map_err(|e| WazaError::Spec(format!("invalid spec {}: {e}", path.display())))?;

    validate_spec(&spec)?;
    Ok(spec)
}

/// Replace glob string entries in the `tasks` sequence with the task
/// declarations loaded from the matched files.
fn resolve_task_refs(doc: &mut serde_yaml::Value, base_dir: &Path) -> Result<(), WazaError> {
    let Some(tasks) = doc.get_mut("tasks").and_then(|t| t.as_sequence_mut()) else {
        return Ok(());
    };

    let mut resolved = Vec::with_capacity(tasks.len());
    for entry in tasks.drain(..) {
        match entry {
            serde_yaml::Value::String(pattern) => {
                let full = base_dir.join(&pattern);
                let matches = glob::glob(&full.to_string_lossy())
                    .map_err(|e| WazaError::Spec(format!("bad task glob '{pattern}': {e}")))?;

                let mut paths: Vec<_> = matches
                    .filter_map(|m| m.ok())
                    .filter(|p| p.is_file())
                    .collect();
                paths.sort();

                if paths.is_empty() {
                    return Err(WazaError::Spec(format!(
                        "task glob '{pattern}' matched no files"
                    )));
                }

                for task_path in paths {
                    let raw = std::fs::read_to_string(&task_path).map_err(|e| {
                        WazaError::Spec(format!(
                            "failed to read task file {}: {e}",
                            task_path.display()
                        ))
                    })?;
                    let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
                        WazaError::Spec(format!(
                            "invalid YAML in task file {}: {e}",
                            task_path.display()
                        ))
                    })?;
                    resolved.push(value);
                }
            }
            inline => resolved.push(inline),
        }
    }

    *tasks = resolved;
    Ok(())
}

/// Structural validation of a loaded spec.
///
/// Checks performed here rather than during execution:
/// - non-empty benchmark name
/// - `runs_per_task >= 1`, `workers >= 1`
/// - recognized executor kind
/// - unique task ids
/// - unique grader names within each task (global graders included)
/// - hook commands non-empty after trimming
pub fn validate_spec(spec: &BenchmarkSpec) -> Result<(), WazaError> {
    if spec.name.trim().is_empty() {
        return Err(WazaError::Spec("benchmark name must not be empty".into()));
    }
    if spec.config.runs_per_task < 1 {
        return Err(WazaError::Spec("config.runs_per_task must be >= 1".into()));
    }
    if spec.config.workers < 1 {
        return Err(WazaError::Spec("config.workers must be >= 1".into()));
    }

    spec.config
        .executor
        .parse::<EngineKind>()
        .map_err(|e| WazaError::Spec(e.to_string()))?;

    let mut task_ids = HashSet::new();
    for task in &spec.tasks {
        if task.id.trim().is_empty() {
            return Err(WazaError::Spec("task id must not be empty".into()));
        }
        if !task_ids.insert(task.id.as_str()) {
            return Err(WazaError::Spec(format!("duplicate task id '{}'", task.id)));
        }
        validate_grader_names(&task.id, &spec.global_graders, &task.graders)?;
    }

    validate_hooks(spec)?;

    if spec.tasks.is_empty() {
        tracing::warn!(benchmark = %spec.name, "spec declares no tasks");
    }

    Ok(())
}

fn validate_grader_names(
    task_id: &str,
    global: &[GraderSpec],
    local: &[GraderSpec],
) -> Result<(), WazaError> {
    let mut seen = HashSet::new();
    for grader in global.iter().chain(local.iter()) {
        if grader.name.trim().is_empty() {
            return Err(WazaError::Spec(format!(
                "task '{task_id}': grader name must not be empty"
            )));
        }
        if grader.weight < 0.0 {
            return Err(WazaError::Spec(format!(
                "task '{task_id}': grader '{}' has negative weight",
                grader.name
            )));
        }
        if !seen.insert(grader.name.as_str()) {
            return Err(WazaError::Spec(format!(
                "task '{task_id}': duplicate grader name '{}'",
                grader.name
            )));
        }
    }
    Ok(())
}

fn validate_hooks(spec: &BenchmarkSpec) -> Result<(), WazaError> {
    let scopes = [
        ("before_benchmark", &spec.hooks.before_benchmark),
        ("after_benchmark", &spec.hooks.after_benchmark),
        ("before_task", &spec.hooks.before_task),
        ("after_task", &spec.hooks.after_task),
        ("before_run", &spec.hooks.before_run),
        ("after_run", &spec.hooks.after_run),
    ];
    for (scope, hooks) in scopes {
        for hook in hooks {
            if hook.command.trim().is_empty() {
                return Err(WazaError::Spec(format!(
                    "hook in scope '{scope}' has an empty command"
                )));
            }
        }
    }
    Ok(())
}

/// Parse a task declaration from a standalone YAML string. Used by task
/// file tooling and tests.
pub fn parse_task(yaml: &str) -> Result<TaskSpec, WazaError> {
    serde_yaml::from_str(yaml).map_err(|e| WazaError::Spec(format!("invalid task: {e}")))
}
