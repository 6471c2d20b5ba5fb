//! Benchmark spec data model
//!
//! This module defines the input side of the system: a [`BenchmarkSpec`]
//! names a skill under evaluation, a list of [`TaskSpec`]s, execution
//! configuration, graders, and lifecycle hooks. Specs are immutable after
//! load and shared read-only across workers.
//!
//! # Spec Format
//!
//! Benchmark specs are YAML. Tasks may be declared inline or referenced by
//! glob patterns pointing at task files (resolved by [`loader`]):
//!
//! ```yaml
//! name: file-handling
//! skill: file-tools
//! version: "1.0"
//! config:
//!   runs_per_task: 2
//!   parallel: true
//!   workers: 4
//! graders:
//!   - name: mentions-done
//!     kind: regex
//!     must_match: ["done"]
//! tasks:
//!   - id: create-readme
//!     name: Create a README
//!     inputs:
//!       prompt: "Create README.md describing the project"
//!       files:
//!         - source: fixtures/project
//!           dest: project
//! ```

pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::load_spec;

/// A validated benchmark specification.
///
/// Immutable after load. Shared by reference across the scheduler and all
/// run executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    /// Benchmark name, unique among result files.
    pub name: String,

    /// The skill under evaluation.
    #[serde(default, rename = "skill")]
    pub skill_name: String,

    /// Spec version string, echoed into reports.
    #[serde(default = "default_version")]
    pub version: String,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Execution configuration.
    #[serde(default)]
    pub config: BenchConfig,

    /// Optional metric declarations. Carried through untouched for
    /// downstream renderers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_yaml::Value>,

    /// Graders applied to every task, before task-local graders.
    #[serde(default, rename = "graders")]
    pub global_graders: Vec<GraderSpec>,

    /// Tasks, in declaration order. The loader resolves glob references
    /// into this list before validation.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,

    /// Shell hooks by scope.
    #[serde(default)]
    pub hooks: Hooks,

    /// Skills that must be present before any model runs.
    #[serde(default)]
    pub required_skills: Vec<String>,

    /// Directories searched for required skills.
    #[serde(default)]
    pub skill_directories: Vec<PathBuf>,
}

fn default_version() -> String {
    "0".to_string()
}

/// Execution configuration for a benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// How many times each task is run per model.
    #[serde(default = "default_runs_per_task")]
    pub runs_per_task: u32,

    /// Run tasks concurrently. Sequential by default for reproducibility.
    #[serde(default)]
    pub parallel: bool,

    /// Parallel scheduling shape. `task` keeps each task's runs sequential;
    /// `flat` queues every (task, run) pair as an independent work item.
    #[serde(default)]
    pub parallel_shape: ParallelShape,

    /// Worker count gating concurrent work via a counting semaphore.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-run wall clock timeout, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Optional deadline for the whole benchmark.
    #[serde(default, with = "humantime_serde::option")]
    pub benchmark_deadline: Option<Duration>,

    /// Stop scheduling new work after the first non-passing run.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Engine kind ("mock", "api").
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Default model when no model list is supplied.
    #[serde(default = "default_model")]
    pub model: String,

    /// Allow engines to reuse cached responses.
    #[serde(default)]
    pub cache: bool,

    /// Seed for the scheduler's work ordering in parallel mode.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Upper bound, in seconds, between cancellation and all workers
    /// having observed it.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_runs_per_task() -> u32 {
    1
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_executor() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "mock".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            runs_per_task: default_runs_per_task(),
            parallel: false,
            parallel_shape: ParallelShape::default(),
            workers: default_workers(),
            timeout_seconds: default_timeout_seconds(),
            benchmark_deadline: None,
            stop_on_error: false,
            executor: default_executor(),
            model: default_model(),
            cache: false,
            seed: None,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl BenchConfig {
    /// Per-run timeout as a [`Duration`].
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Scheduling shape for parallel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelShape {
    /// Workers pop whole tasks; each task's runs execute sequentially.
    /// Required when a task's runs have ordering-relevant side effects.
    #[default]
    Task,

    /// Every (task, run_index) pair is an independent work item. Maximum
    /// parallelism when `runs_per_task > 1`.
    Flat,
}

/// A single benchmark task: prompt, fixtures, expectations, and graders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique id within the spec.
    pub id: String,

    /// Human-readable name. Falls back to the id when empty.
    #[serde(default, rename = "name")]
    pub display_name: String,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Tags for filtering and reporting.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Prompt and fixtures.
    pub inputs: TaskInputs,

    /// Declarative hints about the expected outcome. Opaque to the core;
    /// some graders consult it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_yaml::Value>,

    /// Task-local graders, applied after the spec's global graders.
    #[serde(default)]
    pub graders: Vec<GraderSpec>,

    /// Per-task timeout overriding `config.timeout_seconds`.
    #[serde(
        default,
        rename = "timeout",
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_override: Option<Duration>,
}

impl TaskSpec {
    /// Display name with fallback to the task id.
    pub fn title(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    /// The agent prompt.
    pub fn prompt(&self) -> &str {
        &self.inputs.prompt
    }

    /// Fixtures staged into the workspace before the engine starts.
    pub fn resources(&self) -> &[ResourceSpec] {
        &self.inputs.files
    }
}

/// Inputs section of a task declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInputs {
    /// Prompt handed to the agent engine.
    pub prompt: String,

    /// Fixtures staged into the workspace.
    #[serde(default)]
    pub files: Vec<ResourceSpec>,
}

/// One fixture to stage: a source path under the fixtures root and a
/// relative destination inside the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Path relative to the fixtures root.
    pub source: PathBuf,

    /// Relative destination inside the workspace. Absolute paths and `..`
    /// segments are rejected at staging time.
    pub dest: PathBuf,
}

/// Grader declaration: a name, a weight, and kind-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderSpec {
    /// Unique within a task (global graders included).
    pub name: String,

    /// Weight in the aggregate score. Zero-weight graders still run but do
    /// not influence pass/fail.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Kind tag plus kind-specific configuration.
    #[serde(flatten)]
    pub kind: GraderKindSpec,
}

fn default_weight() -> f64 {
    1.0
}

/// Kind-specific grader configuration, tagged by `kind` in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraderKindSpec {
    /// Match patterns against the agent's final output.
    Regex {
        #[serde(default)]
        must_match: Vec<String>,
        #[serde(default)]
        must_not_match: Vec<String>,
    },

    /// File existence and content checks against the workspace.
    File {
        #[serde(default)]
        checks: Vec<FileCheck>,
    },

    /// Caps over the session digest.
    Behavior {
        #[serde(default)]
        max_tool_calls: Option<u64>,
        #[serde(default)]
        max_tokens: Option<u64>,
        #[serde(default)]
        max_duration_ms: Option<u64>,
        #[serde(default)]
        required_tools: Vec<String>,
        #[serde(default)]
        forbidden_tools: Vec<String>,
    },

    /// F1 of the actual tool-call sequence against an expected one.
    ActionSequence {
        expected: Vec<String>,
        #[serde(default)]
        mode: MatchMode,
    },

    /// F1 of recorded skill invocations against an expected sequence.
    SkillInvocation {
        expected: Vec<String>,
        #[serde(default)]
        mode: MatchMode,
    },

    /// Expected files whose content must contain required fragments.
    Diff {
        #[serde(default)]
        expected_files: Vec<DiffExpectation>,
    },

    /// Inline assertions over the output and digest.
    InlineScript { assertions: Vec<String> },

    /// External process; exit 0 means pass.
    Program {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl GraderKindSpec {
    /// Stable kind label used in results.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Regex { .. } => "regex",
            Self::File { .. } => "file",
            Self::Behavior { .. } => "behavior",
            Self::ActionSequence { .. } => "action_sequence",
            Self::SkillInvocation { .. } => "skill_invocation",
            Self::Diff { .. } => "diff",
            Self::InlineScript { .. } => "inline_script",
            Self::Program { .. } => "program",
        }
    }
}

/// Matching mode for sequence graders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Positional equality.
    Exact,

    /// Expected entries must appear in order, gaps allowed.
    #[default]
    InOrder,

    /// Multiset overlap, order ignored.
    AnyOrder,
}

/// One check performed by the `file` grader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCheck {
    /// Path relative to the workspace root.
    pub path: PathBuf,

    /// Whether the file must exist. Set false to assert absence.
    #[serde(default = "default_true")]
    pub exists: bool,

    /// Regex patterns the file content must match.
    #[serde(default)]
    pub contains: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// One expectation for the `diff` grader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffExpectation {
    /// Path relative to the workspace root.
    pub path: PathBuf,

    /// Literal fragments the file content must contain.
    #[serde(default)]
    pub fragments: Vec<String>,
}

/// Hooks by scope, each a list executed in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub before_benchmark: Vec<HookSpec>,
    #[serde(default)]
    pub after_benchmark: Vec<HookSpec>,
    #[serde(default)]
    pub before_task: Vec<HookSpec>,
    #[serde(default)]
    pub after_task: Vec<HookSpec>,
    #[serde(default)]
    pub before_run: Vec<HookSpec>,
    #[serde(default)]
    pub after_run: Vec<HookSpec>,
}

impl Hooks {
    /// True when no scope declares any hooks.
    pub fn is_empty(&self) -> bool {
        self.before_benchmark.is_empty()
            && self.after_benchmark.is_empty()
            && self.before_task.is_empty()
            && self.after_task.is_empty()
            && self.before_run.is_empty()
            && self.after_run.is_empty()
    }
}

/// A single shell hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    /// Shell command. Must be non-empty after trimming.
    pub command: String,

    /// Propagate failure and abort the surrounding scope.
    #[serde(default)]
    pub error_on_fail: bool,

    /// Exit codes treated as success.
    #[serde(default = "default_exit_codes")]
    pub acceptable_exit_codes: Vec<i32>,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.runs_per_task, 1);
        assert!(!config.parallel);
        assert_eq!(config.parallel_shape, ParallelShape::Task);
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.executor, "mock");
        assert_eq!(config.shutdown_grace_seconds, 5);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_grader_spec_yaml_roundtrip() {
        let yaml = r#"
name: greet-check
weight: 2.0
kind: regex
must_match: ["hi"]
must_not_match: ["error"]
"#;
        let spec: GraderSpec = serde_yaml::from_str(yaml).expect("Failed to parse grader spec");
        assert_eq!(spec.name, "greet-check");
        assert_eq!(spec.weight, 2.0);
        assert_eq!(spec.kind.kind_name(), "regex");

        match &spec.kind {
            GraderKindSpec::Regex {
                must_match,
                must_not_match,
            } => {
                assert_eq!(must_match, &["hi".to_string()]);
                assert_eq!(must_not_match, &["error".to_string()]);
            }
            other => panic!("Unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_grader_weight_defaults_to_one() {
        let yaml = r#"
name: files
kind: file
checks:
  - path: out.txt
    contains: ["ok"]
"#;
        let spec: GraderSpec = serde_yaml::from_str(yaml).expect("Failed to parse grader spec");
        assert_eq!(spec.weight, 1.0);
        assert_eq!(spec.kind.kind_name(), "file");
    }

    #[test]
    fn test_task_spec_parsing() {
        let yaml = r#"
id: t1
name: First task
tags: [smoke]
inputs:
  prompt: "say hi"
  files:
    - source: seed/readme.md
      dest: README.md
timeout: 90s
"#;
        let task: TaskSpec = serde_yaml::from_str(yaml).expect("Failed to parse task spec");
        assert_eq!(task.id, "t1");
        assert_eq!(task.title(), "First task");
        assert_eq!(task.prompt(), "say hi");
        assert_eq!(task.resources().len(), 1);
        assert_eq!(task.timeout_override, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_task_title_falls_back_to_id() {
        let yaml = r#"
id: unnamed
inputs:
  prompt: "do something"
"#;
        let task: TaskSpec = serde_yaml::from_str(yaml).expect("Failed to parse task spec");
        assert_eq!(task.title(), "unnamed");
    }

    #[test]
    fn test_hook_defaults() {
        let yaml = r#"
command: "echo hello"
"#;
        let hook: HookSpec = serde_yaml::from_str(yaml).expect("Failed to parse hook");
        assert!(!hook.error_on_fail);
        assert_eq!(hook.acceptable_exit_codes, vec![0]);
    }

    #[test]
    fn test_match_mode_default_is_in_order() {
        let yaml = r#"
name: seq
kind: action_sequence
expected: [read, write]
"#;
        let spec: GraderSpec = serde_yaml::from_str(yaml).expect("Failed to parse grader spec");
        match spec.kind {
            GraderKindSpec::ActionSequence { mode, .. } => {
                assert_eq!(mode, MatchMode::InOrder);
            }
            other => panic!("Unexpected kind: {:?}", other),
        }
    }
}
