//! Grader pipeline
//!
//! Graders score a finished run. They are constructed once per task from
//! the spec's declarations, shared read-only across every run of that task,
//! and applied sequentially in declared order: global graders first, then
//! task-local ones. Each call is timed; a grader fault stops the pipeline
//! and preserves the partial result map.
//!
//! # Score semantics
//!
//! Every grader produces a score in `[0, 1]` (clamped by the pipeline) and
//! a pass verdict. The run's aggregate score is the weighted mean over
//! graders with positive weight; a run passes only when every positively
//! weighted grader passed.

pub mod behavior;
pub mod diff;
pub mod file;
pub mod program;
pub mod regex;
pub mod script;
pub mod sequence;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{SessionDigest, TranscriptEvent};
use crate::spec::{GraderKindSpec, GraderSpec, TaskSpec};

pub use behavior::BehaviorGrader;
pub use diff::DiffGrader;
pub use file::FileGrader;
pub use program::ProgramGrader;
pub use self::regex::RegexGrader;
pub use script::InlineScriptGrader;
pub use sequence::{SequenceGrader, SequenceSource};

/// Grader failures.
#[derive(Error, Debug)]
pub enum GraderError {
    /// The declaration could not be turned into a grader (bad pattern,
    /// unparsable assertion).
    #[error("grader '{name}' construction failed: {message}")]
    Construction { name: String, message: String },

    /// The grader itself faulted while scoring. Marks the run as errored.
    #[error("grader '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Output of one grader for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderResult {
    /// Grader name, unique within the run.
    pub name: String,

    /// Kind label ("regex", "file", ...).
    pub kind: String,

    /// Score in `[0, 1]`.
    pub score: f64,

    /// Kind-specific pass verdict, usually `score >= 1.0`.
    pub passed: bool,

    /// Weight in the aggregate.
    pub weight: f64,

    /// Human-readable explanation of the verdict.
    pub feedback: String,

    /// Wall clock spent inside the grader.
    pub duration_ms: u64,

    /// Kind-specific observations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl GraderResult {
    /// Empty result scaffold for a grader to fill in.
    pub fn new(name: &str, kind: &'static str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            score: 0.0,
            passed: false,
            weight,
            feedback: String::new(),
            duration_ms: 0,
            details: BTreeMap::new(),
        }
    }
}

/// Everything a grader may look at. Graders read; they never mutate the
/// workspace.
pub struct GradingContext<'a> {
    pub task: &'a TaskSpec,
    pub output: &'a str,
    pub transcript: &'a [TranscriptEvent],
    pub digest: &'a SessionDigest,
    pub workspace_dir: &'a Path,
    pub duration_ms: u64,
}

impl GradingContext<'_> {
    /// Ordered skill invocations recorded for the run.
    pub fn skill_invocations(&self) -> &[String] {
        &self.digest.skill_invocations
    }

    /// Tool names from transcript start events, in call order. Distinct
    /// from skill invocations.
    pub fn tool_call_sequence(&self) -> Vec<String> {
        self.transcript
            .iter()
            .filter_map(|event| match event {
                TranscriptEvent::ToolExecutionStart { tool_name, .. } => Some(tool_name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A scoring function over a completed run.
///
/// Implementations hold only configuration; anything run-specific arrives
/// through the [`GradingContext`]. This is what makes per-task construction
/// and cross-run sharing safe.
#[async_trait]
pub trait Grader: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> &'static str;
    fn weight(&self) -> f64;
    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError>;
}

/// Construct the ordered grader list for a task: global graders first, then
/// task-local ones. Patterns compile here, once per task.
pub fn build_graders(
    global: &[GraderSpec],
    task: &TaskSpec,
) -> Result<Vec<Arc<dyn Grader>>, GraderError> {
    global
        .iter()
        .chain(task.graders.iter())
        .map(build_grader)
        .collect()
}

fn build_grader(spec: &GraderSpec) -> Result<Arc<dyn Grader>, GraderError> {
    let grader: Arc<dyn Grader> = match &spec.kind {
        GraderKindSpec::Regex {
            must_match,
            must_not_match,
        } => Arc::new(RegexGrader::new(
            &spec.name,
            spec.weight,
            must_match,
            must_not_match,
        )?),
        GraderKindSpec::File { checks } => {
            Arc::new(FileGrader::new(&spec.name, spec.weight, checks)?)
        }
        GraderKindSpec::Behavior {
            max_tool_calls,
            max_tokens,
            max_duration_ms,
            required_tools,
            forbidden_tools,
        } => Arc::new(BehaviorGrader::new(
            &spec.name,
            spec.weight,
            *max_tool_calls,
            *max_tokens,
            *max_duration_ms,
            required_tools.clone(),
            forbidden_tools.clone(),
        )),
        GraderKindSpec::ActionSequence { expected, mode } => Arc::new(SequenceGrader::new(
            &spec.name,
            spec.weight,
            SequenceSource::ToolCalls,
            expected.clone(),
            *mode,
        )),
        GraderKindSpec::SkillInvocation { expected, mode } => Arc::new(SequenceGrader::new(
            &spec.name,
            spec.weight,
            SequenceSource::SkillInvocations,
            expected.clone(),
            *mode,
        )),
        GraderKindSpec::Diff { expected_files } => {
            Arc::new(DiffGrader::new(&spec.name, spec.weight, expected_files.clone()))
        }
        GraderKindSpec::InlineScript { assertions } => {
            Arc::new(InlineScriptGrader::new(&spec.name, spec.weight, assertions)?)
        }
        GraderKindSpec::Program { command, args } => Arc::new(ProgramGrader::new(
            &spec.name,
            spec.weight,
            command.clone(),
            args.clone(),
        )),
    };
    Ok(grader)
}

/// How a pipeline pass ended.
#[derive(Debug)]
pub enum PipelineEnd {
    /// Every grader ran.
    Completed,

    /// Cancellation observed at a grader boundary.
    Cancelled,

    /// A grader faulted; the run is marked errored.
    Fault(GraderError),
}

/// Result map plus how the pass ended. The map is partial when the pass
/// was cut short. Keyed by grader name, iterating in declared order; the
/// report serializes it in that order too.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub validations: IndexMap<String, GraderResult>,
    pub end: PipelineEnd,
}

/// Apply graders sequentially in declared order.
pub async fn run_pipeline(
    cancel: &CancellationToken,
    graders: &[Arc<dyn Grader>],
    ctx: &GradingContext<'_>,
) -> PipelineOutcome {
    let mut validations = IndexMap::new();

    for grader in graders {
        if cancel.is_cancelled() {
            return PipelineOutcome {
                validations,
                end: PipelineEnd::Cancelled,
            };
        }

        let started = Instant::now();
        match grader.grade(ctx).await {
            Ok(mut result) => {
                result.duration_ms = started.elapsed().as_millis() as u64;
                result.score = result.score.clamp(0.0, 1.0);
                validations.insert(result.name.clone(), result);
            }
            Err(e) => {
                tracing::warn!(grader = grader.name(), "grader fault: {e}");
                return PipelineOutcome {
                    validations,
                    end: PipelineEnd::Fault(e),
                };
            }
        }
    }

    PipelineOutcome {
        validations,
        end: PipelineEnd::Completed,
    }
}

/// Weighted mean over graders with positive weight. A zero weight sum
/// yields `None`; callers treat that as an errored run.
pub fn aggregate_score(validations: &IndexMap<String, GraderResult>) -> Option<f64> {
    let weight_sum: f64 = validations.values().map(|v| v.weight.max(0.0)).sum();
    if weight_sum <= 0.0 {
        return None;
    }
    let weighted: f64 = validations
        .values()
        .filter(|v| v.weight > 0.0)
        .map(|v| v.weight * v.score)
        .sum();
    Some(weighted / weight_sum)
}

/// True when every positively weighted grader passed.
pub fn all_weighted_passed(validations: &IndexMap<String, GraderResult>) -> bool {
    validations
        .values()
        .filter(|v| v.weight > 0.0)
        .all(|v| v.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TaskInputs;

    pub(crate) fn task_with_graders(graders: Vec<GraderSpec>) -> TaskSpec {
        TaskSpec {
            id: "t1".into(),
            display_name: String::new(),
            description: None,
            tags: vec![],
            inputs: TaskInputs {
                prompt: "say hi".into(),
                files: vec![],
            },
            expected: None,
            graders,
            timeout_override: None,
        }
    }

    pub(crate) fn context<'a>(
        task: &'a TaskSpec,
        output: &'a str,
        transcript: &'a [TranscriptEvent],
        digest: &'a SessionDigest,
        workspace_dir: &'a Path,
    ) -> GradingContext<'a> {
        GradingContext {
            task,
            output,
            transcript,
            digest,
            workspace_dir,
            duration_ms: 42,
        }
    }

    fn result(name: &str, score: f64, passed: bool, weight: f64) -> GraderResult {
        GraderResult {
            score,
            passed,
            weight,
            ..GraderResult::new(name, "regex", weight)
        }
    }

    #[test]
    fn test_aggregate_score_is_weighted_mean() {
        let mut validations = IndexMap::new();
        validations.insert("a".to_string(), result("a", 1.0, true, 3.0));
        validations.insert("b".to_string(), result("b", 0.0, false, 1.0));

        let score = aggregate_score(&validations).unwrap();
        assert!((score - 0.75).abs() < 1e-9);
        assert!(!all_weighted_passed(&validations));
    }

    #[test]
    fn test_zero_weight_sum_yields_none() {
        let mut validations = IndexMap::new();
        validations.insert("a".to_string(), result("a", 1.0, true, 0.0));
        assert_eq!(aggregate_score(&validations), None);
    }

    #[test]
    fn test_zero_weight_graders_do_not_gate_pass() {
        let mut validations = IndexMap::new();
        validations.insert("a".to_string(), result("a", 1.0, true, 1.0));
        validations.insert("advisory".to_string(), result("advisory", 0.0, false, 0.0));
        assert!(all_weighted_passed(&validations));
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_declared_order_and_times_calls() {
        let specs = vec![
            GraderSpec {
                name: "first".into(),
                weight: 1.0,
                kind: GraderKindSpec::Regex {
                    must_match: vec!["hi".into()],
                    must_not_match: vec![],
                },
            },
            GraderSpec {
                name: "second".into(),
                weight: 1.0,
                kind: GraderKindSpec::Regex {
                    must_match: vec!["absent".into()],
                    must_not_match: vec![],
                },
            },
        ];
        let task = task_with_graders(specs);
        let graders = build_graders(&[], &task).unwrap();
        let digest = SessionDigest::default();
        let ctx = context(&task, "hi there", &[], &digest, Path::new("/tmp"));

        let cancel = CancellationToken::new();
        let outcome = run_pipeline(&cancel, &graders, &ctx).await;

        assert!(matches!(outcome.end, PipelineEnd::Completed));
        assert_eq!(outcome.validations.len(), 2);
        assert!(outcome.validations["first"].passed);
        assert!(!outcome.validations["second"].passed);
    }

    #[tokio::test]
    async fn test_pipeline_stops_at_cancellation_boundary() {
        let specs = vec![GraderSpec {
            name: "never-runs".into(),
            weight: 1.0,
            kind: GraderKindSpec::Regex {
                must_match: vec!["hi".into()],
                must_not_match: vec![],
            },
        }];
        let task = task_with_graders(specs);
        let graders = build_graders(&[], &task).unwrap();
        let digest = SessionDigest::default();
        let ctx = context(&task, "hi", &[], &digest, Path::new("/tmp"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_pipeline(&cancel, &graders, &ctx).await;

        assert!(matches!(outcome.end, PipelineEnd::Cancelled));
        assert!(outcome.validations.is_empty());
    }

    #[test]
    fn test_build_graders_orders_global_before_local() {
        let global = vec![GraderSpec {
            name: "global-check".into(),
            weight: 1.0,
            kind: GraderKindSpec::Regex {
                must_match: vec![],
                must_not_match: vec![],
            },
        }];
        let task = task_with_graders(vec![GraderSpec {
            name: "local-check".into(),
            weight: 1.0,
            kind: GraderKindSpec::Behavior {
                max_tool_calls: None,
                max_tokens: None,
                max_duration_ms: None,
                required_tools: vec![],
                forbidden_tools: vec![],
            },
        }]);

        let graders = build_graders(&global, &task).unwrap();
        assert_eq!(graders.len(), 2);
        assert_eq!(graders[0].name(), "global-check");
        assert_eq!(graders[1].name(), "local-check");
    }

    #[test]
    fn test_bad_regex_fails_construction() {
        let task = task_with_graders(vec![GraderSpec {
            name: "broken".into(),
            weight: 1.0,
            kind: GraderKindSpec::Regex {
                must_match: vec!["(unclosed".into()],
                must_not_match: vec![],
            },
        }]);
        let err = build_graders(&[], &task).unwrap_err();
        assert!(matches!(err, GraderError::Construction { .. }));
    }

    #[tokio::test]
    async fn test_validations_keep_declared_order_not_alphabetical() {
        // "zeta" is declared first but sorts after "alpha"; the result map
        // and its JSON form must both keep the declared order.
        let specs = vec![
            GraderSpec {
                name: "zeta".into(),
                weight: 1.0,
                kind: GraderKindSpec::Regex {
                    must_match: vec!["hi".into()],
                    must_not_match: vec![],
                },
            },
            GraderSpec {
                name: "alpha".into(),
                weight: 1.0,
                kind: GraderKindSpec::Regex {
                    must_match: vec!["hi".into()],
                    must_not_match: vec![],
                },
            },
        ];
        let task = task_with_graders(specs);
        let graders = build_graders(&[], &task).unwrap();
        let digest = SessionDigest::default();
        let ctx = context(&task, "hi", &[], &digest, Path::new("/tmp"));

        let cancel = CancellationToken::new();
        let outcome = run_pipeline(&cancel, &graders, &ctx).await;

        let names: Vec<&str> = outcome.validations.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let json = serde_json::to_string(&outcome.validations).unwrap();
        let zeta_at = json.find("\"zeta\"").unwrap();
        let alpha_at = json.find("\"alpha\"").unwrap();
        assert!(
            zeta_at < alpha_at,
            "serialized keys must follow declared order: {json}"
        );
    }
}
