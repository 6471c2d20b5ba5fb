//! Program grader: external process verdicts
//!
//! Runs a declared command with the agent output on stdin and the live
//! workspace path in `WAZA_WORKSPACE_DIR`. Exit 0 scores 1.0; any other
//! exit scores 0.0 with stderr folded into the feedback.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};

#[derive(Debug)]
pub struct ProgramGrader {
    name: String,
    weight: f64,
    command: String,
    args: Vec<String>,
}

impl ProgramGrader {
    pub fn new(name: &str, weight: f64, command: String, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            weight,
            command,
            args,
        }
    }
}

#[async_trait]
impl Grader for ProgramGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "program"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .env("WAZA_WORKSPACE_DIR", ctx.workspace_dir)
            .current_dir(ctx.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GraderError::Failed {
                name: self.name.clone(),
                message: format!("failed to spawn '{}': {e}", self.command),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let output = ctx.output.as_bytes().to_vec();
            // The child may exit without reading; a broken pipe is fine.
            let _ = stdin.write_all(&output).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GraderError::Failed {
                name: self.name.clone(),
                message: format!("failed to wait for '{}': {e}", self.command),
            })?;

        let code = output.status.code().unwrap_or(-1);
        result.passed = output.status.success();
        result.score = if result.passed { 1.0 } else { 0.0 };
        result.feedback = if result.passed {
            format!("'{}' exited 0", self.command)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            format!(
                "'{}' exited {code}: {}",
                self.command,
                stderr.trim().chars().take(400).collect::<String>()
            )
        };
        result
            .details
            .insert("exit_code".into(), serde_json::json!(code));

        Ok(result)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};

    async fn grade(grader: &ProgramGrader, output: &str, workspace: &std::path::Path) -> GraderResult {
        let task = task_with_graders(vec![]);
        let digest = SessionDigest::default();
        let ctx = context(&task, output, &[], &digest, workspace);
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_exit_zero_passes() {
        let dir = tempfile::tempdir().unwrap();
        let grader = ProgramGrader::new("prog", 1.0, "true".into(), vec![]);
        let result = grade(&grader, "anything", dir.path()).await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let grader = ProgramGrader::new("prog", 1.0, "false".into(), vec![]);
        let result = grade(&grader, "anything", dir.path()).await;

        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert_eq!(result.details["exit_code"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_stdin_receives_agent_output() {
        let dir = tempfile::tempdir().unwrap();
        let grader = ProgramGrader::new(
            "prog",
            1.0,
            "sh".into(),
            vec!["-c".into(), "grep -q done".into()],
        );

        let passing = grade(&grader, "work is done", dir.path()).await;
        assert!(passing.passed);

        let failing = grade(&grader, "still going", dir.path()).await;
        assert!(!failing.passed);
    }

    #[tokio::test]
    async fn test_workspace_env_is_exported() {
        let dir = tempfile::tempdir().unwrap();
        let grader = ProgramGrader::new(
            "prog",
            1.0,
            "sh".into(),
            vec!["-c".into(), "test -d \"$WAZA_WORKSPACE_DIR\"".into()],
        );
        let result = grade(&grader, "", dir.path()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_grader_fault() {
        let dir = tempfile::tempdir().unwrap();
        let grader = ProgramGrader::new("prog", 1.0, "/no/such/binary".into(), vec![]);

        let task = task_with_graders(vec![]);
        let digest = SessionDigest::default();
        let ctx = context(&task, "", &[], &digest, dir.path());
        let err = grader.grade(&ctx).await.unwrap_err();
        assert!(matches!(err, GraderError::Failed { .. }));
    }
}
