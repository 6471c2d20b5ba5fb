//! Diff grader: expected workspace files against required fragments

use std::path::Component;

use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};
use crate::spec::DiffExpectation;

/// Scores the fraction of expected files whose content contains every
/// required fragment.
#[derive(Debug)]
pub struct DiffGrader {
    name: String,
    weight: f64,
    expected_files: Vec<DiffExpectation>,
}

impl DiffGrader {
    pub fn new(name: &str, weight: f64, expected_files: Vec<DiffExpectation>) -> Self {
        Self {
            name: name.to_string(),
            weight,
            expected_files,
        }
    }
}

#[async_trait]
impl Grader for DiffGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "diff"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let mut matched = 0usize;
        let mut failures = Vec::new();

        for expectation in &self.expected_files {
            let display = expectation.path.display();

            let contained = !expectation.path.is_absolute()
                && expectation
                    .path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained {
                failures.push(format!("{display}: path leaves the workspace"));
                continue;
            }

            let full = ctx.workspace_dir.join(&expectation.path);
            let content = match tokio::fs::read_to_string(&full).await {
                Ok(content) => content,
                Err(_) => {
                    failures.push(format!("{display}: missing"));
                    continue;
                }
            };

            let missing: Vec<&String> = expectation
                .fragments
                .iter()
                .filter(|fragment| !content.contains(fragment.as_str()))
                .collect();
            if missing.is_empty() {
                matched += 1;
            } else {
                failures.push(format!("{display}: missing fragments {missing:?}"));
            }
        }

        result.score = if self.expected_files.is_empty() {
            1.0
        } else {
            matched as f64 / self.expected_files.len() as f64
        };
        result.passed = failures.is_empty();
        result.feedback = if result.passed {
            format!("{matched} expected files matched")
        } else {
            failures.join("; ")
        };
        result
            .details
            .insert("files_matched".into(), serde_json::json!(matched));
        result.details.insert(
            "files_expected".into(),
            serde_json::json!(self.expected_files.len()),
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};
    use std::path::PathBuf;

    fn expectation(path: &str, fragments: Vec<&str>) -> DiffExpectation {
        DiffExpectation {
            path: PathBuf::from(path),
            fragments: fragments.into_iter().map(String::from).collect(),
        }
    }

    async fn grade(grader: &DiffGrader, workspace: &std::path::Path) -> GraderResult {
        let task = task_with_graders(vec![]);
        let digest = SessionDigest::default();
        let ctx = context(&task, "", &[], &digest, workspace);
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_all_fragments_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "def run():\n    return 1\n").unwrap();

        let grader = DiffGrader::new(
            "diff",
            1.0,
            vec![expectation("main.py", vec!["def run()", "return 1"])],
        );
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_missing_fragment_fails_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();

        let grader = DiffGrader::new(
            "diff",
            1.0,
            vec![
                expectation("a.txt", vec!["alpha"]),
                expectation("b.txt", vec!["gamma"]),
            ],
        );
        let result = grade(&grader, dir.path()).await;

        assert!((result.score - 0.5).abs() < 1e-9);
        assert!(!result.passed);
        assert!(result.feedback.contains("b.txt"));
    }

    #[tokio::test]
    async fn test_missing_file_counts_as_unmatched() {
        let dir = tempfile::tempdir().unwrap();

        let grader = DiffGrader::new("diff", 1.0, vec![expectation("ghost.txt", vec![])]);
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 0.0);
        assert!(result.feedback.contains("missing"));
    }
}
