//! File grader over the run workspace

use std::path::Component;

use ::regex::Regex;
use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};
use crate::spec::FileCheck;

/// Scores the fraction of file existence and content checks that pass
/// against the workspace as the engine left it.
#[derive(Debug)]
pub struct FileGrader {
    name: String,
    weight: f64,
    checks: Vec<CompiledCheck>,
}

#[derive(Debug)]
struct CompiledCheck {
    check: FileCheck,
    patterns: Vec<Regex>,
}

impl FileGrader {
    pub fn new(name: &str, weight: f64, checks: &[FileCheck]) -> Result<Self, GraderError> {
        let compiled = checks
            .iter()
            .map(|check| {
                let patterns = check
                    .contains
                    .iter()
                    .map(|p| {
                        Regex::new(p).map_err(|e| GraderError::Construction {
                            name: name.to_string(),
                            message: format!("bad pattern '{p}': {e}"),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledCheck {
                    check: check.clone(),
                    patterns,
                })
            })
            .collect::<Result<Vec<_>, GraderError>>()?;

        Ok(Self {
            name: name.to_string(),
            weight,
            checks: compiled,
        })
    }
}

/// Paths in checks stay inside the workspace; anything else fails the
/// check rather than reading outside the sandbox.
fn path_is_contained(check: &FileCheck) -> bool {
    !check.path.is_absolute()
        && check
            .path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl Grader for FileGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let mut total = 0usize;
        let mut passed = 0usize;
        let mut failures = Vec::new();

        for compiled in &self.checks {
            let check = &compiled.check;
            let display = check.path.display();

            if !path_is_contained(check) {
                total += 1 + compiled.patterns.len();
                failures.push(format!("{display}: path leaves the workspace"));
                continue;
            }

            let full = ctx.workspace_dir.join(&check.path);
            let exists = full.is_file();

            total += 1;
            if exists == check.exists {
                passed += 1;
            } else if check.exists {
                failures.push(format!("{display}: missing"));
            } else {
                failures.push(format!("{display}: unexpectedly present"));
            }

            if compiled.patterns.is_empty() {
                continue;
            }
            total += compiled.patterns.len();

            if !exists {
                failures.push(format!("{display}: content checks skipped, file missing"));
                continue;
            }

            let content = match tokio::fs::read_to_string(&full).await {
                Ok(content) => content,
                Err(e) => {
                    failures.push(format!("{display}: unreadable: {e}"));
                    continue;
                }
            };
            for pattern in &compiled.patterns {
                if pattern.is_match(&content) {
                    passed += 1;
                } else {
                    failures.push(format!("{display}: no match for '{}'", pattern.as_str()));
                }
            }
        }

        result.score = if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        };
        result.passed = failures.is_empty();
        result.feedback = if result.passed {
            format!("{total} checks passed")
        } else {
            failures.join("; ")
        };
        result
            .details
            .insert("checks_total".into(), serde_json::json!(total));
        result
            .details
            .insert("checks_passed".into(), serde_json::json!(passed));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};
    use std::path::PathBuf;

    fn check(path: &str, exists: bool, contains: Vec<&str>) -> FileCheck {
        FileCheck {
            path: PathBuf::from(path),
            exists,
            contains: contains.into_iter().map(String::from).collect(),
        }
    }

    async fn grade(grader: &FileGrader, workspace: &std::path::Path) -> GraderResult {
        let task = task_with_graders(vec![]);
        let digest = SessionDigest::default();
        let ctx = context(&task, "", &[], &digest, workspace);
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_existence_and_content_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "status: done\n").unwrap();

        let grader = FileGrader::new(
            "files",
            1.0,
            &[check("out.txt", true, vec!["status: done"])],
        )
        .unwrap();
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_missing_file_fails_its_checks() {
        let dir = tempfile::tempdir().unwrap();

        let grader = FileGrader::new(
            "files",
            1.0,
            &[
                check("missing.txt", true, vec!["anything"]),
                check("also-missing.txt", true, vec![]),
            ],
        )
        .unwrap();
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(result.feedback.contains("missing.txt"));
    }

    #[tokio::test]
    async fn test_absence_check_passes_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();

        let grader = FileGrader::new("files", 1.0, &[check("tmp.lock", false, vec![])]).unwrap();
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_partial_content_match_is_fractional() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), "alpha\n").unwrap();

        let grader = FileGrader::new(
            "files",
            1.0,
            &[check("report.md", true, vec!["alpha", "beta"])],
        )
        .unwrap();
        let result = grade(&grader, dir.path()).await;

        // existence + alpha pass, beta fails: 2 of 3.
        assert!((result.score - 2.0 / 3.0).abs() < 1e-9);
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_escaping_path_fails_closed() {
        let dir = tempfile::tempdir().unwrap();

        let grader =
            FileGrader::new("files", 1.0, &[check("../outside.txt", true, vec![])]).unwrap();
        let result = grade(&grader, dir.path()).await;

        assert_eq!(result.score, 0.0);
        assert!(result.feedback.contains("leaves the workspace"));
    }
}
