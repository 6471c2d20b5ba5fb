//! Regex grader over the agent's final output

use ::regex::Regex;
use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};

/// Scores the fraction of `must_match` patterns found in the output, minus
/// a penalty for every `must_not_match` hit.
#[derive(Debug)]
pub struct RegexGrader {
    name: String,
    weight: f64,
    must_match: Vec<Regex>,
    must_not_match: Vec<Regex>,
}

impl RegexGrader {
    pub fn new(
        name: &str,
        weight: f64,
        must_match: &[String],
        must_not_match: &[String],
    ) -> Result<Self, GraderError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, GraderError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| GraderError::Construction {
                        name: name.to_string(),
                        message: format!("bad pattern '{p}': {e}"),
                    })
                })
                .collect()
        };

        Ok(Self {
            name: name.to_string(),
            weight,
            must_match: compile(must_match)?,
            must_not_match: compile(must_not_match)?,
        })
    }
}

#[async_trait]
impl Grader for RegexGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "regex"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let mut missing = Vec::new();
        let matched = self
            .must_match
            .iter()
            .filter(|pattern| {
                let hit = pattern.is_match(ctx.output);
                if !hit {
                    missing.push(pattern.as_str().to_string());
                }
                hit
            })
            .count();

        let forbidden_hits: Vec<String> = self
            .must_not_match
            .iter()
            .filter(|pattern| pattern.is_match(ctx.output))
            .map(|pattern| pattern.as_str().to_string())
            .collect();

        let base = if self.must_match.is_empty() {
            1.0
        } else {
            matched as f64 / self.must_match.len() as f64
        };
        let penalty = if self.must_not_match.is_empty() {
            0.0
        } else {
            forbidden_hits.len() as f64 / self.must_not_match.len() as f64
        };

        result.score = (base - penalty).clamp(0.0, 1.0);
        result.passed = missing.is_empty() && forbidden_hits.is_empty();
        result.feedback = if result.passed {
            format!("all {} required patterns matched", self.must_match.len())
        } else {
            let mut parts = Vec::new();
            if !missing.is_empty() {
                parts.push(format!("unmatched: {missing:?}"));
            }
            if !forbidden_hits.is_empty() {
                parts.push(format!("forbidden matches: {forbidden_hits:?}"));
            }
            parts.join("; ")
        };
        result.details.insert(
            "matched".into(),
            serde_json::json!(matched),
        );
        if !forbidden_hits.is_empty() {
            result
                .details
                .insert("forbidden_hits".into(), serde_json::json!(forbidden_hits));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};
    use std::path::Path;

    async fn grade(grader: &RegexGrader, output: &str) -> GraderResult {
        let task = task_with_graders(vec![]);
        let digest = SessionDigest::default();
        let ctx = context(&task, output, &[], &digest, Path::new("/tmp"));
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_all_patterns_matched_scores_one() {
        let grader =
            RegexGrader::new("r", 1.0, &["hi".into(), "there".into()], &[]).unwrap();
        let result = grade(&grader, "hi there").await;
        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_partial_match_is_fractional() {
        let grader =
            RegexGrader::new("r", 1.0, &["hi".into(), "goodbye".into()], &[]).unwrap();
        let result = grade(&grader, "hi there").await;
        assert!((result.score - 0.5).abs() < 1e-9);
        assert!(!result.passed);
        assert!(result.feedback.contains("goodbye"));
    }

    #[tokio::test]
    async fn test_forbidden_hit_applies_penalty() {
        let grader = RegexGrader::new(
            "r",
            1.0,
            &["hi".into()],
            &["panic".into(), "abort".into()],
        )
        .unwrap();
        let result = grade(&grader, "hi, then panic").await;
        assert!((result.score - 0.5).abs() < 1e-9);
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_score_clamps_at_zero() {
        let grader = RegexGrader::new("r", 1.0, &["x".into()], &["bad".into()]).unwrap();
        let result = grade(&grader, "bad output").await;
        assert_eq!(result.score, 0.0);
    }

    #[tokio::test]
    async fn test_empty_must_match_passes_without_forbidden_hits() {
        let grader = RegexGrader::new("r", 1.0, &[], &["oops".into()]).unwrap();
        let result = grade(&grader, "clean").await;
        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }
}
