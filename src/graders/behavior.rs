//! Behavior grader over the session digest

use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};

/// All-or-nothing check of behavioral caps: tool call budget, token budget,
/// wall clock, and required/forbidden tool sets.
#[derive(Debug)]
pub struct BehaviorGrader {
    name: String,
    weight: f64,
    max_tool_calls: Option<u64>,
    max_tokens: Option<u64>,
    max_duration_ms: Option<u64>,
    required_tools: Vec<String>,
    forbidden_tools: Vec<String>,
}

impl BehaviorGrader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        weight: f64,
        max_tool_calls: Option<u64>,
        max_tokens: Option<u64>,
        max_duration_ms: Option<u64>,
        required_tools: Vec<String>,
        forbidden_tools: Vec<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            weight,
            max_tool_calls,
            max_tokens,
            max_duration_ms,
            required_tools,
            forbidden_tools,
        }
    }
}

#[async_trait]
impl Grader for BehaviorGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "behavior"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);
        let digest = ctx.digest;
        let mut violations = Vec::new();

        if let Some(cap) = self.max_tool_calls {
            if digest.tool_call_count > cap {
                violations.push(format!(
                    "tool calls {} exceed cap {cap}",
                    digest.tool_call_count
                ));
            }
        }
        if let Some(cap) = self.max_tokens {
            if digest.tokens_total > cap {
                violations.push(format!("tokens {} exceed cap {cap}", digest.tokens_total));
            }
        }
        if let Some(cap) = self.max_duration_ms {
            if ctx.duration_ms > cap {
                violations.push(format!("duration {}ms exceeds cap {cap}ms", ctx.duration_ms));
            }
        }
        for tool in &self.required_tools {
            if !digest.tools_used.contains(tool) {
                violations.push(format!("required tool '{tool}' never used"));
            }
        }
        for tool in &self.forbidden_tools {
            if digest.tools_used.contains(tool) {
                violations.push(format!("forbidden tool '{tool}' used"));
            }
        }

        result.passed = violations.is_empty();
        result.score = if result.passed { 1.0 } else { 0.0 };
        result.feedback = if result.passed {
            "all behavioral caps satisfied".to_string()
        } else {
            violations.join("; ")
        };
        result.details.insert(
            "tool_call_count".into(),
            serde_json::json!(digest.tool_call_count),
        );
        result
            .details
            .insert("tokens_total".into(), serde_json::json!(digest.tokens_total));
        result
            .details
            .insert("duration_ms".into(), serde_json::json!(ctx.duration_ms));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};
    use std::path::Path;

    fn digest_with(tool_calls: u64, tokens: u64, tools: Vec<&str>) -> SessionDigest {
        SessionDigest {
            tool_call_count: tool_calls,
            tokens_total: tokens,
            tools_used: tools.into_iter().map(String::from).collect(),
            ..SessionDigest::default()
        }
    }

    async fn grade(grader: &BehaviorGrader, digest: &SessionDigest) -> GraderResult {
        let task = task_with_graders(vec![]);
        let ctx = context(&task, "", &[], digest, Path::new("/tmp"));
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_within_caps_scores_one() {
        let grader = BehaviorGrader::new(
            "caps",
            1.0,
            Some(10),
            Some(1000),
            None,
            vec!["read".into()],
            vec!["bash".into()],
        );
        let digest = digest_with(3, 500, vec!["read", "write"]);
        let result = grade(&grader, &digest).await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_any_violation_scores_zero() {
        let grader = BehaviorGrader::new("caps", 1.0, Some(2), None, None, vec![], vec![]);
        let digest = digest_with(5, 0, vec![]);
        let result = grade(&grader, &digest).await;

        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(result.feedback.contains("exceed cap"));
    }

    #[tokio::test]
    async fn test_forbidden_tool_use_fails() {
        let grader =
            BehaviorGrader::new("caps", 1.0, None, None, None, vec![], vec!["bash".into()]);
        let digest = digest_with(1, 0, vec!["bash"]);
        let result = grade(&grader, &digest).await;

        assert!(!result.passed);
        assert!(result.feedback.contains("forbidden tool 'bash'"));
    }

    #[tokio::test]
    async fn test_missing_required_tool_fails() {
        let grader =
            BehaviorGrader::new("caps", 1.0, None, None, None, vec!["edit".into()], vec![]);
        let digest = digest_with(0, 0, vec!["read"]);
        let result = grade(&grader, &digest).await;

        assert!(!result.passed);
        assert!(result.feedback.contains("required tool 'edit'"));
    }
}
