//! Inline-script grader: small assertions over the output and digest
//!
//! Assertions are single-line expressions of the form `<var> <op> <value>`,
//! parsed at construction so malformed scripts fail the spec, not the run:
//!
//! ```yaml
//! kind: inline_script
//! assertions:
//!   - output contains "done"
//!   - tool_call_count <= 5
//!   - tokens_total < 20000
//! ```
//!
//! The run scores 1.0 only when every assertion holds.

use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Output,
    OutputLen,
    TotalTurns,
    ToolCallCount,
    TokensIn,
    TokensOut,
    TokensTotal,
    DurationMs,
    ErrorCount,
    SkillCount,
    PendingToolCalls,
}

impl Var {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "output" => Some(Self::Output),
            "output_len" => Some(Self::OutputLen),
            "total_turns" => Some(Self::TotalTurns),
            "tool_call_count" => Some(Self::ToolCallCount),
            "tokens_in" => Some(Self::TokensIn),
            "tokens_out" => Some(Self::TokensOut),
            "tokens_total" => Some(Self::TokensTotal),
            "duration_ms" => Some(Self::DurationMs),
            "error_count" => Some(Self::ErrorCount),
            "skill_count" => Some(Self::SkillCount),
            "pending_tool_calls" => Some(Self::PendingToolCalls),
            _ => None,
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, Self::Output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
}

impl Op {
    fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "contains" => Some(Self::Contains),
            "not_contains" => Some(Self::NotContains),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone)]
struct Assertion {
    raw: String,
    var: Var,
    op: Op,
    operand: Operand,
}

impl Assertion {
    fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let mut parts = trimmed.split_whitespace();
        let var_name = parts.next().unwrap_or_default();
        let op_symbol = parts.next().unwrap_or_default();
        // Everything after the operator is the value, quotes included.
        let value_raw = trimmed
            .strip_prefix(var_name)
            .map(str::trim_start)
            .and_then(|rest| rest.strip_prefix(op_symbol))
            .map(str::trim)
            .unwrap_or_default();

        let var = Var::parse(var_name).ok_or_else(|| format!("unknown variable '{var_name}'"))?;
        let op = Op::parse(op_symbol).ok_or_else(|| format!("unknown operator '{op_symbol}'"))?;
        if value_raw.is_empty() {
            return Err("missing value".to_string());
        }

        let operand = if value_raw.starts_with('"') && value_raw.ends_with('"') && value_raw.len() >= 2
        {
            Operand::Text(value_raw[1..value_raw.len() - 1].to_string())
        } else if let Ok(number) = value_raw.parse::<f64>() {
            Operand::Number(number)
        } else {
            Operand::Text(value_raw.to_string())
        };

        // Type check once, here, instead of on every run.
        match (var.is_text(), op, &operand) {
            (true, Op::Eq | Op::Ne | Op::Contains | Op::NotContains, Operand::Text(_)) => {}
            (true, _, _) => {
                return Err(format!("operator '{op_symbol}' not usable with text variable"));
            }
            (false, Op::Contains | Op::NotContains, _) => {
                return Err(format!("operator '{op_symbol}' needs a text variable"));
            }
            (false, _, Operand::Text(_)) => {
                return Err(format!("numeric variable '{var_name}' needs a numeric value"));
            }
            (false, _, Operand::Number(_)) => {}
        }

        Ok(Self {
            raw: trimmed.to_string(),
            var,
            op,
            operand,
        })
    }

    fn holds(&self, ctx: &GradingContext<'_>) -> bool {
        if self.var.is_text() {
            let Operand::Text(expected) = &self.operand else {
                return false;
            };
            let actual = ctx.output;
            return match self.op {
                Op::Eq => actual == expected,
                Op::Ne => actual != expected,
                Op::Contains => actual.contains(expected.as_str()),
                Op::NotContains => !actual.contains(expected.as_str()),
                _ => false,
            };
        }

        let Operand::Number(expected) = self.operand else {
            return false;
        };
        let digest = ctx.digest;
        let actual = match self.var {
            Var::Output => return false,
            Var::OutputLen => ctx.output.len() as f64,
            Var::TotalTurns => digest.total_turns as f64,
            Var::ToolCallCount => digest.tool_call_count as f64,
            Var::TokensIn => digest.tokens_in as f64,
            Var::TokensOut => digest.tokens_out as f64,
            Var::TokensTotal => digest.tokens_total as f64,
            Var::DurationMs => ctx.duration_ms as f64,
            Var::ErrorCount => digest.errors.len() as f64,
            Var::SkillCount => digest.skill_invocations.len() as f64,
            Var::PendingToolCalls => digest.pending_tool_calls.len() as f64,
        };

        match self.op {
            Op::Eq => actual == expected,
            Op::Ne => actual != expected,
            Op::Gt => actual > expected,
            Op::Ge => actual >= expected,
            Op::Lt => actual < expected,
            Op::Le => actual <= expected,
            Op::Contains | Op::NotContains => false,
        }
    }
}

/// All-or-nothing assertion grader.
#[derive(Debug)]
pub struct InlineScriptGrader {
    name: String,
    weight: f64,
    assertions: Vec<Assertion>,
}

impl InlineScriptGrader {
    pub fn new(name: &str, weight: f64, assertions: &[String]) -> Result<Self, GraderError> {
        let parsed = assertions
            .iter()
            .map(|raw| {
                Assertion::parse(raw).map_err(|message| GraderError::Construction {
                    name: name.to_string(),
                    message: format!("assertion '{raw}': {message}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            weight,
            assertions: parsed,
        })
    }
}

#[async_trait]
impl Grader for InlineScriptGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "inline_script"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let failed: Vec<String> = self
            .assertions
            .iter()
            .filter(|assertion| !assertion.holds(ctx))
            .map(|assertion| assertion.raw.clone())
            .collect();

        result.passed = failed.is_empty();
        result.score = if result.passed { 1.0 } else { 0.0 };
        result.feedback = if result.passed {
            format!("all {} assertions held", self.assertions.len())
        } else {
            format!("failed assertions: {failed:?}")
        };
        result.details.insert(
            "assertions_total".into(),
            serde_json::json!(self.assertions.len()),
        );
        result
            .details
            .insert("assertions_failed".into(), serde_json::json!(failed.len()));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionDigest;
    use crate::graders::tests::{context, task_with_graders};
    use std::path::Path;

    async fn grade_with(
        assertions: &[&str],
        output: &str,
        digest: &SessionDigest,
    ) -> GraderResult {
        let assertions: Vec<String> = assertions.iter().map(|s| s.to_string()).collect();
        let grader = InlineScriptGrader::new("script", 1.0, &assertions).unwrap();
        let task = task_with_graders(vec![]);
        let ctx = context(&task, output, &[], digest, Path::new("/tmp"));
        grader.grade(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_passing_assertions() {
        let digest = SessionDigest {
            tool_call_count: 3,
            tokens_total: 500,
            ..SessionDigest::default()
        };
        let result = grade_with(
            &[
                "output contains \"done\"",
                "tool_call_count <= 5",
                "tokens_total < 1000",
            ],
            "all done",
            &digest,
        )
        .await;

        assert_eq!(result.score, 1.0);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_one_failure_zeroes_the_score() {
        let result = grade_with(
            &["output contains \"done\"", "output_len < 3"],
            "all done",
            &SessionDigest::default(),
        )
        .await;

        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(result.feedback.contains("output_len"));
    }

    #[tokio::test]
    async fn test_quoted_values_may_contain_spaces() {
        let result = grade_with(
            &["output == \"hi there\""],
            "hi there",
            &SessionDigest::default(),
        )
        .await;
        assert!(result.passed);
    }

    #[test]
    fn test_unknown_variable_fails_construction() {
        let err =
            InlineScriptGrader::new("script", 1.0, &["bogus_var == 1".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown variable"));
    }

    #[test]
    fn test_type_mismatch_fails_construction() {
        let err = InlineScriptGrader::new("script", 1.0, &["output > 3".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not usable"));

        let err = InlineScriptGrader::new(
            "script",
            1.0,
            &["tool_call_count contains \"x\"".to_string()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs a text variable"));
    }
}
