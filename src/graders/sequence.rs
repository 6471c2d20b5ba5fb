//! Sequence graders: tool-call order and skill-invocation order
//!
//! Both kinds share the same F1 machinery but read different streams: tool
//! names come from transcript start events, skill invocations from the
//! digest's dedicated list. The two are never mixed.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::graders::{Grader, GraderError, GraderResult, GradingContext};
use crate::spec::MatchMode;

/// Which recorded sequence the grader compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSource {
    /// Tool names from `ToolExecutionStart` transcript events.
    ToolCalls,

    /// Skill names from the digest's invocation list.
    SkillInvocations,
}

/// Precision/recall F1 of the actual sequence against the expected one.
#[derive(Debug)]
pub struct SequenceGrader {
    name: String,
    weight: f64,
    source: SequenceSource,
    expected: Vec<String>,
    mode: MatchMode,
}

impl SequenceGrader {
    pub fn new(
        name: &str,
        weight: f64,
        source: SequenceSource,
        expected: Vec<String>,
        mode: MatchMode,
    ) -> Self {
        Self {
            name: name.to_string(),
            weight,
            source,
            expected,
            mode,
        }
    }

    fn matched_count(&self, actual: &[String]) -> usize {
        match self.mode {
            MatchMode::Exact => actual
                .iter()
                .zip(self.expected.iter())
                .filter(|(a, e)| a == e)
                .count(),
            MatchMode::InOrder => longest_common_subsequence(actual, &self.expected),
            MatchMode::AnyOrder => multiset_overlap(actual, &self.expected),
        }
    }
}

/// Classic O(n*m) LCS length.
fn longest_common_subsequence(a: &[String], b: &[String]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for item_a in a {
        for (j, item_b) in b.iter().enumerate() {
            curr[j + 1] = if item_a == item_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn multiset_overlap(a: &[String], b: &[String]) -> usize {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in b {
        *counts.entry(item.as_str()).or_default() += 1;
    }
    let mut overlap = 0;
    for item in a {
        if let Some(count) = counts.get_mut(item.as_str()) {
            if *count > 0 {
                *count -= 1;
                overlap += 1;
            }
        }
    }
    overlap
}

fn f1(matched: usize, actual_len: usize, expected_len: usize) -> f64 {
    if actual_len == 0 && expected_len == 0 {
        return 1.0;
    }
    if actual_len == 0 || expected_len == 0 {
        return 0.0;
    }
    let precision = matched as f64 / actual_len as f64;
    let recall = matched as f64 / expected_len as f64;
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

#[async_trait]
impl Grader for SequenceGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        match self.source {
            SequenceSource::ToolCalls => "action_sequence",
            SequenceSource::SkillInvocations => "skill_invocation",
        }
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn grade(&self, ctx: &GradingContext<'_>) -> Result<GraderResult, GraderError> {
        let mut result = GraderResult::new(&self.name, self.kind(), self.weight);

        let actual: Vec<String> = match self.source {
            SequenceSource::ToolCalls => ctx.tool_call_sequence(),
            SequenceSource::SkillInvocations => ctx.skill_invocations().to_vec(),
        };

        // All modes score as F1; the mode only changes what counts as a
        // match.
        let matched = self.matched_count(&actual);
        let score = f1(matched, actual.len(), self.expected.len());

        result.score = score;
        result.passed = score >= 1.0;
        result.feedback = format!(
            "matched {matched} of {} expected (actual length {})",
            self.expected.len(),
            actual.len()
        );
        result
            .details
            .insert("actual".into(), serde_json::json!(actual));
        result
            .details
            .insert("expected".into(), serde_json::json!(self.expected));

        Ok(result)
    }
}
