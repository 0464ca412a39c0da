//! Result interpretation: raw execution output into structured insight.
//!
//! Only successful executions are sent to the backend. Failed, timed-out
//! and policy-rejected steps get a synthesized "not completed" insight so
//! the record stays complete without spending backend budget on output
//! that does not exist.

use autoanalyst_sdk::{BoundedText, Purpose, ReasoningBackend};

use crate::backend::{complete_with_retry, RetryPolicy};
use crate::context::{build_context, ContextView};
use crate::error::EngineResult;
use crate::prompts;
use crate::state::{Confidence, ContextSnapshot, ExecutionArtifact, Insight, PlanStep};

/// Longest slice of captured stdout forwarded to the backend. Output
/// beyond this is overwhelmingly table dumps.
const MAX_STDOUT_CHARS: usize = 4000;

pub struct ResultInterpreter {
    retry: RetryPolicy,
    context_budget: usize,
}

impl ResultInterpreter {
    pub fn new(retry: RetryPolicy, context_budget: usize) -> Self {
        Self {
            retry,
            context_budget,
        }
    }

    /// Interpret a finished step. Non-success artifacts never reach the
    /// backend; they produce a local synthesized insight.
    pub async fn interpret(
        &self,
        backend: &dyn ReasoningBackend,
        step: &PlanStep,
        artifact: &ExecutionArtifact,
        snapshot: &ContextSnapshot,
    ) -> EngineResult<Insight> {
        if !artifact.succeeded() {
            return Ok(Insight::not_completed(
                step.id,
                artifact.outcome,
                artifact.code_version,
            ));
        }

        let view = ContextView::from_snapshot(snapshot).with_step(format!(
            "Step {}: {}",
            step.seq + 1,
            step.description
        ));
        let context = build_context(&view, self.context_budget);

        let stdout = clip(&artifact.stdout, MAX_STDOUT_CHARS);
        let result = artifact
            .result_value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        let prompt = BoundedText::fit(
            prompts::interpret_results(context.as_str(), &stdout, &result, artifact.figures.len()),
            self.context_budget * 2,
        );

        let response =
            complete_with_retry(backend, &prompt, Purpose::Interpret, self.retry).await?;
        Ok(parse_insight(step, &response))
    }

    /// Final report body over the whole project. Falls back to a
    /// deterministic local rendering when the backend is unavailable.
    pub async fn summary_report(
        &self,
        backend: &dyn ReasoningBackend,
        digest_text: &str,
        plan_overview: &str,
    ) -> String {
        let view = ContextView {
            insight_digest: Some(digest_text.to_string()),
            full_plan: Some(plan_overview.to_string()),
            ..Default::default()
        };
        let context = build_context(&view, self.context_budget);
        let prompt = BoundedText::fit(
            prompts::summary_report(context.as_str()),
            self.context_budget * 2,
        );

        match complete_with_retry(backend, &prompt, Purpose::Interpret, self.retry).await {
            Ok(report) if !report.trim().is_empty() => report,
            _ => format!(
                "# Analysis summary\n\n## Findings\n\n{}\n\n## Plan\n\n{}\n",
                digest_text, plan_overview
            ),
        }
    }
}

/// Parse the structured interpretation response, tolerating missing
/// sections: a response with no recognizable structure still yields an
/// insight whose interpretation is the whole text.
fn parse_insight(step: &PlanStep, response: &str) -> Insight {
    let interpretation = prompts::section_text(response, "INTERPRETATION:")
        .unwrap_or_else(|| response.trim().to_string());
    let key_findings = prompts::section_bullets(response, "KEY FINDINGS:");
    let suggested_next_steps = prompts::section_bullets(response, "NEXT STEPS:");
    let confidence = parse_confidence(response);

    Insight {
        step_id: step.id,
        interpretation,
        key_findings,
        suggested_next_steps,
        confidence,
    }
}

fn parse_confidence(response: &str) -> Confidence {
    for line in response.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("CONFIDENCE:") {
            return match rest.trim().to_lowercase().as_str() {
                "low" => Confidence::Low,
                "high" => Confidence::High,
                _ => Confidence::Medium,
            };
        }
    }
    Confidence::Medium
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{}\n...(truncated)", clipped)
    }
}
