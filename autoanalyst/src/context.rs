//! Context budgeting for reasoning backend calls.
//!
//! Every prompt the engine sends is assembled here under a hard token
//! budget. When the naive concatenation overflows, sections are kept in a
//! fixed precedence order - current step detail, recent failures, insight
//! digest, data profile, full plan - truncating the first section that no
//! longer fits and dropping everything after it.

use autoanalyst_sdk::{estimate_tokens, BoundedText, DataProfile, TokenBudget};

use crate::state::ContextSnapshot;

/// Which parts of project state a backend call wants to see.
///
/// Sections are plain rendered text; precedence is positional, not
/// caller-controlled, so every call site gets the same overflow behavior.
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    pub current_step: Option<String>,
    pub recent_failures: Vec<String>,
    pub insight_digest: Option<String>,
    pub data_profile: Option<String>,
    pub full_plan: Option<String>,
}

impl ContextView {
    /// Start from a consistent state snapshot: digest, profile and plan.
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Self {
        Self {
            current_step: None,
            recent_failures: Vec::new(),
            insight_digest: if snapshot.digest_text.is_empty() {
                None
            } else {
                Some(snapshot.digest_text.clone())
            },
            data_profile: Some(render_profile(&snapshot.profile)),
            full_plan: if snapshot.plan_overview.is_empty() {
                None
            } else {
                Some(snapshot.plan_overview.clone())
            },
        }
    }

    pub fn with_step(mut self, detail: impl Into<String>) -> Self {
        self.current_step = Some(detail.into());
        self
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.recent_failures.push(failure.into());
        self
    }

    fn sections(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(step) = &self.current_step {
            out.push(("Current step", step.clone()));
        }
        if !self.recent_failures.is_empty() {
            out.push(("Recent failures", self.recent_failures.join("\n\n")));
        }
        if let Some(digest) = &self.insight_digest {
            out.push(("Findings so far", digest.clone()));
        }
        if let Some(profile) = &self.data_profile {
            out.push(("Data profile", profile.clone()));
        }
        if let Some(plan) = &self.full_plan {
            out.push(("Analysis plan", plan.clone()));
        }
        out
    }
}

/// Assemble a view into budgeted text. The result never exceeds `budget`
/// estimated tokens, whatever the view contains.
pub fn build_context(view: &ContextView, budget: TokenBudget) -> BoundedText {
    let mut parts: Vec<String> = Vec::new();
    let mut remaining = budget;

    for (title, body) in view.sections() {
        if remaining == 0 {
            break;
        }
        let header = format!("## {}", title);
        let header_tokens = estimate_tokens(&header);
        if header_tokens + 1 > remaining {
            break;
        }
        let body_budget = remaining - header_tokens;
        let body = BoundedText::fit(body, body_budget);
        if body.as_str().is_empty() {
            break;
        }
        remaining -= header_tokens + body.tokens();
        parts.push(format!("{}\n{}", header, body.as_str()));
    }

    BoundedText::fit(parts.join("\n\n"), budget)
}

/// Render a data profile as prompt text: one line per field with declared
/// and observed types, statistics and samples, plus the dictionary text.
pub fn render_profile(profile: &DataProfile) -> String {
    let mut out = String::new();
    if let Some(rows) = profile.row_count {
        out.push_str(&format!("Dataset rows: {}\n", rows));
    }
    out.push_str(&format!("Fields ({}):\n", profile.fields.len()));
    for (name, field) in &profile.fields {
        out.push_str(&format!(
            "- {} (declared: {}, observed: {})",
            name,
            field.declared_type.as_deref().unwrap_or("?"),
            field.observed_type.as_deref().unwrap_or("?"),
        ));
        if let Some(desc) = &field.description {
            out.push_str(&format!(" - {}", desc));
        }
        let stats = &field.stats;
        if let (Some(min), Some(max)) = (stats.min, stats.max) {
            out.push_str(&format!(" [min {}, max {}", min, max));
            if let Some(mean) = stats.mean {
                out.push_str(&format!(", mean {:.3}", mean));
            }
            out.push(']');
        } else if let Some(distinct) = stats.distinct_count {
            out.push_str(&format!(" [{} distinct]", distinct));
        }
        if let Some(nulls) = stats.null_count {
            if nulls > 0 {
                out.push_str(&format!(" ({} nulls)", nulls));
            }
        }
        if !field.sample_values.is_empty() {
            out.push_str(&format!(" e.g. {}", field.sample_values.join(", ")));
        }
        out.push('\n');
    }
    if !profile.dictionary_text.is_empty() {
        out.push_str("\nData dictionary:\n");
        out.push_str(&profile.dictionary_text);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoanalyst_sdk::{FieldProfile, FieldStats};

    fn big_view() -> ContextView {
        ContextView {
            current_step: Some("inspect the age distribution in detail".into()),
            recent_failures: vec!["KeyError: 'age'".into()],
            insight_digest: Some("- finding one\n- finding two\n".repeat(200)),
            data_profile: Some("age int64\nincome float64\n".repeat(100)),
            full_plan: Some("1. clean\n2. explore\n".repeat(100)),
        }
    }

    #[test]
    fn test_never_exceeds_budget() {
        let view = big_view();
        for budget in [1usize, 5, 20, 100, 500, 4000] {
            let text = build_context(&view, budget);
            assert!(
                text.tokens() <= budget,
                "budget {} exceeded: {}",
                budget,
                text.tokens()
            );
        }
    }

    #[test]
    fn test_precedence_keeps_current_step_first() {
        let view = big_view();
        let text = build_context(&view, 30);
        assert!(text.as_str().contains("Current step"));
        // plan is lowest precedence; at 30 tokens it cannot survive
        assert!(!text.as_str().contains("Analysis plan"));
    }

    #[test]
    fn test_small_view_passes_through() {
        let view = ContextView::default().with_step("tiny step");
        let text = build_context(&view, 1000);
        assert!(text.as_str().contains("tiny step"));
    }

    #[test]
    fn test_empty_view_is_empty() {
        let text = build_context(&ContextView::default(), 100);
        assert!(text.as_str().is_empty());
    }

    #[test]
    fn test_render_profile_includes_fields_and_stats() {
        let mut profile = DataProfile {
            row_count: Some(1000),
            dictionary_text: "| age | int64 | years |".into(),
            ..Default::default()
        };
        profile.fields.insert(
            "age".into(),
            FieldProfile {
                declared_type: Some("int64".into()),
                observed_type: Some("int64".into()),
                description: Some("age in years".into()),
                stats: FieldStats {
                    min: Some(18.0),
                    max: Some(90.0),
                    mean: Some(44.2),
                    null_count: Some(3),
                    ..Default::default()
                },
                sample_values: vec!["21".into(), "35".into()],
            },
        );
        let text = render_profile(&profile);
        assert!(text.contains("Dataset rows: 1000"));
        assert!(text.contains("age (declared: int64"));
        assert!(text.contains("mean 44.200"));
        assert!(text.contains("(3 nulls)"));
        assert!(text.contains("Data dictionary:"));
    }
}
