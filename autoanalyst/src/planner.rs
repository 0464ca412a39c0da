//! Plan management: initial generation, enhancement, selection and
//! append-only revision.
//!
//! Backend responses are treated as untrusted structured output: parsed
//! flexibly, validated field by field, and replaced by a deterministic
//! fallback plan when they stay malformed, so the engine never stalls with
//! an empty plan.

use autoanalyst_sdk::{log_warning, BackendError, BoundedText, DataProfile, Purpose, ReasoningBackend};
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::backend::{complete_with_retry, RetryPolicy};
use crate::context::{build_context, render_profile, ContextView};
use crate::error::{EngineError, EngineResult};
use crate::prompts;
use crate::state::{PlanStep, Selection, SharedState, StepCategory, StepStatus};

/// A step as parsed out of a backend response, before ids and sequence
/// numbers exist. `depends_on` holds 1-based plan positions.
#[derive(Debug, Clone)]
struct StepDraft {
    description: String,
    category: StepCategory,
    priority: i32,
    depends_on: Vec<u64>,
}

/// Owns every mutation of the plan's topology.
pub struct PlanManager {
    retry: RetryPolicy,
    max_steps: u64,
    context_budget: usize,
    /// Plan mirror written after every change, for human inspection
    mirror_path: Option<PathBuf>,
}

impl PlanManager {
    pub fn new(retry: RetryPolicy, max_steps: u64, context_budget: usize) -> Self {
        Self {
            retry,
            max_steps,
            context_budget,
            mirror_path: None,
        }
    }

    pub fn with_mirror(mut self, path: PathBuf) -> Self {
        self.mirror_path = Some(path);
        self
    }

    // ------------------------------------------------------------------
    // Initial plan
    // ------------------------------------------------------------------

    /// Ask the backend for an initial plan; retry once with a stricter
    /// prompt on malformed output; fall back to a deterministic minimal
    /// plan when the backend stays unusable. Only an auth failure escapes.
    pub async fn generate_initial_plan(
        &self,
        backend: &dyn ReasoningBackend,
        profile: &DataProfile,
    ) -> EngineResult<Vec<PlanStep>> {
        let view = ContextView {
            data_profile: Some(render_profile(profile)),
            ..Default::default()
        };
        let context = build_context(&view, self.context_budget);

        let drafts = match self.request_plan(backend, &context, false).await {
            Ok(drafts) => drafts,
            Err(EngineError::Generation(reason)) => {
                log_warning!("Initial plan was malformed ({}), retrying strictly", reason);
                match self.request_plan(backend, &context, true).await {
                    Ok(drafts) => drafts,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(reason) => {
                        log_warning!("Falling back to default plan: {}", reason);
                        return Ok(fallback_plan(profile));
                    }
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(reason) => {
                log_warning!("Falling back to default plan: {}", reason);
                return Ok(fallback_plan(profile));
            }
        };

        let drafts = self.enhance(backend, &context, drafts).await;
        Ok(drafts_to_steps(&drafts, &[], 0))
    }

    async fn request_plan(
        &self,
        backend: &dyn ReasoningBackend,
        context: &BoundedText,
        strict: bool,
    ) -> EngineResult<Vec<StepDraft>> {
        let prompt_text = if strict {
            prompts::initial_plan_strict(context.as_str(), self.max_steps)
        } else {
            prompts::initial_plan(context.as_str(), self.max_steps)
        };
        let prompt = BoundedText::fit(prompt_text, self.context_budget * 2);
        let response = complete_with_retry(backend, &prompt, Purpose::Plan, self.retry).await?;
        let value = prompts::parse_json(&response).map_err(EngineError::Generation)?;
        parse_step_entries(&value)
            .ok_or_else(|| EngineError::Generation("no usable analysis_steps".to_string()))
    }

    /// Enhancement pass over a freshly parsed plan. Best-effort: any
    /// failure keeps the original drafts.
    async fn enhance(
        &self,
        backend: &dyn ReasoningBackend,
        context: &BoundedText,
        drafts: Vec<StepDraft>,
    ) -> Vec<StepDraft> {
        let plan_json = drafts_as_json(&drafts);
        let prompt = BoundedText::fit(
            prompts::enhance_plan(context.as_str(), &plan_json),
            self.context_budget * 2,
        );
        match complete_with_retry(backend, &prompt, Purpose::Plan, self.retry).await {
            Ok(response) => match prompts::parse_json(&response).ok().and_then(|v| parse_step_entries(&v)) {
                Some(enhanced) if enhanced.len() as u64 <= self.max_steps * 2 => enhanced,
                _ => {
                    log_warning!("Plan enhancement unusable, keeping initial plan");
                    drafts
                }
            },
            Err(_) => {
                log_warning!("Plan enhancement call failed, keeping initial plan");
                drafts
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection and outcome recording
    // ------------------------------------------------------------------

    /// Highest-priority ready step, or why there is none.
    pub async fn next_ready_step(&self, shared: &SharedState) -> Selection {
        shared.read(|state| state.plan.next_ready()).await
    }

    /// Manual override: mark a finished or planned step skipped.
    pub async fn skip_step(&self, shared: &SharedState, step_id: uuid::Uuid) -> EngineResult<()> {
        shared
            .mutate(|state| {
                let round = state.round;
                state
                    .plan
                    .get_mut(step_id)
                    .ok_or_else(|| EngineError::State(format!("unknown step {}", step_id)))?
                    .transition(StepStatus::Skipped, round)
                    .map_err(|e| EngineError::State(e.to_string()))
            })
            .await
    }

    // ------------------------------------------------------------------
    // Revision
    // ------------------------------------------------------------------

    /// Revise the plan after a completed or failed step: append new steps,
    /// adjust priorities, mark obsolete steps skipped. Historical steps
    /// are never renumbered or deleted. Returns (appended, skipped).
    ///
    /// A malformed revision response keeps the current plan; only fatal
    /// backend failures escape.
    pub async fn review_and_update(
        &self,
        backend: &dyn ReasoningBackend,
        shared: &SharedState,
    ) -> EngineResult<(usize, usize)> {
        let snapshot = shared.snapshot_context().await;
        let mut view = ContextView::from_snapshot(&snapshot);
        if !snapshot.recent_suggestions.is_empty() {
            let advisory = snapshot
                .recent_suggestions
                .iter()
                .map(|s| format!("- {}", s))
                .collect::<Vec<_>>()
                .join("\n");
            let digest = view.insight_digest.get_or_insert_with(String::new);
            digest.push_str("\nSuggested follow-ups from interpretation:\n");
            digest.push_str(&advisory);
        }
        let context = build_context(&view, self.context_budget);
        let prompt = BoundedText::fit(
            prompts::revise_plan(context.as_str()),
            self.context_budget * 2,
        );

        let response = match complete_with_retry(backend, &prompt, Purpose::Revise, self.retry).await
        {
            Ok(response) => response,
            Err(e @ BackendError::Auth(_)) => return Err(EngineError::Backend(e)),
            Err(e) => {
                log_warning!("Plan revision call failed ({}), keeping current plan", e);
                return Ok((0, 0));
            }
        };

        let value = match prompts::parse_json(&response) {
            Ok(value) => value,
            Err(reason) => {
                log_warning!("Plan revision was malformed ({}), keeping current plan", reason);
                return Ok((0, 0));
            }
        };

        let result = shared
            .mutate(|state| apply_revision(state, &value))
            .await;

        if let Some(path) = &self.mirror_path {
            let plan_json = shared.read(|state| plan_mirror_json(state)).await;
            if let Err(e) = std::fs::write(path, plan_json) {
                log_warning!("Failed to mirror plan to {}: {}", path.display(), e);
            }
        }

        Ok(result)
    }

    /// Write the plan mirror after initial generation.
    pub async fn mirror_plan(&self, shared: &SharedState) {
        if let Some(path) = &self.mirror_path {
            let plan_json = shared.read(|state| plan_mirror_json(state)).await;
            if let Err(e) = std::fs::write(path, plan_json) {
                log_warning!("Failed to mirror plan to {}: {}", path.display(), e);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Parsing and application helpers
// ----------------------------------------------------------------------

fn parse_step_entries(value: &Value) -> Option<Vec<StepDraft>> {
    let steps = value.get("analysis_steps")?.as_array()?;
    let drafts: Vec<StepDraft> = steps
        .iter()
        .filter_map(|s| {
            let description = s.get("description").and_then(|d| d.as_str())?.trim();
            if description.is_empty() {
                return None;
            }
            Some(StepDraft {
                description: description.to_string(),
                category: StepCategory::parse(
                    s.get("category").and_then(|c| c.as_str()).unwrap_or("other"),
                ),
                priority: s.get("priority").and_then(|p| p.as_i64()).unwrap_or(0) as i32,
                depends_on: s
                    .get("depends_on")
                    .and_then(|d| d.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_u64()).collect())
                    .unwrap_or_default(),
            })
        })
        .collect();
    if drafts.is_empty() {
        None
    } else {
        Some(drafts)
    }
}

/// Turn drafts into plan steps, resolving 1-based dependency positions
/// against existing steps first, then the new batch. Self-references and
/// out-of-range positions are dropped rather than trusted.
fn drafts_to_steps(drafts: &[StepDraft], existing: &[PlanStep], round: u64) -> Vec<PlanStep> {
    let mut steps: Vec<PlanStep> = drafts
        .iter()
        .map(|d| {
            let mut step = PlanStep::new(0, &d.description, d.category);
            step.priority = d.priority;
            step.created_round = round;
            step.updated_round = round;
            step
        })
        .collect();

    for (i, draft) in drafts.iter().enumerate() {
        let deps = draft
            .depends_on
            .iter()
            .filter_map(|&pos| {
                let pos = pos as usize;
                if pos == 0 {
                    None
                } else if pos <= existing.len() {
                    Some(existing[pos - 1].id)
                } else {
                    let new_idx = pos - existing.len() - 1;
                    if new_idx < steps.len() && new_idx != i {
                        Some(steps[new_idx].id)
                    } else {
                        None
                    }
                }
            })
            .collect();
        steps[i].depends_on = deps;
    }
    steps
}

fn drafts_as_json(drafts: &[StepDraft]) -> String {
    let value = json!({
        "analysis_steps": drafts.iter().map(|d| json!({
            "description": d.description,
            "category": format!("{:?}", d.category).to_lowercase(),
            "priority": d.priority,
            "depends_on": d.depends_on,
        })).collect::<Vec<_>>()
    });
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

/// Apply a parsed revision under one lease. Returns (appended, skipped).
fn apply_revision(state: &mut crate::state::ProjectState, value: &Value) -> (usize, usize) {
    let round = state.round;
    let mut skipped = 0;

    if let Some(updates) = value.get("updates").and_then(|u| u.as_array()) {
        for update in updates {
            let pos = match update.get("step").and_then(|s| s.as_u64()) {
                Some(pos) if pos >= 1 => pos as usize - 1,
                _ => continue,
            };
            let step_id = match state.plan.steps().get(pos) {
                Some(step) => step.id,
                None => continue,
            };
            if let Some(priority) = update.get("priority").and_then(|p| p.as_i64()) {
                if let Some(step) = state.plan.get_mut(step_id) {
                    if step.status == StepStatus::Planned {
                        step.priority = priority as i32;
                        step.updated_round = round;
                    }
                }
            }
            if update.get("obsolete").and_then(|o| o.as_bool()) == Some(true) {
                if let Some(step) = state.plan.get_mut(step_id) {
                    if step.status == StepStatus::Planned
                        && step.transition(StepStatus::Skipped, round).is_ok()
                    {
                        skipped += 1;
                    }
                }
            }
        }
    }

    let mut appended = 0;
    if let Some(new_steps) = value
        .get("new_steps")
        .filter(|n| n.is_array())
        .map(|n| json!({ "analysis_steps": n }))
    {
        if let Some(drafts) = parse_step_entries(&new_steps) {
            let existing: Vec<PlanStep> = state.plan.steps().to_vec();
            for step in drafts_to_steps(&drafts, &existing, round) {
                state.plan.push(step);
                appended += 1;
            }
        }
    }

    (appended, skipped)
}

fn plan_mirror_json(state: &crate::state::ProjectState) -> String {
    let tasks: Vec<Value> = state
        .plan
        .steps()
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "seq": s.seq,
                "description": s.description,
                "category": s.category,
                "status": s.status.to_string(),
                "priority": s.priority,
                "depends_on": s.depends_on,
            })
        })
        .collect();
    serde_json::to_string_pretty(&json!({ "tasks": tasks })).unwrap_or_default()
}

/// Deterministic minimal plan: basic cleaning, then univariate
/// exploration, plus a correlation pass when the profile has at least two
/// numeric fields. Exists so malformed backend output can never leave the
/// engine without work to do.
pub fn fallback_plan(profile: &DataProfile) -> Vec<PlanStep> {
    let mut steps = Vec::new();

    let mut cleaning = PlanStep::new(
        0,
        "Inspect the dataset for missing values and impossible values; \
         impute numeric gaps with the median and flag text gaps as 'Unknown'",
        StepCategory::Cleaning,
    );
    cleaning.priority = 10;
    let cleaning_id = cleaning.id;
    steps.push(cleaning);

    let mut explore = PlanStep::new(
        0,
        "Summarize every field: distributions and histograms for numeric \
         fields, value counts for categorical fields",
        StepCategory::Exploration,
    );
    explore.priority = 5;
    explore.depends_on = vec![cleaning_id];
    let explore_id = explore.id;
    steps.push(explore);

    if profile.numeric_fields().len() >= 2 {
        let mut corr = PlanStep::new(
            0,
            "Compute pairwise correlations between numeric fields and plot \
             the correlation matrix",
            StepCategory::Exploration,
        );
        corr.priority = 3;
        corr.depends_on = vec![explore_id];
        steps.push(corr);
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoanalyst_sdk::FieldProfile;
    use crate::state::ProjectState;
    use std::sync::Mutex;

    /// Backend that replays a fixed script of responses.
    struct Scripted {
        responses: Mutex<Vec<Result<String, BackendError>>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String, BackendError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[autoanalyst_sdk::async_trait]
    impl ReasoningBackend for Scripted {
        async fn complete(
            &self,
            _prompt: &BoundedText,
            _purpose: Purpose,
        ) -> Result<String, BackendError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(BackendError::MalformedResponse("script exhausted".into()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn numeric_profile() -> DataProfile {
        let mut profile = DataProfile::default();
        for name in ["age", "income"] {
            profile.fields.insert(
                name.to_string(),
                FieldProfile {
                    declared_type: Some("float64".to_string()),
                    ..Default::default()
                },
            );
        }
        profile
    }

    fn manager() -> PlanManager {
        PlanManager::new(RetryPolicy::new(0, 1), 10, 2000)
    }

    fn plan_response() -> String {
        r#"{"analysis_steps": [
            {"description": "clean nulls", "category": "cleaning", "priority": 10},
            {"description": "explore distributions", "category": "exploration",
             "priority": 5, "depends_on": [1]}
        ]}"#
            .to_string()
    }

    #[tokio::test]
    async fn test_initial_plan_parses_and_resolves_deps() {
        // plan call + enhancement call (echoes the same shape)
        let backend = Scripted::new(vec![Ok(plan_response()), Ok(plan_response())]);
        let steps = manager()
            .generate_initial_plan(&backend, &numeric_profile())
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].category, StepCategory::Cleaning);
        assert_eq!(steps[1].depends_on, vec![steps[0].id]);
    }

    #[tokio::test]
    async fn test_malformed_then_strict_retry() {
        let backend = Scripted::new(vec![
            Ok("not json at all".into()),
            Ok(plan_response()),
            // enhancement fails, drafts kept
            Ok("still not json".into()),
        ]);
        let steps = manager()
            .generate_initial_plan(&backend, &numeric_profile())
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_malformed_falls_back() {
        let backend = Scripted::new(vec![
            Ok("garbage".into()),
            Ok("{\"analysis_steps\": []}".into()),
        ]);
        let steps = manager()
            .generate_initial_plan(&backend, &numeric_profile())
            .await
            .unwrap();
        // fallback: cleaning + exploration + correlation (two numeric fields)
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].category, StepCategory::Cleaning);
        assert_eq!(steps[1].category, StepCategory::Exploration);
    }

    #[tokio::test]
    async fn test_auth_failure_escapes() {
        let backend = Scripted::new(vec![Err(BackendError::Auth("bad key".into()))]);
        let result = manager()
            .generate_initial_plan(&backend, &numeric_profile())
            .await;
        assert!(matches!(result, Err(EngineError::Backend(BackendError::Auth(_)))));
    }

    #[tokio::test]
    async fn test_revision_appends_and_skips() {
        let mut state = ProjectState::new("p", numeric_profile(), 1200, 3);
        let keep = state
            .plan
            .push(PlanStep::new(0, "keep me", StepCategory::Exploration));
        let obsolete = state
            .plan
            .push(PlanStep::new(0, "obsolete idea", StepCategory::Other));
        let shared = SharedState::new(state);

        let revision = r#"{
            "new_steps": [
                {"description": "model income", "category": "modeling",
                 "priority": 2, "depends_on": [1]}
            ],
            "updates": [
                {"step": 2, "obsolete": true},
                {"step": 1, "priority": 9}
            ]
        }"#;
        let backend = Scripted::new(vec![Ok(revision.to_string())]);

        let (appended, skipped) = manager()
            .review_and_update(&backend, &shared)
            .await
            .unwrap();
        assert_eq!((appended, skipped), (1, 1));

        shared
            .read(|state| {
                assert_eq!(state.plan.len(), 3);
                assert_eq!(state.plan.get(keep).unwrap().priority, 9);
                assert_eq!(state.plan.get(obsolete).unwrap().status, StepStatus::Skipped);
                let new_step = &state.plan.steps()[2];
                assert_eq!(new_step.depends_on, vec![keep]);
                assert_eq!(new_step.seq, 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_malformed_revision_keeps_plan() {
        let mut state = ProjectState::new("p", numeric_profile(), 1200, 3);
        state
            .plan
            .push(PlanStep::new(0, "keep me", StepCategory::Exploration));
        let shared = SharedState::new(state);
        let backend = Scripted::new(vec![Ok("no json here".into())]);

        let (appended, skipped) = manager()
            .review_and_update(&backend, &shared)
            .await
            .unwrap();
        assert_eq!((appended, skipped), (0, 0));
        shared.read(|state| assert_eq!(state.plan.len(), 1)).await;
    }

    #[test]
    fn test_fallback_plan_without_numeric_pair() {
        let steps = fallback_plan(&DataProfile::default());
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_drafts_ignore_self_and_bad_deps() {
        let drafts = vec![
            StepDraft {
                description: "a".into(),
                category: StepCategory::Other,
                priority: 0,
                depends_on: vec![1, 99],
            },
        ];
        let steps = drafts_to_steps(&drafts, &[], 0);
        assert!(steps[0].depends_on.is_empty());
    }
}
