//! Project state: the single source of truth for one analysis project.
//!
//! `ProjectState` is mutated only through the operations defined here, and
//! in concurrent mode only under the short-lived lease that [`SharedState`]
//! provides. Claiming a step is compare-and-set on its status; committing
//! an artifact, its insight and the status transition happens in one
//! critical section, so no observer ever sees a partial commit.

use std::collections::HashMap;
use std::sync::Arc;

use autoanalyst_sdk::{estimate_tokens, DataProfile};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::state::artifact::{ExecutionArtifact, Insight};
use crate::state::plan::{Plan, StepStatus};

/// Findings longer than this are clipped when they enter the digest, so a
/// single runaway finding cannot defeat compaction.
const MAX_FINDING_CHARS: usize = 200;

/// One round's findings inside the digest window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DigestEntry {
    round: u64,
    findings: Vec<String>,
}

/// The continuously-compacted summary of all findings so far.
///
/// Recent rounds are kept verbatim; older findings are merged into a
/// deduplicated carry-forward list. Compaction is structural and
/// deterministic, so re-compacting an already-compact digest is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightDigest {
    carryover: Vec<String>,
    recent: Vec<DigestEntry>,
}

impl InsightDigest {
    pub fn is_empty(&self) -> bool {
        self.carryover.is_empty() && self.recent.is_empty()
    }

    /// Record a round's findings, clipping each to a bounded length.
    pub fn record(&mut self, round: u64, findings: &[String]) {
        if findings.is_empty() {
            return;
        }
        let clipped: Vec<String> = findings
            .iter()
            .map(|f| clip_chars(f.trim(), MAX_FINDING_CHARS))
            .filter(|f| !f.is_empty())
            .collect();
        if clipped.is_empty() {
            return;
        }
        match self.recent.iter_mut().find(|e| e.round == round) {
            Some(entry) => entry.findings.extend(clipped),
            None => self.recent.push(DigestEntry {
                round,
                findings: clipped,
            }),
        }
    }

    /// Render the digest as prompt-ready text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.carryover.is_empty() {
            out.push_str("Earlier findings:\n");
            for finding in &self.carryover {
                out.push_str("- ");
                out.push_str(finding);
                out.push('\n');
            }
        }
        for entry in &self.recent {
            out.push_str(&format!("Round {} findings:\n", entry.round));
            for finding in &entry.findings {
                out.push_str("- ");
                out.push_str(finding);
                out.push('\n');
            }
        }
        out
    }

    /// Compact in place until the rendered digest fits `max_tokens`.
    ///
    /// Order of operations: merge entries older than the last `keep_rounds`
    /// rounds into the carry-forward list (deduplicated, original order),
    /// then drop the oldest carried findings, then the oldest remaining
    /// rounds, until the budget holds. A digest already within budget is
    /// returned untouched, which makes compaction idempotent.
    pub fn compact(&mut self, max_tokens: usize, keep_rounds: u64, current_round: u64) {
        if estimate_tokens(&self.render()) <= max_tokens {
            return;
        }

        let cutoff = current_round.saturating_sub(keep_rounds);
        let (old, kept): (Vec<DigestEntry>, Vec<DigestEntry>) = std::mem::take(&mut self.recent)
            .into_iter()
            .partition(|e| e.round < cutoff);
        self.recent = kept;
        for entry in old {
            for finding in entry.findings {
                if !self.carryover.contains(&finding) {
                    self.carryover.push(finding);
                }
            }
        }

        while estimate_tokens(&self.render()) > max_tokens && !self.carryover.is_empty() {
            self.carryover.remove(0);
        }
        while estimate_tokens(&self.render()) > max_tokens && self.recent.len() > 1 {
            self.recent.remove(0);
        }
    }
}

fn clip_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max).collect();
        format!("{}...", clipped.trim_end())
    }
}

/// Everything a worker needs to read during a step, cloned under the lease
/// at step start so it never observes another worker's half-written state.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub profile: DataProfile,
    pub digest_text: String,
    pub plan_overview: String,
    pub round: u64,
    /// Advisory next-step suggestions from recent interpretations
    pub recent_suggestions: Vec<String>,
}

/// The single source of truth for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub profile: DataProfile,
    pub plan: Plan,
    /// Step id -> every artifact ever produced, latest last
    artifacts: HashMap<Uuid, Vec<ExecutionArtifact>>,
    insights: HashMap<Uuid, Insight>,
    digest: InsightDigest,
    pub round: u64,
    pub analyses_run: u64,
    pub retries_used: u64,
    digest_max_tokens: usize,
    digest_keep_rounds: u64,
}

impl ProjectState {
    pub fn new(
        project_id: impl Into<String>,
        profile: DataProfile,
        digest_max_tokens: usize,
        digest_keep_rounds: u64,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            profile,
            plan: Plan::new(),
            artifacts: HashMap::new(),
            insights: HashMap::new(),
            digest: InsightDigest::default(),
            round: 0,
            analyses_run: 0,
            retries_used: 0,
            digest_max_tokens,
            digest_keep_rounds,
        }
    }

    // ------------------------------------------------------------------
    // Read API (consumed by reporting; everything here is immutable)
    // ------------------------------------------------------------------

    pub fn latest_artifact(&self, step_id: Uuid) -> Option<&ExecutionArtifact> {
        self.artifacts.get(&step_id).and_then(|v| v.last())
    }

    pub fn artifact_history(&self, step_id: Uuid) -> &[ExecutionArtifact] {
        self.artifacts
            .get(&step_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn insight(&self, step_id: Uuid) -> Option<&Insight> {
        self.insights.get(&step_id)
    }

    pub fn digest_text(&self) -> String {
        self.digest.render()
    }

    pub fn digest_is_empty(&self) -> bool {
        self.digest.is_empty()
    }

    /// One line per step: sequence, status, description. Used both by
    /// prompts and by the console.
    pub fn plan_overview(&self) -> String {
        let mut out = String::new();
        for step in self.plan.steps() {
            out.push_str(&format!(
                "{}. [{}] {}\n",
                step.seq + 1,
                step.status,
                step.description
            ));
        }
        out
    }

    /// Stderr of the most recent failed artifacts, newest first, capped.
    pub fn recent_failures(&self, limit: usize) -> Vec<&ExecutionArtifact> {
        let mut failed: Vec<&ExecutionArtifact> = self
            .artifacts
            .values()
            .flat_map(|v| v.iter())
            .filter(|a| !a.succeeded())
            .collect();
        failed.sort_by(|a, b| b.code_version.cmp(&a.code_version));
        failed.truncate(limit);
        failed
    }

    // ------------------------------------------------------------------
    // Transition operations
    // ------------------------------------------------------------------

    /// Compare-and-set claim: Planned -> InProgress. Returns false when the
    /// step was already claimed (or otherwise past Planned).
    pub fn claim_step(&mut self, step_id: Uuid) -> bool {
        match self.plan.get_mut(step_id) {
            Some(step) if step.status == StepStatus::Planned => {
                let round = self.round;
                step.transition(StepStatus::InProgress, round).is_ok()
            }
            _ => false,
        }
    }

    /// Commit a finished step: artifact, insight and status transition
    /// land together. The digest absorbs the insight's findings and is
    /// re-compacted before the commit returns.
    pub fn commit_step(
        &mut self,
        step_id: Uuid,
        artifact: ExecutionArtifact,
        insight: Insight,
    ) -> EngineResult<()> {
        let final_status = if artifact.succeeded() {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        let round = self.round;
        let step = self
            .plan
            .get_mut(step_id)
            .ok_or_else(|| EngineError::State(format!("unknown step {}", step_id)))?;
        step.transition(final_status, round)
            .map_err(|e| EngineError::State(e.to_string()))?;

        self.digest.record(round, &insight.key_findings);
        self.digest
            .compact(self.digest_max_tokens, self.digest_keep_rounds, round);

        self.artifacts.entry(step_id).or_default().push(artifact);
        self.insights.insert(step_id, insight);
        self.analyses_run += 1;
        Ok(())
    }

    /// Record repair retries consumed by a step, successful or not.
    pub fn add_retries(&mut self, count: u64) {
        self.retries_used += count;
    }

    pub fn snapshot_context(&self) -> ContextSnapshot {
        ContextSnapshot {
            profile: self.profile.clone(),
            digest_text: self.digest.render(),
            plan_overview: self.plan_overview(),
            round: self.round,
            recent_suggestions: self.recent_suggestions(10),
        }
    }

    /// Next-step suggestions from insights of steps that finished in the
    /// last two rounds. Advisory input for plan revision, never binding.
    fn recent_suggestions(&self, limit: usize) -> Vec<String> {
        let cutoff = self.round.saturating_sub(1);
        let mut suggestions: Vec<String> = self
            .plan
            .steps()
            .iter()
            .filter(|s| s.updated_round >= cutoff)
            .filter_map(|s| self.insights.get(&s.id))
            .flat_map(|i| i.suggested_next_steps.iter().cloned())
            .collect();
        suggestions.truncate(limit);
        suggestions
    }
}

/// Shared handle with short-lived lease semantics.
///
/// Workers go through these methods only; none of them holds the lock
/// across an await point, so a lease is always brief.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ProjectState>>,
}

impl SharedState {
    pub fn new(state: ProjectState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn claim_step(&self, step_id: Uuid) -> bool {
        self.inner.lock().await.claim_step(step_id)
    }

    pub async fn commit_step(
        &self,
        step_id: Uuid,
        artifact: ExecutionArtifact,
        insight: Insight,
    ) -> EngineResult<()> {
        self.inner.lock().await.commit_step(step_id, artifact, insight)
    }

    pub async fn add_retries(&self, count: u64) {
        self.inner.lock().await.add_retries(count);
    }

    pub async fn snapshot_context(&self) -> ContextSnapshot {
        self.inner.lock().await.snapshot_context()
    }

    /// Run a read-only closure under the lease.
    pub async fn read<R>(&self, f: impl FnOnce(&ProjectState) -> R) -> R {
        f(&*self.inner.lock().await)
    }

    /// Run a mutating closure under the lease. Reserved for the
    /// orchestrator task (plan revision, round advancement); workers use
    /// the claim/commit operations above.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut ProjectState) -> R) -> R {
        f(&mut *self.inner.lock().await)
    }

    /// Clone the full state for snapshot persistence.
    pub async fn clone_state(&self) -> ProjectState {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::artifact::Confidence;
    use crate::state::plan::{PlanStep, StepCategory};
    use autoanalyst_sdk::{ExecOutcome, ExecRecord};

    fn state_with_step() -> (ProjectState, Uuid) {
        let mut state = ProjectState::new("proj", DataProfile::default(), 1200, 3);
        let id = state
            .plan
            .push(PlanStep::new(0, "explore age", StepCategory::Exploration));
        (state, id)
    }

    fn success_artifact(step_id: Uuid) -> ExecutionArtifact {
        ExecutionArtifact::from_record(
            step_id,
            "result = df.describe()".into(),
            1,
            ExecRecord {
                outcome: ExecOutcome::Success,
                ..Default::default()
            },
        )
    }

    fn insight_with(step_id: Uuid, findings: &[&str]) -> Insight {
        Insight {
            step_id,
            interpretation: "ok".into(),
            key_findings: findings.iter().map(|s| s.to_string()).collect(),
            suggested_next_steps: Vec::new(),
            confidence: Confidence::Medium,
        }
    }

    #[test]
    fn test_claim_is_compare_and_set() {
        let (mut state, id) = state_with_step();
        assert!(state.claim_step(id));
        assert!(!state.claim_step(id));
    }

    #[test]
    fn test_commit_lands_atomically() {
        let (mut state, id) = state_with_step();
        state.claim_step(id);
        state
            .commit_step(id, success_artifact(id), insight_with(id, &["age is skewed"]))
            .unwrap();

        assert_eq!(state.plan.get(id).unwrap().status, StepStatus::Completed);
        assert!(state.latest_artifact(id).is_some());
        assert!(state.insight(id).is_some());
        assert!(state.digest_text().contains("age is skewed"));
        assert_eq!(state.analyses_run, 1);
    }

    #[test]
    fn test_commit_unclaimed_step_is_state_error() {
        let (mut state, id) = state_with_step();
        // no claim: Planned -> Completed is not lawful
        let err = state
            .commit_step(id, success_artifact(id), insight_with(id, &[]))
            .unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[test]
    fn test_digest_compaction_idempotent() {
        let mut digest = InsightDigest::default();
        for round in 0..20 {
            let findings: Vec<String> = (0..5)
                .map(|i| format!("round {} finding number {} with some detail text", round, i))
                .collect();
            digest.record(round, &findings);
        }

        digest.compact(100, 3, 20);
        let once = digest.clone();
        digest.compact(100, 3, 20);
        assert_eq!(digest, once, "re-compacting a compact digest must be a no-op");
        assert!(estimate_tokens(&digest.render()) <= 100);
    }

    #[test]
    fn test_digest_within_budget_untouched() {
        let mut digest = InsightDigest::default();
        digest.record(1, &["small finding".to_string()]);
        let before = digest.clone();
        digest.compact(1000, 3, 5);
        assert_eq!(digest, before);
    }

    #[test]
    fn test_digest_merges_old_rounds() {
        let mut digest = InsightDigest::default();
        for round in 0..10 {
            digest.record(
                round,
                &[format!("finding from round {} with padding words here", round)],
            );
        }
        digest.compact(60, 2, 10);
        let text = digest.render();
        assert!(estimate_tokens(&text) <= 60);
        // recent window survives verbatim
        assert!(text.contains("Round 9 findings"));
    }

    #[test]
    fn test_oversized_finding_is_clipped() {
        let mut digest = InsightDigest::default();
        digest.record(1, &["x".repeat(5000)]);
        assert!(digest.render().len() < 400);
    }

    #[tokio::test]
    async fn test_shared_claim_race_single_winner() {
        let (state, id) = state_with_step();
        let shared = SharedState::new(state);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move { shared.claim_step(id).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent claim may succeed");
    }

    #[test]
    fn test_recent_failures_ordering() {
        let (mut state, id) = state_with_step();
        state.claim_step(id);
        let mut artifact = success_artifact(id);
        artifact.outcome = ExecOutcome::RuntimeError;
        artifact.code_version = 1;
        let mut newer = artifact.clone();
        newer.code_version = 2;
        state.artifacts.entry(id).or_default().push(artifact);
        state.artifacts.entry(id).or_default().push(newer);

        let failures = state.recent_failures(5);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].code_version, 2);
    }
}
