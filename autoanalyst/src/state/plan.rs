//! The analysis plan and its step state machine.
//!
//! The plan is append-only: historical steps are never renumbered or
//! deleted, and a step's status only ever moves forward. Every transition
//! goes through [`PlanStep::transition`], which is the single place the
//! ordering is enforced.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of analysis a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Cleaning,
    Exploration,
    HypothesisTest,
    Modeling,
    Other,
}

impl StepCategory {
    /// Lenient parse for backend-supplied category strings.
    pub fn parse(s: &str) -> Self {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cleaning" | "clean" | "preprocessing" => StepCategory::Cleaning,
            "exploration" | "explore" | "eda" => StepCategory::Exploration,
            "hypothesis_test" | "hypothesis-test" | "hypothesis test" | "test" => {
                StepCategory::HypothesisTest
            }
            "modeling" | "model" | "ml" => StepCategory::Modeling,
            _ => StepCategory::Other,
        }
    }
}

/// Lifecycle status of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Planned,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Position in the forward-only ordering. Completed and Failed share a
    /// rank: both are terminal outcomes of execution.
    pub fn ordinal(self) -> u8 {
        match self {
            StepStatus::Planned => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Failed => 2,
            StepStatus::Skipped => 3,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Planned => "planned",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One discrete analysis task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    /// Position in creation order; stable for the life of the plan
    pub seq: usize,
    pub description: String,
    pub category: StepCategory,
    pub status: StepStatus,
    pub priority: i32,
    /// Steps that must be Completed before this one may run
    pub depends_on: Vec<Uuid>,
    pub created_round: u64,
    pub updated_round: u64,
}

impl PlanStep {
    pub fn new(seq: usize, description: impl Into<String>, category: StepCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            description: description.into(),
            category,
            status: StepStatus::Planned,
            priority: 0,
            depends_on: Vec::new(),
            created_round: 0,
            updated_round: 0,
        }
    }

    /// Attempt a status transition. Lawful edges:
    ///
    /// - Planned -> InProgress (claim)
    /// - Planned -> Skipped (plan review marks the step obsolete)
    /// - InProgress -> Completed | Failed
    /// - Completed | Failed -> Skipped (manual override)
    ///
    /// Everything else - in particular anything that would move the
    /// ordinal backward - is rejected.
    pub fn transition(&mut self, to: StepStatus, round: u64) -> Result<(), TransitionError> {
        use StepStatus::*;
        let lawful = matches!(
            (self.status, to),
            (Planned, InProgress)
                | (Planned, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, Skipped)
                | (Failed, Skipped)
        );
        if !lawful {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        debug_assert!(to.ordinal() > self.status.ordinal());
        self.status = to;
        self.updated_round = round;
        Ok(())
    }
}

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal step transition {from} -> {to}")]
pub struct TransitionError {
    pub from: StepStatus,
    pub to: StepStatus,
}

/// What step selection found.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A step is ready to claim
    Ready(Uuid),
    /// Planned steps remain but all are blocked on unmet dependencies
    Blocked(usize),
    /// No Planned steps remain
    Exhausted,
}

/// Ordered, append-only collection of plan steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Append a step, assigning the next sequence index.
    pub fn push(&mut self, mut step: PlanStep) -> Uuid {
        step.seq = self.steps.len();
        let id = step.id;
        self.steps.push(step);
        id
    }

    /// Count of steps in a given status.
    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Select the next step to run: the highest-priority Planned step whose
    /// dependencies are all Completed. Ties break on priority descending,
    /// then sequence index ascending, so selection is deterministic.
    ///
    /// A dependency that ended Failed or Skipped never satisfies the gate;
    /// such steps surface as [`Selection::Blocked`] rather than being
    /// silently dropped.
    pub fn next_ready(&self) -> Selection {
        let planned: Vec<&PlanStep> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Planned)
            .collect();
        if planned.is_empty() {
            return Selection::Exhausted;
        }

        let mut ready: Vec<&PlanStep> = planned
            .iter()
            .copied()
            .filter(|s| {
                s.depends_on.iter().all(|dep| {
                    self.get(*dep)
                        .map(|d| d.status == StepStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();

        if ready.is_empty() {
            return Selection::Blocked(planned.len());
        }

        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        Selection::Ready(ready[0].id)
    }

    /// All currently ready step ids in selection order, for concurrent
    /// dispatch. Same ordering rule as [`Plan::next_ready`].
    pub fn ready_steps(&self) -> Vec<Uuid> {
        let mut ready: Vec<&PlanStep> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Planned)
            .filter(|s| {
                s.depends_on.iter().all(|dep| {
                    self.get(*dep)
                        .map(|d| d.status == StepStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        ready.iter().map(|s| s.id).collect()
    }
}
