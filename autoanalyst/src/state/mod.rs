//! Project state: plan, artifacts, insights, digest and persistence.

pub mod artifact;
pub mod plan;
pub mod project;
pub mod store;

pub use artifact::{Confidence, ExecutionArtifact, Insight};
pub use plan::{Plan, PlanStep, Selection, StepCategory, StepStatus};
pub use project::{ContextSnapshot, InsightDigest, ProjectState, SharedState};
pub use store::StateStore;
