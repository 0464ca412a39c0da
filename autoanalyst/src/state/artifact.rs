//! Execution artifacts and insights - the per-step durable record.

use autoanalyst_sdk::{ExecOutcome, ExecRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One execution of one code version for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionArtifact {
    pub step_id: Uuid,
    pub code: String,
    /// Monotonic per step; incremented on every regeneration
    pub code_version: u32,
    pub stdout: String,
    pub stderr: String,
    pub result_value: Option<serde_json::Value>,
    pub figures: Vec<String>,
    pub duration_ms: u64,
    pub outcome: ExecOutcome,
}

impl ExecutionArtifact {
    pub fn from_record(step_id: Uuid, code: String, code_version: u32, record: ExecRecord) -> Self {
        Self {
            step_id,
            code,
            code_version,
            stdout: record.stdout,
            stderr: record.stderr,
            result_value: record.result_value,
            figures: record.figures,
            duration_ms: record.duration_ms,
            outcome: record.outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == ExecOutcome::Success
    }
}

/// How sure the interpreter is of its findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Structured interpretation of one step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub step_id: Uuid,
    pub interpretation: String,
    /// Short, ordered statements extracted from the interpretation
    pub key_findings: Vec<String>,
    /// Advisory input to plan revision, never binding
    pub suggested_next_steps: Vec<String>,
    pub confidence: Confidence,
}

impl Insight {
    /// Local stand-in for a step that never produced interpretable output.
    /// Failure insights are synthesized, not sent to the backend.
    pub fn not_completed(step_id: Uuid, outcome: ExecOutcome, code_version: u32) -> Self {
        Self {
            step_id,
            interpretation: format!(
                "Step not completed: {} at code version {}.",
                outcome, code_version
            ),
            key_findings: Vec::new(),
            suggested_next_steps: Vec::new(),
            confidence: Confidence::Low,
        }
    }
}
