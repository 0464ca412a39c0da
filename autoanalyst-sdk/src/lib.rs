//! Shared types and collaborator interfaces for the autoanalyst engine.
//!
//! Everything that crosses an external boundary lives here so that
//! collaborators (reasoning backends, ingestion, execution environments,
//! front ends) can be implemented without depending on the engine crate:
//!
//! - [`ReasoningBackend`] - the natural-language reasoning service
//! - [`StepRunner`] - the execution environment that runs generated code
//! - [`DataProfile`] - the dataset description supplied by ingestion
//! - [`EngineLog`] - structured progress events plus console logging macros

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// Re-export async trait for implementors
pub use async_trait::async_trait;

// ============================================================================
// Reasoning backend boundary
// ============================================================================

/// Why the engine is calling the reasoning backend.
///
/// Callers may route purposes to different models or prompts; the engine
/// only guarantees that the prompt it supplies is already budgeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Generate or enhance the initial analysis plan
    Plan,
    /// Revise the plan after a completed or failed step
    Revise,
    /// Produce executable code for a plan step
    Codegen,
    /// Repair code that failed at runtime
    Repair,
    /// Interpret execution output
    Interpret,
}

/// Failures surfaced by a reasoning backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("backend timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    /// Transient failures are worth retrying with backoff; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. } | BackendError::Timeout(_)
        )
    }
}

/// Token budget for a single backend call, in estimated tokens.
pub type TokenBudget = usize;

/// Rough token estimate. Whitespace word count, which tracks the budget
/// closely enough for enforcement and never under-counts by much.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Text guaranteed to fit a token budget.
///
/// The only way to construct one is through [`BoundedText::fit`], which
/// truncates on word boundaries, so a `BoundedText` can be handed to a
/// backend without re-checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedText {
    text: String,
    budget: TokenBudget,
}

impl BoundedText {
    /// Fit `text` into `budget` estimated tokens, truncating from the end
    /// on word boundaries when it overflows.
    pub fn fit(text: impl Into<String>, budget: TokenBudget) -> Self {
        let text = text.into();
        if estimate_tokens(&text) <= budget {
            return Self { text, budget };
        }
        let truncated: Vec<&str> = text.split_whitespace().take(budget).collect();
        Self {
            text: truncated.join(" "),
            budget,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    /// Estimated token count of the contained text (always <= budget).
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

impl std::fmt::Display for BoundedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// The natural-language reasoning service.
///
/// Implementations must treat the prompt as already budgeted and must
/// return the raw response text; the engine validates and parses every
/// response itself, never trusting it to be well formed.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, prompt: &BoundedText, purpose: Purpose)
        -> Result<String, BackendError>;
}

// ============================================================================
// Data profile (supplied by the ingestion collaborator)
// ============================================================================

/// Per-field description built from the data dictionary plus an observed
/// sample. `declared_type` comes from the dictionary, `observed_type` and
/// the statistics from sampling; either side may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldProfile {
    pub declared_type: Option<String>,
    pub observed_type: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub stats: FieldStats,
    #[serde(default)]
    pub sample_values: Vec<String>,
}

/// Summary statistics for one field. Numeric fields fill min/max/mean,
/// categorical fields fill distinct_count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: Option<u64>,
    pub null_count: Option<u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub distinct_count: Option<u64>,
}

/// Immutable dataset description. Built once at project start and never
/// mutated in place; a changed dataset means a new profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataProfile {
    /// Field name -> profile, ordered by name for stable rendering
    pub fields: BTreeMap<String, FieldProfile>,
    /// Total rows in the full dataset, when known
    pub row_count: Option<u64>,
    /// Raw data-dictionary text, passed through to prompts verbatim
    pub dictionary_text: String,
}

impl DataProfile {
    /// Names of fields whose declared or observed type is numeric.
    pub fn numeric_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, p)| {
                let ty = p
                    .observed_type
                    .as_deref()
                    .or(p.declared_type.as_deref())
                    .unwrap_or("")
                    .to_lowercase();
                ty.contains("int") || ty.contains("float") || ty.contains("number")
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Stable fingerprint input: field names and types only. Statistics are
    /// deliberately excluded so that re-sampling noise does not invalidate
    /// cached code.
    pub fn fingerprint_source(&self) -> String {
        let mut out = String::new();
        for (name, profile) in &self.fields {
            out.push_str(name);
            out.push(':');
            out.push_str(profile.declared_type.as_deref().unwrap_or("?"));
            out.push(':');
            out.push_str(profile.observed_type.as_deref().unwrap_or("?"));
            out.push('\n');
        }
        out
    }
}

/// Handle to the dataset as the execution environment sees it. The engine
/// never opens the data file itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHandle {
    /// Path the generated code loads the dataset from
    pub data_path: PathBuf,
    /// Directory all run outputs (figures, results) must stay inside
    pub output_dir: PathBuf,
}

// ============================================================================
// Execution environment boundary
// ============================================================================

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    Success,
    RuntimeError,
    Timeout,
    PolicyViolation,
}

impl std::fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecOutcome::Success => "success",
            ExecOutcome::RuntimeError => "runtime-error",
            ExecOutcome::Timeout => "timeout",
            ExecOutcome::PolicyViolation => "policy-violation",
        };
        f.write_str(s)
    }
}

/// Resource limits for one sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecLimits {
    pub timeout_secs: u64,
    /// Module roots the generated code may import
    pub allowed_imports: Vec<String>,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            allowed_imports: Vec::new(),
        }
    }
}

/// What one execution produced, before the engine attaches step identity
/// and code versioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRecord {
    pub stdout: String,
    pub stderr: String,
    /// The step's declared result value, when the run produced one
    pub result_value: Option<serde_json::Value>,
    /// File names of visualizations written to the output directory
    pub figures: Vec<String>,
    pub duration_ms: u64,
    pub outcome: ExecOutcome,
}

impl Default for ExecOutcome {
    fn default() -> Self {
        ExecOutcome::RuntimeError
    }
}

/// The execution environment that runs generated code against the dataset.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(
        &self,
        code: &str,
        dataset: &DatasetHandle,
        limits: &ExecLimits,
    ) -> anyhow::Result<ExecRecord>;
}

// ============================================================================
// Run status (for front ends)
// ============================================================================

/// Coarse engine status for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Idle,
    Planning,
    Running,
    Done,
    Aborted,
}

// ============================================================================
// Structured progress events
// ============================================================================

/// Structured events emitted by the engine while a project runs.
///
/// Front ends parse these off stderr; the console macros below provide the
/// human-readable channel on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineLog {
    /// Run started for a project
    RunStarted { project_id: String },
    /// Initial plan is in place
    PlanReady { steps: usize },
    /// A new round began
    RoundStarted { round: u64 },
    /// A step was claimed and is executing
    StepStarted {
        step_id: String,
        description: String,
    },
    /// Progress message within a step (e.g. repair attempt)
    StepProgress { step_id: String, message: String },
    /// A step finished with the given outcome
    StepFinished { step_id: String, outcome: String },
    /// The plan was revised after a step
    PlanRevised { appended: usize, skipped: usize },
    /// A state snapshot was persisted
    SnapshotSaved { round: u64 },
    /// The run completed normally
    RunCompleted { analyses: u64 },
    /// The run aborted
    RunAborted { reason: String },
}

impl EngineLog {
    /// Emit this event to stderr for front-end parsing
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("__AA_EVENT__:{}", json);
            // Force flush stderr in concurrent contexts
            let _ = std::io::stderr().flush();
        }
    }
}

/// Helper macros for engine event logging
#[macro_export]
macro_rules! log_step_started {
    ($step_id:expr, $desc:expr) => {
        $crate::EngineLog::StepStarted {
            step_id: $step_id.to_string(),
            description: $desc.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_step_progress {
    ($step_id:expr, $msg:expr) => {
        $crate::EngineLog::StepProgress {
            step_id: $step_id.to_string(),
            message: $msg.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_step_finished {
    ($step_id:expr, $outcome:expr) => {
        $crate::EngineLog::StepFinished {
            step_id: $step_id.to_string(),
            outcome: $outcome.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_round_started {
    ($round:expr) => {
        $crate::EngineLog::RoundStarted { round: $round }.emit();
    };
}

// ============================================================================
// Console Logging Macros
// ============================================================================
// Colored human-readable output, complementing the structured EngineLog
// events parsed by front ends.
// ============================================================================

/// Logs an informational message.
///
/// # Example
/// ```
/// use autoanalyst_sdk::log_info;
/// log_info!("Loading data dictionary...");
/// ```
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
///
/// # Example
/// ```
/// use autoanalyst_sdk::log_warning;
/// log_warning!("Plan response was malformed, retrying");
/// ```
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs that a file has been saved.
///
/// # Example
/// ```
/// use autoanalyst_sdk::log_file_saved;
/// log_file_saved!("./output/final_report.md");
/// ```
#[macro_export]
macro_rules! log_file_saved {
    ($path:expr) => {
        println!("\x1b[32m✓ Saved: {}\x1b[0m", $path);
    };
}

/// Logs progress of an operation.
///
/// # Example
/// ```
/// use autoanalyst_sdk::log_progress;
/// log_progress!(3, 10, "analyses");
/// ```
#[macro_export]
macro_rules! log_progress {
    ($current:expr, $total:expr, $item_type:expr) => {
        println!(
            "\x1b[36mProgress: {}/{} {}\x1b[0m",
            $current, $total, $item_type
        );
    };
}

/// Logs the number of items found.
///
/// # Example
/// ```
/// use autoanalyst_sdk::log_found;
/// log_found!(6, "ready steps");
/// ```
#[macro_export]
macro_rules! log_found {
    ($count:expr, $item_type:expr) => {
        println!("\x1b[36mFound {} {}\x1b[0m", $count, $item_type);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_text_within_budget() {
        let text = BoundedText::fit("one two three", 10);
        assert_eq!(text.as_str(), "one two three");
        assert_eq!(text.tokens(), 3);
    }

    #[test]
    fn test_bounded_text_truncates() {
        let text = BoundedText::fit("a b c d e f g h", 3);
        assert_eq!(text.as_str(), "a b c");
        assert!(text.tokens() <= text.budget());
    }

    #[test]
    fn test_backend_error_transience() {
        assert!(BackendError::RateLimited { retry_after: None }.is_transient());
        assert!(BackendError::Timeout("slow".into()).is_transient());
        assert!(!BackendError::Auth("bad key".into()).is_transient());
        assert!(!BackendError::MalformedResponse("not json".into()).is_transient());
    }

    #[test]
    fn test_numeric_fields() {
        let mut profile = DataProfile::default();
        profile.fields.insert(
            "age".to_string(),
            FieldProfile {
                declared_type: Some("int64".to_string()),
                ..Default::default()
            },
        );
        profile.fields.insert(
            "name".to_string(),
            FieldProfile {
                declared_type: Some("object".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(profile.numeric_fields(), vec!["age"]);
    }

    #[test]
    fn test_fingerprint_source_ignores_stats() {
        let mut a = DataProfile::default();
        a.fields.insert(
            "x".to_string(),
            FieldProfile {
                declared_type: Some("float64".to_string()),
                stats: FieldStats {
                    mean: Some(1.0),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let mut b = a.clone();
        b.fields.get_mut("x").unwrap().stats.mean = Some(2.0);
        assert_eq!(a.fingerprint_source(), b.fingerprint_source());
    }

    #[test]
    fn test_engine_log_serializes_tagged() {
        let log = EngineLog::RoundStarted { round: 4 };
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("\"type\":\"round_started\""));
    }
}
