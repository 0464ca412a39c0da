//! Engine error taxonomy
//!
//! Execution failures are not errors here: they are recorded as artifact
//! outcomes and the run continues. `EngineError` covers the failures that
//! escape a single step.

use autoanalyst_sdk::BackendError;

/// Failures raised by engine components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Reasoning backend failure that survived the retry policy
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Backend output could not be turned into usable code or plan
    #[error("generation failed: {0}")]
    Generation(String),

    /// Project state is corrupt or could not be persisted/loaded
    #[error("state error: {0}")]
    State(String),
}

impl EngineError {
    /// Only these abort the whole run; everything else is step-local.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Backend(BackendError::Auth(_)) => true,
            EngineError::Backend(_) => false,
            EngineError::Generation(_) => false,
            EngineError::State(_) => true,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
