//! Code generation and repair for plan steps.
//!
//! Generated code for a given step-description-plus-profile fingerprint is
//! cached: an unchanged fingerprint reuses the cached code instead of
//! re-invoking the backend. That trades a small correctness risk - stale
//! assumptions if data characteristics drift without the profile changing -
//! for cost and latency; the cache key therefore covers names and types
//! only, never sampled statistics.

use std::collections::HashMap;
use std::sync::Mutex;

use autoanalyst_sdk::{BoundedText, DatasetHandle, Purpose, ReasoningBackend};
use sha2::{Digest, Sha256};

use crate::backend::{complete_with_retry, RetryPolicy};
use crate::context::{build_context, ContextView};
use crate::error::{EngineError, EngineResult};
use crate::prompts;
use crate::state::{ContextSnapshot, PlanStep};

pub struct CodeGenerator {
    retry: RetryPolicy,
    context_budget: usize,
    cache: Mutex<HashMap<String, String>>,
}

impl CodeGenerator {
    pub fn new(retry: RetryPolicy, context_budget: usize) -> Self {
        Self {
            retry,
            context_budget,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Produce code for a step, serving an unchanged fingerprint from the
    /// cache without a backend call.
    pub async fn generate(
        &self,
        backend: &dyn ReasoningBackend,
        step: &PlanStep,
        snapshot: &ContextSnapshot,
        dataset: &DatasetHandle,
    ) -> EngineResult<String> {
        let key = fingerprint(&step.description, &snapshot.profile.fingerprint_source());
        if let Some(code) = self.cached(&key) {
            return Ok(code);
        }

        let view = ContextView::from_snapshot(snapshot).with_step(step_detail(step));
        let context = build_context(&view, self.context_budget);
        let prompt = BoundedText::fit(
            prompts::generate_code(
                context.as_str(),
                &dataset.data_path.to_string_lossy(),
                &dataset.output_dir.join("figures").to_string_lossy(),
            ),
            self.context_budget * 2,
        );

        let response = complete_with_retry(backend, &prompt, Purpose::Codegen, self.retry).await?;
        let code = prompts::extract_code(&response);
        if code.is_empty() {
            return Err(EngineError::Generation(
                "backend returned no code".to_string(),
            ));
        }

        self.store(key, code.clone());
        Ok(code)
    }

    /// Repair failing code using its own error as feedback. Repairs are
    /// never cached; a new code version comes back every time.
    pub async fn repair(
        &self,
        backend: &dyn ReasoningBackend,
        step: &PlanStep,
        snapshot: &ContextSnapshot,
        failing_code: &str,
        error: &str,
    ) -> EngineResult<String> {
        let view = ContextView::from_snapshot(snapshot)
            .with_step(step_detail(step))
            .with_failure(error.to_string());
        let context = build_context(&view, self.context_budget);
        let prompt = BoundedText::fit(
            prompts::repair_code(context.as_str(), failing_code, error),
            self.context_budget * 2,
        );

        let response = complete_with_retry(backend, &prompt, Purpose::Repair, self.retry).await?;
        let code = prompts::extract_code(&response);
        if code.is_empty() {
            return Err(EngineError::Generation(
                "backend returned no repaired code".to_string(),
            ));
        }
        Ok(code)
    }

    /// Drop a cached entry, e.g. after its code turned out not to run.
    pub fn invalidate(&self, step: &PlanStep, snapshot: &ContextSnapshot) {
        let key = fingerprint(&step.description, &snapshot.profile.fingerprint_source());
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&key);
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().ok().and_then(|c| c.get(key).cloned())
    }

    fn store(&self, key: String, code: String) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, code);
        }
    }
}

fn step_detail(step: &PlanStep) -> String {
    format!(
        "Step {}: {}\nCategory: {:?}\nPriority: {}",
        step.seq + 1,
        step.description,
        step.category,
        step.priority
    )
}

/// SHA-256 over the step description and the profile's structural
/// fingerprint (names and types, not statistics).
fn fingerprint(description: &str, profile_source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(b"\x00");
    hasher.update(profile_source.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoanalyst_sdk::{BackendError, DataProfile, FieldProfile};
    use crate::state::StepCategory;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
        response: String,
    }

    #[autoanalyst_sdk::async_trait]
    impl ReasoningBackend for Counting {
        async fn complete(
            &self,
            _prompt: &BoundedText,
            _purpose: Purpose,
        ) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn snapshot() -> ContextSnapshot {
        let mut profile = DataProfile::default();
        profile.fields.insert(
            "age".into(),
            FieldProfile {
                declared_type: Some("int64".into()),
                ..Default::default()
            },
        );
        ContextSnapshot {
            profile,
            digest_text: String::new(),
            plan_overview: String::new(),
            round: 0,
            recent_suggestions: Vec::new(),
        }
    }

    fn dataset() -> DatasetHandle {
        DatasetHandle {
            data_path: PathBuf::from("data.csv"),
            output_dir: PathBuf::from("output"),
        }
    }

    fn step() -> PlanStep {
        PlanStep::new(0, "histogram of age", StepCategory::Exploration)
    }

    #[tokio::test]
    async fn test_generate_strips_fences_and_caches() {
        let backend = Counting {
            calls: AtomicU32::new(0),
            response: "```python\nresult = df['age'].mean()\n```".into(),
        };
        let generator = CodeGenerator::new(RetryPolicy::new(0, 1), 2000);
        let step = step();
        let snapshot = snapshot();

        let code = generator
            .generate(&backend, &step, &snapshot, &dataset())
            .await
            .unwrap();
        assert_eq!(code, "result = df['age'].mean()");

        // identical fingerprint: served from cache, no second call
        let again = generator
            .generate(&backend, &step, &snapshot, &dataset())
            .await
            .unwrap();
        assert_eq!(again, code);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_step_misses_cache() {
        let backend = Counting {
            calls: AtomicU32::new(0),
            response: "result = 1".into(),
        };
        let generator = CodeGenerator::new(RetryPolicy::new(0, 1), 2000);
        let snapshot = snapshot();

        generator
            .generate(&backend, &step(), &snapshot, &dataset())
            .await
            .unwrap();
        let other = PlanStep::new(0, "value counts of city", StepCategory::Exploration);
        generator
            .generate(&backend, &other, &snapshot, &dataset())
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_regeneration() {
        let backend = Counting {
            calls: AtomicU32::new(0),
            response: "result = 1".into(),
        };
        let generator = CodeGenerator::new(RetryPolicy::new(0, 1), 2000);
        let step = step();
        let snapshot = snapshot();

        generator
            .generate(&backend, &step, &snapshot, &dataset())
            .await
            .unwrap();
        generator.invalidate(&step, &snapshot);
        generator
            .generate(&backend, &step, &snapshot, &dataset())
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_response_is_generation_error() {
        let backend = Counting {
            calls: AtomicU32::new(0),
            response: "   ".into(),
        };
        let generator = CodeGenerator::new(RetryPolicy::new(0, 1), 2000);
        let result = generator
            .generate(&backend, &step(), &snapshot(), &dataset())
            .await;
        assert!(matches!(result, Err(EngineError::Generation(_))));
    }

    #[test]
    fn test_fingerprint_sensitive_to_both_inputs() {
        let a = fingerprint("step one", "age:int64\n");
        assert_eq!(a, fingerprint("step one", "age:int64\n"));
        assert_ne!(a, fingerprint("step two", "age:int64\n"));
        assert_ne!(a, fingerprint("step one", "age:float64\n"));
    }
}
