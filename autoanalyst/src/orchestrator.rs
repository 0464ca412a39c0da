//! The orchestration loop.
//!
//! Drives rounds of Selecting -> Generating -> Executing -> Interpreting ->
//! Updating over the shared project state until the step budget runs out,
//! the plan is exhausted, or a fatal error aborts the run. Each round ends
//! with a persisted snapshot, so an interrupted run resumes at the next
//! Selecting without re-running completed steps.
//!
//! Concurrent mode dispatches several ready steps at once through a
//! semaphore-capped `FuturesUnordered`; workers only touch shared state
//! through claim/commit leases, and plan revision stays serialized on this
//! task between dispatch waves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use autoanalyst_sdk::{
    log_found, log_info, log_progress, log_round_started, log_step_finished, log_step_progress,
    log_step_started, log_warning, DataProfile, DatasetHandle, EngineLog, ExecLimits,
    ExecOutcome, ExecRecord, ReasoningBackend, RunStatus, StepRunner,
};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::backend::RetryPolicy;
use crate::codegen::CodeGenerator;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::interpreter::ResultInterpreter;
use crate::planner::PlanManager;
use crate::state::{
    ExecutionArtifact, Insight, ProjectState, Selection, SharedState, StateStore,
};

/// Handle for user-initiated cancellation. Marking it cancelled lets
/// in-flight executions run to their own timeout, then aborts the run at
/// the next round boundary with every committed artifact persisted.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a run ended, with the counters a front end reports.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub reason: String,
    pub rounds: u64,
    pub analyses_run: u64,
    pub retries_used: u64,
}

pub struct Orchestrator {
    config: EngineConfig,
    backend: Arc<dyn ReasoningBackend>,
    runner: Arc<dyn StepRunner>,
    planner: PlanManager,
    codegen: CodeGenerator,
    interpreter: ResultInterpreter,
    store: StateStore,
    dataset: DatasetHandle,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ReasoningBackend>,
        runner: Arc<dyn StepRunner>,
        store: StateStore,
        dataset: DatasetHandle,
    ) -> Self {
        let retry = RetryPolicy::new(config.backend_max_retries, config.backend_backoff_ms);
        let planner = PlanManager::new(retry, config.max_analyses, config.context_budget)
            .with_mirror(config.output_dir.join("analysis_plan.json"));
        let codegen = CodeGenerator::new(retry, config.context_budget);
        let interpreter = ResultInterpreter::new(retry, config.context_budget);
        Self {
            config,
            backend,
            runner,
            planner,
            codegen,
            interpreter,
            store,
            dataset,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a project to completion and return the final state alongside
    /// the summary. `resume` picks up the latest persisted snapshot when
    /// one exists.
    pub async fn run(
        &self,
        project_id: &str,
        profile: DataProfile,
        resume: bool,
    ) -> Result<(ProjectState, RunSummary)> {
        EngineLog::RunStarted {
            project_id: project_id.to_string(),
        }
        .emit();

        // Idle -> Planning
        let shared = self.initialize(project_id, profile, resume).await?;

        let summary = match self.round_loop(&shared).await {
            Ok(summary) => summary,
            Err(e) => {
                // fatal: persist what committed, then surface
                let state = shared.clone_state().await;
                let _ = self.store.save_snapshot(&state);
                EngineLog::RunAborted {
                    reason: e.to_string(),
                }
                .emit();
                return Err(e.into());
            }
        };

        let state = shared.clone_state().await;
        self.store
            .save_snapshot(&state)
            .context("failed to persist final snapshot")?;

        match summary.status {
            RunStatus::Done => EngineLog::RunCompleted {
                analyses: summary.analyses_run,
            }
            .emit(),
            _ => EngineLog::RunAborted {
                reason: summary.reason.clone(),
            }
            .emit(),
        }

        Ok((state, summary))
    }

    /// Planning: resume from the latest snapshot, or build a fresh state
    /// and ask the plan manager for the initial plan.
    async fn initialize(
        &self,
        project_id: &str,
        profile: DataProfile,
        resume: bool,
    ) -> Result<SharedState> {
        if resume {
            if let Some(state) = self
                .store
                .load_latest(project_id)
                .map_err(|e| EngineError::State(e.to_string()))?
            {
                log_info!(
                    "Resuming {} at round {} ({} analyses done)",
                    project_id,
                    state.round,
                    state.analyses_run
                );
                return Ok(SharedState::new(state));
            }
            log_info!("No snapshot for {}, starting fresh", project_id);
        }

        let mut state = ProjectState::new(
            project_id,
            profile,
            self.config.digest_max_tokens,
            self.config.digest_keep_rounds,
        );

        let steps = self
            .planner
            .generate_initial_plan(self.backend.as_ref(), &state.profile)
            .await?;
        for step in steps {
            state.plan.push(step);
        }
        EngineLog::PlanReady {
            steps: state.plan.len(),
        }
        .emit();
        log_found!(state.plan.len(), "planned steps");

        let shared = SharedState::new(state);
        self.planner.mirror_plan(&shared).await;
        let snapshot = shared.clone_state().await;
        self.store
            .save_snapshot(&snapshot)
            .context("failed to persist initial snapshot")?;
        Ok(shared)
    }

    async fn round_loop(&self, shared: &SharedState) -> Result<RunSummary, EngineError> {
        loop {
            // Termination checks at the top of each round
            if self.cancel.is_cancelled() {
                return Ok(self.summary(shared, RunStatus::Aborted, "cancelled").await);
            }
            let analyses_run = shared.read(|s| s.analyses_run).await;
            if analyses_run >= self.config.max_analyses {
                log_info!("Analysis budget of {} reached", self.config.max_analyses);
                return Ok(self
                    .summary(shared, RunStatus::Done, "analysis budget reached")
                    .await);
            }

            // Selecting
            let batch = match self.select_batch(shared, analyses_run).await {
                Ok(batch) => batch,
                Err(done) => return Ok(done),
            };

            let round = shared
                .mutate(|state| {
                    state.round += 1;
                    state.round
                })
                .await;
            log_round_started!(round);

            // Generating / Executing / Interpreting, one worker per step
            self.dispatch(shared, &batch).await?;

            // Updating: plan revision is serialized on this task, so it
            // never races a worker's claim
            let (appended, skipped) = self
                .planner
                .review_and_update(self.backend.as_ref(), shared)
                .await?;
            if appended + skipped > 0 {
                EngineLog::PlanRevised { appended, skipped }.emit();
            }

            let state = shared.clone_state().await;
            self.store
                .save_snapshot(&state)
                .map_err(|e| EngineError::State(e.to_string()))?;
            EngineLog::SnapshotSaved { round }.emit();
            log_progress!(state.analyses_run, self.config.max_analyses, "analyses");
        }
    }

    /// Pick the steps for this round: one in single-loop mode, up to the
    /// concurrency cap (and remaining budget) in concurrent mode.
    async fn select_batch(
        &self,
        shared: &SharedState,
        analyses_run: u64,
    ) -> Result<Vec<Uuid>, RunSummary> {
        let selection = self.planner.next_ready_step(shared).await;
        match selection {
            Selection::Exhausted => {
                log_info!("Plan exhausted");
                Err(self.summary(shared, RunStatus::Done, "plan exhausted").await)
            }
            Selection::Blocked(count) => {
                log_warning!("{} remaining steps are blocked on unmet dependencies", count);
                Err(self
                    .summary(shared, RunStatus::Done, "remaining steps blocked")
                    .await)
            }
            Selection::Ready(first) => {
                if self.config.max_concurrency <= 1 {
                    return Ok(vec![first]);
                }
                let budget_left =
                    (self.config.max_analyses - analyses_run).max(1) as usize;
                let cap = self.config.max_concurrency.min(budget_left);
                let mut batch = shared.read(|s| s.plan.ready_steps()).await;
                batch.truncate(cap);
                Ok(batch)
            }
        }
    }

    /// Run a batch of steps concurrently. Only fatal errors escape; every
    /// other failure is committed as a failed step.
    async fn dispatch(&self, shared: &SharedState, batch: &[Uuid]) -> Result<(), EngineError> {
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut workers = FuturesUnordered::new();

        for &step_id in batch {
            let sem = sem.clone();
            workers.push(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| EngineError::State("semaphore closed".to_string()))?;
                self.run_step(shared, step_id).await
            });
        }

        while let Some(result) = workers.next().await {
            match result {
                Ok(Some((step_id, outcome))) => {
                    log_step_finished!(step_id, outcome);
                }
                Ok(None) => {} // lost the claim race; another worker has it
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log_warning!("Step worker failed non-fatally: {}", e),
            }
        }
        Ok(())
    }

    /// One worker: claim -> generate -> execute (with bounded repair) ->
    /// interpret -> commit. Always commits exactly once after a
    /// successful claim; the artifact and status land atomically.
    async fn run_step(
        &self,
        shared: &SharedState,
        step_id: Uuid,
    ) -> Result<Option<(Uuid, ExecOutcome)>, EngineError> {
        if !shared.claim_step(step_id).await {
            return Ok(None);
        }

        // Consistent snapshot for the whole step
        let snapshot = shared.snapshot_context().await;
        let step = shared
            .read(|s| s.plan.get(step_id).cloned())
            .await
            .ok_or_else(|| EngineError::State(format!("claimed unknown step {}", step_id)))?;
        log_step_started!(step_id, step.description);

        let limits = ExecLimits {
            timeout_secs: self.config.exec_timeout_secs,
            allowed_imports: self.config.allowed_imports.clone(),
        };

        let mut code = match self
            .codegen
            .generate(self.backend.as_ref(), &step, &snapshot, &self.dataset)
            .await
        {
            Ok(code) => code,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // no code to run: the step fails with the error on record
                let artifact = failure_artifact(step_id, String::new(), 1, e.to_string());
                let insight = Insight::not_completed(step_id, ExecOutcome::RuntimeError, 1);
                shared.commit_step(step_id, artifact, insight).await?;
                return Ok(Some((step_id, ExecOutcome::RuntimeError)));
            }
        };

        let mut version: u32 = 1;
        let mut repairs_used: u64 = 0;
        let (artifact, outcome) = loop {
            let record = match self.runner.run(&code, &self.dataset, &limits).await {
                Ok(record) => record,
                Err(e) => ExecRecord {
                    stderr: format!("execution environment failure: {}", e),
                    outcome: ExecOutcome::RuntimeError,
                    ..Default::default()
                },
            };
            let outcome = record.outcome;
            let artifact = ExecutionArtifact::from_record(step_id, code.clone(), version, record);

            match outcome {
                ExecOutcome::Success => break (artifact, outcome),
                // no error feedback to repair from; terminal for the step
                ExecOutcome::Timeout | ExecOutcome::PolicyViolation => break (artifact, outcome),
                ExecOutcome::RuntimeError => {
                    if version > self.config.max_repair_attempts {
                        break (artifact, outcome);
                    }
                    log_step_progress!(
                        step_id,
                        format!(
                            "repair attempt {}/{}",
                            version, self.config.max_repair_attempts
                        )
                    );
                    // cached code that does not run must not be served again
                    self.codegen.invalidate(&step, &snapshot);
                    match self
                        .codegen
                        .repair(
                            self.backend.as_ref(),
                            &step,
                            &snapshot,
                            &code,
                            &artifact.stderr,
                        )
                        .await
                    {
                        Ok(repaired) => {
                            code = repaired;
                            version += 1;
                            repairs_used += 1;
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(_) => break (artifact, outcome),
                    }
                }
            }
        };

        if repairs_used > 0 {
            shared.add_retries(repairs_used).await;
        }

        let insight = match self
            .interpreter
            .interpret(self.backend.as_ref(), &step, &artifact, &snapshot)
            .await
        {
            Ok(insight) => insight,
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => Insight::not_completed(step_id, outcome, artifact.code_version),
        };

        shared.commit_step(step_id, artifact, insight).await?;
        Ok(Some((step_id, outcome)))
    }

    async fn summary(&self, shared: &SharedState, status: RunStatus, reason: &str) -> RunSummary {
        shared
            .read(|s| RunSummary {
                status,
                reason: reason.to_string(),
                rounds: s.round,
                analyses_run: s.analyses_run,
                retries_used: s.retries_used,
            })
            .await
    }
}

fn failure_artifact(
    step_id: Uuid,
    code: String,
    version: u32,
    error: String,
) -> ExecutionArtifact {
    ExecutionArtifact::from_record(
        step_id,
        code,
        version,
        ExecRecord {
            stderr: error,
            outcome: ExecOutcome::RuntimeError,
            ..Default::default()
        },
    )
}
