//! Saga worker.
//!
//! Drives one queue delivery through the orchestration state machine:
//!
//! ```text
//! ENTERING -> LOCK_ACQUIRED -> EXECUTING(i) -> COMPLETED
//!                                   \-> COMPENSATING -> FAILED -> QUARANTINED
//! ```
//!
//! Each step's status is persisted before its side effects run and again
//! after they commit. On crash between the two writes the step re-runs once
//! (execute actions are required to be idempotent within a saga); on crash
//! after the second write it never re-runs. Resume-after-crash falls out:
//! redelivery picks up at `current_step_index` with completed steps left
//! untouched.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::compensation::{CompensationEngine, TrailEntry};
use crate::config::SagaConfig;
use crate::error::SagaError;
use crate::job::{SagaJob, SagaReport, StepStatus};
use crate::kv::KvStore;
use crate::lock::LockManager;
use crate::quarantine::{QuarantineRecord, QuarantineStore};
use crate::queue::{JobQueue, QueuedJob};
use crate::registry::{StepContext, StepRegistry};
use crate::resource::describe_resources;

/// Executes saga instances delivered by the queue.
pub struct SagaWorker {
    queue: Arc<dyn JobQueue>,
    registry: Arc<StepRegistry>,
    locks: LockManager,
    compensation: CompensationEngine,
    quarantine: QuarantineStore,
    config: SagaConfig,
    metrics: Arc<WorkerMetrics>,
}

impl SagaWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        kv: Arc<dyn KvStore>,
        registry: Arc<StepRegistry>,
        config: SagaConfig,
    ) -> Self {
        let locks = LockManager::new(kv.clone(), &config);
        let compensation = CompensationEngine::new(kv.clone(), registry.clone(), &config);
        let quarantine = QuarantineStore::new(kv);
        Self {
            queue,
            registry,
            locks,
            compensation,
            quarantine,
            config,
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    /// The lock manager this worker serializes sagas with.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The compensation engine, for operator retry of failed compensations.
    pub fn compensation(&self) -> &CompensationEngine {
        &self.compensation
    }

    /// The quarantine store this worker parks exhausted sagas in.
    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    /// Worker statistics snapshot.
    pub fn stats(&self) -> WorkerStats {
        self.metrics.get_stats()
    }

    /// Reserve and process the next waiting job.
    ///
    /// Returns `None` when the queue is empty. A `Some(Err(_))` outcome has
    /// already been reported to the queue (and quarantined when the attempt
    /// budget is exhausted).
    pub fn process_next(&self) -> Option<Result<SagaReport, SagaError>> {
        match self.queue.reserve_next() {
            Ok(Some(job)) => Some(self.process(&job)),
            Ok(None) => None,
            Err(err) => Some(Err(err.into())),
        }
    }

    /// Process every waiting job; returns how many were processed.
    pub fn drain(&self) -> usize {
        let mut processed = 0;
        while self.process_next().is_some() {
            processed += 1;
        }
        processed
    }

    /// Process one reserved job through the state machine and report the
    /// outcome to the queue.
    pub fn process(&self, job: &QueuedJob) -> Result<SagaReport, SagaError> {
        self.metrics.record_run();
        match self.run(job) {
            Ok(report) => {
                self.queue.update_progress(&job.id, 100)?;
                self.queue.complete(&job.id, serde_json::to_value(&report)?)?;
                self.metrics.record_completed();
                tracing::info!(
                    job_id = %job.id,
                    steps = report.executed_steps.len(),
                    duration_ms = report.duration_ms,
                    "saga completed"
                );
                Ok(report)
            }
            Err(err) => {
                self.metrics.record_failed();
                // Quarantine before the failure reaches the queue, so an
                // operator sees the record even if event handling is flaky.
                self.quarantine_if_exhausted(job, &err);
                self.queue.fail(&job.id, &err.to_string())?;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn run(&self, job: &QueuedJob) -> Result<SagaReport, SagaError> {
        let started = Instant::now();
        let mut saga: SagaJob = serde_json::from_value(job.payload.clone())?;
        let resources = saga.resources();

        // ENTERING: serialize on the resource set. On conflict nothing is
        // released here; the owner check protects the holder's locks.
        if !self
            .locks
            .acquire(&resources, &job.id, self.config.lock_ttl)?
        {
            self.metrics.record_busy();
            return Err(SagaError::ResourceBusy {
                resources: describe_resources(&resources),
            });
        }

        let outcome = self.run_locked(job, &mut saga, started);

        // Released on every exit path. Owner verification makes this safe
        // even when the TTL already expired and someone else holds the key.
        if let Err(err) = self.locks.release(&resources, &job.id) {
            tracing::warn!(job_id = %job.id, error = %err, "lock release failed");
        }
        outcome
    }

    fn run_locked(
        &self,
        job: &QueuedJob,
        saga: &mut SagaJob,
        started: Instant,
    ) -> Result<SagaReport, SagaError> {
        // LOCK_ACQUIRED: rebuild the success trail from persisted state so a
        // failure later in this run can still roll back steps completed by
        // earlier runs. A name this process does not know is skipped; its
        // compensation can only run on a node that has it.
        let mut trail: Vec<TrailEntry> = Vec::new();
        for step in saga.steps.iter().take(saga.current_step_index) {
            if step.status != StepStatus::Completed {
                continue;
            }
            match self.registry.get(&step.name) {
                Some(handler) => trail.push(TrailEntry {
                    name: step.name.clone(),
                    result: step.result.clone().unwrap_or(JsonValue::Null),
                    handler,
                }),
                None => tracing::warn!(
                    job_id = %job.id,
                    step = %step.name,
                    "completed step not in registry; compensation unreachable on this node"
                ),
            }
        }

        let total = saga.steps.len();
        let mut executed: Vec<String> = Vec::new();

        // EXECUTING(i)
        for i in saga.current_step_index..total {
            let name = saga.steps[i].name.clone();
            self.queue
                .update_progress(&job.id, ((i * 100) / total) as u8)?;

            // Persist in_progress (and the cursor) before any side effect.
            saga.steps[i].status = StepStatus::InProgress;
            if saga.current_step_index < i {
                saga.current_step_index = i;
            }
            self.persist(job, saga)?;

            let Some(handler) = self.registry.get(&name) else {
                saga.steps[i].status = StepStatus::Failed;
                self.persist_best_effort(job, saga);
                self.compensate_trail(&job.id, &trail);
                return Err(SagaError::StepFunctionNotFound(name));
            };

            let context = StepContext {
                job_id: job.id.clone(),
                user_id: saga.user_id,
                step_name: name.clone(),
                step_index: i,
                prior_results: completed_results(saga),
            };

            tracing::debug!(job_id = %job.id, step = %name, index = i, "executing step");
            match handler.execute(&context) {
                Ok(result) => {
                    saga.steps[i].status = StepStatus::Completed;
                    saga.steps[i].result = Some(result.clone());
                    if i + 1 < total {
                        saga.current_step_index = i + 1;
                    }
                    self.persist(job, saga)?;
                    trail.push(TrailEntry {
                        name: name.clone(),
                        result,
                        handler,
                    });
                    executed.push(name);
                }
                Err(message) => {
                    // COMPENSATING: explicit rollback branch, then the
                    // original failure propagates.
                    saga.steps[i].status = StepStatus::Failed;
                    self.persist_best_effort(job, saga);
                    self.compensate_trail(&job.id, &trail);
                    return Err(SagaError::StepExecution { step: name, message });
                }
            }
        }

        // COMPLETED
        Ok(SagaReport {
            success: true,
            executed_steps: executed,
            duration_ms: started.elapsed().as_millis() as u64,
            results: completed_results(saga),
        })
    }

    fn compensate_trail(&self, job_id: &str, trail: &[TrailEntry]) {
        if trail.is_empty() {
            return;
        }
        self.metrics.record_compensation();
        let outcome = self.compensation.execute(job_id, trail);
        tracing::info!(
            job_id,
            compensated = outcome.compensated.len(),
            failures = outcome.failures.len(),
            "success trail compensated"
        );
    }

    fn persist(&self, job: &QueuedJob, saga: &SagaJob) -> Result<(), SagaError> {
        let payload = serde_json::to_value(saga)?;
        self.queue.update_payload(&job.id, payload)?;
        Ok(())
    }

    fn persist_best_effort(&self, job: &QueuedJob, saga: &SagaJob) {
        if let Err(err) = self.persist(job, saga) {
            tracing::warn!(job_id = %job.id, error = %err, "failed to persist step failure");
        }
    }

    // ------------------------------------------------------------------
    // Quarantine
    // ------------------------------------------------------------------

    fn quarantine_if_exhausted(&self, job: &QueuedJob, err: &SagaError) {
        // attempts_made was counted at reservation; budget left means the
        // queue requeues this job instead.
        if job.attempts_made < job.attempts_max {
            tracing::debug!(
                job_id = %job.id,
                attempt = job.attempts_made,
                "attempt failed, queue will retry"
            );
            return;
        }

        // Prefer the freshest payload; step statuses were persisted during
        // the run.
        let payload = self
            .queue
            .fetch(&job.id)
            .ok()
            .flatten()
            .map(|j| j.payload)
            .unwrap_or_else(|| job.payload.clone());
        let saga: Option<SagaJob> = serde_json::from_value(payload.clone()).ok();

        let mut record = QuarantineRecord::new(&job.id, job.attempts_made, &err.to_string())
            .with_job_data(payload)
            .with_failure_stack(&format!("{:?}", err));

        if let Some(saga) = &saga {
            record = record
                .with_user_id(saga.user_id)
                .with_completed_steps(saga.completed_step_names());
            if let Some(key) = &saga.idempotency_key {
                record = record.with_business_context(
                    serde_json::json!({ "idempotency_key": key }),
                );
            }
        }
        if let Some(step) = failed_step_name(err) {
            record = record.with_failed_step(&step);
        }

        match self.quarantine.add(record) {
            Ok(dlq_id) => {
                self.metrics.record_quarantined();
                tracing::info!(job_id = %job.id, dlq_id = %dlq_id, "saga quarantined");
            }
            Err(quarantine_err) => {
                // The saga failure still propagates; recovery is operational.
                tracing::error!(
                    job_id = %job.id,
                    error = %quarantine_err,
                    "failed to write quarantine record"
                );
            }
        }
    }
}

fn completed_results(saga: &SagaJob) -> HashMap<String, JsonValue> {
    saga.steps
        .iter()
        .filter(|s| s.is_completed())
        .filter_map(|s| s.result.clone().map(|r| (s.name.clone(), r)))
        .collect()
}

fn failed_step_name(err: &SagaError) -> Option<String> {
    match err {
        SagaError::StepExecution { step, .. } => Some(step.clone()),
        SagaError::StepFunctionNotFound(name) => Some(name.clone()),
        _ => None,
    }
}

// ============================================================================
// Statistics & Metrics
// ============================================================================

/// Aggregate worker statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Deliveries processed.
    pub total_runs: u64,
    /// Sagas that completed.
    pub completed: u64,
    /// Runs that failed for any reason.
    pub failed: u64,
    /// Runs rejected because the resource set was locked.
    pub busy_rejections: u64,
    /// Runs that triggered compensation.
    pub compensations: u64,
    /// Sagas parked in quarantine.
    pub quarantined: u64,
}

/// Internal atomic metrics tracker for the worker.
#[derive(Default)]
struct WorkerMetrics {
    total_runs: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    busy_rejections: AtomicU64,
    compensations: AtomicU64,
    quarantined: AtomicU64,
}

impl WorkerMetrics {
    fn record_run(&self) {
        self.total_runs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_busy(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            total_runs: self.total_runs.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
