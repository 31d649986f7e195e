//! Durable job queue contract.
//!
//! The orchestrator treats the queue as an existing durable FIFO primitive:
//! at-least-once delivery, per-job payload mutation, configurable attempt
//! budgets, and failure events. This module defines that contract plus an
//! in-memory backend with the same visibility semantics, used for
//! development and the crate's own tests:
//! - Enqueue with dedup anchors (caller-supplied job ids)
//! - Reservation (a reserved job is invisible to other workers)
//! - Attempt counting with automatic requeue while budget remains
//! - Completion / failure / progress event hooks

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

// ============================================================================
// Job Types
// ============================================================================

/// Queue-level state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be reserved by a worker.
    Waiting,
    /// Reserved by a worker; invisible to other workers.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempt budget.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A job as the queue sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Opaque job id.
    pub id: String,
    /// Current payload. Replaced in place by `update_payload`.
    pub payload: JsonValue,
    /// Queue-level state.
    pub state: JobState,
    /// Attempt budget.
    pub attempts_max: u32,
    /// Attempts started so far (incremented on reservation).
    pub attempts_made: u32,
    /// Observational progress, 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    /// When the latest attempt was reserved.
    pub processed_on: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_on: Option<DateTime<Utc>>,
    /// Reason of the most recent failure.
    pub failed_reason: Option<String>,
    /// Return value of a completed job.
    pub return_value: Option<JsonValue>,
}

/// Options for enqueueing a job.
#[derive(Clone, Debug)]
pub struct EnqueueOptions {
    /// Attempt budget. 1 means a single failure is final.
    pub attempts: u32,
    /// Caller-supplied job id, used as a dedup anchor: enqueueing an id that
    /// already exists returns the existing job untouched.
    pub job_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            job_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Job queue error types.
#[derive(Debug, Clone)]
pub enum QueueError {
    /// No job with the given id.
    JobNotFound(String),
    /// The operation is not valid for the job's current state.
    InvalidState { job_id: String, state: JobState },
    /// Failed to serialize or deserialize a payload.
    Serialization(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::JobNotFound(id) => write!(f, "job not found: {}", id),
            QueueError::InvalidState { job_id, state } => {
                write!(f, "job {} is in state {}", job_id, state)
            }
            QueueError::Serialization(msg) => write!(f, "queue serialization error: {}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

// ============================================================================
// Queue Contract
// ============================================================================

/// Callback invoked on job lifecycle events.
pub type JobCallback = Arc<dyn Fn(&QueuedJob) + Send + Sync>;

/// Contract over the durable work queue.
///
/// A reserved job must not be delivered to another worker until it is
/// completed or failed. No cross-job ordering is guaranteed; sagas touching
/// the same resources are serialized by the lock manager, not the queue.
pub trait JobQueue: Send + Sync {
    /// Enqueue a payload, returning the job id.
    fn enqueue(&self, payload: JsonValue, options: EnqueueOptions) -> Result<String, QueueError>;

    /// Fetch a job snapshot by id.
    fn fetch(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError>;

    /// Replace a job's payload in place. Required for resumability.
    fn update_payload(&self, job_id: &str, payload: JsonValue) -> Result<(), QueueError>;

    /// Record observational progress (0..=100).
    fn update_progress(&self, job_id: &str, progress: u8) -> Result<(), QueueError>;

    /// Reserve the next waiting job, making it invisible to other workers.
    fn reserve_next(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Mark a reserved job completed with a return value.
    fn complete(&self, job_id: &str, return_value: JsonValue) -> Result<(), QueueError>;

    /// Mark a reserved job's attempt failed. The job is requeued while its
    /// attempt budget lasts, then parked in the failed state.
    fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError>;

    /// Register a completion callback.
    fn on_completed(&self, callback: JobCallback);

    /// Register a failure callback. Fired on every failed attempt; handlers
    /// must tolerate repeats for the same job.
    fn on_failed(&self, callback: JobCallback);

    /// Register a progress callback.
    fn on_progress(&self, callback: JobCallback);

    /// Queue statistics snapshot.
    fn stats(&self) -> QueueStats;
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// In-memory job queue backend.
pub struct InMemoryJobQueue {
    jobs: DashMap<String, QueuedJob>,
    ready: RwLock<VecDeque<String>>,
    completed_callbacks: RwLock<Vec<JobCallback>>,
    failed_callbacks: RwLock<Vec<JobCallback>>,
    progress_callbacks: RwLock<Vec<JobCallback>>,
    metrics: Arc<QueueMetrics>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            ready: RwLock::new(VecDeque::new()),
            completed_callbacks: RwLock::new(Vec::new()),
            failed_callbacks: RwLock::new(Vec::new()),
            progress_callbacks: RwLock::new(Vec::new()),
            metrics: Arc::new(QueueMetrics::default()),
        }
    }

    /// Number of jobs waiting to be reserved.
    pub fn waiting_count(&self) -> usize {
        self.ready.read().len()
    }

    /// Total jobs known to the queue in any state.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Drop every job. Test-reset surface.
    pub fn clear(&self) {
        self.jobs.clear();
        self.ready.write().clear();
    }

    fn fire(callbacks: &RwLock<Vec<JobCallback>>, job: &QueuedJob) {
        let callbacks = callbacks.read().clone();
        for callback in callbacks {
            callback(job);
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, payload: JsonValue, options: EnqueueOptions) -> Result<String, QueueError> {
        let job_id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Dedup anchor: an existing id is returned untouched.
        if self.jobs.contains_key(&job_id) {
            return Ok(job_id);
        }

        let job = QueuedJob {
            id: job_id.clone(),
            payload,
            state: JobState::Waiting,
            attempts_max: options.attempts.max(1),
            attempts_made: 0,
            progress: 0,
            created_at: Utc::now(),
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            return_value: None,
        };

        self.jobs.insert(job_id.clone(), job);
        self.ready.write().push_back(job_id.clone());
        self.metrics.record_enqueued();
        Ok(job_id)
    }

    fn fetch(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.jobs.get(job_id).map(|j| j.value().clone()))
    }

    fn update_payload(&self, job_id: &str, payload: JsonValue) -> Result<(), QueueError> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.payload = payload;
        Ok(())
    }

    fn update_progress(&self, job_id: &str, progress: u8) -> Result<(), QueueError> {
        let snapshot = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
            job.progress = progress.min(100);
            job.clone()
        };
        Self::fire(&self.progress_callbacks, &snapshot);
        Ok(())
    }

    fn reserve_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        loop {
            let candidate = self.ready.write().pop_front();
            let Some(job_id) = candidate else {
                return Ok(None);
            };

            // The ready list can reference jobs that were cleared; skip them.
            let Some(mut job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.state != JobState::Waiting {
                continue;
            }

            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_on = Some(Utc::now());
            self.metrics.record_reserved();
            return Ok(Some(job.clone()));
        }
    }

    fn complete(&self, job_id: &str, return_value: JsonValue) -> Result<(), QueueError> {
        let snapshot = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
            if job.state != JobState::Active {
                return Err(QueueError::InvalidState {
                    job_id: job_id.to_string(),
                    state: job.state,
                });
            }
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.return_value = Some(return_value);
            job.clone()
        };
        self.metrics.record_completed();
        Self::fire(&self.completed_callbacks, &snapshot);
        Ok(())
    }

    fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        let (snapshot, requeued) = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
            if job.state != JobState::Active {
                return Err(QueueError::InvalidState {
                    job_id: job_id.to_string(),
                    state: job.state,
                });
            }
            job.failed_reason = Some(reason.to_string());
            let requeued = job.attempts_made < job.attempts_max;
            if requeued {
                job.state = JobState::Waiting;
            } else {
                job.state = JobState::Failed;
                job.finished_on = Some(Utc::now());
            }
            (job.clone(), requeued)
        };

        if requeued {
            self.ready.write().push_back(job_id.to_string());
            self.metrics.record_retried();
        } else {
            self.metrics.record_failed();
        }
        Self::fire(&self.failed_callbacks, &snapshot);
        Ok(())
    }

    fn on_completed(&self, callback: JobCallback) {
        self.completed_callbacks.write().push(callback);
    }

    fn on_failed(&self, callback: JobCallback) {
        self.failed_callbacks.write().push(callback);
    }

    fn on_progress(&self, callback: JobCallback) {
        self.progress_callbacks.write().push(callback);
    }

    fn stats(&self) -> QueueStats {
        let mut stats = self.metrics.get_stats();
        stats.waiting = self.ready.read().len();
        stats
    }
}

// ============================================================================
// Statistics & Metrics
// ============================================================================

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs ever enqueued.
    pub total_enqueued: u64,
    /// Reservations handed to workers.
    pub total_reserved: u64,
    /// Jobs that completed.
    pub total_completed: u64,
    /// Jobs that exhausted their attempt budget.
    pub total_failed: u64,
    /// Failed attempts that were requeued.
    pub total_retried: u64,
    /// Jobs currently waiting.
    pub waiting: usize,
}

/// Internal atomic metrics tracker for the queue.
#[derive(Default)]
struct QueueMetrics {
    total_enqueued: AtomicU64,
    total_reserved: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
}

impl QueueMetrics {
    fn record_enqueued(&self) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reserved(&self) {
        self.total_reserved.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completed(&self) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retried(&self) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> QueueStats {
        QueueStats {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_reserved: self.total_reserved.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            waiting: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ---------- Enqueue Tests ----------

    #[test]
    fn test_enqueue_and_fetch() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .enqueue(json!({"n": 1}), EnqueueOptions::default())
            .unwrap();

        let job = queue.fetch(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_max, 1);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.payload, json!({"n": 1}));
        assert_eq!(queue.waiting_count(), 1);
        assert!(queue.fetch("missing").unwrap().is_none());
    }

    #[test]
    fn test_enqueue_dedup_anchor() {
        let queue = InMemoryJobQueue::new();
        let options = EnqueueOptions::new().with_job_id("anchor-1");
        let a = queue.enqueue(json!({"v": 1}), options.clone()).unwrap();
        let b = queue.enqueue(json!({"v": 2}), options).unwrap();

        assert_eq!(a, b);
        assert_eq!(queue.job_count(), 1);
        // The first payload wins.
        let job = queue.fetch(&a).unwrap().unwrap();
        assert_eq!(job.payload, json!({"v": 1}));
    }

    // ---------- Reservation Tests ----------

    #[test]
    fn test_reserve_fifo_and_visibility() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(json!(1), EnqueueOptions::default()).unwrap();
        let second = queue.enqueue(json!(2), EnqueueOptions::default()).unwrap();

        let job = queue.reserve_next().unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(job.processed_on.is_some());

        // The reserved job is invisible; the next reservation is the second.
        let job = queue.reserve_next().unwrap().unwrap();
        assert_eq!(job.id, second);
        assert!(queue.reserve_next().unwrap().is_none());
    }

    // ---------- Completion & Failure Tests ----------

    #[test]
    fn test_complete() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        let job = queue.reserve_next().unwrap().unwrap();
        queue.complete(&job.id, json!({"ok": true})).unwrap();

        let job = queue.fetch(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finished_on.is_some());
        assert_eq!(job.return_value, Some(json!({"ok": true})));
    }

    #[test]
    fn test_complete_requires_active() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        let result = queue.complete(&id, json!(null));
        assert!(matches!(result, Err(QueueError::InvalidState { .. })));
    }

    #[test]
    fn test_fail_exhausts_single_attempt() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        let job = queue.reserve_next().unwrap().unwrap();
        queue.fail(&job.id, "boom").unwrap();

        let job = queue.fetch(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert!(queue.reserve_next().unwrap().is_none());
    }

    #[test]
    fn test_fail_requeues_while_budget_lasts() {
        let queue = InMemoryJobQueue::new();
        let id = queue
            .enqueue(json!(null), EnqueueOptions::new().with_attempts(2))
            .unwrap();

        let job = queue.reserve_next().unwrap().unwrap();
        queue.fail(&job.id, "first").unwrap();
        assert_eq!(queue.fetch(&id).unwrap().unwrap().state, JobState::Waiting);

        let job = queue.reserve_next().unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
        queue.fail(&job.id, "second").unwrap();
        assert_eq!(queue.fetch(&id).unwrap().unwrap().state, JobState::Failed);
    }

    // ---------- Payload & Progress Tests ----------

    #[test]
    fn test_update_payload_in_place() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(json!({"v": 1}), EnqueueOptions::default()).unwrap();
        queue.update_payload(&id, json!({"v": 2})).unwrap();
        assert_eq!(queue.fetch(&id).unwrap().unwrap().payload, json!({"v": 2}));

        let result = queue.update_payload("missing", json!(null));
        assert!(matches!(result, Err(QueueError::JobNotFound(_))));
    }

    #[test]
    fn test_progress_clamped() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        queue.update_progress(&id, 250).unwrap();
        assert_eq!(queue.fetch(&id).unwrap().unwrap().progress, 100);
    }

    // ---------- Event Hook Tests ----------

    #[test]
    fn test_event_hooks() {
        let queue = InMemoryJobQueue::new();
        let completed = Arc::new(RwLock::new(Vec::new()));
        let failed = Arc::new(RwLock::new(Vec::new()));

        let sink = completed.clone();
        queue.on_completed(Arc::new(move |job| sink.write().push(job.id.clone())));
        let sink = failed.clone();
        queue.on_failed(Arc::new(move |job| sink.write().push(job.id.clone())));

        let a = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        let b = queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();

        let job = queue.reserve_next().unwrap().unwrap();
        queue.complete(&job.id, json!(null)).unwrap();
        let job = queue.reserve_next().unwrap().unwrap();
        queue.fail(&job.id, "nope").unwrap();

        assert_eq!(completed.read().clone(), vec![a]);
        assert_eq!(failed.read().clone(), vec![b]);
    }

    // ---------- Stats Tests ----------

    #[test]
    fn test_queue_stats() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();
        queue.enqueue(json!(null), EnqueueOptions::default()).unwrap();

        let job = queue.reserve_next().unwrap().unwrap();
        queue.complete(&job.id, json!(null)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.total_reserved, 1);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_failed, 0);
        assert_eq!(stats.waiting, 1);
    }
}
