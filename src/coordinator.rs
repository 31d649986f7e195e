//! Saga coordinator.
//!
//! The client-facing entry point: accepts a saga definition (ordered step
//! names plus the resources they touch), enforces idempotency, enqueues the
//! durable job, and answers status and quarantine queries. Execution itself
//! happens in the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::config::SagaConfig;
use crate::error::SagaError;
use crate::job::SagaJob;
use crate::kv::KvStore;
use crate::quarantine::{QuarantineRecord, QuarantineStats, QuarantineStore};
use crate::queue::{EnqueueOptions, JobQueue, JobState};
use crate::resource::ResourceIdentifier;

/// Key prefix for idempotency bindings.
pub const IDEMPOTENCY_KEY_PREFIX: &str = "idempotent:";

fn idempotency_key(key: &str) -> String {
    format!("{}{}", IDEMPOTENCY_KEY_PREFIX, key)
}

/// Queue-level view of a saga instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub queue_state: JobState,
    pub progress: u8,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Current job payload.
    pub data: JsonValue,
}

/// Accepts sagas and exposes their status.
pub struct SagaCoordinator {
    queue: Arc<dyn JobQueue>,
    kv: Arc<dyn KvStore>,
    quarantine: QuarantineStore,
    config: SagaConfig,
}

impl SagaCoordinator {
    pub fn new(queue: Arc<dyn JobQueue>, kv: Arc<dyn KvStore>, config: SagaConfig) -> Self {
        let quarantine = QuarantineStore::new(kv.clone());
        Self {
            queue,
            kv,
            quarantine,
            config,
        }
    }

    /// Submit a saga for execution and return its job id.
    ///
    /// When `resources` is `None` the saga locks the principal
    /// (`{type: "user", id: user_id}`). When `idempotency_key` is given and
    /// already bound, the bound job id is returned without enqueueing.
    pub fn execute(
        &self,
        user_id: i64,
        step_names: &[&str],
        resources: Option<Vec<ResourceIdentifier>>,
        idempotency_key_value: Option<&str>,
    ) -> Result<String, SagaError> {
        if let Some(key) = idempotency_key_value {
            if let Some(existing) = self.kv.get(&idempotency_key(key))? {
                tracing::debug!(key, job_id = %existing, "idempotency hit, returning bound job");
                return Ok(existing);
            }
        }

        let resources = resources.unwrap_or_else(|| ResourceIdentifier::for_user(user_id));
        let names: Vec<String> = step_names.iter().map(|s| s.to_string()).collect();
        let job = SagaJob::new(
            user_id,
            &names,
            resources,
            idempotency_key_value.map(|s| s.to_string()),
        );

        let payload = serde_json::to_value(&job)?;
        let options = EnqueueOptions::new().with_attempts(self.config.default_attempts);
        let job_id = self.queue.enqueue(payload, options)?;

        if let Some(key) = idempotency_key_value {
            self.kv.set(
                &idempotency_key(key),
                &job_id,
                Some(self.config.idempotency_ttl),
            )?;
        }

        tracing::info!(
            job_id = %job_id,
            user_id,
            steps = names.len(),
            "saga enqueued"
        );
        Ok(job_id)
    }

    /// Queue-level status of a saga instance.
    pub fn status(&self, job_id: &str) -> Result<Option<JobStatus>, SagaError> {
        let Some(job) = self.queue.fetch(job_id)? else {
            return Ok(None);
        };
        Ok(Some(JobStatus {
            id: job.id,
            queue_state: job.state,
            progress: job.progress,
            processed_on: job.processed_on,
            finished_on: job.finished_on,
            failed_reason: job.failed_reason,
            data: job.payload,
        }))
    }

    /// The quarantine store backing this coordinator's queries.
    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    /// Quarantined sagas an operator may requeue.
    pub fn dlq_retryable_jobs(&self) -> Result<Vec<QuarantineRecord>, SagaError> {
        self.quarantine.get_retryable()
    }

    /// Quarantine statistics.
    pub fn quarantine_stats(&self) -> Result<QuarantineStats, SagaError> {
        self.quarantine.stats()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::queue::InMemoryJobQueue;
    use std::time::Duration;

    fn coordinator() -> (Arc<InMemoryJobQueue>, Arc<InMemoryKv>, SagaCoordinator) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let kv = Arc::new(InMemoryKv::new());
        let queue_dyn: Arc<dyn JobQueue> = queue.clone();
        let kv_dyn: Arc<dyn KvStore> = kv.clone();
        let coordinator = SagaCoordinator::new(queue_dyn, kv_dyn, SagaConfig::default());
        (queue, kv, coordinator)
    }

    // ---------- Enqueue Tests ----------

    #[test]
    fn test_execute_enqueues_payload() {
        let (queue, _kv, coordinator) = coordinator();
        let job_id = coordinator
            .execute(42, &["validate", "charge"], None, None)
            .unwrap();

        let job = queue.fetch(&job_id).unwrap().unwrap();
        assert_eq!(job.attempts_max, 1);

        let saga: SagaJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(saga.user_id, 42);
        assert_eq!(saga.steps.len(), 2);
        assert_eq!(saga.steps[0].name, "validate");
        assert_eq!(saga.current_step_index, 0);
        // Resource set defaulted to the principal.
        assert_eq!(saga.resource_identifiers.len(), 1);
        assert_eq!(saga.resource_identifiers[0].lock_key(), "tx_lock:user_42");
    }

    #[test]
    fn test_execute_with_declared_resources_and_attempts() {
        let (queue, _kv, coordinator) = {
            let queue = Arc::new(InMemoryJobQueue::new());
            let kv = Arc::new(InMemoryKv::new());
            let queue_dyn: Arc<dyn JobQueue> = queue.clone();
            let kv_dyn: Arc<dyn KvStore> = kv.clone();
            let config = SagaConfig::default().with_default_attempts(3);
            (queue.clone(), kv, SagaCoordinator::new(queue_dyn, kv_dyn, config))
        };

        let resources = vec![ResourceIdentifier::with_action("order", 9, "refund")];
        let job_id = coordinator
            .execute(1, &["refund"], Some(resources.clone()), None)
            .unwrap();

        let job = queue.fetch(&job_id).unwrap().unwrap();
        assert_eq!(job.attempts_max, 3);
        let saga: SagaJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(saga.resource_identifiers, resources);
    }

    // ---------- Idempotency Tests ----------

    #[test]
    fn test_idempotency_binding() {
        let (queue, kv, coordinator) = coordinator();

        let first = coordinator.execute(1, &["a"], None, Some("K")).unwrap();
        let second = coordinator.execute(1, &["a"], None, Some("K")).unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.job_count(), 1);

        // The binding exists with a bounded TTL.
        assert_eq!(kv.get("idempotent:K").unwrap(), Some(first));
        let ttl = kv.ttl("idempotent:K").unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
    }

    #[test]
    fn test_different_keys_different_jobs() {
        let (queue, _kv, coordinator) = coordinator();
        let a = coordinator.execute(1, &["a"], None, Some("K1")).unwrap();
        let b = coordinator.execute(1, &["a"], None, Some("K2")).unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.job_count(), 2);
    }

    // ---------- Status Tests ----------

    #[test]
    fn test_status_reflects_queue_state() {
        let (queue, _kv, coordinator) = coordinator();
        let job_id = coordinator.execute(1, &["a"], None, None).unwrap();

        let status = coordinator.status(&job_id).unwrap().unwrap();
        assert_eq!(status.queue_state, JobState::Waiting);
        assert_eq!(status.progress, 0);
        assert!(status.failed_reason.is_none());
        assert!(status.data.get("steps").is_some());

        let job = queue.reserve_next().unwrap().unwrap();
        queue.fail(&job.id, "boom").unwrap();

        let status = coordinator.status(&job_id).unwrap().unwrap();
        assert_eq!(status.queue_state, JobState::Failed);
        assert_eq!(status.failed_reason.as_deref(), Some("boom"));

        assert!(coordinator.status("missing").unwrap().is_none());
    }
}
