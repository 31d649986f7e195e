//! Saga-style logical transaction orchestrator.
//!
//! Provides all-or-compensated semantics over a persistence layer without
//! multi-statement transactions:
//! - Ordered steps with execute/compensate pairs, registered by name
//! - Per-resource-set mutual exclusion via TTL'd locks with owner-verified
//!   release
//! - Durable job state with resume-after-crash at the last uncompleted step
//! - Reverse-order compensation with retryability classification
//! - Dead-letter quarantine for failures that exhaust their attempt budget
//!
//! The key-value service and the durable queue are consumed through the
//! [`KvStore`] and [`JobQueue`] contracts; [`InMemoryKv`] and
//! [`InMemoryJobQueue`] back them for development and tests.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sagatx::{
//!     InMemoryJobQueue, InMemoryKv, JobQueue, JobState, KvStore, SagaConfig,
//!     SagaCoordinator, SagaWorker, StepHandler, StepRegistry,
//! };
//!
//! let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
//! let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
//! let registry = Arc::new(StepRegistry::new());
//!
//! registry.register(
//!     StepHandler::new(
//!         "charge",
//!         Arc::new(|ctx| Ok(serde_json::json!({ "charged": ctx.user_id }))),
//!     )
//!     .with_compensation(Arc::new(|_result| Ok(()))),
//! );
//!
//! let config = SagaConfig::from_env();
//! let coordinator = SagaCoordinator::new(queue.clone(), kv.clone(), config.clone());
//! let worker = SagaWorker::new(queue, kv, registry, config);
//!
//! let job_id = coordinator.execute(42, &["charge"], None, None)?;
//! let report = worker.process_next().expect("a job is waiting")?;
//! assert!(report.success);
//!
//! let status = coordinator.status(&job_id)?.expect("job exists");
//! assert_eq!(status.queue_state, JobState::Completed);
//! # Ok::<(), sagatx::SagaError>(())
//! ```

pub mod classify;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod kv;
pub mod lock;
pub mod quarantine;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod worker;

pub use classify::{Classification, ClassifierRules, FailureClassifier, Priority};
pub use compensation::{
    CompensationEngine, CompensationFailureRecord, CompensationOutcome, TrailEntry,
};
pub use config::SagaConfig;
pub use coordinator::{JobStatus, SagaCoordinator};
pub use error::SagaError;
pub use job::{SagaJob, SagaReport, StepState, StepStatus};
pub use kv::{InMemoryKv, KvError, KvStats, KvStore};
pub use lock::LockManager;
pub use quarantine::{QuarantineRecord, QuarantineStats, QuarantineStore};
pub use queue::{
    EnqueueOptions, InMemoryJobQueue, JobCallback, JobQueue, JobState, QueueError, QueueStats,
    QueuedJob,
};
pub use registry::{CompensateFn, ExecuteFn, StepContext, StepHandler, StepRegistry};
pub use resource::{ResourceId, ResourceIdentifier};
pub use worker::{SagaWorker, WorkerStats};
