//! Saga instance payload.
//!
//! The payload is what the durable queue persists between worker
//! invocations: ordered step states, the resume cursor, and the resource
//! set. Workers mutate it through the queue's payload-update operation only
//! while holding the resource locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::resource::ResourceIdentifier;

// ============================================================================
// Step State
// ============================================================================

/// Status of an individual saga step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not yet started.
    Pending,
    /// Step execution has begun; its side effects may or may not have
    /// happened.
    InProgress,
    /// Step completed successfully and its result is recorded.
    Completed,
    /// Step execution failed.
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one step within a saga instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepState {
    /// Step name, resolved against the registry at execution time.
    pub name: String,
    /// 0-based position in the saga.
    pub index: usize,
    /// Current execution status.
    pub status: StepStatus,
    /// Result payload, written exactly once on transition to completed.
    pub result: Option<JsonValue>,
}

impl StepState {
    /// Create a pending step state.
    pub fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
            status: StepStatus::Pending,
            result: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

// ============================================================================
// Saga Instance
// ============================================================================

/// The durable payload of one saga instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaJob {
    /// Principal the saga runs on behalf of.
    pub user_id: i64,
    /// Ordered step states.
    pub steps: Vec<StepState>,
    /// Index of the next step to execute. Monotonically non-decreasing
    /// across worker observations of the same job.
    pub current_step_index: usize,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Client-supplied idempotency key, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Resources this saga touches. Never empty after resolution; an empty
    /// declared set falls back to the principal.
    pub resource_identifiers: Vec<ResourceIdentifier>,
}

impl SagaJob {
    /// Create a fresh saga payload with every step pending.
    pub fn new(
        user_id: i64,
        step_names: &[String],
        resources: Vec<ResourceIdentifier>,
        idempotency_key: Option<String>,
    ) -> Self {
        let steps = step_names
            .iter()
            .enumerate()
            .map(|(index, name)| StepState::new(name, index))
            .collect();

        Self {
            user_id,
            steps,
            current_step_index: 0,
            created_at: Utc::now(),
            idempotency_key,
            resource_identifiers: resources,
        }
    }

    /// The resource set this saga locks, falling back to the principal when
    /// none was declared.
    pub fn resources(&self) -> Vec<ResourceIdentifier> {
        if self.resource_identifiers.is_empty() {
            ResourceIdentifier::for_user(self.user_id)
        } else {
            self.resource_identifiers.clone()
        }
    }

    /// Names of steps that have reached completed, in execution order.
    pub fn completed_step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.is_completed())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Whether every step has completed.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.is_completed())
    }
}

// ============================================================================
// Worker Report
// ============================================================================

/// Summary returned by a successful worker run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaReport {
    pub success: bool,
    /// Step names executed during this run, in order.
    pub executed_steps: Vec<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Step results keyed by step name, including steps completed in
    /// earlier runs.
    pub results: HashMap<String, JsonValue>,
}

// ============================================================================
// Tests
// ============================================================================
