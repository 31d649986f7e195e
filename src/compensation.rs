//! Compensation engine.
//!
//! Rolls back the success trail of a failed saga by invoking each completed
//! step's compensation in reverse execution order. Every compensation is
//! best-effort: a failure is classified, persisted for operator retry, and
//! never stops compensation of the remaining earlier steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::classify::FailureClassifier;
use crate::config::SagaConfig;
use crate::error::SagaError;
use crate::kv::KvStore;
use crate::registry::{StepHandler, StepRegistry};

/// Key prefix for persisted compensation failures.
pub const FAILURE_KEY_PREFIX: &str = "compensation_failure:";
/// Set of all live compensation-failure keys.
pub const FAILURE_INDEX_KEY: &str = "compensation_failures:index";

/// Build the failure key for one job/step pair.
pub fn failure_key(job_id: &str, step_name: &str) -> String {
    format!("{}{}:{}", FAILURE_KEY_PREFIX, job_id, step_name)
}

// ============================================================================
// Trail & Records
// ============================================================================

/// One completed step of the current run: what to undo and with what input.
#[derive(Clone, Debug)]
pub struct TrailEntry {
    /// Step name.
    pub name: String,
    /// The result the step recorded on completion; input to its compensate.
    pub result: JsonValue,
    /// The resolved handler.
    pub handler: StepHandler,
}

/// A persisted compensation failure awaiting operator retry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensationFailureRecord {
    /// Store key of this record.
    pub key: String,
    pub job_id: String,
    pub step_name: String,
    /// Snapshot of the step result the compensation was invoked with.
    pub step_result: JsonValue,
    pub error_message: String,
    /// Whether a retry has a chance of succeeding.
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

/// Result of compensating one success trail.
#[derive(Clone, Debug, Default)]
pub struct CompensationOutcome {
    /// Steps whose compensation succeeded, in rollback order.
    pub compensated: Vec<String>,
    /// Steps whose compensation failed, with their persisted records.
    pub failures: Vec<CompensationFailureRecord>,
}

// ============================================================================
// Engine
// ============================================================================

/// Invokes compensations in reverse and tracks their failures.
pub struct CompensationEngine {
    kv: Arc<dyn KvStore>,
    registry: Arc<StepRegistry>,
    classifier: FailureClassifier,
    retention: Duration,
}

impl CompensationEngine {
    pub fn new(kv: Arc<dyn KvStore>, registry: Arc<StepRegistry>, config: &SagaConfig) -> Self {
        Self {
            kv,
            registry,
            classifier: FailureClassifier::for_compensation(),
            retention: config.compensation_retention,
        }
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Compensate a success trail.
    ///
    /// `trail` is in execution order; compensations run in reverse. A failed
    /// compensation is recorded and skipped over, so earlier steps still get
    /// their rollback.
    pub fn execute(&self, job_id: &str, trail: &[TrailEntry]) -> CompensationOutcome {
        let mut outcome = CompensationOutcome::default();

        for entry in trail.iter().rev() {
            match entry.handler.compensate(&entry.result) {
                Ok(()) => {
                    tracing::debug!(job_id, step = %entry.name, "step compensated");
                    outcome.compensated.push(entry.name.clone());
                }
                Err(message) => {
                    tracing::error!(
                        job_id,
                        step = %entry.name,
                        error = %message,
                        "compensation failed"
                    );
                    let record = self.record_failure(job_id, entry, &message);
                    outcome.failures.push(record);
                }
            }
        }

        outcome
    }

    /// Re-run a previously failed compensation from its persisted record.
    ///
    /// On success the record is removed from the store and the index.
    pub fn retry_failure(&self, key: &str) -> Result<(), SagaError> {
        let fields = self.kv.hgetall(key)?;
        let record = record_from_hash(key, &fields).ok_or_else(|| SagaError::Compensation {
            step: key.to_string(),
            message: "compensation failure record not found".to_string(),
        })?;

        let handler = self
            .registry
            .get(&record.step_name)
            .ok_or_else(|| SagaError::StepFunctionNotFound(record.step_name.clone()))?;

        handler
            .compensate(&record.step_result)
            .map_err(|message| SagaError::Compensation {
                step: record.step_name.clone(),
                message,
            })?;

        self.kv.delete(key)?;
        self.kv.srem(FAILURE_INDEX_KEY, key)?;
        tracing::info!(job_id = %record.job_id, step = %record.step_name, "compensation retried successfully");
        Ok(())
    }

    /// All live compensation-failure records, oldest first.
    ///
    /// Index entries whose record expired are pruned as they are seen.
    pub fn list_failures(&self) -> Result<Vec<CompensationFailureRecord>, SagaError> {
        let mut records = Vec::new();
        for key in self.kv.smembers(FAILURE_INDEX_KEY)? {
            let fields = self.kv.hgetall(&key)?;
            match record_from_hash(&key, &fields) {
                Some(record) => records.push(record),
                None => {
                    self.kv.srem(FAILURE_INDEX_KEY, &key)?;
                }
            }
        }
        records.sort_by_key(|r| r.failed_at);
        Ok(records)
    }

    fn record_failure(
        &self,
        job_id: &str,
        entry: &TrailEntry,
        message: &str,
    ) -> CompensationFailureRecord {
        let classification = self.classifier.classify(message);
        let record = CompensationFailureRecord {
            key: failure_key(job_id, &entry.name),
            job_id: job_id.to_string(),
            step_name: entry.name.clone(),
            step_result: entry.result.clone(),
            error_message: message.to_string(),
            retryable: classification.retryable,
            failed_at: Utc::now(),
        };

        // Persistence is best-effort: a failure here is logged, the saga
        // outcome is unchanged either way.
        if let Err(err) = self.persist(&record) {
            tracing::error!(
                job_id,
                step = %entry.name,
                error = %err,
                "failed to persist compensation failure record"
            );
        }
        record
    }

    fn persist(&self, record: &CompensationFailureRecord) -> Result<(), SagaError> {
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), record.job_id.clone());
        fields.insert("step_name".to_string(), record.step_name.clone());
        fields.insert(
            "step_result".to_string(),
            serde_json::to_string(&record.step_result)?,
        );
        fields.insert("error_message".to_string(), record.error_message.clone());
        fields.insert("retryable".to_string(), record.retryable.to_string());
        fields.insert("failed_at".to_string(), record.failed_at.to_rfc3339());

        self.kv.hset_all(&record.key, &fields)?;
        self.kv.expire(&record.key, self.retention)?;
        self.kv.sadd(FAILURE_INDEX_KEY, &record.key)?;
        Ok(())
    }
}

fn record_from_hash(
    key: &str,
    fields: &HashMap<String, String>,
) -> Option<CompensationFailureRecord> {
    if fields.is_empty() {
        return None;
    }
    let step_result = fields
        .get("step_result")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(JsonValue::Null);
    let failed_at = fields
        .get("failed_at")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(CompensationFailureRecord {
        key: key.to_string(),
        job_id: fields.get("job_id")?.clone(),
        step_name: fields.get("step_name")?.clone(),
        step_result,
        error_message: fields.get("error_message").cloned().unwrap_or_default(),
        retryable: fields.get("retryable").map(|v| v == "true").unwrap_or(false),
        failed_at,
    })
}

// ============================================================================
// Tests
// ============================================================================
