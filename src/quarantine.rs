//! Dead-letter quarantine.
//!
//! A saga that exhausts its queue-level attempts is parked here with enough
//! context for manual remediation: completed step names, the failing step,
//! the principal, the failure reason and stack, and a retryability
//! classification. Quarantined jobs are never re-enqueued automatically;
//! requeueing a retryable record is an operator action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

use crate::classify::{FailureClassifier, Priority};
use crate::error::SagaError;
use crate::kv::KvStore;

/// Key prefix for quarantine record hashes.
pub const DLQ_KEY_PREFIX: &str = "dlq:";
/// Set of active (unhandled) record ids.
pub const DLQ_ACTIVE_KEY: &str = "dlq:job_ids";
/// Set of active high-priority record ids.
pub const DLQ_HIGH_PRIORITY_KEY: &str = "dlq:high_priority";
/// Set of handled record ids.
pub const DLQ_PROCESSED_KEY: &str = "dlq:processed";

fn record_key(dlq_id: &str) -> String {
    format!("{}{}", DLQ_KEY_PREFIX, dlq_id)
}

// ============================================================================
// Record
// ============================================================================

/// A quarantined saga failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Quarantine id, deterministic per job and attempt so repeated failure
    /// handling cannot produce duplicate entries.
    pub id: String,
    pub original_job_id: String,
    /// The attempt whose failure produced this record.
    pub attempt: u32,
    /// Principal of the quarantined saga.
    pub user_id: i64,
    /// Snapshot of the job payload at failure time.
    pub original_job_data: JsonValue,
    pub failure_reason: String,
    pub failure_stack: String,
    pub failed_at: DateTime<Utc>,
    /// Names of steps that had completed before the failure.
    pub completed_steps: Vec<String>,
    /// The step that failed, when the failure happened inside a step.
    pub failed_step: Option<String>,
    /// Assigned by classification at add time.
    pub priority: Priority,
    /// Assigned by classification at add time.
    pub can_retry: bool,
    /// Opaque business metadata for the operator.
    pub business_context: JsonValue,
    /// Stamped by `mark_handled`.
    pub processed_at: Option<DateTime<Utc>>,
    pub processor_note: Option<String>,
}

impl QuarantineRecord {
    /// Create a record for one failed attempt. Classification fields are
    /// filled in by [`QuarantineStore::add`].
    pub fn new(original_job_id: &str, attempt: u32, failure_reason: &str) -> Self {
        Self {
            id: format!("{}:{}", original_job_id, attempt),
            original_job_id: original_job_id.to_string(),
            attempt,
            user_id: 0,
            original_job_data: JsonValue::Null,
            failure_reason: failure_reason.to_string(),
            failure_stack: String::new(),
            failed_at: Utc::now(),
            completed_steps: Vec::new(),
            failed_step: None,
            priority: Priority::Normal,
            can_retry: false,
            business_context: JsonValue::Null,
            processed_at: None,
            processor_note: None,
        }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_job_data(mut self, data: JsonValue) -> Self {
        self.original_job_data = data;
        self
    }

    pub fn with_failure_stack(mut self, stack: &str) -> Self {
        self.failure_stack = stack.to_string();
        self
    }

    pub fn with_completed_steps(mut self, steps: Vec<String>) -> Self {
        self.completed_steps = steps;
        self
    }

    pub fn with_failed_step(mut self, step: &str) -> Self {
        self.failed_step = Some(step.to_string());
        self
    }

    pub fn with_business_context(mut self, context: JsonValue) -> Self {
        self.business_context = context;
        self
    }
}

// ============================================================================
// Store
// ============================================================================

/// Persists quarantined failures and the operator workflow around them.
pub struct QuarantineStore {
    kv: Arc<dyn KvStore>,
    classifier: FailureClassifier,
}

impl QuarantineStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            classifier: FailureClassifier::for_quarantine(),
        }
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Persist a record, classifying its failure reason.
    ///
    /// Idempotent per (job, attempt): adding an id that already exists
    /// returns it without rewriting, so repeated failure-event handling
    /// cannot duplicate entries.
    pub fn add(&self, mut record: QuarantineRecord) -> Result<String, SagaError> {
        let key = record_key(&record.id);
        if self.kv.exists(&key)? {
            tracing::debug!(dlq_id = %record.id, "quarantine record already exists");
            return Ok(record.id);
        }

        let classification = self.classifier.classify(&record.failure_reason);
        record.priority = classification.priority();
        record.can_retry = classification.retryable;

        self.kv.hset_all(&key, &record_to_hash(&record)?)?;
        self.kv.sadd(DLQ_ACTIVE_KEY, &record.id)?;
        if record.priority == Priority::High {
            self.kv.sadd(DLQ_HIGH_PRIORITY_KEY, &record.id)?;
        }

        tracing::info!(
            dlq_id = %record.id,
            job_id = %record.original_job_id,
            priority = %record.priority,
            can_retry = record.can_retry,
            "saga quarantined"
        );
        Ok(record.id)
    }

    /// Load one record by id.
    pub fn get(&self, dlq_id: &str) -> Result<Option<QuarantineRecord>, SagaError> {
        let fields = self.kv.hgetall(&record_key(dlq_id))?;
        Ok(record_from_hash(dlq_id, &fields))
    }

    /// Active high-priority records, oldest failure first.
    pub fn get_high_priority(&self) -> Result<Vec<QuarantineRecord>, SagaError> {
        self.load_set(DLQ_HIGH_PRIORITY_KEY)
    }

    /// Every active record, oldest failure first.
    pub fn get_all_active(&self) -> Result<Vec<QuarantineRecord>, SagaError> {
        self.load_set(DLQ_ACTIVE_KEY)
    }

    /// Active records an operator may requeue.
    pub fn get_retryable(&self) -> Result<Vec<QuarantineRecord>, SagaError> {
        let mut records = self.get_all_active()?;
        records.retain(|r| r.can_retry);
        Ok(records)
    }

    /// Move a record from the active indices to the handled set, stamping
    /// when and why.
    pub fn mark_handled(&self, dlq_id: &str, note: &str) -> Result<(), SagaError> {
        let key = record_key(dlq_id);
        if !self.kv.exists(&key)? {
            return Err(SagaError::QuarantineWrite(format!(
                "quarantine record not found: {}",
                dlq_id
            )));
        }

        self.kv.hset(&key, "processed_at", &Utc::now().to_rfc3339())?;
        self.kv.hset(&key, "processor_note", note)?;
        self.kv.srem(DLQ_ACTIVE_KEY, dlq_id)?;
        self.kv.srem(DLQ_HIGH_PRIORITY_KEY, dlq_id)?;
        self.kv.sadd(DLQ_PROCESSED_KEY, dlq_id)?;

        tracing::info!(dlq_id, note, "quarantine record handled");
        Ok(())
    }

    /// Quarantine statistics.
    pub fn stats(&self) -> Result<QuarantineStats, SagaError> {
        let active = self.get_all_active()?;
        Ok(QuarantineStats {
            total_active: active.len(),
            high_priority: self.kv.smembers(DLQ_HIGH_PRIORITY_KEY)?.len(),
            total_processed: self.kv.smembers(DLQ_PROCESSED_KEY)?.len(),
            oldest_failure: active.first().map(|r| r.failed_at),
        })
    }

    fn load_set(&self, set_key: &str) -> Result<Vec<QuarantineRecord>, SagaError> {
        let mut records = Vec::new();
        for dlq_id in self.kv.smembers(set_key)? {
            if let Some(record) = self.get(&dlq_id)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.failed_at);
        Ok(records)
    }
}

// ============================================================================
// Hash Mapping
// ============================================================================

fn record_to_hash(record: &QuarantineRecord) -> Result<HashMap<String, String>, SagaError> {
    let mut fields = HashMap::new();
    fields.insert("original_job_id".to_string(), record.original_job_id.clone());
    fields.insert("attempt".to_string(), record.attempt.to_string());
    fields.insert("user_id".to_string(), record.user_id.to_string());
    fields.insert(
        "original_job_data".to_string(),
        serde_json::to_string(&record.original_job_data)?,
    );
    fields.insert("failure_reason".to_string(), record.failure_reason.clone());
    fields.insert("failure_stack".to_string(), record.failure_stack.clone());
    fields.insert("failed_at".to_string(), record.failed_at.to_rfc3339());
    fields.insert(
        "completed_steps".to_string(),
        serde_json::to_string(&record.completed_steps)?,
    );
    if let Some(step) = &record.failed_step {
        fields.insert("failed_step".to_string(), step.clone());
    }
    fields.insert("priority".to_string(), record.priority.to_string());
    fields.insert("can_retry".to_string(), record.can_retry.to_string());
    fields.insert(
        "business_context".to_string(),
        serde_json::to_string(&record.business_context)?,
    );
    Ok(fields)
}

fn record_from_hash(
    dlq_id: &str,
    fields: &HashMap<String, String>,
) -> Option<QuarantineRecord> {
    if fields.is_empty() {
        return None;
    }

    let parse_time = |field: &str| {
        fields
            .get(field)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    Some(QuarantineRecord {
        id: dlq_id.to_string(),
        original_job_id: fields.get("original_job_id")?.clone(),
        attempt: fields.get("attempt").and_then(|v| v.parse().ok()).unwrap_or(1),
        user_id: fields.get("user_id").and_then(|v| v.parse().ok()).unwrap_or(0),
        original_job_data: fields
            .get("original_job_data")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(JsonValue::Null),
        failure_reason: fields.get("failure_reason").cloned().unwrap_or_default(),
        failure_stack: fields.get("failure_stack").cloned().unwrap_or_default(),
        failed_at: parse_time("failed_at").unwrap_or_else(Utc::now),
        completed_steps: fields
            .get("completed_steps")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        failed_step: fields.get("failed_step").cloned(),
        priority: fields
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(Priority::Normal),
        can_retry: fields.get("can_retry").map(|v| v == "true").unwrap_or(false),
        business_context: fields
            .get("business_context")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(JsonValue::Null),
        processed_at: parse_time("processed_at"),
        processor_note: fields.get("processor_note").cloned(),
    })
}

// ============================================================================
// Statistics
// ============================================================================

/// Quarantine statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuarantineStats {
    /// Unhandled records.
    pub total_active: usize,
    /// Unhandled high-priority records.
    pub high_priority: usize,
    /// Records an operator has marked handled.
    pub total_processed: usize,
    /// Failure time of the oldest unhandled record.
    pub oldest_failure: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
