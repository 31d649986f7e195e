//! Distributed resource locks.
//!
//! At most one saga may be in progress for any resource set. Acquisition is
//! per-key set-if-absent with TTL in the caller's input order; release is an
//! atomic owner-verified multi-key delete, so no caller can erase another
//! caller's lock even when they share a key.
//!
//! Acquisition is not atomic across the set, so two callers racing for
//! overlapping sets may both fail (each sees a partial conflict and rolls
//! back). Accepted: progress comes from the queue's retry layer, and
//! correctness is preserved.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SagaConfig;
use crate::kv::{KvError, KvStore};
use crate::resource::{describe_resources, ResourceIdentifier};

/// Acquires and releases named resource locks with TTL.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, config: &SagaConfig) -> Self {
        Self {
            kv,
            default_ttl: config.lock_ttl,
        }
    }

    /// TTL applied when the caller does not pass one explicitly.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Try to acquire every lock in the resource set for `job_id`.
    ///
    /// Keys are taken in input order. On the first conflict, every key
    /// acquired by this call is released (owner-verified) and the call
    /// returns false. On a store error the same rollback runs and the error
    /// propagates.
    pub fn acquire(
        &self,
        resources: &[ResourceIdentifier],
        job_id: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut acquired: Vec<String> = Vec::with_capacity(resources.len());

        for resource in resources {
            let key = resource.lock_key();
            match self.kv.set_if_absent(&key, job_id, Some(ttl)) {
                Ok(true) => acquired.push(key),
                Ok(false) => {
                    tracing::debug!(
                        job_id,
                        key = %key,
                        "lock conflict, rolling back partial acquisition"
                    );
                    self.rollback(&acquired, job_id);
                    return Ok(false);
                }
                Err(err) => {
                    self.rollback(&acquired, job_id);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            job_id,
            resources = %describe_resources(resources),
            "locks acquired"
        );
        Ok(true)
    }

    /// Acquire with the configured default TTL.
    pub fn acquire_default(
        &self,
        resources: &[ResourceIdentifier],
        job_id: &str,
    ) -> Result<bool, KvError> {
        self.acquire(resources, job_id, self.default_ttl)
    }

    /// Release every lock in the resource set held by `job_id`.
    ///
    /// Runs as one atomic compare-value-then-delete over all keys. Keys held
    /// by a different owner (or already expired) are left alone and logged;
    /// mismatches never fail the call. Returns the number of keys deleted.
    pub fn release(
        &self,
        resources: &[ResourceIdentifier],
        job_id: &str,
    ) -> Result<usize, KvError> {
        let keys: Vec<String> = resources.iter().map(|r| r.lock_key()).collect();
        let deleted = self.kv.delete_if_equals(&keys, job_id)?;

        if deleted < keys.len() {
            tracing::warn!(
                job_id,
                expected = keys.len(),
                deleted,
                "some locks were not owned by this job at release"
            );
        } else {
            tracing::debug!(job_id, deleted, "locks released");
        }
        Ok(deleted)
    }

    /// Current owner of a resource's lock, if any.
    pub fn holder(&self, resource: &ResourceIdentifier) -> Result<Option<String>, KvError> {
        self.kv.get(&resource.lock_key())
    }

    fn rollback(&self, acquired: &[String], job_id: &str) {
        if acquired.is_empty() {
            return;
        }
        if let Err(err) = self.kv.delete_if_equals(acquired, job_id) {
            tracing::warn!(job_id, error = %err, "failed to roll back partial lock acquisition");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn manager(kv: &Arc<InMemoryKv>) -> LockManager {
        let store: Arc<dyn KvStore> = kv.clone();
        LockManager::new(store, &SagaConfig::default())
    }

    #[test]
    fn test_acquire_and_release() {
        let kv = Arc::new(InMemoryKv::new());
        let locks = manager(&kv);
        let resources = vec![
            ResourceIdentifier::new("user", 1),
            ResourceIdentifier::new("order", 9),
        ];

        assert!(locks.acquire_default(&resources, "job-a").unwrap());
        assert_eq!(
            locks.holder(&resources[0]).unwrap(),
            Some("job-a".to_string())
        );

        let released = locks.release(&resources, "job-a").unwrap();
        assert_eq!(released, 2);
        assert_eq!(locks.holder(&resources[0]).unwrap(), None);
    }

    #[test]
    fn test_conflict_rolls_back_partial_acquisition() {
        let kv = Arc::new(InMemoryKv::new());
        let locks = manager(&kv);
        let first = ResourceIdentifier::new("user", 1);
        let second = ResourceIdentifier::new("user", 2);

        // job-a holds the second key only.
        assert!(locks
            .acquire_default(std::slice::from_ref(&second), "job-a")
            .unwrap());

        // job-b wants both; it must fail and leave the first key free.
        let both = vec![first.clone(), second.clone()];
        assert!(!locks.acquire_default(&both, "job-b").unwrap());
        assert_eq!(locks.holder(&first).unwrap(), None);
        assert_eq!(locks.holder(&second).unwrap(), Some("job-a".to_string()));
    }

    #[test]
    fn test_release_is_owner_verified() {
        let kv = Arc::new(InMemoryKv::new());
        let locks = manager(&kv);
        let resources = vec![ResourceIdentifier::new("user", 42)];

        assert!(locks.acquire_default(&resources, "job-y").unwrap());

        // A different job releasing deletes nothing.
        let released = locks.release(&resources, "job-x").unwrap();
        assert_eq!(released, 0);
        assert_eq!(
            locks.holder(&resources[0]).unwrap(),
            Some("job-y".to_string())
        );

        // The owner's release still succeeds afterwards.
        let released = locks.release(&resources, "job-y").unwrap();
        assert_eq!(released, 1);
    }

    #[test]
    fn test_reacquire_after_ttl_expiry() {
        let kv = Arc::new(InMemoryKv::new());
        let locks = manager(&kv);
        let resources = vec![ResourceIdentifier::new("user", 5)];

        assert!(locks
            .acquire(&resources, "job-a", Duration::from_millis(10))
            .unwrap());
        std::thread::sleep(Duration::from_millis(25));

        // The expired lock no longer blocks, and the stale owner's release
        // deletes zero keys.
        assert!(locks.acquire_default(&resources, "job-b").unwrap());
        assert_eq!(locks.release(&resources, "job-a").unwrap(), 0);
        assert_eq!(
            locks.holder(&resources[0]).unwrap(),
            Some("job-b".to_string())
        );
    }

    #[test]
    fn test_acquire_same_key_twice_fails() {
        let kv = Arc::new(InMemoryKv::new());
        let locks = manager(&kv);
        let resources = vec![ResourceIdentifier::new("user", 1)];

        assert!(locks.acquire_default(&resources, "job-a").unwrap());
        assert!(!locks.acquire_default(&resources, "job-b").unwrap());
        // The original owner is intact.
        assert_eq!(
            locks.holder(&resources[0]).unwrap(),
            Some("job-a".to_string())
        );
    }
}
