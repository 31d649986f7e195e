//! Key-value service contract.
//!
//! The orchestrator stores locks, idempotency bindings, quarantine records,
//! and compensation-failure records in a single-instance key-value server
//! exposing atomic commands. This module defines that contract and an
//! in-memory backend for development and testing:
//! - String, hash, and set values with per-key TTL
//! - Atomic set-if-absent (the lock primitive)
//! - Atomic multi-key compare-value-then-delete (the owner-verified release)
//! - Store statistics

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Error Types
// ============================================================================

/// Key-value store error types.
#[derive(Debug, Clone)]
pub enum KvError {
    /// Failed to reach the key-value server.
    Connection(String),
    /// A command failed, e.g. a type mismatch on an existing key.
    Command(String),
    /// Failed to serialize or deserialize a stored value.
    Serialization(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::Connection(msg) => write!(f, "kv connection error: {}", msg),
            KvError::Command(msg) => write!(f, "kv command error: {}", msg),
            KvError::Serialization(msg) => write!(f, "kv serialization error: {}", msg),
        }
    }
}

impl std::error::Error for KvError {}

// ============================================================================
// Store Contract
// ============================================================================

/// Contract over the key-value service.
///
/// `set_if_absent` and `delete_if_equals` must be atomic: the backend is
/// expected to implement them with a native command and a server-side script
/// respectively. Every mutation the orchestrator performs on shared keys goes
/// through these two or through single-key commands.
pub trait KvStore: Send + Sync {
    /// Get a string value.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set a string value with optional TTL.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Atomically set a string value only if the key is absent.
    ///
    /// Returns true if the key was set by this call.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, KvError>;

    /// Delete a key of any type. Returns true if it existed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Check whether a key exists.
    fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Set a TTL on an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Remaining TTL of a key, if one is set.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    /// Set a single hash field.
    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    /// Set every field of a hash in one command.
    fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), KvError>;

    /// Get a single hash field.
    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    /// Get all fields of a hash. Absent keys yield an empty map.
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    /// Add a member to a set. Returns true if it was not already present.
    fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Remove a member from a set. Returns true if it was present.
    fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// All members of a set. Absent keys yield an empty list.
    fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// Atomically delete every key whose current string value equals
    /// `expected`, returning the number of keys deleted.
    ///
    /// Equivalent to the server-side script
    /// `for key in KEYS: if GET(key) == ARGV[1] then DEL(key)`.
    fn delete_if_equals(&self, keys: &[String], expected: &str) -> Result<usize, KvError>;

    /// Store statistics snapshot.
    fn stats(&self) -> KvStats;
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// One stored value.
#[derive(Clone, Debug)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

impl Entry {
    fn type_name(&self) -> &'static str {
        match self {
            Entry::Str(_) => "string",
            Entry::Hash(_) => "hash",
            Entry::Set(_) => "set",
        }
    }
}

/// In-memory key-value backend.
///
/// Single-process stand-in for the external server: TTL-aware, thread-safe,
/// and atomic where the contract requires it (multi-key operations run under
/// one write lock, which is the in-process equivalent of a server-side
/// script).
pub struct InMemoryKv {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    ttls: Arc<RwLock<HashMap<String, Instant>>>,
    metrics: Arc<KvMetrics>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            ttls: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(KvMetrics::default()),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Drop every key. Test-reset surface.
    pub fn clear(&self) {
        self.data.write().clear();
        self.ttls.write().clear();
    }

    fn is_expired(&self, key: &str) -> bool {
        let ttls = self.ttls.read();
        match ttls.get(key) {
            Some(expiry) => Instant::now() > *expiry,
            None => false,
        }
    }

    fn clean_expired(&self, key: &str) {
        if self.is_expired(key) {
            self.data.write().remove(key);
            self.ttls.write().remove(key);
        }
    }

    fn wrong_type(key: &str, entry: &Entry, wanted: &str) -> KvError {
        KvError::Command(format!(
            "key '{}' holds a {} value, expected {}",
            key,
            entry.type_name(),
            wanted
        ))
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.clean_expired(key);
        let data = self.data.read();
        let result = match data.get(key) {
            None => None,
            Some(Entry::Str(s)) => Some(s.clone()),
            Some(other) => return Err(Self::wrong_type(key, other, "string")),
        };
        self.metrics.record_get(result.is_some());
        Ok(result)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.data
            .write()
            .insert(key.to_string(), Entry::Str(value.to_string()));
        let mut ttls = self.ttls.write();
        match ttl {
            Some(ttl) => {
                ttls.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                ttls.remove(key);
            }
        }
        self.metrics.record_set();
        Ok(())
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.clean_expired(key);
        // Hold the data lock across the check and the insert.
        let mut data = self.data.write();
        if data.contains_key(key) {
            self.metrics.record_contention();
            return Ok(false);
        }
        data.insert(key.to_string(), Entry::Str(value.to_string()));
        if let Some(ttl) = ttl {
            self.ttls.write().insert(key.to_string(), Instant::now() + ttl);
        }
        self.metrics.record_set();
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let removed = self.data.write().remove(key).is_some();
        self.ttls.write().remove(key);
        self.metrics.record_delete();
        Ok(removed)
    }

    fn exists(&self, key: &str) -> Result<bool, KvError> {
        self.clean_expired(key);
        Ok(self.data.read().contains_key(key))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        self.clean_expired(key);
        if self.data.read().contains_key(key) {
            self.ttls.write().insert(key.to_string(), Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        self.clean_expired(key);
        let ttls = self.ttls.read();
        Ok(ttls
            .get(key)
            .map(|expiry| expiry.saturating_duration_since(Instant::now())))
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.clean_expired(key);
        let mut data = self.data.write();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                self.metrics.record_set();
                Ok(())
            }
            other => Err(Self::wrong_type(key, other, "hash")),
        }
    }

    fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), KvError> {
        self.clean_expired(key);
        let mut data = self.data.write();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(map) => {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                self.metrics.record_set();
                Ok(())
            }
            other => Err(Self::wrong_type(key, other, "hash")),
        }
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        self.clean_expired(key);
        let data = self.data.read();
        match data.get(key) {
            None => {
                self.metrics.record_get(false);
                Ok(None)
            }
            Some(Entry::Hash(map)) => {
                let result = map.get(field).cloned();
                self.metrics.record_get(result.is_some());
                Ok(result)
            }
            Some(other) => Err(Self::wrong_type(key, other, "hash")),
        }
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        self.clean_expired(key);
        let data = self.data.read();
        match data.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Hash(map)) => {
                self.metrics.record_get(true);
                Ok(map.clone())
            }
            Some(other) => Err(Self::wrong_type(key, other, "hash")),
        }
    }

    fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.clean_expired(key);
        let mut data = self.data.write();
        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()));
        match entry {
            Entry::Set(set) => {
                self.metrics.record_set();
                Ok(set.insert(member.to_string()))
            }
            other => Err(Self::wrong_type(key, other, "set")),
        }
    }

    fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut data = self.data.write();
        match data.get_mut(key) {
            None => Ok(false),
            Some(Entry::Set(set)) => Ok(set.remove(member)),
            Some(other) => Err(Self::wrong_type(key, other, "set")),
        }
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.clean_expired(key);
        let data = self.data.read();
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(Self::wrong_type(key, other, "set")),
        }
    }

    fn delete_if_equals(&self, keys: &[String], expected: &str) -> Result<usize, KvError> {
        // One write lock across the whole loop makes this the in-process
        // equivalent of a server-side script.
        let mut data = self.data.write();
        let mut ttls = self.ttls.write();
        let now = Instant::now();
        let mut deleted = 0;

        for key in keys {
            let expired = ttls.get(key).map(|expiry| now > *expiry).unwrap_or(false);
            if expired {
                data.remove(key);
                ttls.remove(key);
                continue;
            }
            let matches = matches!(data.get(key), Some(Entry::Str(s)) if s == expected);
            if matches {
                data.remove(key);
                ttls.remove(key);
                deleted += 1;
            }
        }
        self.metrics.record_delete();
        Ok(deleted)
    }

    fn stats(&self) -> KvStats {
        self.metrics.get_stats()
    }
}

// ============================================================================
// Statistics & Metrics
// ============================================================================

/// Key-value store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvStats {
    /// Total write commands (set, hset, sadd).
    pub total_writes: u64,
    /// Total read commands that returned a value.
    pub read_hits: u64,
    /// Total read commands that returned nothing.
    pub read_misses: u64,
    /// Total delete commands.
    pub total_deletes: u64,
    /// Set-if-absent calls rejected because the key existed.
    pub lock_contentions: u64,
    /// Read hit ratio.
    pub hit_ratio: f64,
}

/// Internal atomic metrics tracker for the key-value store.
#[derive(Default)]
struct KvMetrics {
    total_writes: AtomicU64,
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    total_deletes: AtomicU64,
    lock_contentions: AtomicU64,
}

impl KvMetrics {
    fn record_set(&self) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_get(&self, hit: bool) {
        if hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_delete(&self) {
        self.total_deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_contention(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> KvStats {
        let hits = self.read_hits.load(Ordering::Relaxed);
        let misses = self.read_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        KvStats {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            read_hits: hits,
            read_misses: misses,
            total_deletes: self.total_deletes.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
