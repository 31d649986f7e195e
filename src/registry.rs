//! Step registry.
//!
//! Behavior lives in the process, not in the queued payload: persisted jobs
//! reference steps by name only, and every worker that might process a job
//! resolves those names against its own registry, populated at startup.
//! Re-registering a name replaces the previous binding (last writer wins).

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to a step's execute action.
#[derive(Clone, Debug)]
pub struct StepContext {
    /// Id of the saga instance being executed.
    pub job_id: String,
    /// Principal the saga runs on behalf of.
    pub user_id: i64,
    /// Name of the executing step.
    pub step_name: String,
    /// 0-based index of the executing step.
    pub step_index: usize,
    /// Results of previously completed steps, keyed by step name.
    pub prior_results: HashMap<String, JsonValue>,
}

/// Execute action: runs the step's side effects and returns its result.
///
/// Execute actions must be idempotent within a single saga; a crashed worker
/// re-runs the step that was in progress.
pub type ExecuteFn = Arc<dyn Fn(&StepContext) -> Result<JsonValue, String> + Send + Sync>;

/// Compensate action: undoes a completed step given its recorded result.
pub type CompensateFn = Arc<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>;

/// An execute/compensate pair addressable by name.
#[derive(Clone)]
pub struct StepHandler {
    /// Unique step name.
    pub name: String,
    execute: ExecuteFn,
    compensate: Option<CompensateFn>,
}

impl StepHandler {
    /// Create a handler without a compensation action.
    pub fn new(name: &str, execute: ExecuteFn) -> Self {
        Self {
            name: name.to_string(),
            execute,
            compensate: None,
        }
    }

    /// Attach a compensation action.
    pub fn with_compensation(mut self, compensate: CompensateFn) -> Self {
        self.compensate = Some(compensate);
        self
    }

    /// Whether this step can be rolled back.
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    /// Run the execute action.
    pub fn execute(&self, context: &StepContext) -> Result<JsonValue, String> {
        (self.execute)(context)
    }

    /// Run the compensation action with the step's recorded result.
    ///
    /// A step without a compensation action compensates as a no-op.
    pub fn compensate(&self, result: &JsonValue) -> Result<(), String> {
        match &self.compensate {
            Some(compensate) => compensate(result),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandler")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .finish()
    }
}

/// Process-wide mapping from step name to its handler.
///
/// Owned explicitly by whoever constructs the worker; tests reset it with
/// [`StepRegistry::clear`].
pub struct StepRegistry {
    handlers: RwLock<HashMap<String, StepHandler>>,
}

impl StepRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any existing binding with the same name.
    pub fn register(&self, handler: StepHandler) {
        self.handlers.write().insert(handler.name.clone(), handler);
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<StepHandler> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether a handler is registered under the given name.
    pub fn has(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered step names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove a binding. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Drop every binding. Test-reset surface.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
