//! Failure classification.
//!
//! The retryable/terminal taxonomy is textually encoded: two ordered
//! substring lists, matched case-insensitively against the error message,
//! with terminal winning when both lists match. The lists are plain data so
//! operators can extend classification without code changes. Messages that
//! match neither list classify as terminal.

use serde::{Deserialize, Serialize};

/// Operator-facing priority of a quarantined failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Retryable failures: surfaced first for operator requeue.
    High,
    /// Terminal failures: need investigation, not a retry.
    Normal,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Outcome of classifying one failure message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    /// Whether a retry has a chance of succeeding.
    pub retryable: bool,
}

impl Classification {
    /// Quarantine priority implied by this classification.
    pub fn priority(&self) -> Priority {
        if self.retryable {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// The two substring lists a classifier matches against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierRules {
    /// Substrings marking a failure retryable.
    pub retryable: Vec<String>,
    /// Substrings marking a failure terminal. Terminal wins on overlap.
    pub terminal: Vec<String>,
}

impl ClassifierRules {
    /// Rules for compensation-action failures: transient infrastructure
    /// errors retry, semantic errors do not.
    pub fn compensation() -> Self {
        Self {
            retryable: vec![
                "connection refused".to_string(),
                "timeout".to_string(),
                "timed out".to_string(),
                "lock wait timeout".to_string(),
                "connection lost".to_string(),
                "service unavailable".to_string(),
                "cache connection".to_string(),
            ],
            terminal: vec![
                "not found".to_string(),
                "invalid".to_string(),
                "permission denied".to_string(),
                "constraint".to_string(),
            ],
        }
    }

    /// Rules for saga-level failures at quarantine time. Unregistered steps
    /// and busy resources retry (deploy skew and lock contention recover on
    /// their own); business rejections do not.
    pub fn quarantine() -> Self {
        Self {
            retryable: vec![
                "connection refused".to_string(),
                "timeout".to_string(),
                "timed out".to_string(),
                "step function not found".to_string(),
                "cache connection".to_string(),
                "service unavailable".to_string(),
                "other transaction".to_string(),
            ],
            terminal: vec![
                "duplicate".to_string(),
                "insufficient".to_string(),
                "already".to_string(),
                "invalid".to_string(),
                "permission denied".to_string(),
            ],
        }
    }

    /// Append a retryable substring.
    pub fn with_retryable(mut self, needle: &str) -> Self {
        self.retryable.push(needle.to_string());
        self
    }

    /// Append a terminal substring.
    pub fn with_terminal(mut self, needle: &str) -> Self {
        self.terminal.push(needle.to_string());
        self
    }
}

/// Substring-based failure classifier.
#[derive(Clone, Debug)]
pub struct FailureClassifier {
    rules: ClassifierRules,
}

impl FailureClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    /// Classifier preset for compensation-action failures.
    pub fn for_compensation() -> Self {
        Self::new(ClassifierRules::compensation())
    }

    /// Classifier preset for saga-level quarantine classification.
    pub fn for_quarantine() -> Self {
        Self::new(ClassifierRules::quarantine())
    }

    /// The active rule tables.
    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Classify a failure message.
    pub fn classify(&self, message: &str) -> Classification {
        let haystack = message.to_lowercase();

        let terminal = self
            .rules
            .terminal
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()));
        if terminal {
            return Classification { retryable: false };
        }

        let retryable = self
            .rules
            .retryable
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()));
        Classification { retryable }
    }
}

// ============================================================================
// Tests
// ============================================================================
