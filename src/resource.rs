//! Resource identifiers and lock-key derivation.
//!
//! A saga declares the set of logical resources it touches; each identifier
//! maps to exactly one lock key of the form `tx_lock:<type>_<id>` or
//! `tx_lock:<type>_<id>_<action>`.

use serde::{Deserialize, Serialize};

/// Prefix shared by every resource lock key.
pub const LOCK_KEY_PREFIX: &str = "tx_lock:";

/// A resource id, either numeric or opaque string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    /// Numeric id (e.g. a primary key).
    Int(i64),
    /// Opaque string id.
    Str(String),
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Int(i) => write!(f, "{}", i),
            ResourceId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ResourceId {
    fn from(id: i64) -> Self {
        ResourceId::Int(id)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId::Str(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        ResourceId::Str(id)
    }
}

/// Identifies one logical resource a saga operates on.
///
/// Value object; belongs to exactly one saga instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    /// Resource type discriminator (e.g. "user", "order").
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource id within the type.
    pub id: ResourceId,
    /// Optional action discriminator, for finer-grained serialization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ResourceIdentifier {
    /// Create a resource identifier without an action discriminator.
    pub fn new(resource_type: &str, id: impl Into<ResourceId>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.into(),
            action: None,
        }
    }

    /// Create a resource identifier scoped to a specific action.
    pub fn with_action(resource_type: &str, id: impl Into<ResourceId>, action: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.into(),
            action: Some(action.to_string()),
        }
    }

    /// Default resource set for a saga that declared none: the principal.
    pub fn for_user(user_id: i64) -> Vec<ResourceIdentifier> {
        vec![ResourceIdentifier::new("user", user_id)]
    }

    /// Derive the lock key for this resource.
    pub fn lock_key(&self) -> String {
        match &self.action {
            Some(action) => format!(
                "{}{}_{}_{}",
                LOCK_KEY_PREFIX, self.resource_type, self.id, action
            ),
            None => format!("{}{}_{}", LOCK_KEY_PREFIX, self.resource_type, self.id),
        }
    }
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action {
            Some(action) => write!(f, "{}/{}/{}", self.resource_type, self.id, action),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

/// Render a resource set for log and error messages.
pub fn describe_resources(resources: &[ResourceIdentifier]) -> String {
    resources
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Tests
// ============================================================================
