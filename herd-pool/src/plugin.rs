//! Backend plugin interface.
//!
//! A pool talks to whatever actually creates and destroys instances through
//! the [`InstanceBackend`] trait. Connecting to a backend goes through a
//! [`BackendConnector`], so the controller can re-establish access when a
//! pool's instance access configuration changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::spec::InstanceAccess;

/// Errors surfaced by backend plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Backend could not be reached at all.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Provision call failed.
    #[error("provision failed: {0}")]
    Provision(String),

    /// Destroy call failed.
    #[error("destroy failed: {0}")]
    Destroy(String),

    /// Instance listing failed.
    #[error("describe failed: {0}")]
    Describe(String),

    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// A background backend call panicked.
    #[error("backend call panicked: {0}")]
    Panic(String),
}

/// Result type for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Provider-assigned instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        InstanceId(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        InstanceId(value.to_string())
    }
}

/// Why an instance is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateContext {
    /// The instance leaves the pool for good.
    Retire,
    /// The instance is replaced by one built from a newer template.
    Rolling,
}

/// One instance as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: InstanceId,

    /// Backend-side logical name, when the provider distinguishes it from
    /// the instance id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Full provider-specific detail, present when the observer asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl InstanceDescription {
    /// Content hash over everything the pool tracks about the instance.
    /// Two reports with equal fingerprints are the same observation.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0.as_bytes());
        hasher.update([0]);
        if let Some(logical_id) = &self.logical_id {
            hasher.update(logical_id.as_bytes());
        }
        hasher.update([0]);
        for (key, value) in &self.tags {
            hasher.update(key.as_bytes());
            hasher.update([1]);
            hasher.update(value.as_bytes());
            hasher.update([1]);
        }
        hasher.update([0]);
        if let Some(properties) = &self.properties {
            hasher.update(properties.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// The calls a pool issues against its backend.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Creates an instance from a fully resolved spec. Returns the
    /// provider-assigned id once the request is accepted.
    async fn provision(&self, spec: &Value) -> Result<InstanceId>;

    /// Destroys an instance.
    async fn destroy(&self, id: &InstanceId, context: TerminateContext) -> Result<()>;

    /// Lists instances matching every tag in `select`.
    async fn describe_instances(
        &self,
        select: &BTreeMap<String, String>,
        include_properties: bool,
    ) -> Result<Vec<InstanceDescription>>;
}

/// Establishes backend access for a given instance access configuration.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, access: &InstanceAccess) -> Result<Arc<dyn InstanceBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn description() -> InstanceDescription {
        InstanceDescription {
            id: InstanceId::from("i-1234"),
            logical_id: None,
            tags: BTreeMap::from([("app".to_string(), "web".to_string())]),
            properties: Some(json!({"cpu": 2})),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_for_equal_content() {
        assert_eq!(description().fingerprint(), description().fingerprint());
    }

    #[test]
    fn test_fingerprint_reflects_tag_changes() {
        let mut changed = description();
        changed
            .tags
            .insert("app".to_string(), "worker".to_string());
        assert_ne!(description().fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_fingerprint_reflects_property_changes() {
        let mut changed = description();
        changed.properties = Some(json!({"cpu": 4}));
        assert_ne!(description().fingerprint(), changed.fingerprint());
    }
}
