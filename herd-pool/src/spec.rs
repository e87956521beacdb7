//! Pool specification schema.
//!
//! A submitted spec carries free-form `properties`. [`Properties::decode`]
//! tries the typed schema first and keeps the raw document when the shape is
//! unknown, so a commit can report a precise schema error instead of
//! panicking deep inside the loop.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::plugin::InstanceDescription;

/// Tag naming the pool item an instance belongs to.
pub const KEY_TAG: &str = "herd.instance.key";
/// Tag naming the owning pool.
pub const POOL_TAG: &str = "herd.pool";
/// Tag carrying the hash of the resolved spec the instance was built from.
pub const HASH_TAG: &str = "herd.spec.hash";

/// Lower bound on the observe interval.
pub const MIN_OBSERVE_INTERVAL: Duration = Duration::from_millis(10);

/// Errors in a submitted pool spec. All of these fail the commit; nothing
/// is partially applied.
#[derive(Debug, Error)]
pub enum SpecError {
    /// Properties did not match the supported schema.
    #[error("unsupported properties schema: {0}")]
    UnsupportedSchema(String),

    #[error("parallelism must be at least 1")]
    ZeroParallelism,

    #[error("observe interval {got:?} is below the minimum {min:?}")]
    ObserveIntervalTooShort { got: Duration, min: Duration },

    /// Key selector string did not parse.
    #[error("invalid key selector: {0}")]
    KeySelector(String),

    #[error("selector tag names must not be empty")]
    EmptyTagSelector,

    #[error("resource template must be a JSON object")]
    TemplateNotObject,

    #[error("pool name must not be empty")]
    EmptyName,
}

/// A pool spec as submitted to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub metadata: Metadata,
    /// Free-form properties document, decoded via [`Properties::decode`].
    pub properties: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

/// Typed pool properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolProperties {
    /// Desired number of items.
    pub count: usize,

    /// Upper bound on concurrent provision calls, and separately on
    /// concurrent destroy calls.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    pub instance: InstanceAccess,

    /// Template the resolved instance spec is built from.
    #[serde(default = "default_template")]
    pub resource: Value,
}

impl PoolProperties {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.parallelism == 0 {
            return Err(SpecError::ZeroParallelism);
        }
        if !self.resource.is_object() {
            return Err(SpecError::TemplateNotObject);
        }
        self.instance.validate()
    }
}

fn default_parallelism() -> usize {
    1
}

fn default_template() -> Value {
    Value::Object(serde_json::Map::new())
}

/// How a pool finds and keys its instances at the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceAccess {
    /// Tags an instance must carry to be observed by this pool.
    #[serde(default)]
    pub select: BTreeMap<String, String>,

    /// Poll period for `describe_instances`, in milliseconds.
    pub observe_interval_ms: u64,

    #[serde(default)]
    pub key_selector: KeySelector,
}

impl InstanceAccess {
    pub fn observe_interval(&self) -> Duration {
        Duration::from_millis(self.observe_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let got = self.observe_interval();
        if got < MIN_OBSERVE_INTERVAL {
            return Err(SpecError::ObserveIntervalTooShort {
                got,
                min: MIN_OBSERVE_INTERVAL,
            });
        }
        if self.select.keys().any(|tag| tag.is_empty()) {
            return Err(SpecError::EmptyTagSelector);
        }
        Ok(())
    }
}

/// Which part of an instance description identifies the pool item it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySelector {
    /// Value of a tag, written `tag:<name>`.
    Tag(String),
    /// The backend-side logical name, written `logical-id`.
    LogicalId,
    /// The provider-assigned instance id, written `id`.
    ProviderId,
}

impl KeySelector {
    /// Extracts the item key from a description, if present.
    pub fn key_of(&self, description: &InstanceDescription) -> Option<String> {
        match self {
            KeySelector::Tag(tag) => description.tags.get(tag).cloned(),
            KeySelector::LogicalId => description.logical_id.clone(),
            KeySelector::ProviderId => Some(description.id.to_string()),
        }
    }
}

impl Default for KeySelector {
    fn default() -> Self {
        KeySelector::Tag(KEY_TAG.to_string())
    }
}

impl FromStr for KeySelector {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(tag) = s.strip_prefix("tag:") {
            if tag.is_empty() {
                return Err(SpecError::EmptyTagSelector);
            }
            return Ok(KeySelector::Tag(tag.to_string()));
        }
        match s {
            "logical-id" => Ok(KeySelector::LogicalId),
            "id" => Ok(KeySelector::ProviderId),
            other => Err(SpecError::KeySelector(other.to_string())),
        }
    }
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySelector::Tag(tag) => write!(f, "tag:{tag}"),
            KeySelector::LogicalId => f.write_str("logical-id"),
            KeySelector::ProviderId => f.write_str("id"),
        }
    }
}

impl TryFrom<String> for KeySelector {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySelector> for String {
    fn from(value: KeySelector) -> Self {
        value.to_string()
    }
}

/// Decoded pool properties, either typed or kept raw when the schema is
/// not understood.
#[derive(Debug, Clone)]
pub enum Properties {
    Pool(PoolProperties),
    Raw { raw: Value, reason: String },
}

impl Properties {
    pub fn decode(properties: &Value) -> Properties {
        match serde_json::from_value::<PoolProperties>(properties.clone()) {
            Ok(pool) => Properties::Pool(pool),
            Err(e) => {
                debug!(error = %e, "properties did not match the pool schema");
                Properties::Raw {
                    raw: properties.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Returns validated pool properties, or the schema error for a raw
    /// document.
    pub fn into_pool(self) -> Result<PoolProperties, SpecError> {
        match self {
            Properties::Pool(pool) => {
                pool.validate()?;
                Ok(pool)
            }
            Properties::Raw { reason, .. } => Err(SpecError::UnsupportedSchema(reason)),
        }
    }
}
