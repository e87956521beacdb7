//! Exported instance metadata.
//!
//! Each pool publishes the observed description of every live item here.
//! Readers hold a cheap clone of the view; the owning pool exports on found
//! observations and retracts on cleanup or loss.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MetadataView {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MetadataView {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn export(&self, key: &str, value: Value) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    pub(crate) async fn retract(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
