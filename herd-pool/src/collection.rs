//! Item bookkeeping for one pool.
//!
//! The collection owns the key to machine mapping and keeps it bijective:
//! every item has exactly one machine and every machine belongs to exactly
//! one item. Lifecycle state itself lives in the model, not here.

use std::collections::HashMap;

use herd_fsm::FsmId;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::plugin::{InstanceDescription, InstanceId};

/// Data key holding the latest observed instance description.
pub const DATA_INSTANCE: &str = "instance";
/// Data key holding the provider id returned by a provision call.
pub const DATA_INSTANCE_ID: &str = "instance_id";
/// Data key holding the fingerprint of the latest observation.
pub const DATA_FINGERPRINT: &str = "fingerprint";

#[derive(Debug, Error)]
pub enum CollectionError {
    /// The key is still bound to a live item. Items leave the collection
    /// only through cleanup, so a duplicate put is always a caller bug.
    #[error("key already exists: {0}")]
    KeyExists(String),
}

/// One managed item.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: String,
    pub fsm: FsmId,
    /// Unresolved spec template this item provisions from.
    pub spec: Value,
    /// Loose per-item state written by the reconciliation loop.
    pub data: Map<String, Value>,
    pub ordinal: usize,
}

impl Item {
    /// Latest observed description, when the item has been seen.
    pub fn instance(&self) -> Option<InstanceDescription> {
        let value = self.data.get(DATA_INSTANCE)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Provider id of the item's instance. Prefers the id returned by the
    /// provision call, falling back to the observed description.
    pub fn instance_id(&self) -> Option<InstanceId> {
        if let Some(id) = self.data.get(DATA_INSTANCE_ID).and_then(Value::as_str) {
            return Some(InstanceId::from(id));
        }
        self.instance().map(|description| description.id)
    }
}

/// Items of one pool, addressable by key and by machine id.
pub struct Collection {
    pool: String,
    items: HashMap<String, Item>,
    by_fsm: HashMap<FsmId, String>,
    next_ordinal: usize,
}

impl Collection {
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            items: HashMap::new(),
            by_fsm: HashMap::new(),
            next_ordinal: 0,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Inserts a new item. `ordinal` is allocated when not given; an
    /// explicit ordinal bumps the allocator past it.
    pub fn put(
        &mut self,
        key: &str,
        fsm: FsmId,
        spec: Value,
        ordinal: Option<usize>,
    ) -> Result<&mut Item, CollectionError> {
        if self.items.contains_key(key) {
            return Err(CollectionError::KeyExists(key.to_string()));
        }
        let ordinal = match ordinal {
            Some(ordinal) => {
                self.next_ordinal = self.next_ordinal.max(ordinal + 1);
                ordinal
            }
            None => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                ordinal
            }
        };
        self.by_fsm.insert(fsm, key.to_string());
        let item = Item {
            key: key.to_string(),
            fsm,
            spec,
            data: Map::new(),
            ordinal,
        };
        Ok(self.items.entry(key.to_string()).or_insert(item))
    }

    pub fn get(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Item> {
        self.items.get_mut(key)
    }

    pub fn get_by_fsm(&self, fsm: FsmId) -> Option<&Item> {
        self.items.get(self.by_fsm.get(&fsm)?)
    }

    pub fn get_by_fsm_mut(&mut self, fsm: FsmId) -> Option<&mut Item> {
        self.items.get_mut(self.by_fsm.get(&fsm)?)
    }

    /// Removes an item. Callers remove only after the item reached its
    /// terminal state.
    pub fn delete(&mut self, key: &str) -> Option<Item> {
        let item = self.items.remove(key)?;
        self.by_fsm.remove(&item.fsm);
        Some(item)
    }

    pub fn visit<F: FnMut(&Item)>(&self, mut f: F) {
        for item in self.items.values() {
            f(item);
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
