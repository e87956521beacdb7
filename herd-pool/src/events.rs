//! Pool event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::plugin::{InstanceId, PluginError};

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "provision")]
    Provision,
    #[serde(rename = "error/provision")]
    ProvisionError,
    #[serde(rename = "destroy")]
    Destroy,
    #[serde(rename = "error/destroy")]
    DestroyError,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "ready")]
    Ready,
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::Provision => "provision",
            EventKind::ProvisionError => "error/provision",
            EventKind::Destroy => "destroy",
            EventKind::DestroyError => "error/destroy",
            EventKind::Pending => "pending",
            EventKind::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEvent {
    pub pool: String,
    pub key: String,
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub at: DateTime<Utc>,
}

impl PoolEvent {
    pub fn new(pool: &str, key: &str, kind: EventKind) -> Self {
        Self {
            pool: pool.to_string(),
            key: key.to_string(),
            kind,
            instance: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_error(mut self, error: &PluginError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Fan-out sender shared by all pools of a controller.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emitting without subscribers is fine; the event is dropped.
    pub fn emit(&self, event: PoolEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}
