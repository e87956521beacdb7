//! Instance observation.
//!
//! An accessor wraps one backend connection plus the pool's instance access
//! configuration. Its observer polls `describe_instances` and reports two
//! streams of batches: instances that are new or changed since the last
//! poll, and instances that disappeared. Change detection runs on content
//! fingerprints, so a steady backend produces no traffic at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::plugin::{self, InstanceBackend, InstanceDescription, InstanceId, TerminateContext};
use crate::spec::{InstanceAccess, SpecError};

/// Which accessor produced an observation. A pool keeps at most one
/// previous accessor, left over from an instance access cutover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationScope {
    Current,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Found,
    Lost,
}

/// One batch of instance reports.
#[derive(Debug, Clone)]
pub struct Observation {
    pub scope: ObservationScope,
    pub kind: ObservationKind,
    pub instances: Vec<InstanceDescription>,
}

/// One backend connection under one instance access configuration.
pub struct Accessor {
    config: InstanceAccess,
    backend: Arc<dyn InstanceBackend>,
}

impl Accessor {
    pub fn new(config: InstanceAccess, backend: Arc<dyn InstanceBackend>) -> Result<Self, SpecError> {
        config.validate()?;
        Ok(Self { config, backend })
    }

    pub fn select(&self) -> &BTreeMap<String, String> {
        &self.config.select
    }

    pub fn observe_interval(&self) -> Duration {
        self.config.observe_interval()
    }

    /// Item key of an observed instance, per the configured selector.
    pub fn key_of(&self, description: &InstanceDescription) -> Option<String> {
        self.config.key_selector.key_of(description)
    }

    pub async fn provision(&self, spec: &Value) -> plugin::Result<InstanceId> {
        self.backend.provision(spec).await
    }

    pub async fn destroy(&self, id: &InstanceId, context: TerminateContext) -> plugin::Result<()> {
        self.backend.destroy(id, context).await
    }

    /// Starts the poll task. Returns the found and lost batch streams.
    pub fn spawn_observer(
        self: &Arc<Self>,
        buffer: usize,
    ) -> (
        ObserverHandle,
        mpsc::Receiver<Vec<InstanceDescription>>,
        mpsc::Receiver<Vec<InstanceDescription>>,
    ) {
        let (found_tx, found_rx) = mpsc::channel(buffer.max(1));
        let (lost_tx, lost_rx) = mpsc::channel(buffer.max(1));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let accessor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(accessor.observe_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // key -> fingerprint of the last delivered poll
            let mut known: HashMap<String, String> = HashMap::new();
            let mut described: HashMap<String, InstanceDescription> = HashMap::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("observer stopping");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                let listed = match accessor
                    .backend
                    .describe_instances(&accessor.config.select, true)
                    .await
                {
                    Ok(listed) => listed,
                    Err(e) => {
                        warn!(error = %e, "describe failed, retrying next poll");
                        continue;
                    }
                };

                let mut found = Vec::new();
                let mut next_known = HashMap::with_capacity(listed.len());
                let mut next_described = HashMap::with_capacity(listed.len());
                for description in listed {
                    let Some(key) = accessor.key_of(&description) else {
                        warn!(instance = %description.id, "observed instance has no key, ignoring");
                        continue;
                    };
                    let fingerprint = description.fingerprint();
                    if known.get(&key) != Some(&fingerprint) {
                        found.push(description.clone());
                    }
                    next_known.insert(key.clone(), fingerprint);
                    next_described.insert(key, description);
                }
                let lost: Vec<InstanceDescription> = described
                    .iter()
                    .filter(|(key, _)| !next_known.contains_key(*key))
                    .map(|(_, description)| description.clone())
                    .collect();

                let mut delivered = true;
                if !found.is_empty() && found_tx.try_send(found).is_err() {
                    delivered = false;
                }
                if !lost.is_empty() && lost_tx.try_send(lost).is_err() {
                    delivered = false;
                }
                // An undelivered diff is repeated next poll; the loop
                // deduplicates on its own fingerprints.
                if delivered {
                    known = next_known;
                    described = next_described;
                } else {
                    warn!("observation channel full, repeating the diff next poll");
                }
            }
        });
        (
            ObserverHandle {
                shutdown: shutdown_tx,
                task,
            },
            found_rx,
            lost_rx,
        )
    }
}

pub struct ObserverHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "observer task did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginError;
    use crate::spec::KEY_TAG;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct StubBackend {
        instances: Mutex<Vec<InstanceDescription>>,
    }

    impl StubBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                instances: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, instances: Vec<InstanceDescription>) {
            *self.instances.lock().unwrap() = instances;
        }
    }

    #[async_trait]
    impl InstanceBackend for StubBackend {
        async fn provision(&self, _spec: &Value) -> plugin::Result<InstanceId> {
            Err(PluginError::Provision("stub".to_string()))
        }

        async fn destroy(&self, _id: &InstanceId, _context: TerminateContext) -> plugin::Result<()> {
            Ok(())
        }

        async fn describe_instances(
            &self,
            _select: &BTreeMap<String, String>,
            _include_properties: bool,
        ) -> plugin::Result<Vec<InstanceDescription>> {
            Ok(self.instances.lock().unwrap().clone())
        }
    }

    fn config() -> InstanceAccess {
        InstanceAccess {
            select: BTreeMap::new(),
            observe_interval_ms: 10,
            key_selector: Default::default(),
        }
    }

    fn described(key: &str, id: &str) -> InstanceDescription {
        InstanceDescription {
            id: InstanceId::from(id),
            logical_id: None,
            tags: BTreeMap::from([(KEY_TAG.to_string(), key.to_string())]),
            properties: None,
        }
    }

    async fn recv_batch(
        rx: &mut mpsc::Receiver<Vec<InstanceDescription>>,
    ) -> Vec<InstanceDescription> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("batch in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_new_instances_are_reported_once() {
        let backend = StubBackend::new();
        backend.set(vec![described("web_0000", "i-1")]);
        let accessor = Arc::new(Accessor::new(config(), backend.clone()).unwrap());
        let (handle, mut found, _lost) = accessor.spawn_observer(8);
        let batch = recv_batch(&mut found).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, InstanceId::from("i-1"));
        // Unchanged instances stay quiet.
        assert!(timeout(Duration::from_millis(80), found.recv()).await.is_err());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_disappeared_instances_are_reported_lost() {
        let backend = StubBackend::new();
        backend.set(vec![described("web_0000", "i-1")]);
        let accessor = Arc::new(Accessor::new(config(), backend.clone()).unwrap());
        let (handle, mut found, mut lost) = accessor.spawn_observer(8);
        recv_batch(&mut found).await;
        backend.set(Vec::new());
        let batch = recv_batch(&mut lost).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, InstanceId::from("i-1"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_changed_instances_are_reported_again() {
        let backend = StubBackend::new();
        backend.set(vec![described("web_0000", "i-1")]);
        let accessor = Arc::new(Accessor::new(config(), backend.clone()).unwrap());
        let (handle, mut found, _lost) = accessor.spawn_observer(8);
        recv_batch(&mut found).await;
        let mut changed = described("web_0000", "i-1");
        changed.tags.insert("phase".to_string(), "blue".to_string());
        backend.set(vec![changed]);
        let batch = recv_batch(&mut found).await;
        assert_eq!(batch[0].tags.get("phase"), Some(&"blue".to_string()));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_keyless_instances_are_skipped() {
        let backend = StubBackend::new();
        let mut keyless = described("web_0000", "i-1");
        keyless.tags.clear();
        backend.set(vec![keyless, described("web_0001", "i-2")]);
        let accessor = Arc::new(Accessor::new(config(), backend.clone()).unwrap());
        let (handle, mut found, _lost) = accessor.spawn_observer(8);
        let batch = recv_batch(&mut found).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, InstanceId::from("i-2"));
        handle.stop().await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let backend = StubBackend::new();
        let mut config = config();
        config.observe_interval_ms = 1;
        assert!(matches!(
            Accessor::new(config, backend),
            Err(SpecError::ObserveIntervalTooShort { .. })
        ));
    }
}
