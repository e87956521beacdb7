//! herd-sim - In-memory backend for pool testing.
//!
//! [`SimBackend`] keeps instances in a map and supports scripted failures,
//! panics and connect refusals, so the reconciliation behavior of a pool can
//! be exercised end to end without any real provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use herd_pool::plugin::{
    BackendConnector, InstanceBackend, InstanceDescription, InstanceId, PluginError, Result,
    TerminateContext,
};
use herd_pool::spec::InstanceAccess;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Decrements a scripted counter, returning whether a charge was taken.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Simulated provisioning backend.
pub struct SimBackend {
    instances: RwLock<HashMap<InstanceId, InstanceDescription>>,
    latency: Duration,
    fail_provisions: AtomicUsize,
    fail_destroys: AtomicUsize,
    panic_provisions: AtomicUsize,
    provision_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    retire_destroys: AtomicUsize,
    rolling_destroys: AtomicUsize,
    inflight_provisions: AtomicUsize,
    max_inflight_provisions: AtomicUsize,
    inflight_destroys: AtomicUsize,
    max_inflight_destroys: AtomicUsize,
}

impl SimBackend {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    /// Backend whose provision and destroy calls take `latency` to complete.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            latency,
            fail_provisions: AtomicUsize::new(0),
            fail_destroys: AtomicUsize::new(0),
            panic_provisions: AtomicUsize::new(0),
            provision_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            retire_destroys: AtomicUsize::new(0),
            rolling_destroys: AtomicUsize::new(0),
            inflight_provisions: AtomicUsize::new(0),
            max_inflight_provisions: AtomicUsize::new(0),
            inflight_destroys: AtomicUsize::new(0),
            max_inflight_destroys: AtomicUsize::new(0),
        })
    }

    /// Fails the next `n` provision calls.
    pub fn fail_next_provisions(&self, n: usize) {
        self.fail_provisions.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` destroy calls.
    pub fn fail_next_destroys(&self, n: usize) {
        self.fail_destroys.store(n, Ordering::SeqCst);
    }

    /// Panics inside the next `n` provision calls.
    pub fn panic_next_provisions(&self, n: usize) {
        self.panic_provisions.store(n, Ordering::SeqCst);
    }

    /// Inserts an instance as if it existed at the provider already.
    pub async fn plant(&self, description: InstanceDescription) {
        self.instances
            .write()
            .await
            .insert(description.id.clone(), description);
    }

    /// Drops an instance behind the pool's back.
    pub async fn remove_instance(&self, id: &InstanceId) -> Option<InstanceDescription> {
        self.instances.write().await.remove(id)
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<InstanceDescription> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn instances(&self) -> Vec<InstanceDescription> {
        let mut instances: Vec<InstanceDescription> =
            self.instances.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        instances
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Destroy calls tagged as retirements.
    pub fn retire_destroys(&self) -> usize {
        self.retire_destroys.load(Ordering::SeqCst)
    }

    /// Destroy calls tagged as rolling replacements.
    pub fn rolling_destroys(&self) -> usize {
        self.rolling_destroys.load(Ordering::SeqCst)
    }

    /// Highest number of provision calls that were in flight at once.
    pub fn max_inflight_provisions(&self) -> usize {
        self.max_inflight_provisions.load(Ordering::SeqCst)
    }

    /// Highest number of destroy calls that were in flight at once.
    pub fn max_inflight_destroys(&self) -> usize {
        self.max_inflight_destroys.load(Ordering::SeqCst)
    }

    fn spec_tags(spec: &Value) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(map) = spec.get("tags").and_then(Value::as_object) {
            for (tag, value) in map {
                if let Some(value) = value.as_str() {
                    tags.insert(tag.clone(), value.to_string());
                }
            }
        }
        tags
    }
}

#[async_trait]
impl InstanceBackend for SimBackend {
    async fn provision(&self, spec: &Value) -> Result<InstanceId> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.panic_provisions) {
            panic!("injected provision panic");
        }
        if take(&self.fail_provisions) {
            return Err(PluginError::Provision(
                "injected provision failure".to_string(),
            ));
        }
        let inflight = self.inflight_provisions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight_provisions
            .fetch_max(inflight, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let id = InstanceId(format!("sim-{}", Uuid::new_v4()));
        let description = InstanceDescription {
            id: id.clone(),
            logical_id: None,
            tags: Self::spec_tags(spec),
            properties: Some(spec.clone()),
        };
        self.instances.write().await.insert(id.clone(), description);
        self.inflight_provisions.fetch_sub(1, Ordering::SeqCst);
        debug!(instance = %id, "provisioned");
        Ok(id)
    }

    async fn destroy(&self, id: &InstanceId, context: TerminateContext) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let tagged = match context {
            TerminateContext::Retire => &self.retire_destroys,
            TerminateContext::Rolling => &self.rolling_destroys,
        };
        tagged.fetch_add(1, Ordering::SeqCst);
        if take(&self.fail_destroys) {
            return Err(PluginError::Destroy("injected destroy failure".to_string()));
        }
        let inflight = self.inflight_destroys.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight_destroys
            .fetch_max(inflight, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let removed = self.instances.write().await.remove(id);
        self.inflight_destroys.fetch_sub(1, Ordering::SeqCst);
        match removed {
            Some(_) => {
                debug!(instance = %id, "destroyed");
                Ok(())
            }
            None => Err(PluginError::NotFound(id.clone())),
        }
    }

    async fn describe_instances(
        &self,
        select: &BTreeMap<String, String>,
        include_properties: bool,
    ) -> Result<Vec<InstanceDescription>> {
        let mut matched: Vec<InstanceDescription> = self
            .instances
            .read()
            .await
            .values()
            .filter(|description| {
                select
                    .iter()
                    .all(|(tag, value)| description.tags.get(tag) == Some(value))
            })
            .cloned()
            .collect();
        if !include_properties {
            for description in &mut matched {
                description.properties = None;
            }
        }
        matched.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(matched)
    }
}

/// Connector handing out one shared [`SimBackend`], with scripted refusals.
pub struct SimConnector {
    backend: Arc<SimBackend>,
    refuse: AtomicUsize,
}

impl SimConnector {
    pub fn new(backend: Arc<SimBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            refuse: AtomicUsize::new(0),
        })
    }

    /// Refuses the next `n` connect attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendConnector for SimConnector {
    async fn connect(&self, _access: &InstanceAccess) -> Result<Arc<dyn InstanceBackend>> {
        if take(&self.refuse) {
            return Err(PluginError::Unreachable(
                "simulated backend offline".to_string(),
            ));
        }
        Ok(self.backend.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(pool: &str) -> Value {
        json!({"cpu": 1, "tags": {"herd.pool": pool}})
    }

    #[tokio::test]
    async fn test_describe_filters_by_select_tags() {
        let backend = SimBackend::new();
        backend.provision(&spec("web")).await.unwrap();
        backend.provision(&spec("db")).await.unwrap();
        let select = BTreeMap::from([("herd.pool".to_string(), "web".to_string())]);
        let matched = backend.describe_instances(&select, true).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].tags.get("herd.pool"), Some(&"web".to_string()));
    }

    #[tokio::test]
    async fn test_describe_can_strip_properties() {
        let backend = SimBackend::new();
        backend.provision(&spec("web")).await.unwrap();
        let matched = backend
            .describe_instances(&BTreeMap::new(), false)
            .await
            .unwrap();
        assert!(matched[0].properties.is_none());
        let matched = backend
            .describe_instances(&BTreeMap::new(), true)
            .await
            .unwrap();
        assert!(matched[0].properties.is_some());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_one_shot() {
        let backend = SimBackend::new();
        backend.fail_next_provisions(1);
        assert!(backend.provision(&spec("web")).await.is_err());
        assert!(backend.provision(&spec("web")).await.is_ok());
        assert_eq!(backend.provision_calls(), 2);
        assert_eq!(backend.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_destroy_of_unknown_instance_fails() {
        let backend = SimBackend::new();
        let id = backend.provision(&spec("web")).await.unwrap();
        backend.destroy(&id, TerminateContext::Retire).await.unwrap();
        assert!(matches!(
            backend.destroy(&id, TerminateContext::Retire).await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_contexts_are_counted() {
        let backend = SimBackend::new();
        let first = backend.provision(&spec("web")).await.unwrap();
        let second = backend.provision(&spec("web")).await.unwrap();
        backend
            .destroy(&first, TerminateContext::Retire)
            .await
            .unwrap();
        backend
            .destroy(&second, TerminateContext::Rolling)
            .await
            .unwrap();
        assert_eq!(backend.retire_destroys(), 1);
        assert_eq!(backend.rolling_destroys(), 1);
        assert_eq!(backend.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn test_planted_instances_are_described() {
        let backend = SimBackend::new();
        backend
            .plant(InstanceDescription {
                id: InstanceId::from("i-planted"),
                logical_id: None,
                tags: BTreeMap::from([("origin".to_string(), "manual".to_string())]),
                properties: None,
            })
            .await;
        let matched = backend
            .describe_instances(&BTreeMap::new(), true)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, InstanceId::from("i-planted"));
        assert!(
            backend
                .instance(&InstanceId::from("i-planted"))
                .await
                .is_some()
        );
        assert!(
            backend
                .remove_instance(&InstanceId::from("i-planted"))
                .await
                .is_some()
        );
        assert_eq!(backend.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_connector_refusals_are_scripted() {
        let backend = SimBackend::new();
        let connector = SimConnector::new(backend);
        connector.refuse_next(1);
        let access = InstanceAccess {
            select: BTreeMap::new(),
            observe_interval_ms: 100,
            key_selector: Default::default(),
        };
        assert!(connector.connect(&access).await.is_err());
        assert!(connector.connect(&access).await.is_ok());
    }
}
