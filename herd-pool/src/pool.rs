//! Pool reconciliation.
//!
//! One worker task per pool owns the collection, the resources table and
//! the lifecycle model, and is their single writer. Everything reaches the
//! worker through channels: model queue deliveries, observation batches,
//! control messages and the outcomes of background backend calls. Backend
//! calls themselves run in spawned tasks bounded by a deadline timer; the
//! timer only stops the wait, never the call, and a late outcome is still
//! applied when it arrives.

use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use herd_fsm::{FsmId, Ticker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accessor::{Accessor, Observation, ObservationKind, ObservationScope, ObserverHandle};
use crate::collection::{Collection, DATA_FINGERPRINT, DATA_INSTANCE, DATA_INSTANCE_ID};
use crate::controller::CommitError;
use crate::events::{EventKind, EventSender, PoolEvent};
use crate::metadata::MetadataView;
use crate::model::{ItemSignal, ItemState, Model, ModelQueues};
use crate::options::Options;
use crate::plugin::{InstanceBackend, InstanceDescription, InstanceId, PluginError, TerminateContext};
use crate::spec::PoolProperties;

const CONTROL_BUFFER: usize = 16;

/// Key of the item seeded at `ordinal`.
pub fn item_key(pool: &str, ordinal: usize) -> String {
    format!("{pool}_{ordinal:04}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub draining: bool,
    pub items: Vec<ItemStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub key: String,
    pub state: ItemState,
    pub ordinal: usize,
    pub instance: Option<InstanceId>,
}

pub(crate) enum Control {
    Update {
        props: PoolProperties,
        backend: Option<Arc<dyn InstanceBackend>>,
    },
    Terminate,
    Describe(oneshot::Sender<PoolStatus>),
}

/// Client side of a running pool worker.
pub(crate) struct PoolHandle {
    name: String,
    control: mpsc::Sender<Control>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
    metadata: MetadataView,
}

impl PoolHandle {
    pub(crate) fn metadata(&self) -> MetadataView {
        self.metadata.clone()
    }

    pub(crate) async fn update(
        &self,
        props: PoolProperties,
        backend: Option<Arc<dyn InstanceBackend>>,
    ) -> Result<(), CommitError> {
        self.control
            .send(Control::Update { props, backend })
            .await
            .map_err(|_| CommitError::PoolStopped(self.name.clone()))
    }

    pub(crate) async fn describe(&self) -> Option<PoolStatus> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::Describe(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Drains every item through destroy and waits for the worker to end.
    pub(crate) async fn terminate(self) {
        let _ = self.control.send(Control::Terminate).await;
        if let Err(e) = self.task.await {
            warn!(pool = %self.name, error = %e, "pool task did not stop cleanly");
        }
    }

    /// Stops the worker in place, leaving backend instances untouched.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            warn!(pool = %self.name, error = %e, "pool task did not stop cleanly");
        }
    }
}

/// Outcome of one background backend call.
enum TaskOutcome {
    Provision {
        key: String,
        result: Result<InstanceId, PluginError>,
    },
    Destroy {
        key: String,
        instance: InstanceId,
        result: Result<(), PluginError>,
    },
}

/// One accessor with its observer and aggregator tasks.
struct AccessorRig {
    accessor: Arc<Accessor>,
    observer: ObserverHandle,
    aggregator: JoinHandle<()>,
}

impl AccessorRig {
    async fn stop(self) {
        self.observer.stop().await;
        // Nobody drains the observation channel while a rig stops, so a
        // forward parked on a full channel would never see its streams
        // close. Cut the task instead of joining it.
        self.aggregator.abort();
        if let Err(e) = self.aggregator.await {
            if !e.is_cancelled() {
                warn!(error = %e, "aggregator task did not stop cleanly");
            }
        }
    }
}

fn start_rig(
    accessor: Arc<Accessor>,
    scope: ObservationScope,
    buffer: usize,
    observations: mpsc::Sender<Observation>,
) -> AccessorRig {
    let (observer, found, lost) = accessor.spawn_observer(buffer);
    let aggregator = spawn_aggregator(scope, found, lost, observations);
    AccessorRig {
        accessor,
        observer,
        aggregator,
    }
}

/// Multiplexes an observer's found and lost streams into scope-tagged
/// observations for the worker.
fn spawn_aggregator(
    scope: ObservationScope,
    mut found: mpsc::Receiver<Vec<InstanceDescription>>,
    mut lost: mpsc::Receiver<Vec<InstanceDescription>>,
    tx: mpsc::Sender<Observation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let observation = tokio::select! {
                batch = found.recv() => match batch {
                    Some(instances) => Observation {
                        scope,
                        kind: ObservationKind::Found,
                        instances,
                    },
                    None => break,
                },
                batch = lost.recv() => match batch {
                    Some(instances) => Observation {
                        scope,
                        kind: ObservationKind::Lost,
                        instances,
                    },
                    None => break,
                },
            };
            if tx.send(observation).await.is_err() {
                break;
            }
        }
    })
}

struct Channels {
    shutdown: mpsc::Receiver<()>,
    control: mpsc::Receiver<Control>,
    queues: ModelQueues,
    observations: mpsc::Receiver<Observation>,
    completions: mpsc::Receiver<TaskOutcome>,
}

/// Builds the worker and starts it.
pub(crate) fn spawn(
    name: &str,
    options: Options,
    props: PoolProperties,
    backend: Arc<dyn InstanceBackend>,
    events: EventSender,
    ticker: Ticker,
) -> Result<PoolHandle, CommitError> {
    let accessor = Arc::new(Accessor::new(props.instance.clone(), backend)?);
    let (model, queues) =
        Model::new(&options.model).map_err(|e| CommitError::Internal(e.to_string()))?;
    let metadata = MetadataView::new();
    let buffer = options.model.channel_buffer_size;
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let (obs_tx, obs_rx) = mpsc::channel(buffer);
    let (completions_tx, completions_rx) = mpsc::channel(buffer);
    let current = start_rig(accessor, ObservationScope::Current, buffer, obs_tx.clone());
    let worker = Worker {
        name: name.to_string(),
        options,
        props,
        model,
        collection: Collection::new(name),
        resources: HashMap::new(),
        current,
        previous: None,
        events,
        metadata: metadata.clone(),
        obs_tx,
        completions_tx,
        draining: false,
    };
    let channels = Channels {
        shutdown: shutdown_rx,
        control: control_rx,
        queues,
        observations: obs_rx,
        completions: completions_rx,
    };
    let task = tokio::spawn(worker.run(ticker, channels));
    Ok(PoolHandle {
        name: name.to_string(),
        control: control_tx,
        shutdown: shutdown_tx,
        task,
        metadata,
    })
}

struct Worker {
    name: String,
    options: Options,
    props: PoolProperties,
    model: Model,
    collection: Collection,
    /// Latest observed description per item key, for dependency resolution.
    resources: HashMap<String, InstanceDescription>,
    current: AccessorRig,
    previous: Option<AccessorRig>,
    events: EventSender,
    metadata: MetadataView,
    obs_tx: mpsc::Sender<Observation>,
    completions_tx: mpsc::Sender<TaskOutcome>,
    draining: bool,
}

impl Worker {
    async fn run(mut self, mut ticker: Ticker, channels: Channels) {
        let Channels {
            mut shutdown,
            mut control,
            queues,
            mut observations,
            mut completions,
        } = channels;
        let ModelQueues {
            mut provision,
            mut destroy,
            mut ready,
            mut pending,
            mut cleanup,
        } = queues;

        self.seed();
        info!(
            pool = %self.name,
            count = self.props.count,
            parallelism = self.props.parallelism,
            "pool reconciliation running"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(pool = %self.name, "pool stopping");
                    break;
                }
                Some(message) = control.recv() => self.handle_control(message).await,
                Some(id) = cleanup.recv() => self.handle_cleanup(id).await,
                Some(id) = ready.recv() => self.handle_ready(id),
                Some(id) = pending.recv() => self.handle_pending(id),
                Some(id) = provision.recv() => self.handle_provision_offer(id),
                Some(id) = destroy.recv() => self.handle_destroy_offer(id),
                Some(observation) = observations.recv() => self.handle_observation(observation).await,
                Some(outcome) = completions.recv() => self.apply_outcome(outcome).await,
                _ = ticker.tick() => {
                    self.model.tick();
                }
            }
            if self.draining && self.collection.is_empty() {
                info!(pool = %self.name, "pool drained");
                break;
            }
        }
        self.teardown().await;
    }

    async fn teardown(self) {
        self.current.stop().await;
        if let Some(previous) = self.previous {
            previous.stop().await;
        }
    }

    fn seed(&mut self) {
        for ordinal in 0..self.props.count {
            self.seed_one(ordinal);
        }
    }

    fn seed_one(&mut self, ordinal: usize) {
        let key = item_key(&self.name, ordinal);
        if self.collection.get(&key).is_some() {
            return;
        }
        let fsm = match self.model.add(ItemState::Requested) {
            Ok(fsm) => fsm,
            Err(e) => {
                error!(pool = %self.name, key = %key, error = %e, "cannot seed item");
                return;
            }
        };
        if let Err(e) = self
            .collection
            .put(&key, fsm, self.props.resource.clone(), Some(ordinal))
        {
            warn!(pool = %self.name, key = %key, error = %e, "seed collided with live item");
            self.model.remove(fsm);
            return;
        }
        debug!(pool = %self.name, key = %key, "seeded item");
    }

    async fn handle_control(&mut self, message: Control) {
        match message {
            Control::Describe(reply) => {
                let _ = reply.send(self.status());
            }
            Control::Terminate => {
                info!(pool = %self.name, "pool terminating");
                self.draining = true;
                let model = &mut self.model;
                self.collection.visit(|item| {
                    model.signal(item.fsm, ItemSignal::Terminate);
                });
            }
            Control::Update { props, backend } => self.apply_update(props, backend).await,
        }
    }

    async fn apply_update(
        &mut self,
        props: PoolProperties,
        backend: Option<Arc<dyn InstanceBackend>>,
    ) {
        info!(
            pool = %self.name,
            count = props.count,
            parallelism = props.parallelism,
            "applying pool spec"
        );
        if let Some(backend) = backend {
            match Accessor::new(props.instance.clone(), backend) {
                Ok(accessor) => {
                    let buffer = self.options.model.channel_buffer_size;
                    let fresh = start_rig(
                        Arc::new(accessor),
                        ObservationScope::Current,
                        buffer,
                        self.obs_tx.clone(),
                    );
                    let old = mem::replace(&mut self.current, fresh);
                    if let Some(stale) = self.previous.take() {
                        stale.stop().await;
                    }
                    // The old accessor keeps observing its instances until
                    // they are destroyed, but only with previous scope.
                    let demoted = start_rig(
                        Arc::clone(&old.accessor),
                        ObservationScope::Previous,
                        buffer,
                        self.obs_tx.clone(),
                    );
                    old.stop().await;
                    self.previous = Some(demoted);
                    info!(pool = %self.name, "instance access cutover, prior accessor demoted");
                }
                Err(e) => {
                    error!(
                        pool = %self.name,
                        error = %e,
                        "rejected instance access config, keeping current accessor"
                    );
                }
            }
        }
        let old_count = self.props.count;
        self.props = props;
        if self.props.count > old_count {
            for ordinal in old_count..self.props.count {
                self.seed_one(ordinal);
            }
        } else if self.props.count < old_count {
            let doomed: Vec<FsmId> = self
                .collection
                .items()
                .filter(|item| item.ordinal >= self.props.count)
                .filter(|item| {
                    !matches!(
                        self.model.state_of(item.fsm),
                        None | Some(ItemState::Unmatched)
                    )
                })
                .map(|item| item.fsm)
                .collect();
            for id in doomed {
                self.model.signal(id, ItemSignal::Terminate);
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let mut items: Vec<ItemStatus> = self
            .collection
            .items()
            .filter_map(|item| {
                let state = self.model.state_of(item.fsm)?;
                Some(ItemStatus {
                    key: item.key.clone(),
                    state,
                    ordinal: item.ordinal,
                    instance: item.instance_id(),
                })
            })
            .collect();
        items.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.key.cmp(&b.key)));
        PoolStatus {
            name: self.name.clone(),
            draining: self.draining,
            items,
        }
    }

    fn handle_provision_offer(&mut self, id: FsmId) {
        if self.model.state_of(id) != Some(ItemState::Requested) {
            return;
        }
        let Some(item) = self.collection.get_by_fsm(id) else {
            return;
        };
        let key = item.key.clone();
        let template = item.spec.clone();
        if self.model.count_in(ItemState::Provisioning) >= self.props.parallelism {
            debug!(pool = %self.name, key = %key, "provision throttled");
            self.model.signal(id, ItemSignal::Throttle);
            return;
        }
        let resolved = match crate::resolver::resolve(&template, &self.resources) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(pool = %self.name, key = %key, error = %e, "dependency not satisfied");
                self.model.signal(id, ItemSignal::DependencyMissing);
                return;
            }
        };
        let spec =
            crate::resolver::finalize(resolved, &self.name, &key, self.current.accessor.select());
        self.model.signal(id, ItemSignal::Admit);
        info!(pool = %self.name, key = %key, "provisioning instance");
        self.dispatch_provision(key, spec);
    }

    fn handle_destroy_offer(&mut self, id: FsmId) {
        if self.model.state_of(id) != Some(ItemState::Destroy) {
            return;
        }
        let Some(item) = self.collection.get_by_fsm(id) else {
            return;
        };
        let key = item.key.clone();
        let instance = item.instance_id();
        // Adopted items carry a null template and always retire.
        let context = if item.spec.is_null() || item.spec == self.props.resource {
            TerminateContext::Retire
        } else {
            TerminateContext::Rolling
        };
        if self.model.count_in(ItemState::Terminating) >= self.props.parallelism {
            debug!(pool = %self.name, key = %key, "destroy throttled");
            self.model.signal(id, ItemSignal::Throttle);
            return;
        }
        self.model.signal(id, ItemSignal::Admit);
        match instance {
            None => {
                debug!(pool = %self.name, key = %key, "nothing provisioned, skipping backend destroy");
                self.model.signal(id, ItemSignal::Destroyed);
            }
            Some(instance) => {
                info!(pool = %self.name, key = %key, instance = %instance, "destroying instance");
                self.dispatch_destroy(key, instance, context);
            }
        }
    }

    fn dispatch_provision(&self, key: String, spec: Value) {
        let accessor = Arc::clone(&self.current.accessor);
        let deadline = self.options.provision_deadline();
        let completions = self.completions_tx.clone();
        let pool = self.name.clone();
        tokio::spawn(async move {
            let call = AssertUnwindSafe(accessor.provision(&spec)).catch_unwind();
            tokio::pin!(call);
            let outcome = match tokio::time::timeout(deadline, &mut call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(pool = %pool, key = %key, "provision deadline elapsed, backend call continues");
                    call.await
                }
            };
            let result = outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload);
                error!(pool = %pool, key = %key, error = %message, "provision call panicked");
                Err(PluginError::Panic(message))
            });
            let _ = completions
                .send(TaskOutcome::Provision { key, result })
                .await;
        });
    }

    fn dispatch_destroy(&self, key: String, instance: InstanceId, context: TerminateContext) {
        let accessor = Arc::clone(&self.current.accessor);
        let deadline = self.options.destroy_deadline();
        let completions = self.completions_tx.clone();
        let pool = self.name.clone();
        tokio::spawn(async move {
            let call = AssertUnwindSafe(accessor.destroy(&instance, context)).catch_unwind();
            tokio::pin!(call);
            let outcome = match tokio::time::timeout(deadline, &mut call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(pool = %pool, key = %key, instance = %instance, "destroy deadline elapsed, backend call continues");
                    call.await
                }
            };
            let result = outcome.unwrap_or_else(|payload| {
                let message = panic_message(payload);
                error!(pool = %pool, key = %key, error = %message, "destroy call panicked");
                Err(PluginError::Panic(message))
            });
            let _ = completions
                .send(TaskOutcome::Destroy {
                    key,
                    instance: instance.clone(),
                    result,
                })
                .await;
        });
    }

    async fn apply_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Provision { key, result } => match result {
                Ok(instance) => {
                    info!(pool = %self.name, key = %key, instance = %instance, "instance provisioned");
                    match self.collection.get_mut(&key) {
                        Some(item) => {
                            item.data.insert(
                                DATA_INSTANCE_ID.to_string(),
                                Value::String(instance.0.clone()),
                            );
                        }
                        None => {
                            debug!(pool = %self.name, key = %key, "provision finished for a removed item");
                        }
                    }
                    self.events.emit(
                        PoolEvent::new(&self.name, &key, EventKind::Provision)
                            .with_instance(instance),
                    );
                }
                Err(e) => {
                    error!(pool = %self.name, key = %key, error = %e, "provision failed");
                    self.events.emit(
                        PoolEvent::new(&self.name, &key, EventKind::ProvisionError).with_error(&e),
                    );
                    if let Some(item) = self.collection.get(&key) {
                        let fsm = item.fsm;
                        self.model.signal(fsm, ItemSignal::ProvisionError);
                    }
                }
            },
            TaskOutcome::Destroy {
                key,
                instance,
                result,
            } => match result {
                Ok(()) => {
                    info!(pool = %self.name, key = %key, instance = %instance, "instance destroyed");
                    self.events.emit(
                        PoolEvent::new(&self.name, &key, EventKind::Destroy)
                            .with_instance(instance),
                    );
                    if let Some(item) = self.collection.get(&key) {
                        let fsm = item.fsm;
                        self.model.signal(fsm, ItemSignal::Destroyed);
                    }
                }
                Err(e) => {
                    error!(pool = %self.name, key = %key, instance = %instance, error = %e, "destroy failed");
                    self.events.emit(
                        PoolEvent::new(&self.name, &key, EventKind::DestroyError)
                            .with_instance(instance)
                            .with_error(&e),
                    );
                    if let Some(item) = self.collection.get(&key) {
                        let fsm = item.fsm;
                        self.model.signal(fsm, ItemSignal::TerminateError);
                    }
                }
            },
        }
    }

    async fn handle_observation(&mut self, observation: Observation) {
        match (observation.scope, observation.kind) {
            (ObservationScope::Current, ObservationKind::Found) => {
                self.handle_found(observation.instances).await;
            }
            (ObservationScope::Current, ObservationKind::Lost) => {
                self.handle_lost(observation.instances).await;
            }
            (ObservationScope::Previous, ObservationKind::Found) => {
                self.handle_previous_found(observation.instances);
            }
            (ObservationScope::Previous, ObservationKind::Lost) => {
                self.handle_previous_lost(observation.instances);
            }
        }
    }

    async fn handle_found(&mut self, instances: Vec<InstanceDescription>) {
        for description in instances {
            let Some(key) = self.current.accessor.key_of(&description) else {
                warn!(pool = %self.name, instance = %description.id, "found instance has no key");
                continue;
            };
            let encoded = match serde_json::to_value(&description) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(pool = %self.name, key = %key, error = %e, "description not encodable");
                    continue;
                }
            };
            let fingerprint = description.fingerprint();
            let fsm = match self.collection.get_mut(&key) {
                Some(item) => {
                    let changed = item.data.get(DATA_FINGERPRINT).and_then(Value::as_str)
                        != Some(fingerprint.as_str());
                    item.data.insert(DATA_INSTANCE.to_string(), encoded.clone());
                    item.data
                        .insert(DATA_FINGERPRINT.to_string(), Value::String(fingerprint));
                    let fsm = item.fsm;
                    if changed {
                        self.metadata.export(&key, encoded).await;
                    }
                    fsm
                }
                None => {
                    let fsm = match self.model.add(ItemState::Unmatched) {
                        Ok(fsm) => fsm,
                        Err(e) => {
                            error!(pool = %self.name, key = %key, error = %e, "cannot track unmatched instance");
                            continue;
                        }
                    };
                    match self.collection.put(&key, fsm, Value::Null, None) {
                        Ok(item) => {
                            item.data.insert(DATA_INSTANCE.to_string(), encoded.clone());
                            item.data
                                .insert(DATA_FINGERPRINT.to_string(), Value::String(fingerprint));
                        }
                        Err(e) => {
                            warn!(pool = %self.name, key = %key, error = %e, "cannot adopt unmatched instance");
                            self.model.remove(fsm);
                            continue;
                        }
                    }
                    info!(pool = %self.name, key = %key, instance = %description.id, "adopted unmatched instance");
                    self.metadata.export(&key, encoded).await;
                    if self.draining {
                        self.model.signal(fsm, ItemSignal::Terminate);
                    }
                    fsm
                }
            };
            self.resources.insert(key, description);
            self.model.signal(fsm, ItemSignal::ResourceFound);
        }
    }

    async fn handle_lost(&mut self, instances: Vec<InstanceDescription>) {
        for description in instances {
            let Some(key) = self.current.accessor.key_of(&description) else {
                continue;
            };
            self.resources.remove(&key);
            self.metadata.retract(&key).await;
            if let Some(item) = self.collection.get(&key) {
                debug!(pool = %self.name, key = %key, "instance lost");
                let fsm = item.fsm;
                self.model.signal(fsm, ItemSignal::ResourceLost);
            }
        }
    }

    /// Found under the prior accessor only refreshes the stored description
    /// so a later destroy still knows the instance id. It never creates
    /// items, touches `resources` or signals the model.
    fn handle_previous_found(&mut self, instances: Vec<InstanceDescription>) {
        for description in instances {
            let Some(key) = self
                .previous
                .as_ref()
                .and_then(|rig| rig.accessor.key_of(&description))
            else {
                continue;
            };
            let Some(item) = self.collection.get_mut(&key) else {
                continue;
            };
            match serde_json::to_value(&description) {
                Ok(encoded) => {
                    item.data.insert(DATA_INSTANCE.to_string(), encoded);
                }
                Err(e) => {
                    debug!(pool = %self.name, key = %key, error = %e, "description not encodable");
                }
            }
        }
    }

    fn handle_previous_lost(&mut self, instances: Vec<InstanceDescription>) {
        for description in instances {
            let Some(key) = self
                .previous
                .as_ref()
                .and_then(|rig| rig.accessor.key_of(&description))
            else {
                continue;
            };
            if let Some(item) = self.collection.get(&key) {
                debug!(pool = %self.name, key = %key, "instance lost under prior accessor");
                let fsm = item.fsm;
                self.model.signal(fsm, ItemSignal::ResourceLost);
            }
        }
    }

    fn handle_ready(&self, id: FsmId) {
        if self.model.state_of(id) != Some(ItemState::Ready) {
            return;
        }
        let Some(item) = self.collection.get_by_fsm(id) else {
            return;
        };
        info!(pool = %self.name, key = %item.key, "item ready");
        let mut event = PoolEvent::new(&self.name, &item.key, EventKind::Ready);
        if let Some(instance) = item.instance_id() {
            event = event.with_instance(instance);
        }
        self.events.emit(event);
    }

    fn handle_pending(&self, id: FsmId) {
        if self.model.state_of(id) != Some(ItemState::Pending) {
            return;
        }
        let Some(item) = self.collection.get_by_fsm(id) else {
            return;
        };
        debug!(pool = %self.name, key = %item.key, "item pending on dependencies");
        self.events
            .emit(PoolEvent::new(&self.name, &item.key, EventKind::Pending));
    }

    async fn handle_cleanup(&mut self, id: FsmId) {
        if self.model.state_of(id) != Some(ItemState::Cleanup) {
            return;
        }
        let Some(key) = self.collection.get_by_fsm(id).map(|item| item.key.clone()) else {
            self.model.remove(id);
            return;
        };
        self.model.remove(id);
        let Some(item) = self.collection.delete(&key) else {
            return;
        };
        self.resources.remove(&key);
        self.metadata.retract(&key).await;
        info!(pool = %self.name, key = %key, "item cleaned up");
        // A seeded ordinal still below the target count grows back, which
        // also picks up the latest resource template.
        if !self.draining
            && item.ordinal < self.props.count
            && key == item_key(&self.name, item.ordinal)
        {
            debug!(pool = %self.name, key = %key, "reseeding missing item");
            self.seed_one(item.ordinal);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
