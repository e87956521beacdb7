//! Test helpers for herd-sim pool integration tests.

use std::sync::Arc;
use std::time::Duration;

use herd_pool::controller::Controller;
use herd_pool::events::{EventKind, PoolEvent};
use herd_pool::model::ItemState;
use herd_pool::options::Options;
use herd_pool::plugin::{InstanceDescription, InstanceId};
use herd_pool::pool::PoolStatus;
use herd_pool::spec::{Metadata, POOL_TAG, PoolSpec};
use herd_sim::{SimBackend, SimConnector};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout_at};
use tracing_subscriber::EnvFilter;

/// Upper bound on every wait loop.
pub const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

/// A controller wired to one fresh in-memory backend.
pub struct Rig {
    pub controller: Controller,
    pub backend: Arc<SimBackend>,
    pub connector: Arc<SimConnector>,
}

pub fn rig() -> Rig {
    rig_with_latency(Duration::ZERO)
}

pub fn rig_with_latency(latency: Duration) -> Rig {
    trace_init();
    let backend = SimBackend::with_latency(latency);
    let connector = SimConnector::new(backend.clone());
    let controller = Controller::new(fast_options(), connector.clone()).unwrap();
    Rig {
        controller,
        backend,
        connector,
    }
}

/// Timings tightened so a full reconciliation round completes in milliseconds.
pub fn fast_options() -> Options {
    let mut options = Options::default();
    options.plugin_retry_interval_ms = 20;
    options.provision_deadline_ms = 2_000;
    options.destroy_deadline_ms = 2_000;
    options.model.tick_unit_ms = 10;
    options.model.wait_before_provision = 1;
    options.model.wait_before_destroy = 1;
    options
}

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pool spec selecting on the pool tag, which every provisioned instance
/// carries.
pub fn pool_spec(name: &str, count: usize, parallelism: usize, resource: Value) -> PoolSpec {
    PoolSpec {
        metadata: Metadata {
            name: name.to_string(),
        },
        properties: json!({
            "count": count,
            "parallelism": parallelism,
            "instance": {
                "select": { POOL_TAG: name },
                "observe_interval_ms": 10,
            },
            "resource": resource,
        }),
    }
}

/// An instance that exists at the provider without the pool having built it.
pub fn planted(id: &str, tags: &[(&str, &str)]) -> InstanceDescription {
    InstanceDescription {
        id: InstanceId::from(id),
        logical_id: None,
        tags: tags
            .iter()
            .map(|(tag, value)| (tag.to_string(), value.to_string()))
            .collect(),
        properties: None,
    }
}

pub fn count_in(status: &PoolStatus, state: ItemState) -> usize {
    status
        .items
        .iter()
        .filter(|item| item.state == state)
        .count()
}

/// Polls `describe` until `want` items sit in `state`.
pub async fn wait_for_state_count(
    controller: &Controller,
    pool: &str,
    state: ItemState,
    want: usize,
) -> PoolStatus {
    let deadline = Instant::now() + WAIT;
    let mut last: Option<PoolStatus> = None;
    loop {
        if let Ok(status) = controller.describe(pool).await {
            if count_in(&status, state) == want {
                return status;
            }
            last = Some(status);
        }
        if Instant::now() >= deadline {
            panic!("pool {pool} never reached {want} items in {state}, last seen: {last:?}");
        }
        sleep(POLL).await;
    }
}

/// Polls `describe` until the pool holds exactly `want` items.
pub async fn wait_for_item_count(controller: &Controller, pool: &str, want: usize) -> PoolStatus {
    let deadline = Instant::now() + WAIT;
    let mut last: Option<PoolStatus> = None;
    loop {
        if let Ok(status) = controller.describe(pool).await {
            if status.items.len() == want {
                return status;
            }
            last = Some(status);
        }
        if Instant::now() >= deadline {
            panic!("pool {pool} never reached {want} items, last seen: {last:?}");
        }
        sleep(POLL).await;
    }
}

/// Waits until the backend holds exactly `want` instances.
pub async fn wait_for_sim_count(backend: &SimBackend, want: usize) {
    let deadline = Instant::now() + WAIT;
    loop {
        let have = backend.instance_count().await;
        if have == want {
            return;
        }
        if Instant::now() >= deadline {
            panic!("backend never reached {want} instances, has {have}");
        }
        sleep(POLL).await;
    }
}

/// Receives events until `want` of `kind` have arrived, returning everything
/// seen along the way.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<PoolEvent>,
    kind: EventKind,
    want: usize,
) -> Vec<PoolEvent> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while events_of(&seen, kind) < want {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!(
                "only {} of {want} {kind:?} events within {WAIT:?}, saw: {seen:?}",
                events_of(&seen, kind)
            ),
        }
    }
    seen
}

/// Receives events until one of `kind` arrives.
pub async fn wait_for_event(rx: &mut broadcast::Receiver<PoolEvent>, kind: EventKind) -> PoolEvent {
    let mut seen = collect_until(rx, kind, 1).await;
    seen.pop().unwrap()
}

/// Takes everything currently buffered on the event channel.
pub fn drain_events(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

pub fn events_of(events: &[PoolEvent], kind: EventKind) -> usize {
    events.iter().filter(|event| event.kind == kind).count()
}
