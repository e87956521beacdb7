//! Item lifecycle model.
//!
//! Every pool item is driven by one machine over the table built in
//! [`lifecycle_spec`]. Work never starts inside the model: actionable states
//! deliver the item onto a queue and the reconciliation loop decides. Entry
//! into `provisioning` or `terminating` happens only through an explicit
//! [`ItemSignal::Admit`], which keeps the count of in-flight backend calls
//! exactly equal to the occupancy of those two states.

use std::fmt;
use std::str::FromStr;

use herd_fsm::{FsmId, Set, SetSpec};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::options::ModelOptions;

/// Lifecycle states of a pool item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    /// Wants an instance, none running yet.
    Requested,
    /// A provision call is in flight.
    Provisioning,
    /// Instance observed at the backend.
    Ready,
    /// Blocked on a missing dependency.
    Pending,
    /// Marked for destruction, waiting for a slot.
    Destroy,
    /// A destroy call is in flight.
    Terminating,
    /// Terminal; the loop removes the item from here.
    Cleanup,
    /// Observed at the backend but never requested by this pool.
    Unmatched,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Requested => "requested",
            ItemState::Provisioning => "provisioning",
            ItemState::Ready => "ready",
            ItemState::Pending => "pending",
            ItemState::Destroy => "destroy",
            ItemState::Terminating => "terminating",
            ItemState::Cleanup => "cleanup",
            ItemState::Unmatched => "unmatched",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Cleanup)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(ItemState::Requested),
            "provisioning" => Ok(ItemState::Provisioning),
            "ready" => Ok(ItemState::Ready),
            "pending" => Ok(ItemState::Pending),
            "destroy" => Ok(ItemState::Destroy),
            "terminating" => Ok(ItemState::Terminating),
            "cleanup" => Ok(ItemState::Cleanup),
            "unmatched" => Ok(ItemState::Unmatched),
            other => Err(format!("unknown item state: {other}")),
        }
    }
}

/// Signals applied to item machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemSignal {
    /// The item's instance showed up in an observation.
    ResourceFound,
    /// The item's instance disappeared from observations.
    ResourceLost,
    /// No free slot under the parallelism bound.
    Throttle,
    /// A template dependency is not resolvable yet.
    DependencyMissing,
    /// The provision call failed.
    ProvisionError,
    /// The destroy call failed.
    TerminateError,
    /// The item should leave the pool.
    Terminate,
    /// The state's rest period elapsed.
    Timeout,
    /// The loop took a slot and dispatched the backend call.
    Admit,
    /// The destroy call succeeded.
    Destroyed,
}

/// Delivery queues for actionable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Provision,
    Destroy,
    Ready,
    Pending,
    Cleanup,
}

/// Builds the item lifecycle table.
///
/// `requested` and `destroy` re-offer themselves through their expiry, so a
/// throttled, failed or dropped offer is retried after the configured rest
/// without any bookkeeping in the loop.
pub fn lifecycle_spec(options: &ModelOptions) -> SetSpec<ItemState, ItemSignal, Queue> {
    use ItemSignal::*;
    use ItemState::*;

    let mut spec = SetSpec::new();
    spec.state(Requested)
        .expire(options.wait_before_provision, Timeout)
        .on_deliver(Timeout, Requested, Queue::Provision)
        .on(Admit, Provisioning)
        .on(Throttle, Requested)
        .on_deliver(DependencyMissing, Pending, Queue::Pending)
        .on_deliver(ResourceFound, Ready, Queue::Ready)
        .on(Terminate, Destroy);
    spec.state(Provisioning)
        .on_deliver(ResourceFound, Ready, Queue::Ready)
        .on(ProvisionError, Requested)
        .on(Terminate, Destroy);
    spec.state(Pending)
        .expire(options.wait_before_provision, Timeout)
        .on_deliver(Timeout, Requested, Queue::Provision)
        .on_deliver(ResourceFound, Ready, Queue::Ready)
        .on(Terminate, Destroy);
    spec.state(Ready)
        .on(ResourceLost, Requested)
        .on(Terminate, Destroy);
    spec.state(Destroy)
        .expire(options.wait_before_destroy, Timeout)
        .on_deliver(Timeout, Destroy, Queue::Destroy)
        .on(Admit, Terminating)
        .on(Throttle, Destroy)
        .on_deliver(ResourceLost, Cleanup, Queue::Cleanup)
        .on(Terminate, Destroy);
    spec.state(Terminating)
        .on_deliver(Destroyed, Cleanup, Queue::Cleanup)
        .on(TerminateError, Destroy)
        .on_deliver(ResourceLost, Cleanup, Queue::Cleanup);
    spec.state(Unmatched)
        .on(Terminate, Destroy)
        .on_deliver(ResourceLost, Cleanup, Queue::Cleanup);
    spec.state(Cleanup);
    spec
}

pub type ModelError = herd_fsm::FsmError<ItemState, ItemSignal>;

/// The machine set of one pool.
pub struct Model {
    set: Set<ItemState, ItemSignal, Queue>,
}

/// Receiving ends of the actionable state queues.
pub struct ModelQueues {
    pub provision: mpsc::Receiver<FsmId>,
    pub destroy: mpsc::Receiver<FsmId>,
    pub ready: mpsc::Receiver<FsmId>,
    pub pending: mpsc::Receiver<FsmId>,
    pub cleanup: mpsc::Receiver<FsmId>,
}

impl Model {
    pub fn new(options: &ModelOptions) -> Result<(Model, ModelQueues), ModelError> {
        let mut set = Set::new(lifecycle_spec(options), options.channel_buffer_size)?;
        let queues = ModelQueues {
            provision: set.take_queue(Queue::Provision),
            destroy: set.take_queue(Queue::Destroy),
            ready: set.take_queue(Queue::Ready),
            pending: set.take_queue(Queue::Pending),
            cleanup: set.take_queue(Queue::Cleanup),
        };
        Ok((Model { set }, queues))
    }

    pub fn add(&mut self, initial: ItemState) -> Result<FsmId, ModelError> {
        self.set.add(initial)
    }

    pub fn remove(&mut self, id: FsmId) -> Option<ItemState> {
        self.set.remove(id)
    }

    pub fn state_of(&self, id: FsmId) -> Option<ItemState> {
        self.set.state_of(id)
    }

    pub fn count_in(&self, state: ItemState) -> usize {
        self.set.count_in(state)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn tick(&mut self) -> usize {
        self.set.tick()
    }

    /// Applies a signal, swallowing model errors. A signal raced by an
    /// observation or a removal is normal here, so the loop only wants to
    /// know whether a transition happened.
    pub fn signal(&mut self, id: FsmId, signal: ItemSignal) -> Option<ItemState> {
        match self.set.signal(id, signal) {
            Ok(next) => next,
            Err(e) => {
                debug!(id = %id, error = %e, "signal dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ModelOptions {
        ModelOptions {
            tick_unit_ms: 10,
            wait_before_provision: 1,
            wait_before_destroy: 2,
            channel_buffer_size: 16,
        }
    }

    #[test]
    fn test_requested_is_offered_after_the_rest_period() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        assert!(queues.provision.try_recv().is_err());
        model.tick();
        assert_eq!(queues.provision.try_recv().unwrap(), id);
        assert_eq!(model.state_of(id), Some(ItemState::Requested));
    }

    #[test]
    fn test_throttled_item_is_offered_again() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.tick();
        assert_eq!(queues.provision.try_recv().unwrap(), id);
        assert_eq!(
            model.signal(id, ItemSignal::Throttle),
            Some(ItemState::Requested)
        );
        assert!(queues.provision.try_recv().is_err());
        model.tick();
        assert_eq!(queues.provision.try_recv().unwrap(), id);
    }

    #[test]
    fn test_admit_is_the_only_door_into_provisioning() {
        let (mut model, _queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.tick();
        assert_eq!(model.count_in(ItemState::Provisioning), 0);
        assert_eq!(
            model.signal(id, ItemSignal::Admit),
            Some(ItemState::Provisioning)
        );
        assert_eq!(model.count_in(ItemState::Provisioning), 1);
    }

    #[test]
    fn test_item_walks_the_full_lifecycle() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();

        model.tick();
        assert_eq!(queues.provision.try_recv().unwrap(), id);
        model.signal(id, ItemSignal::Admit);
        assert_eq!(
            model.signal(id, ItemSignal::ResourceFound),
            Some(ItemState::Ready)
        );
        assert_eq!(queues.ready.try_recv().unwrap(), id);

        model.signal(id, ItemSignal::Terminate);
        assert_eq!(model.state_of(id), Some(ItemState::Destroy));
        model.tick();
        assert!(queues.destroy.try_recv().is_err());
        model.tick();
        assert_eq!(queues.destroy.try_recv().unwrap(), id);
        model.signal(id, ItemSignal::Admit);
        assert_eq!(
            model.signal(id, ItemSignal::Destroyed),
            Some(ItemState::Cleanup)
        );
        assert_eq!(queues.cleanup.try_recv().unwrap(), id);
        assert!(model.state_of(id).unwrap().is_terminal());
        assert_eq!(model.remove(id), Some(ItemState::Cleanup));
    }

    #[test]
    fn test_missing_dependency_parks_the_item() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.tick();
        queues.provision.try_recv().unwrap();
        assert_eq!(
            model.signal(id, ItemSignal::DependencyMissing),
            Some(ItemState::Pending)
        );
        assert_eq!(queues.pending.try_recv().unwrap(), id);
        model.tick();
        assert_eq!(model.state_of(id), Some(ItemState::Requested));
        assert_eq!(queues.provision.try_recv().unwrap(), id);
    }

    #[test]
    fn test_pending_item_can_be_found_directly() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.signal(id, ItemSignal::DependencyMissing);
        assert_eq!(
            model.signal(id, ItemSignal::ResourceFound),
            Some(ItemState::Ready)
        );
        assert_eq!(queues.ready.try_recv().unwrap(), id);
    }

    #[test]
    fn test_failed_destroy_goes_back_to_destroy() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.signal(id, ItemSignal::Terminate);
        model.tick();
        model.tick();
        queues.destroy.try_recv().unwrap();
        model.signal(id, ItemSignal::Admit);
        assert_eq!(
            model.signal(id, ItemSignal::TerminateError),
            Some(ItemState::Destroy)
        );
        model.tick();
        model.tick();
        assert_eq!(queues.destroy.try_recv().unwrap(), id);
    }

    #[test]
    fn test_unmatched_ignores_found_but_honors_terminate() {
        let (mut model, _queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Unmatched).unwrap();
        assert_eq!(model.signal(id, ItemSignal::ResourceFound), None);
        assert_eq!(model.state_of(id), Some(ItemState::Unmatched));
        assert_eq!(
            model.signal(id, ItemSignal::Terminate),
            Some(ItemState::Destroy)
        );
    }

    #[test]
    fn test_lost_while_terminating_still_cleans_up() {
        let (mut model, mut queues) = Model::new(&options()).unwrap();
        let id = model.add(ItemState::Requested).unwrap();
        model.signal(id, ItemSignal::Terminate);
        model.tick();
        model.tick();
        queues.destroy.try_recv().unwrap();
        model.signal(id, ItemSignal::Admit);
        assert_eq!(
            model.signal(id, ItemSignal::ResourceLost),
            Some(ItemState::Cleanup)
        );
        assert_eq!(queues.cleanup.try_recv().unwrap(), id);
    }

    #[test]
    fn test_state_names_roundtrip() {
        for state in [
            ItemState::Requested,
            ItemState::Provisioning,
            ItemState::Ready,
            ItemState::Pending,
            ItemState::Destroy,
            ItemState::Terminating,
            ItemState::Cleanup,
            ItemState::Unmatched,
        ] {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("draining".parse::<ItemState>().is_err());
    }
}
