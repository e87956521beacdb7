//! Live machine sets.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::spec::{FsmError, Label, SetSpec};

/// Opaque identity of one machine instance within a [`Set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsmId(u64);

impl FsmId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FsmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fsm-{}", self.0)
    }
}

#[derive(Debug)]
struct Instance<S> {
    state: S,
    /// Absolute tick at which the current state's expiry fires, if armed.
    deadline: Option<u64>,
}

/// A set of machine instances sharing one [`SetSpec`].
///
/// A single owning task applies signals and ticks; queue deliveries are
/// pushed with `try_send` so the owner never blocks. A full queue drops the
/// delivery with a warning; callers relying on deliveries should pair them
/// with a periodic expiry so a missed offer heals itself.
pub struct Set<S: Label, G: Label, Q: Label> {
    spec: SetSpec<S, G, Q>,
    now: u64,
    next_id: u64,
    instances: HashMap<FsmId, Instance<S>>,
    counts: HashMap<S, usize>,
    queues: HashMap<Q, mpsc::Sender<FsmId>>,
    receivers: HashMap<Q, mpsc::Receiver<FsmId>>,
}

impl<S: Label, G: Label, Q: Label> Set<S, G, Q> {
    /// Validates `spec` and creates one bounded delivery channel per queue
    /// tag referenced by its edges.
    pub fn new(spec: SetSpec<S, G, Q>, buffer: usize) -> Result<Self, FsmError<S, G>> {
        spec.validate()?;
        let mut queues = HashMap::new();
        let mut receivers = HashMap::new();
        for tag in spec.queue_tags() {
            let (tx, rx) = mpsc::channel(buffer.max(1));
            queues.insert(tag, tx);
            receivers.insert(tag, rx);
        }
        Ok(Self {
            spec,
            now: 0,
            next_id: 0,
            instances: HashMap::new(),
            counts: HashMap::new(),
            queues,
            receivers,
        })
    }

    /// Takes the delivery channel for `queue`. Each queue can be taken once;
    /// a queue no edge references yields a receiver that never delivers.
    pub fn take_queue(&mut self, queue: Q) -> mpsc::Receiver<FsmId> {
        self.receivers
            .remove(&queue)
            .unwrap_or_else(|| mpsc::channel(1).1)
    }

    /// Adds an instance in `initial`. Entry by `add` arms the state's expiry
    /// but performs no queue delivery; deliveries only happen on transitions.
    pub fn add(&mut self, initial: S) -> Result<FsmId, FsmError<S, G>> {
        if !self.spec.has_state(initial) {
            return Err(FsmError::UndefinedState(initial));
        }
        let id = FsmId(self.next_id);
        self.next_id += 1;
        let deadline = self.spec.expiry_of(initial).map(|e| self.now + e.after);
        self.instances.insert(
            id,
            Instance {
                state: initial,
                deadline,
            },
        );
        *self.counts.entry(initial).or_insert(0) += 1;
        Ok(id)
    }

    /// Removes an instance, returning the state it was in.
    pub fn remove(&mut self, id: FsmId) -> Option<S> {
        let instance = self.instances.remove(&id)?;
        if let Some(count) = self.counts.get_mut(&instance.state) {
            *count = count.saturating_sub(1);
        }
        Some(instance.state)
    }

    pub fn state_of(&self, id: FsmId) -> Option<S> {
        self.instances.get(&id).map(|instance| instance.state)
    }

    pub fn count_in(&self, state: S) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Logical time, in ticks since the set was created.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Applies `signal` to `id`. Returns the state entered, or `None` when
    /// the current state defines no transition for the signal (ignored
    /// unless the spec is strict).
    pub fn signal(&mut self, id: FsmId, signal: G) -> Result<Option<S>, FsmError<S, G>> {
        let instance = self
            .instances
            .get(&id)
            .ok_or(FsmError::UnknownInstance(id))?;
        let from = instance.state;
        let edge = match self.spec.state_spec(from).and_then(|s| s.edge(signal)) {
            Some(edge) => *edge,
            None => {
                if self.spec.is_strict() {
                    return Err(FsmError::UndefinedTransition {
                        state: from,
                        signal,
                    });
                }
                trace!(%id, state = ?from, signal = ?signal, "signal has no transition, ignoring");
                return Ok(None);
            }
        };
        self.enter(id, from, edge.next);
        if let Some(queue) = edge.queue {
            self.deliver(queue, id);
        }
        Ok(Some(edge.next))
    }

    /// Advances logical time one tick and raises any due expiries. Returns
    /// the number of expiries fired.
    pub fn tick(&mut self) -> usize {
        self.now += 1;
        let now = self.now;
        let mut due: Vec<(FsmId, G)> = self
            .instances
            .iter()
            .filter_map(|(id, instance)| {
                let deadline = instance.deadline?;
                if deadline > now {
                    return None;
                }
                self.spec
                    .expiry_of(instance.state)
                    .map(|e| (*id, e.raise))
            })
            .collect();
        due.sort_by_key(|(id, _)| *id);
        for (id, raise) in &due {
            // Cleared before signalling so an ignored signal does not refire
            // every tick; entry via the transition re-arms as usual.
            if let Some(instance) = self.instances.get_mut(id) {
                instance.deadline = None;
            }
            if let Err(e) = self.signal(*id, *raise) {
                debug!(id = %id, error = %e, "expiry signal not applied");
            }
        }
        due.len()
    }

    fn enter(&mut self, id: FsmId, from: S, to: S) {
        if let Some(count) = self.counts.get_mut(&from) {
            *count = count.saturating_sub(1);
        }
        *self.counts.entry(to).or_insert(0) += 1;
        let deadline = self.spec.expiry_of(to).map(|e| self.now + e.after);
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.state = to;
            instance.deadline = deadline;
        }
    }

    fn deliver(&self, queue: Q, id: FsmId) {
        let Some(tx) = self.queues.get(&queue) else {
            return;
        };
        match tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(queue = ?queue, id = %id, "delivery queue full, dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(queue = ?queue, id = %id, "delivery queue closed");
            }
        }
    }
}
