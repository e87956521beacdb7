//! Transition tables.
//!
//! A [`SetSpec`] is built once per machine family: every state gets a
//! [`StateSpec`] mapping signals to edges, and optionally an [`Expiry`] that
//! raises a signal after the instance has sat in the state for a number of
//! logical ticks. Edges may carry a queue tag; the owning set delivers the
//! instance id on that queue when the edge is taken.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

/// Bound for state, signal and queue tag types.
pub trait Label: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Label for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

#[derive(Debug, Error)]
pub enum FsmError<S: Label, G: Label> {
    #[error("state {0:?} is not defined")]
    UndefinedState(S),
    #[error("no transition from {state:?} on {signal:?}")]
    UndefinedTransition { state: S, signal: G },
    #[error("unknown instance {0}")]
    UnknownInstance(crate::set::FsmId),
}

/// Raises `raise` once the instance has spent `after` ticks in the state.
///
/// The expiry is armed on entry and fires at most once per arming; a
/// transition back into the state (including a self transition) re-arms it.
#[derive(Debug, Clone, Copy)]
pub struct Expiry<G> {
    pub after: u64,
    pub raise: G,
}

/// One transition: the next state plus an optional delivery queue.
#[derive(Debug, Clone, Copy)]
pub struct Edge<S, Q> {
    pub next: S,
    pub queue: Option<Q>,
}

/// Per-state transition map.
#[derive(Debug, Clone)]
pub struct StateSpec<S, G, Q> {
    transitions: HashMap<G, Edge<S, Q>>,
    expiry: Option<Expiry<G>>,
}

impl<S: Label, G: Label, Q: Label> Default for StateSpec<S, G, Q> {
    fn default() -> Self {
        Self {
            transitions: HashMap::new(),
            expiry: None,
        }
    }
}

impl<S: Label, G: Label, Q: Label> StateSpec<S, G, Q> {
    /// Adds a transition without delivery.
    pub fn on(&mut self, signal: G, next: S) -> &mut Self {
        self.transitions.insert(signal, Edge { next, queue: None });
        self
    }

    /// Adds a transition that also delivers the instance id on `queue`.
    pub fn on_deliver(&mut self, signal: G, next: S, queue: Q) -> &mut Self {
        self.transitions.insert(
            signal,
            Edge {
                next,
                queue: Some(queue),
            },
        );
        self
    }

    /// Arms `raise` to fire after `after` ticks in this state.
    pub fn expire(&mut self, after: u64, raise: G) -> &mut Self {
        self.expiry = Some(Expiry { after, raise });
        self
    }

    pub(crate) fn edge(&self, signal: G) -> Option<&Edge<S, Q>> {
        self.transitions.get(&signal)
    }

    pub(crate) fn expiry(&self) -> Option<Expiry<G>> {
        self.expiry
    }
}

/// The full transition table for one machine family.
#[derive(Debug, Clone)]
pub struct SetSpec<S, G, Q> {
    states: HashMap<S, StateSpec<S, G, Q>>,
    strict: bool,
}

impl<S: Label, G: Label, Q: Label> Default for SetSpec<S, G, Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Label, G: Label, Q: Label> SetSpec<S, G, Q> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            strict: false,
        }
    }

    /// Declares `state` (idempotent) and returns its spec for configuration.
    pub fn state(&mut self, state: S) -> &mut StateSpec<S, G, Q> {
        self.states.entry(state).or_default()
    }

    /// In strict mode signalling an undefined transition is an error instead
    /// of a no-op.
    pub fn set_strict(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn has_state(&self, state: S) -> bool {
        self.states.contains_key(&state)
    }

    /// Every edge must point at a declared state.
    pub fn validate(&self) -> Result<(), FsmError<S, G>> {
        for spec in self.states.values() {
            for edge in spec.transitions.values() {
                if !self.states.contains_key(&edge.next) {
                    return Err(FsmError::UndefinedState(edge.next));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn state_spec(&self, state: S) -> Option<&StateSpec<S, G, Q>> {
        self.states.get(&state)
    }

    pub(crate) fn expiry_of(&self, state: S) -> Option<Expiry<G>> {
        self.states.get(&state).and_then(StateSpec::expiry)
    }

    pub(crate) fn queue_tags(&self) -> HashSet<Q> {
        self.states
            .values()
            .flat_map(|spec| spec.transitions.values())
            .filter_map(|edge| edge.queue)
            .collect()
    }
}
