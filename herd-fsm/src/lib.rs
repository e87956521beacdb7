//! Deterministic, table-driven finite state machines for resource lifecycles.
//!
//! A [`spec::SetSpec`] declares states, transitions and tick-based expiries;
//! a [`set::Set`] runs many machine instances against one spec, delivering
//! entries into a state over bounded channels when the transition carries a
//! queue tag. Time is logical: [`set::Set::tick`] advances it, and
//! [`clock::Ticker`] maps logical ticks onto either a wall-clock interval or
//! a manual handle for tests.

pub mod clock;
pub mod set;
pub mod spec;

pub use clock::{TickHandle, Ticker};
pub use set::{FsmId, Set};
pub use spec::{Edge, Expiry, FsmError, Label, SetSpec, StateSpec};
