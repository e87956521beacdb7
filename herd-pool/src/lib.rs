//! herd-pool - Declarative instance pool reconciliation.
//!
//! A pool spec declares how many instances should exist and how to reach
//! the backend that creates them. The controller keeps one reconciliation
//! worker per pool, which continuously converges observed instances against
//! the declared count, throttled by the pool's parallelism.

pub mod accessor;
pub mod collection;
pub mod controller;
pub mod events;
pub mod metadata;
pub mod model;
pub mod options;
pub mod plugin;
pub mod pool;
pub mod resolver;
pub mod spec;

pub use accessor::{Observation, ObservationKind, ObservationScope};
pub use controller::{CommitError, Controller};
pub use events::{EventKind, PoolEvent};
pub use herd_fsm::{FsmId, TickHandle, Ticker};
pub use metadata::MetadataView;
pub use model::{ItemSignal, ItemState};
pub use options::{ModelOptions, Options, OptionsError};
pub use plugin::{
    BackendConnector, InstanceBackend, InstanceDescription, InstanceId, PluginError,
    TerminateContext,
};
pub use pool::{ItemStatus, PoolStatus, item_key};
pub use spec::{
    HASH_TAG, InstanceAccess, KEY_TAG, KeySelector, Metadata, POOL_TAG, PoolProperties, PoolSpec,
    Properties, SpecError,
};
