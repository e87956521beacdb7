//! Controller façade.
//!
//! Owns the registry of running pools. A spec commit creates the pool on
//! first sight and updates it afterwards, so the whole external surface is
//! "declare a spec"; errors come back synchronously only for configuration
//! problems, everything else degrades into events and retries.

use std::collections::HashMap;
use std::sync::Arc;

use herd_fsm::Ticker;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::events::{EventSender, PoolEvent};
use crate::metadata::MetadataView;
use crate::options::{Options, OptionsError};
use crate::plugin::{BackendConnector, InstanceBackend, PluginError};
use crate::pool::{self, PoolHandle, PoolStatus};
use crate::spec::{InstanceAccess, PoolProperties, PoolSpec, Properties, SpecError};

/// Backend connect attempts per commit before giving up.
const CONNECT_ATTEMPTS: u32 = 3;
/// Capacity of the shared event channel.
const EVENT_CAPACITY: usize = 256;

/// Errors returned synchronously from controller calls.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// The backend stayed unreachable through every connect attempt.
    #[error("backend connect failed after {attempts} attempts: {source}")]
    Connect { attempts: u32, source: PluginError },

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("pool stopped: {0}")]
    PoolStopped(String),

    #[error("internal: {0}")]
    Internal(String),
}

struct PoolEntry {
    handle: PoolHandle,
    props: PoolProperties,
}

/// Registry of running pools.
pub struct Controller {
    options: Options,
    connector: Arc<dyn BackendConnector>,
    pools: RwLock<HashMap<String, PoolEntry>>,
    events: EventSender,
}

impl Controller {
    /// Validates `options` once; nothing is re-checked per pool.
    pub fn new(options: Options, connector: Arc<dyn BackendConnector>) -> Result<Self, OptionsError> {
        options.validate()?;
        Ok(Self {
            options,
            connector,
            pools: RwLock::new(HashMap::new()),
            events: EventSender::new(EVENT_CAPACITY),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Applies a pool spec: creates the pool on first commit, updates the
    /// running pool otherwise. The backend is only reconnected when the
    /// instance access configuration changed.
    pub async fn commit(&self, spec: &PoolSpec) -> Result<(), CommitError> {
        let name = spec.metadata.name.trim();
        if name.is_empty() {
            return Err(SpecError::EmptyName.into());
        }
        let props = Properties::decode(&spec.properties).into_pool()?;
        loop {
            // Connect attempts sleep between retries, so they run outside
            // the registry lock and the decision is re-checked under it.
            let known_access = {
                let pools = self.pools.read().await;
                pools.get(name).map(|entry| entry.props.instance.clone())
            };
            let backend = match &known_access {
                Some(access) if *access == props.instance => None,
                _ => Some(self.connect(&props.instance).await?),
            };
            let mut pools = self.pools.write().await;
            if pools.get(name).map(|entry| entry.props.instance.clone()) != known_access {
                // Raced by another commit or terminate, decide again.
                continue;
            }
            if let Some(entry) = pools.get_mut(name) {
                entry.handle.update(props.clone(), backend).await?;
                entry.props = props;
                info!(pool = %name, "pool spec updated");
                return Ok(());
            }
            let Some(backend) = backend else {
                continue;
            };
            let ticker = Ticker::interval(self.options.model.tick_unit());
            let handle = pool::spawn(
                name,
                self.options.clone(),
                props.clone(),
                backend,
                self.events.clone(),
                ticker,
            )?;
            pools.insert(name.to_string(), PoolEntry { handle, props });
            info!(pool = %name, "pool created");
            return Ok(());
        }
    }

    /// Drains a pool to empty, destroying its instances, and removes it.
    pub async fn terminate(&self, name: &str) -> Result<(), CommitError> {
        let entry = self
            .pools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| CommitError::UnknownPool(name.to_string()))?;
        info!(pool = %name, "terminating pool");
        entry.handle.terminate().await;
        Ok(())
    }

    /// Detaches a pool without destroying its instances.
    pub async fn free(&self, name: &str) -> Result<(), CommitError> {
        let entry = self
            .pools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| CommitError::UnknownPool(name.to_string()))?;
        info!(pool = %name, "releasing pool");
        entry.handle.stop().await;
        Ok(())
    }

    pub async fn describe(&self, name: &str) -> Result<PoolStatus, CommitError> {
        let pools = self.pools.read().await;
        let entry = pools
            .get(name)
            .ok_or_else(|| CommitError::UnknownPool(name.to_string()))?;
        entry
            .handle
            .describe()
            .await
            .ok_or_else(|| CommitError::PoolStopped(name.to_string()))
    }

    pub async fn pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata views of all running pools.
    pub async fn metadata(&self) -> HashMap<String, MetadataView> {
        self.pools
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.handle.metadata()))
            .collect()
    }

    async fn connect(&self, access: &InstanceAccess) -> Result<Arc<dyn InstanceBackend>, CommitError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(access).await {
                Ok(backend) => return Ok(backend),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %e, "backend connect failed, retrying");
                    tokio::time::sleep(self.options.plugin_retry_interval()).await;
                }
                Err(e) => {
                    return Err(CommitError::Connect {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
