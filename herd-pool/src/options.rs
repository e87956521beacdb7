//! Process-wide options.
//!
//! These are fixed at controller construction and shared by every pool.
//! Per-pool settings live in the pool spec instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted delivery channel buffer.
pub const MIN_CHANNEL_BUFFER: usize = 10;
/// Smallest accepted wait, in ticks.
pub const MIN_WAIT_TICKS: u64 = 1;

/// Invalid option values. Raised once, at controller construction.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("channel buffer size {got} is below the minimum {min}")]
    BufferTooSmall { got: usize, min: usize },

    #[error("{which} is {got} ticks, minimum is {min}")]
    WaitTooShort {
        which: &'static str,
        got: u64,
        min: u64,
    },

    #[error("{0} must not be zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Pause between backend connect attempts, in milliseconds.
    pub plugin_retry_interval_ms: u64,

    /// How long a provision call may run before it is reported as overdue,
    /// in milliseconds. The call itself is not cancelled.
    pub provision_deadline_ms: u64,

    /// Same bound for destroy calls.
    pub destroy_deadline_ms: u64,

    pub model: ModelOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            plugin_retry_interval_ms: 5_000,
            provision_deadline_ms: 120_000,
            destroy_deadline_ms: 120_000,
            model: ModelOptions::default(),
        }
    }
}

impl Options {
    pub fn plugin_retry_interval(&self) -> Duration {
        Duration::from_millis(self.plugin_retry_interval_ms)
    }

    pub fn provision_deadline(&self) -> Duration {
        Duration::from_millis(self.provision_deadline_ms)
    }

    pub fn destroy_deadline(&self) -> Duration {
        Duration::from_millis(self.destroy_deadline_ms)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.plugin_retry_interval_ms == 0 {
            return Err(OptionsError::ZeroDuration("plugin retry interval"));
        }
        if self.provision_deadline_ms == 0 {
            return Err(OptionsError::ZeroDuration("provision deadline"));
        }
        if self.destroy_deadline_ms == 0 {
            return Err(OptionsError::ZeroDuration("destroy deadline"));
        }
        self.model.validate()
    }
}

/// Timing of the lifecycle model shared by all pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Wall-clock length of one model tick, in milliseconds.
    pub tick_unit_ms: u64,

    /// Ticks an item rests before it is offered for provisioning again.
    pub wait_before_provision: u64,

    /// Ticks an item rests before it is offered for destruction again.
    pub wait_before_destroy: u64,

    /// Buffer of each state delivery channel.
    pub channel_buffer_size: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            tick_unit_ms: 1_000,
            wait_before_provision: 5,
            wait_before_destroy: 5,
            channel_buffer_size: 64,
        }
    }
}

impl ModelOptions {
    pub fn tick_unit(&self) -> Duration {
        Duration::from_millis(self.tick_unit_ms)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.tick_unit_ms == 0 {
            return Err(OptionsError::ZeroDuration("tick unit"));
        }
        if self.channel_buffer_size < MIN_CHANNEL_BUFFER {
            return Err(OptionsError::BufferTooSmall {
                got: self.channel_buffer_size,
                min: MIN_CHANNEL_BUFFER,
            });
        }
        if self.wait_before_provision < MIN_WAIT_TICKS {
            return Err(OptionsError::WaitTooShort {
                which: "wait before provision",
                got: self.wait_before_provision,
                min: MIN_WAIT_TICKS,
            });
        }
        if self.wait_before_destroy < MIN_WAIT_TICKS {
            return Err(OptionsError::WaitTooShort {
                which: "wait before destroy",
                got: self.wait_before_destroy,
                min: MIN_WAIT_TICKS,
            });
        }
        Ok(())
    }
}
