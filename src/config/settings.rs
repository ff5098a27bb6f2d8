use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

use crate::{FatalPolicy, Priority};

pub const DEFAULT_QUEUE_CAPACITY: usize = 20;
pub const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WORKER_STACK_SIZE: usize = 64 * 1024;
pub const DEFAULT_WORKER_NAME_PREFIX: &str = "DefCalls";
pub const DEFAULT_NAME_LENGTH: usize = 16;

/// Flat runtime settings, loaded from defaults and `TASKBUS_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue_capacity: usize,
    pub submit_timeout_ms: u64,
    pub worker_stack_size: usize,
    pub worker_name_prefix: String,
    pub default_priority: u32,
    pub name_length: usize,
    pub fatal_policy: FatalPolicy,
}

/// Deferred calls pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Pending calls per (priority, affinity) queue.
    pub queue_capacity: usize,
    /// How long `submit` waits for room in a full queue.
    pub submit_timeout: Duration,
    pub worker_stack_size: usize,
    pub worker_name_prefix: String,
    /// Priority reported for threads the scheduler knows nothing about.
    pub default_priority: Priority,
    pub fatal_policy: FatalPolicy,
}

/// Subscription registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Length of auto-generated subscription names.
    pub name_length: usize,
    pub fatal_policy: FatalPolicy,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("TASKBUS")
    }

    pub fn load_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let cfg = Config::builder()
            // Adding default values
            .set_default("queue_capacity", defaults.queue_capacity as u64)?
            .set_default("submit_timeout_ms", defaults.submit_timeout_ms)?
            .set_default("worker_stack_size", defaults.worker_stack_size as u64)?
            .set_default("worker_name_prefix", defaults.worker_name_prefix)?
            .set_default("default_priority", defaults.default_priority as u64)?
            .set_default("name_length", defaults.name_length as u64)?
            .set_default("fatal_policy", "panic")?
            // Environment variables with the given prefix, e.g. TASKBUS_QUEUE_CAPACITY
            .add_source(Environment::with_prefix(prefix).try_parsing(true))
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.submit_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "submit_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.name_length == 0 {
            return Err(ConfigError::Message(
                "name_length must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            queue_capacity: self.queue_capacity,
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
            worker_stack_size: self.worker_stack_size,
            worker_name_prefix: self.worker_name_prefix.clone(),
            default_priority: Priority(self.default_priority),
            fatal_policy: self.fatal_policy,
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            name_length: self.name_length,
            fatal_policy: self.fatal_policy,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            submit_timeout_ms: DEFAULT_SUBMIT_TIMEOUT_MS,
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            default_priority: Priority::MAIN.get(),
            name_length: DEFAULT_NAME_LENGTH,
            fatal_policy: FatalPolicy::Panic,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Settings::default().dispatch()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Settings::default().registry()
    }
}
