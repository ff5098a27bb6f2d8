/// Runtime settings loading (`TASKBUS_*` environment).
pub mod config;
/// Deferred calls: per (priority, affinity) queues and their workers.
pub mod dispatch;
/// Error types and the fatal error policy.
pub mod error;
/// Logging setup (filters, formats).
pub mod logging;
/// Pub/Sub: Broker, Subscription, SubscribeOptions.
pub mod pubsub;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// config
pub use config::{DispatchConfig, RegistryConfig, Settings};
/// Deferred calls pool and host scheduler interface.
pub use dispatch::{
    Affinity, Call, DeferredCalls, DispatchKey, PoolStats, Priority, Scheduler, ThreadScheduler,
    WorkerBody, WorkerSpec,
};
/// Operation errors.
pub use error::{DispatchError, FatalPolicy, RegistryError, TaskbusError};
/// Logging configuration and initialization.
pub use logging::{init_logging, LogFormat, LoggingConfig};
/// Pub/Sub API.
pub use pubsub::{Broker, BrokerStats, Callback, SubscribeOptions, Subscription};
