pub mod dispatch;
pub mod fatal;
pub mod pubsub;

pub use dispatch::DispatchError;
pub use fatal::FatalPolicy;
pub use pubsub::RegistryError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskbusError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}
