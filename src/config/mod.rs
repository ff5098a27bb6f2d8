pub mod settings;

pub use settings::{DispatchConfig, RegistryConfig, Settings};
