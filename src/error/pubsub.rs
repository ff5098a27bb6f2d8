use thiserror::Error;

/// Errors raised by the subscription registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("callback name '{name}' is already taken on channel '{channel}', NOT overwriting")]
    DuplicateName { channel: String, name: String },

    #[error("no free {length}-character callback name left on channel '{channel}' after {attempts} attempts")]
    NamesExhausted {
        channel: String,
        length: usize,
        attempts: usize,
    },
}
