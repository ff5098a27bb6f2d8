use std::{io, time::Duration};

use thiserror::Error;

use crate::{Affinity, DispatchKey, Priority};

/// Errors raised by the deferred call pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot add entry to deferred calls queue {key}: still full (capacity {capacity}) after {timeout:?}")]
    QueueTimeout {
        key: DispatchKey,
        capacity: usize,
        timeout: Duration,
    },

    #[error("deferred calls queue {key} has no worker")]
    Disconnected { key: DispatchKey },

    #[error("cannot create calls queue worker for priority {priority}, affinity {affinity}: {source}")]
    Spawn {
        priority: Priority,
        affinity: Affinity,
        #[source]
        source: io::Error,
    },
}
