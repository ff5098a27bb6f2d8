use serde::{Deserialize, Serialize};

use super::TaskbusError;

/// What to do with an unrecoverable error.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalPolicy {
    /// Unwind the calling thread with the error message.
    #[default]
    Panic,
    /// Terminate the process immediately.
    Abort,
}

/// Signals an unrecoverable error: logs it, then panics or aborts.
///
/// There is no way back to the caller; these errors are contract violations
/// (duplicate subscription name) or sustained resource exhaustion (a full
/// deferred calls queue).
#[cold]
#[track_caller]
pub fn raise(
    policy: FatalPolicy,
    err: impl Into<TaskbusError>,
) -> ! {
    let err = err.into();
    tracing::error!(error = %err, ?policy, "unrecoverable error");

    match policy {
        FatalPolicy::Panic => panic!("{err}"),
        FatalPolicy::Abort => std::process::abort(),
    }
}
