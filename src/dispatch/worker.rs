use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_channel::Receiver;

use super::{Call, DispatchKey};

/// Счётчики пула, общие для пула и его рабочих потоков.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
    pub(crate) workers: AtomicUsize,
    pub(crate) submitted: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) panicked: AtomicU64,
}

/// Цикл рабочего потока: ждать вызов, выполнить, выбросить, повторить.
///
/// Цикл завершается только когда закрыты все отправители, то есть вместе
/// с пулом. Паника внутри вызова перехватывается и логируется, поток
/// продолжает работу.
pub(crate) fn run(
    key: DispatchKey,
    receiver: Receiver<Call>,
    metrics: Arc<PoolMetrics>,
) {
    tracing::debug!(%key, "deferred call worker started");

    for call in receiver.iter() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
            metrics.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %key,
                panic = panic_message(payload.as_ref()).unwrap_or("<non-string payload>"),
                "deferred call panicked"
            );
        }
        metrics.executed.fetch_add(1, Ordering::Relaxed);
    }

    tracing::debug!(%key, "deferred call worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}
