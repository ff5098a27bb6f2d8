use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    mem,
};

use parking_lot::Mutex;

use super::Subscription;
use crate::Priority;

/// Операция реестра, которая не смогла сразу захватить блокировку.
#[derive(Debug)]
pub(crate) enum Deferred<A> {
    Publish {
        channel: String,
        args: A,
    },
    PublishAsync {
        channel: String,
        args: A,
        priority: Option<Priority>,
    },
    Subscribe {
        channel: String,
        name: String,
        subscription: Subscription<A>,
    },
    Unsubscribe {
        channel: String,
        name: String,
    },
    ClearChannel {
        channel: String,
    },
    ClearAll,
}

/// Очередь отложенных (рекурсивных) операций реестра.
///
/// Защищена собственным мьютексом, который никогда не удерживается во
/// время выполнения пользовательского кода.
///
/// Рядом хранятся имена отложенных подписок, которые ещё не попали в
/// реестр (`claimed`): и в общей очереди, и в локальной копии, которую
/// сейчас выполняет другой поток. Два мьютекса никогда не берутся
/// одновременно.
#[derive(Debug)]
pub(crate) struct RecursionQueue<A> {
    calls: Mutex<VecDeque<Deferred<A>>>,
    /// (канал, имя) → кол-во ожидающих подписок с этим именем
    claimed: Mutex<HashMap<(String, String), usize>>,
}

impl<A> Deferred<A> {
    /// Короткое имя операции для логов.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Deferred::Publish { .. } => "publish",
            Deferred::PublishAsync { .. } => "publish_async",
            Deferred::Subscribe { .. } => "subscribe",
            Deferred::Unsubscribe { .. } => "unsubscribe",
            Deferred::ClearChannel { .. } => "clear_channel",
            Deferred::ClearAll => "clear",
        }
    }
}

impl<A> RecursionQueue<A> {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(VecDeque::new()),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn push(
        &self,
        call: Deferred<A>,
    ) {
        self.calls.lock().push_back(call);
    }

    /// Забирает всё содержимое очереди, оставляя общую очередь пустой.
    pub(crate) fn take(&self) -> VecDeque<Deferred<A>> {
        mem::take(&mut *self.calls.lock())
    }

    /// Возвращает невыполненные операции в начало очереди, перед теми,
    /// что были поставлены после `take`.
    pub(crate) fn requeue_front(
        &self,
        mut remaining: VecDeque<Deferred<A>>,
    ) {
        if remaining.is_empty() {
            return;
        }
        let mut calls = self.calls.lock();
        remaining.append(&mut calls);
        *calls = remaining;
    }

    /// Отмечает имя отложенной подписки как занятое.
    pub(crate) fn claim(
        &self,
        channel: &str,
        name: &str,
    ) {
        *self
            .claimed
            .lock()
            .entry((channel.to_owned(), name.to_owned()))
            .or_default() += 1;
    }

    /// Занимает имя, только если оно ещё никем не занято.
    pub(crate) fn try_claim(
        &self,
        channel: &str,
        name: &str,
    ) -> bool {
        match self.claimed.lock().entry((channel.to_owned(), name.to_owned())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(1);
                true
            }
        }
    }

    pub(crate) fn is_claimed(
        &self,
        channel: &str,
        name: &str,
    ) -> bool {
        self.claimed
            .lock()
            .contains_key(&(channel.to_owned(), name.to_owned()))
    }

    /// Снимает одну отметку с имени после выполнения подписки.
    pub(crate) fn release(
        &self,
        channel: &str,
        name: &str,
    ) {
        let mut claimed = self.claimed.lock();
        if let Entry::Occupied(mut entry) = claimed.entry((channel.to_owned(), name.to_owned())) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}
