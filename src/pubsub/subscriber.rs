use std::{fmt, sync::Arc};

use crate::{Affinity, Priority};

/// Колбэк подписчика с типизированными аргументами.
pub type Callback<A> = Arc<dyn Fn(A) + Send + Sync + 'static>;

/// Параметры доставки подписки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Приоритет, с которым выполняется отложенная доставка.
    pub priority: Priority,
    /// Ядро, на котором выполняется отложенная доставка.
    pub affinity: Affinity,
    /// Всегда доставлять асинхронно, даже при обычном `publish`.
    pub always_async: bool,
}

/// Подписка на канал.
///
/// Неизменяема после создания: единственная операция над ней: удаление
/// из реестра. Принадлежит реестру; подписчик хранит только имя.
pub struct Subscription<A> {
    callback: Callback<A>,
    options: SubscribeOptions,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SubscribeOptions {
    /// Синхронная доставка в потоке публикующего.
    pub fn sync(
        priority: Priority,
        affinity: Affinity,
    ) -> Self {
        Self {
            priority,
            affinity,
            always_async: false,
        }
    }

    /// Доставка всегда через пул отложенных вызовов.
    pub fn always_async(
        priority: Priority,
        affinity: Affinity,
    ) -> Self {
        Self {
            priority,
            affinity,
            always_async: true,
        }
    }
}

impl<A> Subscription<A> {
    pub(crate) fn new(
        callback: Callback<A>,
        options: SubscribeOptions,
    ) -> Self {
        Self { callback, options }
    }

    pub fn priority(&self) -> Priority {
        self.options.priority
    }

    pub fn affinity(&self) -> Affinity {
        self.options.affinity
    }

    pub fn is_always_async(&self) -> bool {
        self.options.always_async
    }

    /// Вызывает колбэк в текущем потоке.
    pub(crate) fn deliver(
        &self,
        args: A,
    ) {
        (self.callback)(args)
    }

    /// Связывает колбэк с аргументами для отложенного выполнения.
    pub(crate) fn bind(
        &self,
        args: A,
    ) -> impl FnOnce() + Send + 'static
    where
        A: Send + 'static,
    {
        let callback = Arc::clone(&self.callback);
        move || callback(args)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

impl<A> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            options: self.options,
        }
    }
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("priority", &self.options.priority)
            .field("affinity", &self.options.affinity)
            .field("always_async", &self.options.always_async)
            .finish_non_exhaustive()
    }
}
