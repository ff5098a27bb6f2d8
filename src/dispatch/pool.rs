use std::{
    collections::HashMap,
    fmt,
    sync::{atomic::Ordering, Arc},
};

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;

use super::{
    worker::{self, PoolMetrics},
    Affinity, DispatchKey, Priority, Scheduler, ThreadScheduler, WorkerSpec,
};
use crate::{config::DispatchConfig, error::fatal, DispatchError};

/// Отложенный вызов без аргументов (аргументы уже захвачены).
pub type Call = Box<dyn FnOnce() + Send + 'static>;

/// Пул отложенных вызовов.
///
/// Для каждой пары (приоритет, привязка) лениво создаётся ограниченная
/// очередь и один постоянный рабочий поток с этим приоритетом на этом ядре.
/// Созданные очереди не удаляются, пока жив пул.
///
/// Гарантии порядка:
/// - FIFO внутри одного ключа;
/// - между разными ключами порядок не определён.
pub struct DeferredCalls {
    /// Ключ → отправитель в очередь рабочего потока
    queues: Mutex<HashMap<DispatchKey, Sender<Call>>>,
    /// Планировщик хоста
    scheduler: Arc<dyn Scheduler>,
    config: DispatchConfig,
    metrics: Arc<PoolMetrics>,
}

/// Снимок статистики пула.
///
/// # Поля
/// * `workers` - кол-во созданных рабочих потоков.
/// * `submitted` - кол-во принятых вызовов.
/// * `executed` - кол-во завершённых вызовов (включая запаниковавшие).
/// * `panicked` - кол-во вызовов, завершившихся паникой.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub submitted: u64,
    pub executed: u64,
    pub panicked: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl DeferredCalls {
    /// Создаёт пул с планировщиком на `std::thread`.
    pub fn new(config: DispatchConfig) -> Self {
        let scheduler = Arc::new(ThreadScheduler::new(config.default_priority));
        Self::with_scheduler(config, scheduler)
    }

    /// Создаёт пул с заданным планировщиком хоста.
    ///
    /// Ёмкость очереди меньше 1 поднимается до 1: нулевая ёмкость
    /// превратила бы очередь в канал-рандеву.
    pub fn with_scheduler(
        mut config: DispatchConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        if config.queue_capacity == 0 {
            tracing::warn!("deferred calls queue capacity 0 is not allowed, using 1");
            config.queue_capacity = 1;
        }
        Self {
            queues: Mutex::new(HashMap::new()),
            scheduler,
            config,
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Ставит вызов в очередь `(priority, affinity)`.
    ///
    /// При первом обращении к ключу создаются очередь и рабочий поток.
    /// Если очередь заполнена, вызывающий поток ждёт до `submit_timeout`;
    /// по истечении таймаута ошибка неустранима (см. [`fatal::raise`]).
    pub fn submit<F>(
        &self,
        call: F,
        priority: Priority,
        affinity: Affinity,
    ) where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.try_submit(Box::new(call), priority, affinity) {
            fatal::raise(self.config.fatal_policy, err);
        }
    }

    /// Ставит вызов в очередь с приоритетом по умолчанию и привязкой
    /// текущего потока.
    pub fn submit_default<F>(
        &self,
        call: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.submit(call, self.config.default_priority, Affinity::Current);
    }

    /// Возвращает планировщик, через который пул создаёт рабочие потоки.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Возвращает все созданные ключи в отсортированном виде.
    pub fn keys(&self) -> Vec<DispatchKey> {
        let mut keys: Vec<_> = self.queues.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Кол-во вызовов, ожидающих в очереди ключа (0 для неизвестного ключа).
    pub fn pending(
        &self,
        key: &DispatchKey,
    ) -> usize {
        self.queues.lock().get(key).map_or(0, Sender::len)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.metrics.workers.load(Ordering::Relaxed),
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            executed: self.metrics.executed.load(Ordering::Relaxed),
            panicked: self.metrics.panicked.load(Ordering::Relaxed),
        }
    }

    fn try_submit(
        &self,
        call: Call,
        priority: Priority,
        affinity: Affinity,
    ) -> Result<(), DispatchError> {
        let affinity = affinity.resolve(|| self.scheduler.current_affinity());
        let key = DispatchKey::new(priority, affinity);
        let queue = self.queue_for(key)?;

        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        match queue.send_timeout(call, self.config.submit_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DispatchError::QueueTimeout {
                key,
                capacity: self.config.queue_capacity,
                timeout: self.config.submit_timeout,
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(DispatchError::Disconnected { key }),
        }
    }

    /// Находит очередь ключа или создаёт её вместе с рабочим потоком.
    ///
    /// Мьютекс таблицы удерживается только на время поиска и вставки.
    fn queue_for(
        &self,
        key: DispatchKey,
    ) -> Result<Sender<Call>, DispatchError> {
        let (sender, receiver) = {
            let mut queues = self.queues.lock();
            if let Some(sender) = queues.get(&key) {
                return Ok(sender.clone());
            }
            let (sender, receiver) = bounded(self.config.queue_capacity);
            queues.insert(key, sender.clone());
            (sender, receiver)
        };

        if let Err(err) = self.spawn_worker(key, receiver) {
            self.queues.lock().remove(&key);
            return Err(err);
        }
        Ok(sender)
    }

    fn spawn_worker(
        &self,
        key: DispatchKey,
        receiver: Receiver<Call>,
    ) -> Result<(), DispatchError> {
        let spec = WorkerSpec {
            name: key.worker_name(&self.config.worker_name_prefix),
            key,
            stack_size: self.config.worker_stack_size,
        };
        tracing::info!(worker = %spec.name, %key, "creating deferred calls worker");

        let metrics = Arc::clone(&self.metrics);
        self.scheduler
            .spawn_worker(spec, Box::new(move || worker::run(key, receiver, metrics)))
            .map_err(|source| DispatchError::Spawn {
                priority: key.priority(),
                affinity: key.affinity(),
                source,
            })?;

        self.metrics.workers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for DeferredCalls {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl fmt::Debug for DeferredCalls {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DeferredCalls")
            .field("keys", &self.keys())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
