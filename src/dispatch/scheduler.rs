use std::{cell::Cell, io, thread};

use thread_priority::{ThreadPriority, ThreadPriorityValue};

use super::{Affinity, DispatchKey, Priority};

/// Наибольшее значение кроссплатформенного приоритета потока.
const MAX_OS_PRIORITY: u32 = 99;

/// Тело рабочего потока.
pub type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// Параметры создаваемого рабочего потока.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Имя потока, например `DefCalls-p1c*`.
    pub name: String,
    /// Приоритет и привязка, с которыми должен работать поток.
    pub key: DispatchKey,
    /// Размер стека в байтах.
    pub stack_size: usize,
}

/// Планировщик хоста.
///
/// Создаёт потоки с заданным приоритетом и привязкой к ядру и сообщает
/// приоритет и привязку вызывающего потока.
pub trait Scheduler: Send + Sync + 'static {
    /// Создаёт постоянный рабочий поток, исполняющий `body`.
    fn spawn_worker(
        &self,
        spec: WorkerSpec,
        body: WorkerBody,
    ) -> io::Result<()>;

    /// Приоритет вызывающего потока.
    fn current_priority(&self) -> Priority;

    /// Привязка вызывающего потока.
    fn current_affinity(&self) -> Affinity;
}

thread_local! {
    static CURRENT_TASK: Cell<Option<(Priority, Affinity)>> = const { Cell::new(None) };
}

/// Планировщик поверх `std::thread`.
///
/// Рабочий поток при старте привязывается к ядру своего ключа
/// (`core_affinity`) и получает приоритет ОС (`thread-priority`, значение
/// ограничено сверху 99). Если ОС отказывает, поток продолжает работу без
/// привязки или приоритета, а отказ пишется в лог.
///
/// Приоритет и привязка в терминах ключа хранятся в thread-local метке
/// потока. Рабочие потоки помечаются своим ключом автоматически; остальные
/// потоки можно пометить через [`ThreadScheduler::enter`]. Непомеченный
/// поток имеет приоритет по умолчанию, а привязку `Core(n)`, только если
/// маска ОС оставляет ему ровно одно ядро, иначе `Any`.
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    default_priority: Priority,
}

impl ThreadScheduler {
    pub fn new(default_priority: Priority) -> Self {
        Self { default_priority }
    }

    /// Помечает вызывающий поток приоритетом и привязкой.
    pub fn enter(
        priority: Priority,
        affinity: Affinity,
    ) {
        CURRENT_TASK.with(|task| task.set(Some((priority, affinity))));
    }

    /// Снимает метку с вызывающего потока.
    pub fn leave() {
        CURRENT_TASK.with(|task| task.set(None));
    }

    fn current() -> Option<(Priority, Affinity)> {
        CURRENT_TASK.with(Cell::get)
    }

    /// Применяет привязку и приоритет ключа к вызывающему потоку.
    fn apply_os_settings(key: DispatchKey) {
        if let Affinity::Core(id) = key.affinity() {
            let core = core_affinity::CoreId { id: usize::from(id) };
            if !core_affinity::set_for_current(core) {
                tracing::warn!(core = id, "failed to pin worker thread, running unpinned");
            }
        }

        let level = key.priority().get().min(MAX_OS_PRIORITY);
        let applied = u8::try_from(level)
            .map_err(|err| format!("{err}"))
            .and_then(|level| ThreadPriorityValue::try_from(level).map_err(|err| err.to_string()))
            .and_then(|value| {
                thread_priority::set_current_thread_priority(ThreadPriority::Crossplatform(value))
                    .map_err(|err| format!("{err:?}"))
            });
        if let Err(err) = applied {
            tracing::warn!(priority = level, error = %err, "failed to set worker thread priority");
        }
    }

    /// Привязка, которую ОС оставила потоку: одно ядро или любое.
    fn os_affinity() -> Affinity {
        match core_affinity::get_core_ids().as_deref() {
            Some([only]) => u16::try_from(only.id).map_or(Affinity::Any, Affinity::Core),
            _ => Affinity::Any,
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new(Priority::MAIN)
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn_worker(
        &self,
        spec: WorkerSpec,
        body: WorkerBody,
    ) -> io::Result<()> {
        let key = spec.key;
        tracing::trace!(worker = %spec.name, stack_size = spec.stack_size, "dispatch.spawn_worker");

        thread::Builder::new()
            .name(spec.name)
            .stack_size(spec.stack_size)
            .spawn(move || {
                Self::apply_os_settings(key);
                Self::enter(key.priority(), key.affinity());
                body();
            })
            .map(|_detached| ())
    }

    fn current_priority(&self) -> Priority {
        Self::current().map_or(self.default_priority, |(priority, _)| priority)
    }

    fn current_affinity(&self) -> Affinity {
        Self::current().map_or_else(Self::os_affinity, |(_, affinity)| affinity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    /// Тест проверяет значения для непомеченного потока.
    #[test]
    fn test_untagged_thread_defaults() {
        let scheduler = ThreadScheduler::new(Priority(7));
        let (priority, affinity) = thread::spawn(move || {
            (scheduler.current_priority(), scheduler.current_affinity())
        })
        .join()
        .unwrap();

        assert_eq!(priority, Priority(7));
        assert_eq!(affinity, ThreadScheduler::os_affinity());
    }

    /// Тест проверяет, что `enter`/`leave` меняют метку только текущего
    /// потока.
    #[test]
    fn test_enter_and_leave() {
        let scheduler = ThreadScheduler::default();
        thread::spawn(move || {
            ThreadScheduler::enter(Priority(3), Affinity::Core(1));
            assert_eq!(scheduler.current_priority(), Priority(3));
            assert_eq!(scheduler.current_affinity(), Affinity::Core(1));

            ThreadScheduler::leave();
            assert_eq!(scheduler.current_priority(), Priority::MAIN);
            assert_eq!(scheduler.current_affinity(), ThreadScheduler::os_affinity());
        })
        .join()
        .unwrap();
    }

    /// Тест проверяет, что рабочий поток получает имя и метку своего
    /// ключа.
    #[test]
    fn test_spawned_worker_is_tagged() {
        let scheduler = ThreadScheduler::default();
        let key = DispatchKey::new(Priority(4), Affinity::Core(0));
        let (tx, rx) = mpsc::channel();

        let observer = scheduler.clone();
        scheduler
            .spawn_worker(
                WorkerSpec {
                    name: key.worker_name("Test"),
                    key,
                    stack_size: 64 * 1024,
                },
                Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send((name, observer.current_priority(), observer.current_affinity()))
                        .unwrap();
                }),
            )
            .unwrap();

        let (name, priority, affinity) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("Test-p4c0"));
        assert_eq!(priority, Priority(4));
        assert_eq!(affinity, Affinity::Core(0));
    }

    /// Тест проверяет, что рабочий поток с привязкой `Core(0)` действительно
    /// закреплён ОС за ядром 0.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_worker_is_pinned_to_its_core() {
        let available = core_affinity::get_core_ids().unwrap_or_default();
        if !available.contains(&core_affinity::CoreId { id: 0 }) {
            return;
        }

        let scheduler = ThreadScheduler::default();
        let key = DispatchKey::new(Priority(1), Affinity::Core(0));
        let (tx, rx) = mpsc::channel();

        scheduler
            .spawn_worker(
                WorkerSpec {
                    name: key.worker_name("Pin"),
                    key,
                    stack_size: 64 * 1024,
                },
                Box::new(move || {
                    tx.send((core_affinity::get_core_ids(), ThreadScheduler::os_affinity()))
                        .unwrap();
                }),
            )
            .unwrap();

        let (cores, affinity) = rx.recv().unwrap();
        assert_eq!(cores, Some(vec![core_affinity::CoreId { id: 0 }]));
        assert_eq!(affinity, Affinity::Core(0));
    }
}
