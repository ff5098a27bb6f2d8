use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use super::{
    name::generate as generate_name,
    recursion::{Deferred, RecursionQueue},
    Callback, SubscribeOptions, Subscription,
};
use crate::{
    config::RegistryConfig, error::fatal, Affinity, DeferredCalls, Priority, RegistryError,
};

/// Подписки одного канала, упорядоченные по имени.
type ChannelSubscriptions<A> = BTreeMap<String, Subscription<A>>;
/// Канал → подписки.
type SubscriptionMap<A> = BTreeMap<String, ChannelSubscriptions<A>>;

/// Сколько раз генерировать имя, прежде чем признать, что свободных нет.
const MAX_NAME_ATTEMPTS: usize = 1024;

/// Брокер Pub/Sub с типизированными аргументами `A`.
///
/// Поддерживает:
/// - Синхронную доставку в потоке публикующего и асинхронную через
///   [`DeferredCalls`] с приоритетом и привязкой подписки
/// - Рекурсивные вызовы из колбэков (publish/subscribe/unsubscribe/clear)
/// - Канонический порядок доставки: лексикографический по имени подписки
///
/// Блокировка реестра никогда не ждёт: если её не удалось захватить сразу,
/// операция ставится в очередь рекурсивных вызовов и выполняется тем, кто
/// блокировку держит, после её освобождения.
pub struct Broker<A> {
    /// Каналы → подписки, упорядоченные по имени
    subscriptions: RwLock<SubscriptionMap<A>>,
    /// Операции, отложенные из-за занятой блокировки
    recursive: RecursionQueue<A>,
    /// Пул для асинхронной доставки
    dispatcher: Arc<DeferredCalls>,
    config: RegistryConfig,
    metrics: BrokerMetrics,
}

/// Счётчики брокера.
#[derive(Debug, Default)]
struct BrokerMetrics {
    publish_count: AtomicU64,
    deferred_count: AtomicU64,
    sync_deliveries: AtomicU64,
    async_deliveries: AtomicU64,
}

/// Снимок статистики брокера.
///
/// # Поля
/// * `publish_count` - кол-во выполненных публикаций (sync и async).
/// * `deferred_count` - кол-во операций, ушедших в очередь рекурсивных
///   вызовов.
/// * `sync_deliveries` - кол-во вызовов колбэков в потоке публикующего.
/// * `async_deliveries` - кол-во доставок, переданных в пул.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub publish_count: u64,
    pub deferred_count: u64,
    pub sync_deliveries: u64,
    pub async_deliveries: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<A> Broker<A>
where
    A: Clone + Send + 'static,
{
    /// Создаёт брокер поверх заданного пула отложенных вызовов.
    pub fn new(dispatcher: Arc<DeferredCalls>) -> Self {
        Self::with_config(dispatcher, RegistryConfig::default())
    }

    pub fn with_config(
        dispatcher: Arc<DeferredCalls>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(BTreeMap::new()),
            recursive: RecursionQueue::new(),
            dispatcher,
            config,
            metrics: BrokerMetrics::default(),
        }
    }

    /// Публикация в канал.
    ///
    /// Подписки обходятся в порядке имён. Подписки с `always_async`
    /// передаются в пул, остальные вызываются здесь же, до перехода к
    /// следующей. Публикация в неизвестный канал ничего не делает.
    pub fn publish(
        &self,
        channel: &str,
        args: A,
    ) {
        // recursive: вложенная публикация из синхронного колбэка проходит
        // даже при ожидающем писателе
        match self.subscriptions.try_read_recursive() {
            Some(map) => {
                self.publish_unguarded(&map, channel, args);
                drop(map);
                self.run_queued_calls();
            }
            None => self.defer(Deferred::Publish {
                channel: channel.to_owned(),
                args,
            }),
        }
    }

    /// Асинхронная публикация: каждая подписка канала уходит в пул со
    /// своим приоритетом и привязкой, независимо от `always_async`.
    pub fn publish_async(
        &self,
        channel: &str,
        args: A,
    ) {
        self.dispatch_async(channel, args, None);
    }

    /// Как [`Broker::publish_async`], но с приоритетом `priority` вместо
    /// приоритета подписки. Привязка подписки сохраняется.
    pub fn publish_async_with_priority(
        &self,
        channel: &str,
        args: A,
        priority: Priority,
    ) {
        self.dispatch_async(channel, args, Some(priority));
    }

    /// Подписка на канал.
    ///
    /// Если `name` не задано, генерируется случайное имя, не занятое ни в
    /// реестре, ни в очереди отложенных подписок канала. Повтор явного
    /// имени в канале является неустранимой ошибкой; существующая подписка
    /// не перезаписывается.
    ///
    /// # Возвращает
    /// - Имя подписки, нужное для [`Broker::unsubscribe`].
    pub fn subscribe<F>(
        &self,
        channel: &str,
        name: Option<&str>,
        callback: F,
        options: SubscribeOptions,
    ) -> String
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let callback: Callback<A> = Arc::new(callback);
        let subscription = Subscription::new(callback, options);

        match name {
            Some(name) => {
                self.insert(channel, name.to_owned(), subscription);
                name.to_owned()
            }
            None => self.insert_generated(channel, subscription),
        }
    }

    /// Синхронная подписка с приоритетом и привязкой текущего потока.
    pub fn subscribe_sync<F>(
        &self,
        channel: &str,
        callback: F,
    ) -> String
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let options = SubscribeOptions::sync(self.current_priority(), self.current_affinity());
        self.subscribe(channel, None, callback, options)
    }

    /// Асинхронная подписка с приоритетом и привязкой текущего потока.
    pub fn subscribe_async<F>(
        &self,
        channel: &str,
        callback: F,
    ) -> String
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let options =
            SubscribeOptions::always_async(self.current_priority(), self.current_affinity());
        self.subscribe(channel, None, callback, options)
    }

    /// Асинхронная подписка с заданным приоритетом и привязкой текущего
    /// потока.
    pub fn subscribe_async_with_priority<F>(
        &self,
        channel: &str,
        callback: F,
        priority: Priority,
    ) -> String
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let options = SubscribeOptions::always_async(priority, self.current_affinity());
        self.subscribe(channel, None, callback, options)
    }

    /// Синхронная подписка под явным именем.
    pub fn subscribe_sync_named<F>(
        &self,
        channel: &str,
        name: &str,
        callback: F,
    ) where
        F: Fn(A) + Send + Sync + 'static,
    {
        let options = SubscribeOptions::sync(self.current_priority(), self.current_affinity());
        self.subscribe(channel, Some(name), callback, options);
    }

    /// Асинхронная подписка под явным именем.
    pub fn subscribe_async_named<F>(
        &self,
        channel: &str,
        name: &str,
        callback: F,
    ) where
        F: Fn(A) + Send + Sync + 'static,
    {
        let options =
            SubscribeOptions::always_async(self.current_priority(), self.current_affinity());
        self.subscribe(channel, Some(name), callback, options);
    }

    /// Удаляет подписку. Если её нет, ничего не делает.
    pub fn unsubscribe(
        &self,
        channel: &str,
        name: &str,
    ) {
        match self.subscriptions.try_write() {
            Some(mut map) => {
                if let Some(subscribers) = map.get_mut(channel) {
                    subscribers.remove(name);
                }
                drop(map);
                self.run_queued_calls();
            }
            None => self.defer(Deferred::Unsubscribe {
                channel: channel.to_owned(),
                name: name.to_owned(),
            }),
        }
    }

    /// Удаляет все подписки канала. Сам канал остаётся пустым.
    pub fn clear_channel(
        &self,
        channel: &str,
    ) {
        match self.subscriptions.try_write() {
            Some(mut map) => {
                if let Some(subscribers) = map.get_mut(channel) {
                    subscribers.clear();
                }
                drop(map);
                self.run_queued_calls();
            }
            None => self.defer(Deferred::ClearChannel {
                channel: channel.to_owned(),
            }),
        }
    }

    /// Удаляет все подписки всех каналов.
    pub fn clear(&self) {
        match self.subscriptions.try_write() {
            Some(mut map) => {
                map.clear();
                drop(map);
                self.run_queued_calls();
            }
            None => self.defer(Deferred::ClearAll),
        }
    }

    /// Имена известных каналов, включая опустевшие.
    pub fn channels(&self) -> Vec<String> {
        self.inspect(|map| map.keys().cloned().collect())
    }

    /// Имена подписок канала в порядке доставки.
    pub fn subscriber_names(
        &self,
        channel: &str,
    ) -> Vec<String> {
        self.inspect(|map| {
            map.get(channel)
                .map(|subscribers| subscribers.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn subscriber_count(
        &self,
        channel: &str,
    ) -> usize {
        self.inspect(|map| map.get(channel).map_or(0, BTreeMap::len))
    }

    /// Кол-во операций, ожидающих в очереди рекурсивных вызовов.
    pub fn queued_calls(&self) -> usize {
        self.recursive.len()
    }

    pub fn dispatcher(&self) -> &Arc<DeferredCalls> {
        &self.dispatcher
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            publish_count: self.metrics.publish_count.load(Ordering::Relaxed),
            deferred_count: self.metrics.deferred_count.load(Ordering::Relaxed),
            sync_deliveries: self.metrics.sync_deliveries.load(Ordering::Relaxed),
            async_deliveries: self.metrics.async_deliveries.load(Ordering::Relaxed),
        }
    }

    /// Читает реестр под блокировкой, затем разбирает очередь: операции,
    /// отложенные пока блокировка была у нас, иначе остались бы в ней.
    fn inspect<R>(
        &self,
        read: impl FnOnce(&SubscriptionMap<A>) -> R,
    ) -> R {
        let result = read(&self.subscriptions.read_recursive());
        self.run_queued_calls();
        result
    }

    fn current_priority(&self) -> Priority {
        self.dispatcher.scheduler().current_priority()
    }

    fn current_affinity(&self) -> Affinity {
        self.dispatcher.scheduler().current_affinity()
    }

    fn dispatch_async(
        &self,
        channel: &str,
        args: A,
        priority: Option<Priority>,
    ) {
        match self.subscriptions.try_read_recursive() {
            Some(map) => {
                self.publish_async_unguarded(&map, channel, args, priority);
                drop(map);
                self.run_queued_calls();
            }
            None => self.defer(Deferred::PublishAsync {
                channel: channel.to_owned(),
                args,
                priority,
            }),
        }
    }

    fn insert(
        &self,
        channel: &str,
        name: String,
        subscription: Subscription<A>,
    ) {
        match self.subscriptions.try_write() {
            Some(mut map) => {
                let result = Self::subscribe_unguarded(&mut map, channel, name, subscription);
                drop(map);
                if let Err(err) = result {
                    fatal::raise(self.config.fatal_policy, err);
                }
                self.run_queued_calls();
            }
            None => {
                self.recursive.claim(channel, &name);
                self.defer(Deferred::Subscribe {
                    channel: channel.to_owned(),
                    name,
                    subscription,
                });
            }
        }
    }

    /// Вставляет подписку под сгенерированным именем и возвращает его.
    ///
    /// Имя выбирается сразу, даже если сама вставка откладывается, поэтому
    /// оно проверяется и по реестру, и по именам отложенных подписок.
    fn insert_generated(
        &self,
        channel: &str,
        subscription: Subscription<A>,
    ) -> String {
        if let Some(mut map) = self.subscriptions.try_write() {
            let subscribers = map.entry(channel.to_owned()).or_default();
            let name = self.unclaimed_name(channel, |name| {
                !subscribers.contains_key(name) && !self.recursive.is_claimed(channel, name)
            });
            let name = match name {
                Ok(name) => name,
                Err(err) => {
                    drop(map);
                    fatal::raise(self.config.fatal_policy, err)
                }
            };
            subscribers.insert(name.clone(), subscription);
            drop(map);
            self.run_queued_calls();
            return name;
        }

        // Писатели не вызывают пользовательский код, поэтому ожидание
        // чтения здесь не может зациклиться на собственном потоке.
        let name = {
            let map = self.subscriptions.read_recursive();
            let subscribers = map.get(channel);
            self.unclaimed_name(channel, |name| {
                !subscribers.is_some_and(|subscribers| subscribers.contains_key(name))
                    && self.recursive.try_claim(channel, name)
            })
        };
        let name = match name {
            Ok(name) => name,
            Err(err) => fatal::raise(self.config.fatal_policy, err),
        };
        self.defer(Deferred::Subscribe {
            channel: channel.to_owned(),
            name: name.clone(),
            subscription,
        });
        name
    }

    /// Генерирует имена, пока `accept` не примет одно из них.
    fn unclaimed_name(
        &self,
        channel: &str,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String, RegistryError> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = generate_name(self.config.name_length);
            if accept(&name) {
                return Ok(name);
            }
            tracing::debug!(channel, name = %name, "generated subscription name taken, retrying");
        }
        Err(RegistryError::NamesExhausted {
            channel: channel.to_owned(),
            length: self.config.name_length,
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    fn publish_unguarded(
        &self,
        map: &SubscriptionMap<A>,
        channel: &str,
        args: A,
    ) {
        tracing::debug!(channel, "publishing");
        self.metrics.publish_count.fetch_add(1, Ordering::Relaxed);

        let Some(subscribers) = map.get(channel) else {
            return;
        };
        for (name, subscription) in subscribers {
            if subscription.is_always_async() {
                tracing::debug!(channel, subscriber = %name, "~> deferred");
                self.metrics.async_deliveries.fetch_add(1, Ordering::Relaxed);
                self.dispatcher.submit(
                    subscription.bind(args.clone()),
                    subscription.priority(),
                    subscription.affinity(),
                );
            } else {
                tracing::debug!(channel, subscriber = %name, "-> inline");
                self.metrics.sync_deliveries.fetch_add(1, Ordering::Relaxed);
                subscription.deliver(args.clone());
            }
        }
    }

    fn publish_async_unguarded(
        &self,
        map: &SubscriptionMap<A>,
        channel: &str,
        args: A,
        priority: Option<Priority>,
    ) {
        tracing::debug!(channel, ?priority, "publishing async");
        self.metrics.publish_count.fetch_add(1, Ordering::Relaxed);

        let Some(subscribers) = map.get(channel) else {
            return;
        };
        for (name, subscription) in subscribers {
            tracing::debug!(channel, subscriber = %name, "~> deferred");
            self.metrics.async_deliveries.fetch_add(1, Ordering::Relaxed);
            self.dispatcher.submit(
                subscription.bind(args.clone()),
                priority.unwrap_or(subscription.priority()),
                subscription.affinity(),
            );
        }
    }

    fn subscribe_unguarded(
        map: &mut SubscriptionMap<A>,
        channel: &str,
        name: String,
        subscription: Subscription<A>,
    ) -> Result<(), RegistryError> {
        match map.entry(channel.to_owned()).or_default().entry(name) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateName {
                channel: channel.to_owned(),
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(subscription);
                Ok(())
            }
        }
    }

    /// Ставит операцию в очередь рекурсивных вызовов.
    ///
    /// Если к этому моменту блокировку уже отпустили, очередь разбирается
    /// сразу: иначе операция ждала бы следующего вызова брокера.
    fn defer(
        &self,
        call: Deferred<A>,
    ) {
        tracing::debug!(op = call.kind(), "registry busy, deferring call");
        self.metrics.deferred_count.fetch_add(1, Ordering::Relaxed);
        self.recursive.push(call);

        if !self.subscriptions.is_locked() {
            self.run_queued_calls();
        }
    }

    /// Выполняет операции, накопленные в очереди рекурсивных вызовов.
    ///
    /// Очередь сначала целиком забирается в локальную копию под её
    /// мьютексом, затем операции выполняются по порядку без блокировок.
    /// Новые операции, поставленные во время выполнения, попадают уже в
    /// общую очередь.
    ///
    /// Если операция паникует (неустранимая ошибка при `FatalPolicy::Panic`),
    /// оставшиеся операции возвращаются в начало общей очереди, а паника
    /// пробрасывается дальше.
    fn run_queued_calls(&self) {
        let mut calls = self.recursive.take();
        while let Some(call) = calls.pop_front() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.replay(call)));
            if let Err(payload) = result {
                tracing::debug!(remaining = calls.len(), "queued call panicked, requeueing the rest");
                self.recursive.requeue_front(calls);
                panic::resume_unwind(payload);
            }
        }
    }

    fn replay(
        &self,
        call: Deferred<A>,
    ) {
        match call {
            Deferred::Publish { channel, args } => self.publish(&channel, args),
            Deferred::PublishAsync {
                channel,
                args,
                priority,
            } => self.dispatch_async(&channel, args, priority),
            Deferred::Subscribe {
                channel,
                name,
                subscription,
            } => {
                self.insert(&channel, name.clone(), subscription);
                self.recursive.release(&channel, &name);
            }
            Deferred::Unsubscribe { channel, name } => self.unsubscribe(&channel, &name),
            Deferred::ClearChannel { channel } => self.clear_channel(&channel),
            Deferred::ClearAll => self.clear(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

impl<A> fmt::Debug for Broker<A> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::Mutex,
        time::Duration,
    };

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::config::DispatchConfig;

    type Log = Arc<Mutex<Vec<String>>>;

    fn broker() -> Arc<Broker<i32>> {
        let dispatcher = Arc::new(DeferredCalls::new(DispatchConfig {
            submit_timeout: Duration::from_millis(500),
            ..Default::default()
        }));
        Arc::new(Broker::new(dispatcher))
    }

    fn sync_opts() -> SubscribeOptions {
        SubscribeOptions::sync(Priority::MAIN, Affinity::Any)
    }

    fn recorder(
        log: &Log,
        tag: &'static str,
    ) -> impl Fn(i32) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |arg| log.lock().unwrap().push(format!("{tag}={arg}"))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Тест проверяет, что синхронная подписка вызывается до возврата из
    /// `publish`.
    #[test]
    fn test_publish_sync_inline() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("topic1", None, recorder(&log, "arg"), sync_opts());

        log.lock().unwrap().push("before".into());
        broker.publish("topic1", 42);
        log.lock().unwrap().push("after".into());

        assert_eq!(entries(&log), vec!["before", "arg=42", "after"]);
        assert_eq!(broker.stats().sync_deliveries, 1);
    }

    /// Тест проверяет, что порядок доставки определяется именем, а не
    /// порядком подписки.
    #[test]
    fn test_delivery_order_is_lexicographic() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("chan", Some("b"), recorder(&log, "b"), sync_opts());
        broker.subscribe("chan", Some("a"), recorder(&log, "a"), sync_opts());
        broker.subscribe("chan", Some("ab"), recorder(&log, "ab"), sync_opts());

        broker.publish("chan", 1);

        assert_eq!(entries(&log), vec!["a=1", "ab=1", "b=1"]);
        assert_eq!(broker.subscriber_names("chan"), vec!["a", "ab", "b"]);
    }

    /// Тест проверяет, что публикация в неизвестный канал ничего не
    /// делает и канал не создаёт.
    #[test]
    fn test_publish_to_unknown_channel() {
        let broker = broker();
        broker.publish("nochan", 1);

        assert!(broker.channels().is_empty());
        assert_eq!(broker.stats().publish_count, 1);
        assert_eq!(broker.stats().sync_deliveries, 0);
    }

    /// Тест проверяет вложенную публикацию из синхронного колбэка.
    #[test]
    fn test_recursive_publish_runs_inline() {
        let broker = broker();
        let log = Log::default();

        let inner = Arc::clone(&broker);
        let outer_log = Arc::clone(&log);
        broker.subscribe(
            "topic3",
            None,
            move |arg| {
                inner.publish("topic4", 44);
                outer_log.lock().unwrap().push(format!("arg1={arg}"));
            },
            sync_opts(),
        );
        broker.subscribe("topic4", None, recorder(&log, "arg2"), sync_opts());

        broker.publish("topic3", 43);

        assert_eq!(entries(&log), vec!["arg2=44", "arg1=43"]);
        assert_eq!(broker.queued_calls(), 0);
    }

    /// Тест проверяет, что подписка из колбэка становится видимой только
    /// после завершения внешней публикации.
    #[test]
    fn test_subscription_from_callback_is_deferred() {
        let broker = broker();
        let log = Log::default();

        let inner = Arc::clone(&broker);
        let outer_log = Arc::clone(&log);
        broker.subscribe(
            "topic5",
            None,
            move |arg| {
                inner.subscribe("topic6", None, recorder(&outer_log, "arg6"), sync_opts());
                inner.publish("topic6", 44);
                outer_log.lock().unwrap().push(format!("arg5={arg}"));
            },
            sync_opts(),
        );

        broker.publish("topic5", 43);
        assert_eq!(entries(&log), vec!["arg5=43"]);
        assert_eq!(broker.subscriber_count("topic6"), 1);
        assert!(broker.stats().deferred_count >= 1);

        broker.publish("topic6", 45);
        assert_eq!(entries(&log), vec!["arg5=43", "arg6=45"]);
    }

    /// Тест проверяет отложенную отписку самого себя из колбэка.
    #[test]
    fn test_unsubscribe_from_callback() {
        let broker = broker();
        let log = Log::default();

        let inner = Arc::clone(&broker);
        let once_log = Arc::clone(&log);
        broker.subscribe(
            "once",
            Some("self"),
            move |arg| {
                once_log.lock().unwrap().push(format!("once={arg}"));
                inner.unsubscribe("once", "self");
            },
            sync_opts(),
        );

        broker.publish("once", 1);
        broker.publish("once", 2);

        assert_eq!(entries(&log), vec!["once=1"]);
        assert_eq!(broker.subscriber_count("once"), 0);
        assert_eq!(broker.channels(), vec!["once"]);
    }

    /// Тест проверяет, что повтор явного имени роняет поток, а
    /// исходная подписка остаётся.
    #[test]
    fn test_duplicate_explicit_name_is_fatal() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("dup", Some("h"), recorder(&log, "first"), sync_opts());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            broker.subscribe("dup", Some("h"), recorder(&log, "second"), sync_opts());
        }));
        assert!(result.is_err());

        broker.publish("dup", 7);
        assert_eq!(entries(&log), vec!["first=7"]);
        assert_eq!(broker.subscriber_count("dup"), 1);
    }

    /// Тест проверяет, что одно и то же имя допустимо в разных каналах.
    #[test]
    fn test_same_name_in_different_channels() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("left", Some("h"), recorder(&log, "left"), sync_opts());
        broker.subscribe("right", Some("h"), recorder(&log, "right"), sync_opts());

        broker.publish("right", 2);
        broker.publish("left", 1);

        assert_eq!(entries(&log), vec!["right=2", "left=1"]);
    }

    /// Тест проверяет, что сгенерированные имена не совпадают, пока
    /// свободные имена есть, а исчерпание пространства имён фатально.
    #[test]
    fn test_generated_names_fill_namespace_then_fail() {
        let dispatcher = Arc::new(DeferredCalls::default());
        let broker: Broker<i32> = Broker::with_config(
            dispatcher,
            RegistryConfig {
                name_length: 1,
                ..Default::default()
            },
        );

        let mut names = std::collections::BTreeSet::new();
        for _ in 0..64 {
            let name = broker.subscribe("tiny", None, |_| {}, sync_opts());
            assert_eq!(name.len(), 1);
            assert!(names.insert(name));
        }
        assert_eq!(broker.subscriber_count("tiny"), 64);
        assert_eq!(broker.subscriber_names("tiny"), names.into_iter().collect::<Vec<_>>());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            broker.subscribe("tiny", None, |_| {}, sync_opts());
        }));
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("no free"), "{message}");
        assert_eq!(broker.subscriber_count("tiny"), 64);
    }

    /// Тест проверяет, что имя, сгенерированное для отложенной подписки,
    /// не выдаётся повторно, пока подписка ждёт в очереди.
    #[test]
    fn test_generated_names_skip_queued_subscriptions() {
        let dispatcher = Arc::new(DeferredCalls::default());
        let broker = Arc::new(Broker::<i32>::with_config(
            dispatcher,
            RegistryConfig {
                name_length: 1,
                ..Default::default()
            },
        ));
        let names = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&broker);
        let n = Arc::clone(&names);
        broker.subscribe(
            "spawn",
            Some("s"),
            move |_| {
                for _ in 0..63 {
                    let name = inner.subscribe("tiny", None, |_| {}, sync_opts());
                    n.lock().unwrap().push(name);
                }
            },
            sync_opts(),
        );

        broker.publish("spawn", 0);

        let mut names = names.lock().unwrap().clone();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 63);
        assert_eq!(broker.subscriber_count("tiny"), 63);
        assert_eq!(broker.queued_calls(), 0);
    }

    /// Тест проверяет, что фатальная ошибка при выполнении отложенной
    /// операции не теряет операции, стоящие за ней.
    #[test]
    fn test_failed_replay_keeps_remaining_calls() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("c", Some("h"), recorder(&log, "h"), sync_opts());

        let inner = Arc::clone(&broker);
        broker.subscribe(
            "pub",
            Some("p"),
            move |_| {
                inner.subscribe("c", Some("h"), |_| {}, sync_opts());
                inner.subscribe("z", Some("later"), |_| {}, sync_opts());
            },
            sync_opts(),
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| broker.publish("pub", 0)));
        assert!(result.is_err());
        assert_eq!(broker.queued_calls(), 1);

        broker.publish("idle", 0);

        assert_eq!(broker.queued_calls(), 0);
        assert_eq!(broker.subscriber_count("z"), 1);
        assert_eq!(broker.subscriber_count("c"), 1);
    }

    /// Тест проверяет, что операция, отложенная при свободной блокировке,
    /// выполняется сразу тем же потоком.
    #[test]
    fn test_defer_with_free_lock_runs_immediately() {
        let broker = broker();
        let log = Log::default();
        let callback: Callback<i32> = Arc::new(recorder(&log, "late"));

        broker.recursive.claim("d", "late");
        broker.defer(Deferred::Subscribe {
            channel: "d".into(),
            name: "late".into(),
            subscription: Subscription::new(callback, sync_opts()),
        });

        assert_eq!(broker.queued_calls(), 0);
        assert!(!broker.recursive.is_claimed("d", "late"));
        assert_eq!(broker.subscriber_count("d"), 1);
        broker.publish("d", 3);
        assert_eq!(entries(&log), vec!["late=3"]);
    }

    /// Тест проверяет очистку одного канала и всех каналов.
    #[test]
    fn test_clear_channel_and_clear_all() {
        let broker = broker();
        let log = Log::default();
        broker.subscribe("a", None, recorder(&log, "a"), sync_opts());
        broker.subscribe("b", None, recorder(&log, "b"), sync_opts());

        broker.clear_channel("a");
        broker.publish("a", 1);
        broker.publish("b", 2);
        assert_eq!(entries(&log), vec!["b=2"]);
        assert_eq!(broker.channels(), vec!["a", "b"]);

        broker.clear();
        broker.publish("b", 3);
        assert_eq!(entries(&log), vec!["b=2"]);
        assert!(broker.channels().is_empty());
    }

    /// Тест проверяет, что `always_async` подписка уходит в пул с её
    /// приоритетом.
    #[test]
    fn test_always_async_goes_through_pool() {
        let broker = broker();
        let (tx, rx) = unbounded();
        broker.subscribe(
            "async",
            Some("worker"),
            move |arg| {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send((arg, name)).unwrap();
            },
            SubscribeOptions::always_async(Priority(3), Affinity::Any),
        );

        broker.publish("async", 9);

        let (arg, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(arg, 9);
        assert_eq!(name.as_deref(), Some("DefCalls-p3c*"));
        assert_eq!(broker.stats().async_deliveries, 1);
    }

    /// Тест проверяет, что приоритет публикации заменяет только приоритет,
    /// а привязка берётся из подписки.
    #[test]
    fn test_publish_async_priority_override() {
        let broker = broker();
        let (tx, rx) = unbounded();
        broker.subscribe(
            "prio",
            None,
            move |arg| tx.send(arg).unwrap(),
            SubscribeOptions::sync(Priority(2), Affinity::Core(1)),
        );

        broker.publish_async_with_priority("prio", 5, Priority(7));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 5);
        assert_eq!(
            broker.dispatcher().keys(),
            vec![crate::DispatchKey::new(Priority(7), Affinity::Core(1))]
        );
    }

    /// Тест проверяет, что удобные формы подписки берут приоритет и
    /// привязку текущего потока.
    #[test]
    fn test_convenience_subscribe_uses_current_task() {
        let broker = broker();
        let (tx, rx) = unbounded();

        let inner = Arc::clone(&broker);
        std::thread::spawn(move || {
            crate::ThreadScheduler::enter(Priority(4), Affinity::Core(0));
            inner.subscribe_async("conv", move |arg| tx.send(arg).unwrap());
        })
        .join()
        .unwrap();

        broker.publish("conv", 11);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 11);
        assert_eq!(
            broker.dispatcher().keys(),
            vec![crate::DispatchKey::new(Priority(4), Affinity::Core(0))]
        );
    }
}
