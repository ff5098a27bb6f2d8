//! Отложенные вызовы с учётом приоритета и привязки к ядру.
//!
//! - `key`: приоритет, привязка и ключ очереди.
//! - `pool`: пул очередей [`DeferredCalls`], создаваемых по требованию.
//! - `scheduler`: интерфейс планировщика хоста и реализация на
//!   `std::thread`.
//! - `worker` (приватный): цикл рабочего потока.

pub mod key;
pub mod pool;
pub mod scheduler;
mod worker;

pub use key::{Affinity, DispatchKey, Priority};
pub use pool::{Call, DeferredCalls, PoolStats};
pub use scheduler::{Scheduler, ThreadScheduler, WorkerBody, WorkerSpec};
