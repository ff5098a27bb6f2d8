//! Подсистема Publish–Subscribe (pub/sub).
//!
//! Внутрипроцессная шина событий с типизированными аргументами:
//!
//! - `broker`: реестр подписок, публикация и рекурсивные вызовы.
//! - `name` (приватный): генерация случайных имён подписок.
//! - `recursion` (приватный): очередь операций, отложенных из-за занятого
//!   реестра.
//! - `subscriber`: подписка, её колбэк и параметры доставки.
//!
//! Публичный API переэкспортирует:
//! - `broker::*`
//! - `subscriber::*`

pub mod broker;
mod name;
mod recursion;
pub mod subscriber;

pub use broker::*;
pub use subscriber::*;
