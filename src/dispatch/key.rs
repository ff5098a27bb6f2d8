use std::fmt;

use serde::{Deserialize, Serialize};

/// Приоритет планирования, который потребляет планировщик хоста.
///
/// Чем больше значение, тем выше приоритет готового к выполнению потока.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub u32);

/// Привязка к ядру процессора.
///
/// `Current` является маркером, а не реальным ядром: он разрешается в привязку
/// вызывающего потока в момент постановки вызова в очередь.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Affinity {
    /// Любое ядро.
    Any,
    /// Конкретное ядро.
    Core(u16),
    /// Привязка текущего потока (разрешается при отправке).
    Current,
}

/// Ключ очереди отложенных вызовов: пара (приоритет, привязка).
///
/// Привязка в ключе всегда разрешена: `Affinity::Current` здесь не
/// встречается.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchKey {
    priority: Priority,
    affinity: Affinity,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Priority {
    /// Самый низкий приоритет (idle).
    pub const IDLE: Priority = Priority(0);
    /// Приоритет основной задачи приложения.
    pub const MAIN: Priority = Priority(1);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Affinity {
    /// Разрешает маркер `Current` через переданную функцию.
    ///
    /// Если и она вернула `Current`, используется `Any`.
    pub fn resolve(
        self,
        current: impl FnOnce() -> Affinity,
    ) -> Affinity {
        match self {
            Affinity::Current => match current() {
                Affinity::Current => Affinity::Any,
                resolved => resolved,
            },
            fixed => fixed,
        }
    }

    pub fn is_current(self) -> bool {
        matches!(self, Affinity::Current)
    }

    /// Односимвольное обозначение ядра для имени рабочего потока.
    pub(crate) fn as_char(self) -> char {
        match self {
            Affinity::Any => '*',
            Affinity::Core(core) if core < 10 => char::from(b'0' + core as u8),
            Affinity::Core(_) | Affinity::Current => '?',
        }
    }
}

impl DispatchKey {
    /// Создаёт ключ из приоритета и уже разрешённой привязки.
    pub fn new(
        priority: Priority,
        affinity: Affinity,
    ) -> Self {
        debug_assert!(
            !affinity.is_current(),
            "dispatch key requires a resolved affinity"
        );
        Self { priority, affinity }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Имя рабочего потока для этого ключа, например `DefCalls-p5c1`.
    pub fn worker_name(
        &self,
        prefix: &str,
    ) -> String {
        format!("{prefix}-{self}")
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Affinity {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Affinity::Any => f.write_str("any"),
            Affinity::Core(core) => write!(f, "core{core}"),
            Affinity::Current => f.write_str("current"),
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "p{}c{}", self.priority, self.affinity.as_char())
    }
}
