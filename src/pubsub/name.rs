use rand::{distributions::Uniform, Rng};

/// Первый символ диапазона имён (`'!'`).
const FIRST: u8 = b' ' + 1;
/// Последний символ диапазона имён (`` '`' ``).
const LAST: u8 = b' ' + 64;

/// Генерирует случайное имя подписки заданной длины.
///
/// Символы берутся из печатного диапазона `'!'..='`'`. Совпадения с
/// занятыми именами отсеивает брокер.
pub(crate) fn generate(length: usize) -> String {
    let range = Uniform::new_inclusive(FIRST, LAST);
    rand::thread_rng()
        .sample_iter(range)
        .take(length)
        .map(char::from)
        .collect()
}
