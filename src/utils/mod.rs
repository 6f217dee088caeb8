//! Вспомогательные модули: логирование и временные файлы

pub mod logger;
pub mod temp;
