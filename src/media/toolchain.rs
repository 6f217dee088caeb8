//! Абстракция внешнего медиа-инструментария
//!
//! Все операции над аудио и видео проходят через этот трейт, чтобы ядро
//! ресинхронизации можно было проверять без ffmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::media::mixer::DuckingPlan;

/// Операции над медиафайлами.
///
/// Все промежуточные клипы приводятся к единому формату (WAV PCM 16 бит,
/// моно, частота дискретизации из конфигурации), поэтому их можно
/// склеивать без перекодирования.
#[async_trait]
pub trait MediaToolchain: Send + Sync {
    /// Длительность медиафайла в секундах
    async fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Извлечь речевую дорожку: моно, заданная частота, WAV
    async fn extract_speech_audio(&self, input: &Path, sample_rate: u32, output: &Path)
        -> Result<()>;

    /// Вырезать фрагмент `[start, start + duration)` из аудиофайла
    async fn slice(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()>;

    /// Привести клип к единому формату без изменения темпа
    async fn normalize(&self, input: &Path, output: &Path) -> Result<()>;

    /// Применить цепочку проходов `atempo` и дополнить/обрезать результат
    /// ровно до `target_duration` секунд
    async fn time_stretch(
        &self,
        input: &Path,
        passes: &[f64],
        target_duration: f64,
        output: &Path,
    ) -> Result<()>;

    /// Сгенерировать тишину заданной длительности
    async fn silence(&self, duration: f64, output: &Path) -> Result<()>;

    /// Склеить клипы единого формата в порядке следования
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;

    /// Приглушить оригинальную дорожку по плану и смешать с синтезированной
    async fn duck_mix(
        &self,
        original: &Path,
        speech: &Path,
        plan: &DuckingPlan,
        output: &Path,
    ) -> Result<()>;

    /// Собрать итоговое видео: видеопоток копируется, аудио кодируется в AAC
    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;
}
