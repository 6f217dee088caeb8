//! Модуль для работы с медиафайлами
//!
//! Определение длительности, изменение темпа, генерация тишины, склейка,
//! микширование фона и сборка итогового видео.

pub mod decode;
pub mod ffmpeg;
pub mod mixer;
pub mod tempo;
pub mod toolchain;

use std::path::{Path, PathBuf};

use crate::error::Result;

pub use ffmpeg::FfmpegToolchain;
pub use mixer::{db_to_gain, BackgroundMixer, DuckingPlan};
pub use tempo::{decompose_ratio, StretchPlan};
pub use toolchain::MediaToolchain;

/// Определить длительность медиафайла
pub async fn probe(toolchain: &dyn MediaToolchain, path: &Path) -> Result<f64> {
    toolchain.probe_duration(path).await
}

/// Сборщик итоговой дорожки и видео
pub struct Muxer<'a> {
    toolchain: &'a dyn MediaToolchain,
}

impl<'a> Muxer<'a> {
    pub fn new(toolchain: &'a dyn MediaToolchain) -> Self {
        Self { toolchain }
    }

    /// Склеить упорядоченные фрагменты в одну дорожку
    pub async fn assemble_track(&self, pieces: &[PathBuf], output: &Path) -> Result<PathBuf> {
        self.toolchain.concat(pieces, output).await?;
        log::debug!("Assembled {} pieces into {}", pieces.len(), output.display());
        Ok(output.to_path_buf())
    }

    /// Заменить аудиодорожку видео: первый видеопоток копируется,
    /// аудио кодируется в AAC
    pub async fn replace_audio(&self, video: &Path, audio: &Path, output: &Path) -> Result<PathBuf> {
        self.toolchain.mux(video, audio, output).await?;
        Ok(output.to_path_buf())
    }
}
