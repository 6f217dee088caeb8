//! Основной файл библиотеки voice-resync
//!
//! Библиотека озвучивает видео клонированным голосом: получает транскрипт
//! с разметкой времени, синтезирует речь по сегментам, растягивает каждый
//! клип точно в окно исходного сегмента и собирает итоговое видео.
//! Для историй предусмотрен пакетный режим с возобновлением по секциям.

pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod sync;
pub mod transcript;
pub mod tts;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::media::{FfmpegToolchain, MediaToolchain};
use crate::pipeline::{JobHooks, MemoryStore, ProjectPipeline, StoryQueue, StoryWorker};
use crate::progress::{DefaultProgressReporter, ProgressObserver};
use crate::transcript::{GeminiTranscriber, TranscriptAdapter, TranscriptionProvider};
use crate::tts::{ClipStore, ProviderHealth, ProviderRegistry};

pub use crate::error::{PipelineError, Result};
pub use crate::model::{
    PipelineRun, RunStatus, SectionAudio, SectionStatus, StoryJob, SyncMode, Transcript,
    TranscriptSegment, VoiceProfile,
};
pub use crate::pipeline::{DubRequest, JobOutcome};

/// Результат проверки окружения
#[derive(Debug, Clone)]
pub struct DoctorReport {
    /// Версия ffmpeg или текст ошибки
    pub ffmpeg: std::result::Result<String, String>,
    pub providers: Vec<ProviderHealth>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.ffmpeg.is_ok() && self.providers.iter().all(|p| p.healthy)
    }
}

/// Точка сборки: конфигурация, инструментарий, провайдеры и хранилище
pub struct VoiceResync {
    config: PipelineConfig,
    toolchain: Arc<dyn MediaToolchain>,
    registry: ProviderRegistry,
    store: Arc<MemoryStore>,
    reporter: Arc<DefaultProgressReporter>,
}

impl VoiceResync {
    /// Собрать компоненты по конфигурации: ffmpeg и все настроенные провайдеры
    pub fn new(config: PipelineConfig, store: Arc<MemoryStore>) -> Result<Self> {
        config.validate()?;
        let toolchain: Arc<dyn MediaToolchain> =
            Arc::new(FfmpegToolchain::new(config.toolchain.clone()));
        let registry = ProviderRegistry::from_config(&config);
        Ok(Self::with_components(config, toolchain, registry, store))
    }

    pub fn with_components(
        config: PipelineConfig,
        toolchain: Arc<dyn MediaToolchain>,
        registry: ProviderRegistry,
        store: Arc<MemoryStore>,
    ) -> Self {
        Self {
            config,
            toolchain,
            registry,
            store,
            reporter: Arc::new(DefaultProgressReporter::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn toolchain(&self) -> Arc<dyn MediaToolchain> {
        self.toolchain.clone()
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Добавить наблюдателя прогресса
    pub fn add_observer(&self, observer: Box<dyn ProgressObserver>) -> usize {
        self.reporter.add_observer(observer)
    }

    fn transcriber(&self) -> Option<Arc<dyn TranscriptionProvider>> {
        match GeminiTranscriber::new(self.config.transcription.clone()) {
            Ok(transcriber) => Some(Arc::new(transcriber)),
            Err(e) => {
                log::warn!("Transcription provider disabled: {}", e);
                None
            }
        }
    }

    /// Интерактивный конвейер проектов
    pub fn project_pipeline(&self) -> ProjectPipeline {
        let transcripts = TranscriptAdapter::new(
            self.transcriber(),
            self.toolchain.clone(),
            self.store.clone(),
            self.config.transcription.clone(),
        );
        ProjectPipeline::new(
            self.config.clone(),
            self.toolchain.clone(),
            self.registry.clone(),
            transcripts,
            self.store.clone(),
            self.store.clone(),
            self.reporter.clone(),
        )
    }

    /// Обработчик пакетной озвучки историй
    pub fn story_worker(&self) -> Result<StoryWorker> {
        let root = self
            .config
            .worker
            .clip_store_dir
            .clone()
            .unwrap_or_else(|| self.config.work_dir().join("clips"));
        let clips = ClipStore::new(root, self.config.worker.max_clip_store_bytes)?;
        Ok(StoryWorker::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.registry.clone(),
            Arc::new(clips),
            self.config.providers.style,
            self.reporter.clone(),
        ))
    }

    /// Очередь историй с числом обработчиков из конфигурации
    pub fn story_queue(&self, hooks: Arc<dyn JobHooks>) -> Result<StoryQueue> {
        Ok(StoryQueue::new(
            Arc::new(self.story_worker()?),
            self.config.worker.concurrency,
            hooks,
        ))
    }

    /// Проверить ffmpeg и опросить провайдеров синтеза
    pub async fn doctor(&self) -> DoctorReport {
        let ffmpeg = FfmpegToolchain::new(self.config.toolchain.clone())
            .check_installed()
            .await
            .map_err(|e| e.to_string());
        DoctorReport {
            ffmpeg,
            providers: self.registry.health_report().await,
        }
    }
}
