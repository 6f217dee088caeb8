//! Единственный писатель записи прогона
//!
//! Каждый переход этапа сохраняется в хранилище и рассылается наблюдателям
//! прогресса.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::model::{PipelineRun, RunStatus, SyncMode};
use crate::pipeline::store::RunStore;
use crate::progress::{DefaultProgressReporter, ProgressInfo};

/// Именованные этапы интерактивного прогона и их процент
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Starting,
    Transcribing,
    TranscriptReady,
    PipelineSpawn,
    Synthesizing,
    Mixing,
    Muxing,
    Completed,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Transcribing => "transcribing",
            Self::TranscriptReady => "transcript_ready",
            Self::PipelineSpawn => "pipeline_spawn",
            Self::Synthesizing => "tts_synthesis",
            Self::Mixing => "mixing",
            Self::Muxing => "muxing",
            Self::Completed => "completed",
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Starting | Self::Transcribing => RunStatus::Transcribing,
            Self::TranscriptReady => RunStatus::TranscriptReady,
            Self::PipelineSpawn | Self::Synthesizing => RunStatus::Synthesizing,
            Self::Mixing => RunStatus::Mixing,
            Self::Muxing => RunStatus::Muxing,
            Self::Completed => RunStatus::Completed,
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            Self::Starting => 5,
            Self::Transcribing => 10,
            Self::TranscriptReady => 30,
            Self::PipelineSpawn => 35,
            Self::Synthesizing => 40,
            Self::Mixing => 85,
            Self::Muxing => 92,
            Self::Completed => 100,
        }
    }
}

/// Процент внутри этапа синтеза (40..80) по числу готовых сегментов
pub fn synthesis_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 80;
    }
    let fraction = done.min(total) as f64 / total as f64;
    (40.0 + 40.0 * fraction).round() as u8
}

pub struct RunTracker {
    store: Arc<dyn RunStore>,
    reporter: Arc<DefaultProgressReporter>,
    run: PipelineRun,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStore>, reporter: Arc<DefaultProgressReporter>, run: PipelineRun) -> Self {
        Self { store, reporter, run }
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    fn publish(&self, details: Option<String>) -> Result<()> {
        self.store.put_run(&self.run)?;
        let stage = self
            .run
            .stage_history
            .last()
            .map(|r| r.stage.clone())
            .unwrap_or_else(|| self.run.status.as_str().to_string());
        self.reporter.notify(&ProgressInfo::new(
            self.run.unit_id.clone(),
            stage,
            self.run.progress_percent,
            details,
        ));
        Ok(())
    }

    /// Перейти к этапу
    pub fn stage(&mut self, stage: Stage) -> Result<()> {
        log::info!(
            "[{}] {} ({}%)",
            self.run.unit_id,
            stage.name(),
            stage.percent()
        );
        self.run.record_stage(stage.status(), stage.name(), stage.percent());
        self.publish(None)
    }

    /// Обновить процент внутри текущего этапа
    pub fn progress(&mut self, percent: u8, details: impl Into<String>) -> Result<()> {
        if percent <= self.run.progress_percent {
            return Ok(());
        }
        self.run.set_progress(percent);
        self.publish(Some(details.into()))
    }

    pub fn complete(&mut self, output: PathBuf, mode: SyncMode) -> Result<()> {
        self.run.output_path = Some(output);
        self.run.sync_mode = Some(mode);
        self.run.error = None;
        self.stage(Stage::Completed)
    }

    /// Отметить прогон проваленным; частичный результат не сохраняется
    pub fn fail(&mut self, error: &PipelineError) -> Result<()> {
        let message = error.user_message();
        log::error!("[{}] run failed: {}", self.run.unit_id, message);
        let percent = self.run.progress_percent;
        self.run.output_path = None;
        self.run.error = Some(message.clone());
        self.run.record_stage(RunStatus::Failed, "failed", percent);
        self.publish(Some(message))
    }
}
