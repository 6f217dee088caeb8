//! Интерактивный конвейер озвучки проекта
//!
//! Запрос на старт записывает состояние `processing` и сразу возвращается;
//! сама работа идёт в отдельной задаче Tokio. Клиенты опрашивают запись
//! прогона через `status`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::PipelineConfig;
use crate::error::{panic_message, PipelineError, Result};
use crate::media::{self, BackgroundMixer, MediaToolchain, Muxer};
use crate::model::{PipelineRun, SyncMode};
use crate::pipeline::store::{RunStore, VoiceProfiles};
use crate::pipeline::tracker::{synthesis_percent, RunTracker, Stage};
use crate::progress::DefaultProgressReporter;
use crate::sync::Resynchronizer;
use crate::transcript::TranscriptAdapter;
use crate::tts::{ProviderRegistry, StrategyPlan};
use crate::utils::temp::TempFileManager;

/// Запрос на озвучку проекта
#[derive(Debug, Clone)]
pub struct DubRequest {
    pub unit_id: String,
    pub voice_id: String,
    pub source_video: PathBuf,
    pub output_path: PathBuf,
    /// Сохранить фон оригинала, приглушив его под новой речью
    pub preserve_background: bool,
}

struct Shared {
    config: PipelineConfig,
    toolchain: Arc<dyn MediaToolchain>,
    registry: ProviderRegistry,
    transcripts: TranscriptAdapter,
    runs: Arc<dyn RunStore>,
    voices: Arc<dyn VoiceProfiles>,
    reporter: Arc<DefaultProgressReporter>,
}

/// Оркестратор интерактивных прогонов
#[derive(Clone)]
pub struct ProjectPipeline {
    shared: Arc<Shared>,
    active: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
}

impl ProjectPipeline {
    pub fn new(
        config: PipelineConfig,
        toolchain: Arc<dyn MediaToolchain>,
        registry: ProviderRegistry,
        transcripts: TranscriptAdapter,
        runs: Arc<dyn RunStore>,
        voices: Arc<dyn VoiceProfiles>,
        reporter: Arc<DefaultProgressReporter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                toolchain,
                registry,
                transcripts,
                runs,
                voices,
                reporter,
            }),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Запустить прогон в фоне. Возвращает запись в состоянии `processing`.
    pub fn start(&self, request: DubRequest) -> Result<PipelineRun> {
        let runtime = Handle::try_current().map_err(|_| {
            PipelineError::Configuration("interactive runs need a Tokio runtime".to_string())
        })?;

        let mut active = self.active.lock();
        if let Some(done) = active.get(&request.unit_id) {
            if !*done.borrow() {
                return Err(PipelineError::AlreadyRunning(request.unit_id.clone()));
            }
        }

        let mut tracker = RunTracker::new(
            self.shared.runs.clone(),
            self.shared.reporter.clone(),
            PipelineRun::new(request.unit_id.clone(), request.voice_id.clone()),
        );
        tracker.stage(Stage::Starting)?;
        let snapshot = tracker.run().clone();

        let shared = self.shared.clone();
        let registry = self.active.clone();
        let (done_tx, done_rx) = watch::channel(false);
        active.insert(request.unit_id.clone(), done_rx);
        runtime.spawn(async move {
            let tracker = Mutex::new(tracker);
            let result = AssertUnwindSafe(execute(&shared, &tracker, &request))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    log::error!("[{}] run task panicked: {}", request.unit_id, message);
                    Err(PipelineError::Crashed(message))
                });
            if let Err(e) = result {
                remove_partial_output(&request.output_path).await;
                if let Err(store_err) = tracker.lock().fail(&e) {
                    log::error!(
                        "[{}] failed to record failure: {}",
                        request.unit_id,
                        store_err
                    );
                }
            }
            // Запись снимается до сигнала, чтобы новый старт не потерял свою
            registry.lock().remove(&request.unit_id);
            let _ = done_tx.send(true);
        });

        Ok(snapshot)
    }

    /// Текущее состояние прогона
    pub fn status(&self, unit_id: &str) -> Result<Option<PipelineRun>> {
        self.shared.runs.get_run(unit_id)
    }

    pub fn is_running(&self, unit_id: &str) -> bool {
        self.active
            .lock()
            .get(unit_id)
            .map(|done| !*done.borrow())
            .unwrap_or(false)
    }

    /// Дождаться завершения фонового прогона (для CLI и тестов).
    /// Пока прогон идёт, повторный `start` по-прежнему отклоняется.
    pub async fn wait(&self, unit_id: &str) -> Result<Option<PipelineRun>> {
        let done = self.active.lock().get(unit_id).cloned();
        if let Some(mut done) = done {
            loop {
                let finished = *done.borrow_and_update();
                if finished || done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.status(unit_id)
    }
}

async fn execute(shared: &Shared, tracker: &Mutex<RunTracker>, request: &DubRequest) -> Result<()> {
    let config = &shared.config;
    let mut temp = TempFileManager::new_in(
        config.work_dir(),
        &format!("run_{}", request.unit_id),
        !config.keep_temp_files,
    )?;

    tracker.lock().stage(Stage::Transcribing)?;
    let transcript = shared
        .transcripts
        .resolve(&request.unit_id, &request.source_video, temp.dir())
        .await?;
    if transcript.is_empty() {
        return Err(PipelineError::Configuration("no transcript available".to_string()));
    }
    tracker.lock().stage(Stage::TranscriptReady)?;

    let profile = shared
        .voices
        .voice_profile(&request.voice_id)?
        .ok_or_else(|| {
            PipelineError::Configuration(format!("voice profile '{}' not found", request.voice_id))
        })?;
    let synthesizer =
        StrategyPlan::for_profile(&profile)?.resolve(&shared.registry, config.providers.style)?;
    log::info!(
        "[{}] synthesizing with {}{}",
        request.unit_id,
        synthesizer.primary_name(),
        if synthesizer.has_fallback() { " (with fallback)" } else { "" }
    );
    tracker.lock().stage(Stage::PipelineSpawn)?;

    let toolchain = shared.toolchain.as_ref();
    let source_duration = media::probe(toolchain, &request.source_video).await?;

    tracker.lock().stage(Stage::Synthesizing)?;
    let on_segment = |done: usize, total: usize| {
        let mut tracker = tracker.lock();
        let details = format!("segment {}/{}", done, total);
        if let Err(e) = tracker.progress(synthesis_percent(done, total), details) {
            log::warn!("Failed to record synthesis progress: {}", e);
        }
    };
    let resync = Resynchronizer::new(toolchain, &synthesizer, &config.resync);
    let outcome = if transcript.has_timing() {
        resync
            .run(&transcript.segments, source_duration, temp.dir(), Some(&on_segment))
            .await?
    } else {
        resync
            .run_best_effort(&transcript.text(), source_duration, temp.dir())
            .await?
    };
    if outcome.mode == SyncMode::BestEffort {
        log::warn!("[{}] no segment timing, output is best-effort aligned", request.unit_id);
    }

    let audio = if request.preserve_background {
        tracker.lock().stage(Stage::Mixing)?;
        let mixed = temp.path_for("mixed", "wav");
        BackgroundMixer::new(toolchain, config.mixer.duck_level_db)
            .mix(&request.source_video, &outcome.track, &transcript.segments, &mixed)
            .await?
    } else {
        outcome.track.clone()
    };

    tracker.lock().stage(Stage::Muxing)?;
    if let Some(parent) = request.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let output = Muxer::new(toolchain)
        .replace_audio(&request.source_video, &audio, &request.output_path)
        .await?;

    tracker.lock().complete(output, outcome.mode)?;
    temp.cleanup()?;
    Ok(())
}

/// Недоделанный результат не должен выглядеть готовым
async fn remove_partial_output(path: &Path) {
    if tokio::fs::remove_file(path).await.is_ok() {
        log::debug!("Removed partial output {}", path.display());
    }
}
