//! Пакетная озвучка историй по секциям
//!
//! Каждая пара (секция, голос) имеет собственную запись со статусом
//! `PENDING → PROCESSING → COMPLETE | ERROR`. Повторный прогон пропускает
//! готовые секции, поэтому после ошибки работа продолжается с места сбоя.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};

use crate::config::StyleParams;
use crate::error::{panic_message, PipelineError, Result};
use crate::model::{SectionAudio, SectionStatus, StoryJob, StorySection, VoiceProfile};
use crate::pipeline::store::{SectionStore, StoryCatalog, VoiceProfiles};
use crate::progress::{DefaultProgressReporter, ProgressInfo};
use crate::tts::text::prepare_text_for_tts;
use crate::tts::{ClipStore, ProviderRegistry, StoredClip, StrategyPlan};

/// Сообщение для секций, зависших в обработке
pub const STUCK_MESSAGE: &str = "Processing timed out";

pub struct StoryWorker {
    sections: Arc<dyn SectionStore>,
    catalog: Arc<dyn StoryCatalog>,
    voices: Arc<dyn VoiceProfiles>,
    registry: ProviderRegistry,
    clips: Arc<ClipStore>,
    style: StyleParams,
    reporter: Arc<DefaultProgressReporter>,
}

impl StoryWorker {
    pub fn new(
        sections: Arc<dyn SectionStore>,
        catalog: Arc<dyn StoryCatalog>,
        voices: Arc<dyn VoiceProfiles>,
        registry: ProviderRegistry,
        clips: Arc<ClipStore>,
        style: StyleParams,
        reporter: Arc<DefaultProgressReporter>,
    ) -> Self {
        Self {
            sections,
            catalog,
            voices,
            registry,
            clips,
            style,
            reporter,
        }
    }

    /// Озвучить историю голосом `voice_id`.
    ///
    /// Секции обрабатываются по порядку. Готовые секции пропускаются, если
    /// не задан `force`. Первая ошибка останавливает прогон истории, но
    /// уже готовые секции остаются нетронутыми.
    pub async fn run_story(&self, story_id: &str, voice_id: &str, force: bool) -> Result<StoryJob> {
        let sections = self.catalog.story_sections(story_id)?;
        if sections.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "story '{}' has no sections",
                story_id
            )));
        }
        let profile = self.voices.voice_profile(voice_id)?.ok_or_else(|| {
            PipelineError::Configuration(format!("voice profile '{}' not found", voice_id))
        })?;

        let mut job = StoryJob {
            story_id: story_id.to_string(),
            voice_id: voice_id.to_string(),
            status: SectionStatus::Processing,
            completed_sections: 0,
            total_sections: sections.len(),
            error: None,
            updated_at: Utc::now(),
        };
        self.sections.put_story_job(&job)?;
        log::info!(
            "Story {} with voice {}: {} sections (force: {})",
            story_id,
            voice_id,
            sections.len(),
            force
        );

        for section in &sections {
            let existing = self.sections.get_section_audio(&section.id, voice_id)?;
            if let Some(record) = &existing {
                if record.status == SectionStatus::Complete && !force {
                    if self.audio_intact(record) {
                        log::debug!("Section {} already complete, skipping", section.id);
                        job.completed_sections += 1;
                        continue;
                    }
                    log::warn!(
                        "Section {} is complete but its audio is missing or corrupt, resynthesizing",
                        section.id
                    );
                }
            }

            let mut record = existing.unwrap_or_else(|| SectionAudio::pending(section, voice_id));
            record.status = SectionStatus::Processing;
            record.error = None;
            record.updated_at = Utc::now();
            self.sections.put_section_audio(&record)?;

            match self.synthesize_section(&profile, section, voice_id).await {
                Ok((stored, duration)) => {
                    let now = Utc::now();
                    record.status = SectionStatus::Complete;
                    record.audio_url = Some(stored.path.to_string_lossy().into_owned());
                    record.checksum = Some(stored.checksum);
                    record.duration = duration;
                    record.updated_at = now;
                    record.completed_at = Some(now);
                    self.sections.put_section_audio(&record)?;

                    job.completed_sections += 1;
                    job.updated_at = now;
                    self.sections.put_story_job(&job)?;
                    self.report(&job, &section.id);
                }
                Err(e) => {
                    let message = e.user_message();
                    log::error!("Section {} of story {} failed: {}", section.id, story_id, message);
                    record.status = SectionStatus::Error;
                    record.error = Some(message.clone());
                    record.updated_at = Utc::now();
                    self.sections.put_section_audio(&record)?;

                    job.status = SectionStatus::Error;
                    job.error = Some(message);
                    job.updated_at = Utc::now();
                    self.sections.put_story_job(&job)?;
                    return Err(e);
                }
            }
        }

        job.status = SectionStatus::Complete;
        job.updated_at = Utc::now();
        self.sections.put_story_job(&job)?;
        log::info!(
            "Story {} with voice {} complete ({} sections)",
            story_id,
            voice_id,
            job.total_sections
        );
        Ok(job)
    }

    /// Файл готовой секции на месте и совпадает по контрольной сумме
    fn audio_intact(&self, record: &SectionAudio) -> bool {
        match (&record.audio_url, &record.checksum) {
            (Some(url), Some(checksum)) => self.clips.verify(Path::new(url), checksum).unwrap_or(false),
            _ => false,
        }
    }

    /// Пометить прерванный прогон истории как ошибочный: секции, оставшиеся
    /// в `PROCESSING`, и само задание получают статус `ERROR`.
    pub fn abandon(&self, story_id: &str, voice_id: &str, message: &str) -> Result<()> {
        for mut record in self.sections.list_by_status(SectionStatus::Processing)? {
            if record.story_id != story_id || record.voice_id != voice_id {
                continue;
            }
            record.status = SectionStatus::Error;
            record.error = Some(message.to_string());
            record.updated_at = Utc::now();
            self.sections.put_section_audio(&record)?;
        }
        if let Some(mut job) = self.sections.get_story_job(story_id, voice_id)? {
            if job.status == SectionStatus::Processing {
                job.status = SectionStatus::Error;
                job.error = Some(message.to_string());
                job.updated_at = Utc::now();
                self.sections.put_story_job(&job)?;
            }
        }
        Ok(())
    }

    async fn synthesize_section(
        &self,
        profile: &VoiceProfile,
        section: &StorySection,
        voice_id: &str,
    ) -> Result<(StoredClip, Option<f64>)> {
        self.try_synthesize_section(profile, section, voice_id)
            .await
            .map_err(|e| PipelineError::segment(section.index, &section.text, e))
    }

    async fn try_synthesize_section(
        &self,
        profile: &VoiceProfile,
        section: &StorySection,
        voice_id: &str,
    ) -> Result<(StoredClip, Option<f64>)> {
        let text = prepare_text_for_tts(&section.text);
        if text.is_empty() {
            return Err(PipelineError::DataQuality("section has no text".to_string()));
        }
        let synthesizer =
            StrategyPlan::for_section(profile, section)?.resolve(&self.registry, self.style)?;
        log::debug!("Section {} via {}", section.id, synthesizer.primary_name());
        let clip = synthesizer.synthesize(&text).await?;
        let stored = self.clips.put(&section.id, voice_id, &clip)?;
        Ok((stored, clip.approx_duration))
    }

    fn report(&self, job: &StoryJob, section_id: &str) {
        let percent = (job.completed_sections * 100 / job.total_sections.max(1)) as u8;
        self.reporter.notify(&ProgressInfo::new(
            job.story_id.clone(),
            "section_complete",
            percent,
            Some(format!(
                "{} ({}/{})",
                section_id, job.completed_sections, job.total_sections
            )),
        ));
    }

    /// Перевести зависшие в `PROCESSING` секции в `ERROR`, чтобы историю можно было
    /// перезапустить. Возвращает число исправленных записей.
    pub fn reset_stuck(&self, older_than: Duration) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| PipelineError::Configuration(format!("invalid stuck threshold: {}", e)))?;
        let cutoff = Utc::now() - older_than;
        let mut reset = 0;

        for mut record in self.sections.list_by_status(SectionStatus::Processing)? {
            if record.updated_at > cutoff {
                continue;
            }
            log::warn!(
                "Section {} (voice {}) stuck since {}, marking as failed",
                record.section_id,
                record.voice_id,
                record.updated_at
            );
            record.status = SectionStatus::Error;
            record.error = Some(STUCK_MESSAGE.to_string());
            record.updated_at = Utc::now();
            self.sections.put_section_audio(&record)?;

            if let Some(mut job) = self.sections.get_story_job(&record.story_id, &record.voice_id)? {
                if job.status == SectionStatus::Processing {
                    job.status = SectionStatus::Error;
                    job.error = Some(STUCK_MESSAGE.to_string());
                    job.updated_at = Utc::now();
                    self.sections.put_story_job(&job)?;
                }
            }
            reset += 1;
        }
        Ok(reset)
    }
}

/// Ключ дедупликации пакетных заданий
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub story_id: String,
    pub voice_id: String,
}

/// Итог задания
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(StoryJob),
    Failed(String),
}

/// Обработчики событий очереди
pub trait JobHooks: Send + Sync {
    fn on_failed(&self, job: &JobKey, error: &PipelineError);

    fn on_completed(&self, _job: &StoryJob) {}
}

/// Обработчик, пишущий события в журнал
pub struct LogJobHooks;

impl JobHooks for LogJobHooks {
    fn on_failed(&self, job: &JobKey, error: &PipelineError) {
        log::error!(
            "Story job {} / {} failed: {}",
            job.story_id,
            job.voice_id,
            error
        );
    }
}

/// Ссылка на поставленное в очередь задание
#[derive(Clone)]
pub struct JobHandle {
    pub key: JobKey,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    /// Дождаться завершения задания
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return JobOutcome::Failed("job task ended without a result".to_string());
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Тот же ли это экземпляр задания
    pub fn same_job(&self, other: &JobHandle) -> bool {
        self.rx.same_channel(&other.rx)
    }
}

/// Очередь заданий с фиксированным числом обработчиков
#[derive(Clone)]
pub struct StoryQueue {
    worker: Arc<StoryWorker>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<JobKey, JobHandle>>>,
    hooks: Arc<dyn JobHooks>,
}

impl StoryQueue {
    pub fn new(worker: Arc<StoryWorker>, concurrency: usize, hooks: Arc<dyn JobHooks>) -> Self {
        Self {
            worker,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            hooks,
        }
    }

    /// Поставить историю в очередь. Повторная постановка той же пары
    /// (история, голос) возвращает уже существующее задание.
    pub fn enqueue(&self, story_id: &str, voice_id: &str, force: bool) -> Result<JobHandle> {
        let runtime = Handle::try_current().map_err(|_| {
            PipelineError::Configuration("the story queue needs a Tokio runtime".to_string())
        })?;
        let key = JobKey {
            story_id: story_id.to_string(),
            voice_id: voice_id.to_string(),
        };

        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(&key) {
            log::info!(
                "Story {} / {} already queued, reusing the existing job",
                story_id,
                voice_id
            );
            return Ok(existing.clone());
        }

        let (tx, rx) = watch::channel(None);
        let handle = JobHandle { key: key.clone(), rx };
        in_flight.insert(key.clone(), handle.clone());

        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();
        let registry = self.in_flight.clone();
        let hooks = self.hooks.clone();
        runtime.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let result = AssertUnwindSafe(worker.run_story(&key.story_id, &key.voice_id, force))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            let e = PipelineError::Crashed(panic_message(payload.as_ref()));
                            if let Err(store_err) =
                                worker.abandon(&key.story_id, &key.voice_id, &e.user_message())
                            {
                                log::error!("Failed to record crashed story job: {}", store_err);
                            }
                            Err(e)
                        });
                    match result {
                        Ok(job) => {
                            hooks.on_completed(&job);
                            JobOutcome::Completed(job)
                        }
                        Err(e) => {
                            hooks.on_failed(&key, &e);
                            JobOutcome::Failed(e.user_message())
                        }
                    }
                }
                Err(e) => JobOutcome::Failed(format!("queue closed: {}", e)),
            };
            registry.lock().remove(&key);
            let _ = tx.send(Some(outcome));
        });

        Ok(handle)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}
