//! Модель данных конвейера
//!
//! Сегменты транскрипта, синтезированные клипы, записи прогонов и
//! записи аудио секций историй.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Временной отрезок произнесённого текста в исходном файле (секунды)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TranscriptSegment {
    /// Создать новый сегмент
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    /// Длительность сегмента
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Пустой текст или слишком короткий отрезок считаются шумом
    pub fn is_noise(&self, min_duration: f64) -> bool {
        self.text.trim().is_empty() || self.duration() <= min_duration
    }
}

/// Что делать с пересекающимися сегментами
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Отклонить список с ошибкой качества данных
    Reject,
    /// Сдвинуть начало следующего сегмента к концу предыдущего
    Clamp,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Проверить инварианты списка сегментов: `end > start`, сортировка по `start`,
/// отсутствие пересечений.
pub fn validate_segments(
    segments: &[TranscriptSegment],
    policy: OverlapPolicy,
    noise_threshold: f64,
) -> Result<Vec<TranscriptSegment>> {
    let mut validated: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());

    for (index, segment) in segments.iter().enumerate() {
        if !segment.start.is_finite() || !segment.end.is_finite() || segment.start < 0.0 {
            return Err(PipelineError::DataQuality(format!(
                "segment {} has invalid bounds [{}, {}]",
                index, segment.start, segment.end
            )));
        }
        // Нулевая длительность допустима: такой сегмент пропускается как шум
        if segment.end < segment.start {
            return Err(PipelineError::DataQuality(format!(
                "segment {} ends before it starts ([{:.3}, {:.3}])",
                index, segment.start, segment.end
            )));
        }

        let mut segment = segment.clone();
        if let Some(previous) = validated.last() {
            if segment.start < previous.start {
                return Err(PipelineError::DataQuality(format!(
                    "segment {} starts at {:.3}s, before the previous segment ({:.3}s)",
                    index, segment.start, previous.start
                )));
            }
            if segment.start < previous.end {
                match policy {
                    OverlapPolicy::Reject => {
                        return Err(PipelineError::DataQuality(format!(
                            "segment {} [{:.3}, {:.3}] overlaps segment {} [{:.3}, {:.3}]",
                            index,
                            segment.start,
                            segment.end,
                            index - 1,
                            previous.start,
                            previous.end
                        )));
                    }
                    OverlapPolicy::Clamp => {
                        log::warn!(
                            "Segment {} overlaps the previous one by {:.3}s, clamping its start",
                            index,
                            previous.end - segment.start
                        );
                        segment.start = previous.end;
                        if segment.end - segment.start <= noise_threshold {
                            log::warn!("Segment {} dropped after clamping", index);
                            continue;
                        }
                    }
                }
            }
        }
        validated.push(segment);
    }

    Ok(validated)
}

/// Транскрипт исходного файла
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub full_text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl Transcript {
    /// Есть ли временная разметка
    pub fn has_timing(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Нет ни текста, ни сегментов
    pub fn is_empty(&self) -> bool {
        self.full_text.trim().is_empty() && self.segments.iter().all(|s| s.text.trim().is_empty())
    }

    /// Полный текст; если он не сохранён, собирается из сегментов
    pub fn text(&self) -> String {
        if !self.full_text.trim().is_empty() {
            return self.full_text.trim().to_string();
        }
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Непрозрачная ссылка на клонированный голос: id у провайдера или путь к файлу
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceReference(String);

impl VoiceReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ключ провайдера синтеза, хранящийся в профиле голоса
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Облачный API клонированных голосов
    ElevenLabs,
    /// Локальная нейросетевая модель на GPU-сервере
    F5,
    /// Конвертация голоса по ведущей дорожке
    Rvc,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ElevenLabs => "elevenlabs",
            Self::F5 => "f5",
            Self::Rvc => "rvc",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Профиль голоса пользователя
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub provider: ProviderKind,
    /// Идентификатор голоса в облачном API
    #[serde(default)]
    pub cloud_voice_id: Option<VoiceReference>,
    /// Референсная запись для локальной модели
    #[serde(default)]
    pub prompt_path: Option<VoiceReference>,
    /// Модель конвертации голоса (.pth)
    #[serde(default)]
    pub conversion_model: Option<VoiceReference>,
}

/// Синтезированный клип одного сегмента. Живёт в пределах одного прогона.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedClip {
    pub source_segment_index: usize,
    pub raw_path: PathBuf,
    pub raw_duration: f64,
    pub target_duration: f64,
}

/// Статус прогона конвейера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Transcribing,
    TranscriptReady,
    Synthesizing,
    Mixing,
    Muxing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transcribing => "transcribing",
            Self::TranscriptReady => "transcript_ready",
            Self::Synthesizing => "synthesizing",
            Self::Mixing => "mixing",
            Self::Muxing => "muxing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Насколько точно итоговая дорожка совпадает с исходной по времени
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Каждый сегмент растянут точно в своё окно
    Aligned,
    /// Сегментов не было: текст синтезирован целиком и дополнен тишиной
    BestEffort,
}

/// Запись о переходе между этапами
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: RunStatus,
    pub stage: String,
    pub percent: u8,
    pub at: DateTime<Utc>,
}

/// Прогон интерактивного конвейера для одного проекта
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub unit_id: String,
    pub voice_id: String,
    pub status: RunStatus,
    pub progress_percent: u8,
    #[serde(default)]
    pub stage_history: Vec<StageRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub sync_mode: Option<SyncMode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Новый прогон в состоянии `pending`
    pub fn new(unit_id: impl Into<String>, voice_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            unit_id: unit_id.into(),
            voice_id: voice_id.into(),
            status: RunStatus::Pending,
            progress_percent: 0,
            stage_history: vec![StageRecord {
                status: RunStatus::Pending,
                stage: "pending".to_string(),
                percent: 0,
                at: now,
            }],
            error: None,
            output_path: None,
            sync_mode: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Зафиксировать переход к этапу с указанным процентом
    pub fn record_stage(&mut self, status: RunStatus, stage: impl Into<String>, percent: u8) {
        let now = Utc::now();
        self.status = status;
        self.progress_percent = percent.min(100);
        self.stage_history.push(StageRecord {
            status,
            stage: stage.into(),
            percent: self.progress_percent,
            at: now,
        });
        self.updated_at = now;
    }

    /// Обновить процент без новой записи в истории
    pub fn set_progress(&mut self, percent: u8) {
        self.progress_percent = percent.min(100);
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Статус аудио секции истории
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

/// Тип секции истории определяет провайдера синтеза
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Speech,
    Singing,
}

impl Default for SectionKind {
    fn default() -> Self {
        Self::Speech
    }
}

/// Секция истории
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySection {
    pub id: String,
    pub story_id: String,
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub kind: SectionKind,
    /// Ведущая дорожка для поющихся секций
    #[serde(default)]
    pub guide_track: Option<PathBuf>,
}

/// Аудио секции для пары (секция, голос). Единица идемпотентности пакетного режима.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAudio {
    pub section_id: String,
    pub story_id: String,
    pub voice_id: String,
    pub status: SectionStatus,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SectionAudio {
    pub fn pending(section: &StorySection, voice_id: &str) -> Self {
        let now = Utc::now();
        Self {
            section_id: section.id.clone(),
            story_id: section.story_id.clone(),
            voice_id: voice_id.to_string(),
            status: SectionStatus::Pending,
            audio_url: None,
            duration: None,
            checksum: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Сводная запись пакетного прогона истории для пары (история, голос)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryJob {
    pub story_id: String,
    pub voice_id: String,
    pub status: SectionStatus,
    pub completed_sections: usize,
    pub total_sections: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
