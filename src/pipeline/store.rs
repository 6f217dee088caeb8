//! Интерфейсы хранилища записей и эталонная реализация в памяти
//!
//! `MemoryStore` может сохранять снимок состояния в JSON после каждой
//! записи, чтобы пакетные прогоны возобновлялись между запусками процесса.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::{
    PipelineRun, SectionAudio, SectionStatus, StoryJob, StorySection, Transcript, VoiceProfile,
};

/// Записи прогонов интерактивного конвейера
pub trait RunStore: Send + Sync {
    fn get_run(&self, unit_id: &str) -> Result<Option<PipelineRun>>;
    fn put_run(&self, run: &PipelineRun) -> Result<()>;
}

/// Записи аудио секций и сводные записи историй
pub trait SectionStore: Send + Sync {
    fn get_section_audio(&self, section_id: &str, voice_id: &str) -> Result<Option<SectionAudio>>;
    fn put_section_audio(&self, audio: &SectionAudio) -> Result<()>;
    fn list_section_audio(&self, story_id: &str, voice_id: &str) -> Result<Vec<SectionAudio>>;
    fn list_by_status(&self, status: SectionStatus) -> Result<Vec<SectionAudio>>;
    fn get_story_job(&self, story_id: &str, voice_id: &str) -> Result<Option<StoryJob>>;
    fn put_story_job(&self, job: &StoryJob) -> Result<()>;
}

/// Транскрипт, предоставленный источником (например, платформой видео)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ProviderTranscript {
    /// Документ WebVTT
    Captions(String),
    /// Только текст, без разметки времени
    Text(String),
}

/// Метаданные транскриптов
pub trait TranscriptStore: Send + Sync {
    /// Транскрипт, сохранённый предыдущим прогоном конвейера
    fn pipeline_transcript(&self, unit_id: &str) -> Result<Option<Transcript>>;
    /// Транскрипт, объявленный источником
    fn provider_transcript(&self, unit_id: &str) -> Result<Option<ProviderTranscript>>;
    fn save_transcript(&self, unit_id: &str, transcript: &Transcript) -> Result<()>;
}

pub trait VoiceProfiles: Send + Sync {
    fn voice_profile(&self, voice_id: &str) -> Result<Option<VoiceProfile>>;
}

pub trait StoryCatalog: Send + Sync {
    /// Секции истории в порядке следования
    fn story_sections(&self, story_id: &str) -> Result<Vec<StorySection>>;
}

fn pair_key(a: &str, b: &str) -> String {
    format!("{}|{}", a, b)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    runs: HashMap<String, PipelineRun>,
    section_audio: HashMap<String, SectionAudio>,
    story_jobs: HashMap<String, StoryJob>,
    transcripts: HashMap<String, Transcript>,
    provider_transcripts: HashMap<String, ProviderTranscript>,
    voices: HashMap<String, VoiceProfile>,
    stories: HashMap<String, Vec<StorySection>>,
}

/// Хранилище в памяти с необязательным JSON-снимком
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Открыть хранилище со снимком в `path` (файл создаётся при первой записи)
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                PipelineError::Store(format!("corrupt state file {}: {}", path.display(), e))
            })?
        } else {
            StoreState::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write<F: FnOnce(&mut StoreState)>(&self, update: F) -> Result<()> {
        let mut state = self.state.write();
        update(&mut state);
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&*state)?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json)?;
            fs::rename(&tmp, path)?;
        }
        Ok(())
    }

    pub fn add_voice_profile(&self, profile: VoiceProfile) -> Result<()> {
        self.write(|s| {
            s.voices.insert(profile.id.clone(), profile);
        })
    }

    pub fn add_story(&self, story_id: &str, mut sections: Vec<StorySection>) -> Result<()> {
        sections.sort_by_key(|s| s.index);
        self.write(|s| {
            s.stories.insert(story_id.to_string(), sections);
        })
    }

    pub fn set_provider_transcript(&self, unit_id: &str, transcript: ProviderTranscript) -> Result<()> {
        self.write(|s| {
            s.provider_transcripts.insert(unit_id.to_string(), transcript);
        })
    }
}

impl RunStore for MemoryStore {
    fn get_run(&self, unit_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.state.read().runs.get(unit_id).cloned())
    }

    fn put_run(&self, run: &PipelineRun) -> Result<()> {
        self.write(|s| {
            s.runs.insert(run.unit_id.clone(), run.clone());
        })
    }
}

impl SectionStore for MemoryStore {
    fn get_section_audio(&self, section_id: &str, voice_id: &str) -> Result<Option<SectionAudio>> {
        Ok(self
            .state
            .read()
            .section_audio
            .get(&pair_key(section_id, voice_id))
            .cloned())
    }

    fn put_section_audio(&self, audio: &SectionAudio) -> Result<()> {
        self.write(|s| {
            s.section_audio
                .insert(pair_key(&audio.section_id, &audio.voice_id), audio.clone());
        })
    }

    fn list_section_audio(&self, story_id: &str, voice_id: &str) -> Result<Vec<SectionAudio>> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .section_audio
            .values()
            .filter(|a| a.story_id == story_id && a.voice_id == voice_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.section_id.cmp(&b.section_id));
        Ok(records)
    }

    fn list_by_status(&self, status: SectionStatus) -> Result<Vec<SectionAudio>> {
        Ok(self
            .state
            .read()
            .section_audio
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect())
    }

    fn get_story_job(&self, story_id: &str, voice_id: &str) -> Result<Option<StoryJob>> {
        Ok(self
            .state
            .read()
            .story_jobs
            .get(&pair_key(story_id, voice_id))
            .cloned())
    }

    fn put_story_job(&self, job: &StoryJob) -> Result<()> {
        self.write(|s| {
            s.story_jobs
                .insert(pair_key(&job.story_id, &job.voice_id), job.clone());
        })
    }
}

impl TranscriptStore for MemoryStore {
    fn pipeline_transcript(&self, unit_id: &str) -> Result<Option<Transcript>> {
        Ok(self.state.read().transcripts.get(unit_id).cloned())
    }

    fn provider_transcript(&self, unit_id: &str) -> Result<Option<ProviderTranscript>> {
        Ok(self.state.read().provider_transcripts.get(unit_id).cloned())
    }

    fn save_transcript(&self, unit_id: &str, transcript: &Transcript) -> Result<()> {
        self.write(|s| {
            s.transcripts.insert(unit_id.to_string(), transcript.clone());
        })
    }
}

impl VoiceProfiles for MemoryStore {
    fn voice_profile(&self, voice_id: &str) -> Result<Option<VoiceProfile>> {
        Ok(self.state.read().voices.get(voice_id).cloned())
    }
}

impl StoryCatalog for MemoryStore {
    fn story_sections(&self, story_id: &str) -> Result<Vec<StorySection>> {
        Ok(self
            .state
            .read()
            .stories
            .get(story_id)
            .cloned()
            .unwrap_or_default())
    }
}
