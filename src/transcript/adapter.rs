//! Получение транскрипта исходного видео
//!
//! Порядок: сохранённый транскрипт конвейера, затем транскрипт источника,
//! затем внешний провайдер транскрибации. Длинное аудио режется на
//! равные по времени фрагменты, чтобы смещение каждого фрагмента было
//! известно точно.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::TranscriptionConfig;
use crate::error::{PipelineError, Result};
use crate::media::MediaToolchain;
use crate::model::{validate_segments, OverlapPolicy, Transcript, TranscriptSegment};
use crate::pipeline::store::{ProviderTranscript, TranscriptStore};
use crate::transcript::parse::{parse_chunk_response, ChunkWindow};
use crate::transcript::retry::RetryPolicy;
use crate::transcript::vtt::parse_vtt;

/// Инструкция провайдеру транскрибации
pub const TRANSCRIPTION_PROMPT: &str = "Transcribe the speech in this audio clip. \
Respond with a JSON array only, no commentary. Each element must be an object \
{\"start\": seconds, \"end\": seconds, \"text\": string} with times relative to the \
start of this clip, in chronological order, one element per sentence or phrase. \
If the clip contains no speech, respond with [].";

/// Внешний провайдер транскрибации
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Максимальный размер аудио, передаваемого в одном запросе
    fn inline_limit_bytes(&self) -> u64;

    /// Транскрибировать фрагмент; ответом служит сырой текст провайдера
    async fn transcribe_chunk(&self, audio: Bytes, mime_type: &str, prompt: &str) -> Result<String>;
}

/// Разбить аудио на равные по времени фрагменты, каждый не больше лимита
pub fn plan_chunks(size_bytes: u64, duration: f64, limit_bytes: u64, safety_factor: f64) -> Vec<ChunkWindow> {
    let effective = (limit_bytes as f64 * safety_factor).max(1.0);
    let count = ((size_bytes as f64) / effective).ceil().max(1.0) as usize;
    let chunk_len = duration / count as f64;
    (0..count)
        .map(|index| ChunkWindow {
            index,
            offset: chunk_len * index as f64,
            duration: chunk_len,
        })
        .collect()
}

/// Собрать транскрипт из сегментов всех фрагментов
fn assemble(mut segments: Vec<TranscriptSegment>, duration: f64) -> Transcript {
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    let full_text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    Transcript {
        full_text,
        segments,
        duration: Some(duration),
    }
}

pub struct TranscriptAdapter {
    provider: Option<Arc<dyn TranscriptionProvider>>,
    toolchain: Arc<dyn MediaToolchain>,
    store: Arc<dyn TranscriptStore>,
    config: TranscriptionConfig,
}

impl TranscriptAdapter {
    pub fn new(
        provider: Option<Arc<dyn TranscriptionProvider>>,
        toolchain: Arc<dyn MediaToolchain>,
        store: Arc<dyn TranscriptStore>,
        config: TranscriptionConfig,
    ) -> Self {
        Self {
            provider,
            toolchain,
            store,
            config,
        }
    }

    /// Найти уже имеющийся транскрипт без обращения к провайдеру
    pub fn get_existing_transcript(&self, unit_id: &str) -> Result<Option<Transcript>> {
        if let Some(transcript) = self.store.pipeline_transcript(unit_id)? {
            if !transcript.is_empty() {
                log::info!("Using stored pipeline transcript for {}", unit_id);
                return Ok(Some(transcript));
            }
        }

        let transcript = match self.store.provider_transcript(unit_id)? {
            Some(ProviderTranscript::Captions(vtt)) => match parse_vtt(&vtt) {
                Ok(segments) => assemble(segments, 0.0),
                Err(e) => {
                    log::warn!("Ignoring unreadable captions for {}: {}", unit_id, e);
                    return Ok(None);
                }
            },
            Some(ProviderTranscript::Text(text)) => Transcript {
                full_text: text.trim().to_string(),
                segments: Vec::new(),
                duration: None,
            },
            None => return Ok(None),
        };

        if transcript.is_empty() {
            return Ok(None);
        }
        let transcript = Transcript {
            duration: None,
            ..transcript
        };
        log::info!(
            "Using source-provided transcript for {} ({} segments)",
            unit_id,
            transcript.segments.len()
        );
        Ok(Some(transcript))
    }

    /// Транскрипт из хранилища или, если его нет, от провайдера
    pub async fn resolve(&self, unit_id: &str, source: &Path, work_dir: &Path) -> Result<Transcript> {
        if let Some(transcript) = self.get_existing_transcript(unit_id)? {
            return Ok(transcript);
        }
        let transcript = self.transcribe(source, work_dir).await?;
        self.store.save_transcript(unit_id, &transcript)?;
        Ok(transcript)
    }

    /// Транскрибировать исходный файл через провайдера
    pub async fn transcribe(&self, source: &Path, work_dir: &Path) -> Result<Transcript> {
        let provider = self.provider.clone().ok_or_else(|| {
            PipelineError::Configuration("no transcript available and no transcription provider configured".to_string())
        })?;

        let extracted = work_dir.join(format!("speech_{}.wav", uuid::Uuid::new_v4().simple()));
        self.toolchain
            .extract_speech_audio(source, self.config.sample_rate, &extracted)
            .await?;
        let duration = self.toolchain.probe_duration(&extracted).await?;
        let size = tokio::fs::metadata(&extracted).await?.len();

        let windows = plan_chunks(
            size,
            duration,
            provider.inline_limit_bytes(),
            self.config.safety_factor,
        );
        log::info!(
            "Transcribing {:.1}s of audio ({} bytes) in {} chunk(s) via {}",
            duration,
            size,
            windows.len(),
            provider.name()
        );

        let mut chunk_paths: Vec<PathBuf> = Vec::with_capacity(windows.len());
        if windows.len() == 1 {
            chunk_paths.push(extracted.clone());
        } else {
            for window in &windows {
                let path = work_dir.join(format!(
                    "chunk_{:03}_{}.wav",
                    window.index,
                    uuid::Uuid::new_v4().simple()
                ));
                self.toolchain
                    .slice(&extracted, window.offset, window.duration, &path)
                    .await?;
                chunk_paths.push(path);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests.max(1)));
        let policy = RetryPolicy::from_config(&self.config);
        // Поднимается первой фатальной ошибкой; фрагменты из очереди не отправляются
        let stopped = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for (window, path) in windows.iter().copied().zip(chunk_paths.iter().cloned()) {
            let semaphore = semaphore.clone();
            let provider = provider.clone();
            let policy = policy.clone();
            let stopped = stopped.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Transcription(e.to_string()))?;
                if stopped.load(Ordering::SeqCst) {
                    return Err(PipelineError::Transcription(format!(
                        "chunk {} skipped after an earlier failure",
                        window.index
                    )));
                }
                let result = async {
                    let audio = Bytes::from(tokio::fs::read(&path).await?);
                    let label = format!("chunk {}", window.index);
                    policy
                        .run(&label, || {
                            let audio = audio.clone();
                            let provider = provider.clone();
                            async move {
                                provider
                                    .transcribe_chunk(audio, "audio/wav", TRANSCRIPTION_PROMPT)
                                    .await
                            }
                        })
                        .await
                }
                .await;
                match result {
                    Ok(raw) => {
                        log::debug!("Chunk {} transcribed ({} chars)", window.index, raw.len());
                        Ok((window, raw))
                    }
                    Err(e) => {
                        stopped.store(true, Ordering::SeqCst);
                        Err(e)
                    }
                }
            });
        }

        let mut segments = Vec::new();
        let mut failure: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| PipelineError::Transcription(format!("chunk task failed: {}", e)))
                .and_then(|r| r);
            match result {
                Ok((window, raw)) => segments.extend(parse_chunk_response(&raw, window)),
                Err(e) => {
                    stopped.store(true, Ordering::SeqCst);
                    tasks.abort_all();
                    failure = Some(e);
                    break;
                }
            }
        }
        // Дождаться отменённых задач, прежде чем удалять их файлы
        while tasks.join_next().await.is_some() {}

        for path in &chunk_paths {
            if path != &extracted {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
        let _ = tokio::fs::remove_file(&extracted).await;

        if let Some(e) = failure {
            log::error!("Transcription failed: {}", e);
            return Err(match e {
                PipelineError::Transcription(_) | PipelineError::Timeout { .. } => e,
                other => PipelineError::Transcription(other.to_string()),
            });
        }

        let transcript = assemble(segments, duration);
        validate_segments(&transcript.segments, OverlapPolicy::Reject, 0.0)?;
        log::info!(
            "Transcription complete: {} segments, {} chars",
            transcript.segments.len(),
            transcript.full_text.len()
        );
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_uniform_time_slices() {
        let windows = plan_chunks(50_000_000, 300.0, 20 * 1024 * 1024, 0.9);
        assert_eq!(windows.len(), 3);
        for (i, w) in windows.iter().enumerate() {
            assert!((w.duration - 100.0).abs() < 1e-9);
            assert!((w.offset - 100.0 * i as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn small_audio_is_single_chunk() {
        let windows = plan_chunks(1_000, 12.0, 20 * 1024 * 1024, 0.9);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].offset, 0.0);
        assert_eq!(windows[0].duration, 12.0);
    }
}
