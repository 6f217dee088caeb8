//! Заглушки для тестов: медиа-инструментарий без ffmpeg, провайдеры без сети
//!
//! "Аудиофайл" заглушки представляет собой текст: первая строка содержит длительность в
//! секундах, остальные строки описывают содержимое (для проверки порядка).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};
use crate::media::{DuckingPlan, MediaToolchain};
use crate::model::ProviderKind;
use crate::transcript::TranscriptionProvider;
use crate::tts::{AudioClip, ProviderHealth, SpeechProvider, SynthesisRequest};

/// Записать медиафайл заглушки
pub fn write_media(path: &Path, duration: f64, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("{:.6}\n{}", duration, content)).unwrap();
}

fn read_media(path: &Path) -> Result<(f64, String)> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Probe(format!("{}: {}", path.display(), e)))?;
    let (first, rest) = text.split_once('\n').unwrap_or((text.as_str(), ""));
    let duration = first
        .trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::Probe(format!("unparseable duration in {}", path.display())))?;
    Ok((duration, rest.to_string()))
}

/// Содержимое файла заглушки без строки длительности
pub fn media_content(path: &Path) -> String {
    read_media(path).unwrap().1
}

/// Вызов `time_stretch`
#[derive(Debug, Clone, PartialEq)]
pub struct StretchCall {
    pub raw_duration: f64,
    pub passes: Vec<f64>,
    pub target: f64,
}

#[derive(Default)]
pub struct FakeToolchain {
    pub calls: Mutex<Vec<String>>,
    pub stretches: Mutex<Vec<StretchCall>>,
    pub mixes: Mutex<Vec<DuckingPlan>>,
    fail_stage: Option<&'static str>,
    extract_padding: usize,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Заставить операцию (`"mux"`, `"mix"`, `"stretch"`, ...) завершаться ошибкой
    pub fn failing(mut self, stage: &'static str) -> Self {
        self.fail_stage = Some(stage);
        self
    }

    /// Увеличить размер извлечённой речевой дорожки
    pub fn with_extract_padding(mut self, bytes: usize) -> Self {
        self.extract_padding = bytes;
        self
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn enter(&self, stage: &'static str) -> Result<()> {
        self.calls.lock().push(stage.to_string());
        if self.fail_stage == Some(stage) {
            let message = format!("{} failed: injected failure", stage);
            return Err(match stage {
                "probe" => PipelineError::Probe(message),
                "extract" | "slice" => PipelineError::Transcription(message),
                "mix" => PipelineError::Mix(message),
                "mux" | "concat" => PipelineError::Mux(message),
                _ => PipelineError::Stretch(message),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaToolchain for FakeToolchain {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        self.enter("probe")?;
        Ok(read_media(path)?.0)
    }

    async fn extract_speech_audio(&self, input: &Path, _sample_rate: u32, output: &Path) -> Result<()> {
        self.enter("extract")?;
        let (duration, _) = read_media(input)?;
        write_media(output, duration, &format!("speech\n{}", "#".repeat(self.extract_padding)));
        Ok(())
    }

    async fn slice(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()> {
        self.enter("slice")?;
        read_media(input)?;
        write_media(output, duration, &format!("slice@{:.3}", start));
        Ok(())
    }

    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        self.enter("normalize")?;
        let (duration, content) = read_media(input)?;
        write_media(output, duration, &content);
        Ok(())
    }

    async fn time_stretch(
        &self,
        input: &Path,
        passes: &[f64],
        target_duration: f64,
        output: &Path,
    ) -> Result<()> {
        self.enter("stretch")?;
        let (duration, content) = read_media(input)?;
        self.stretches.lock().push(StretchCall {
            raw_duration: duration,
            passes: passes.to_vec(),
            target: target_duration,
        });
        write_media(output, target_duration, &content);
        Ok(())
    }

    async fn silence(&self, duration: f64, output: &Path) -> Result<()> {
        self.enter("silence")?;
        write_media(output, duration, &format!("silence {:.3}", duration));
        Ok(())
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        self.enter("concat")?;
        let mut total = 0.0;
        let mut content = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (duration, body) = read_media(input)?;
            total += duration;
            content.push(body);
        }
        write_media(output, total, &content.join("\n"));
        Ok(())
    }

    async fn duck_mix(
        &self,
        original: &Path,
        speech: &Path,
        plan: &DuckingPlan,
        output: &Path,
    ) -> Result<()> {
        self.enter("mix")?;
        let (original_duration, _) = read_media(original)?;
        let (speech_duration, body) = read_media(speech)?;
        self.mixes.lock().push(plan.clone());
        write_media(
            output,
            original_duration.max(speech_duration),
            &format!("mixed\n{}", body),
        );
        Ok(())
    }

    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        self.enter("mux")?;
        read_media(video)?;
        let (duration, body) = read_media(audio)?;
        write_media(output, duration, &format!("muxed\n{}", body));
        Ok(())
    }
}

/// Провайдер синтеза: длительность клипа пропорциональна длине текста
pub struct FakeSpeechProvider {
    kind: ProviderKind,
    name: String,
    calls: AtomicUsize,
    seconds_per_char: f64,
    fail_on: Option<String>,
    empty_on: Option<String>,
    panic_on: Option<String>,
    jitter: bool,
}

impl FakeSpeechProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            name: format!("fake-{}", kind.as_str()),
            calls: AtomicUsize::new(0),
            seconds_per_char: 0.1,
            fail_on: None,
            empty_on: None,
            panic_on: None,
            jitter: false,
        }
    }

    /// Ошибка синтеза для текста, содержащего `needle`
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Клип нулевой длительности для текста, содержащего `needle`
    pub fn empty_on(mut self, needle: &str) -> Self {
        self.empty_on = Some(needle.to_string());
        self
    }

    /// Паника внутри вызова для текста, содержащего `needle`
    pub fn panicking_on(mut self, needle: &str) -> Self {
        self.panic_on = Some(needle.to_string());
        self
    }

    pub fn with_seconds_per_char(mut self, seconds: f64) -> Self {
        self.seconds_per_char = seconds;
        self
    }

    /// Задержка, зависящая от текста, чтобы параллельные вызовы завершались вразнобой
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechProvider for FakeSpeechProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.jitter {
            let delay = (request.text.len() as u64 * 7) % 13;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(needle) = &self.fail_on {
            if request.text.contains(needle.as_str()) {
                return Err(PipelineError::synthesis(&self.name, "upstream rejected text"));
            }
        }
        if let Some(needle) = &self.panic_on {
            if request.text.contains(needle.as_str()) {
                panic!("fake provider crashed on {:?}", request.text);
            }
        }
        let empty = self
            .empty_on
            .as_deref()
            .map_or(false, |needle| request.text.contains(needle));
        let duration = if empty {
            0.0
        } else {
            (request.text.chars().count() as f64 * self.seconds_per_char).max(0.1)
        };
        let body = format!("{:.6}\nsay:{}", duration, request.text);
        Ok(AudioClip::new(body.into_bytes(), "wav").with_storage_key(format!("mem://{}", self.name)))
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            provider: self.name.clone(),
            healthy: true,
            detail: "fake".to_string(),
        }
    }
}

/// Провайдер транскрибации: возвращает один сегмент на фрагмент
pub struct FakeTranscriber {
    limit: u64,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    rate_limited: AtomicUsize,
    fail_always: bool,
    response: Option<String>,
}

impl FakeTranscriber {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            rate_limited: AtomicUsize::new(0),
            fail_always: false,
            response: None,
        }
    }

    /// Первые `count` вызовов завершаются ограничением частоты
    pub fn rate_limited_first(self, count: usize) -> Self {
        self.rate_limited.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// Один и тот же ответ модели для каждого фрагмента
    pub fn responding(mut self, raw: &str) -> Self {
        self.response = Some(raw.to_string());
        self
    }
}

#[async_trait]
impl TranscriptionProvider for FakeTranscriber {
    fn name(&self) -> &str {
        "fake-transcriber"
    }

    fn inline_limit_bytes(&self) -> u64 {
        self.limit
    }

    async fn transcribe_chunk(&self, audio: Bytes, _mime_type: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_always {
            return Err(PipelineError::Transcription("unsupported audio".to_string()));
        }
        let limited = self
            .rate_limited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(PipelineError::RateLimited("429 Too Many Requests".to_string()));
        }
        if let Some(raw) = &self.response {
            return Ok(raw.clone());
        }

        let text = String::from_utf8_lossy(&audio).to_string();
        let (first, rest) = text.split_once('\n').unwrap_or((text.as_str(), ""));
        let duration: f64 = first.trim().parse().unwrap_or(1.0);
        let label = rest.lines().next().unwrap_or("").trim().to_string();
        Ok(serde_json::json!([
            { "start": 0.0, "end": duration / 2.0, "text": label }
        ])
        .to_string())
    }
}
