//! Модуль конфигурации библиотеки voice-resync
//!
//! Все структуры сериализуются через serde и имеют значения по умолчанию,
//! соответствующие эталонной политике конвейера.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::OverlapPolicy;

/// Внешний медиаинструментарий (ffmpeg/ffprobe)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Таймаут одного вызова внешнего процесса
    pub process_timeout_secs: u64,
    /// Частота дискретизации промежуточных клипов
    pub sample_rate: u32,
    /// Битрейт AAC в итоговом контейнере
    pub audio_bitrate: String,
    /// Сколько байт stderr сохранять в сообщении об ошибке
    pub stderr_tail_bytes: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            process_timeout_secs: 600,
            sample_rate: 44100,
            audio_bitrate: "192k".to_string(),
            stderr_tail_bytes: 1200,
        }
    }
}

/// Провайдер транскрибации и политика разбиения на куски
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    /// Предел размера встроенных данных у провайдера
    pub inline_limit_bytes: u64,
    /// Доля предела, которую разрешено занимать одному куску
    pub safety_factor: f64,
    /// Частота дискретизации извлекаемой речевой дорожки
    pub sample_rate: u32,
    /// Максимум одновременных запросов
    pub max_concurrent_requests: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            inline_limit_bytes: 20 * 1024 * 1024,
            safety_factor: 0.9,
            sample_rate: 16000,
            max_concurrent_requests: 2,
            max_attempts: 5,
            initial_backoff_ms: 2000,
            max_backoff_ms: 30_000,
            request_timeout_secs: 300,
        }
    }
}

/// Параметры стиля синтеза (пробрасываются провайдеру как есть)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleParams {
    pub stability: f32,
    pub similarity: f32,
    pub expressiveness: f32,
    pub speaker_boost: bool,
}

impl Default for StyleParams {
    /// По умолчанию максимальное сходство с референсным голосом
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity: 1.0,
            expressiveness: 0.0,
            speaker_boost: true,
        }
    }
}

/// Облачный API клонированных голосов
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    pub base_url: String,
    pub model_id: String,
    pub output_format: String,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
        }
    }
}

/// Локальный GPU-сервер (F5 или RVC)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceServerConfig {
    /// Пустой URL означает, что провайдер не настроен
    pub base_url: String,
    /// Каталог для выходных файлов, видимый серверу
    pub output_dir: Option<PathBuf>,
}

/// Настройки провайдеров синтеза
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub elevenlabs: ElevenLabsConfig,
    pub f5: InferenceServerConfig,
    pub rvc: InferenceServerConfig,
    pub remove_silence: bool,
    pub f0_method: String,
    pub pitch_change: i32,
    pub request_timeout_secs: u64,
    pub style: StyleParams,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            elevenlabs: ElevenLabsConfig::default(),
            f5: InferenceServerConfig::default(),
            rvc: InferenceServerConfig::default(),
            remove_silence: true,
            f0_method: "rmvpe".to_string(),
            pitch_change: 0,
            request_timeout_secs: 300,
            style: StyleParams::default(),
        }
    }
}

/// Параметры ресинхронизации сегментов
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Сегменты короче этого порога считаются шумом
    pub noise_threshold: f64,
    /// Минимальный зазор, для которого вставляется тишина
    pub gap_threshold: f64,
    /// Расхождение длительностей, ниже которого клип не растягивается
    pub stretch_tolerance: f64,
    /// Минимальный хвост, для которого добавляется тишина в конце
    pub trailing_threshold: f64,
    /// Синтезировать сегменты параллельно (порядок сборки сохраняется)
    pub parallel_synthesis: bool,
    pub max_parallel_synthesis: usize,
    pub overlap_policy: OverlapPolicy,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            noise_threshold: 0.05,
            gap_threshold: 0.05,
            stretch_tolerance: 0.05,
            trailing_threshold: 0.1,
            parallel_synthesis: false,
            max_parallel_synthesis: 4,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

/// Сохранение фоновой дорожки под новым голосом
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub duck_level_db: f64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { duck_level_db: -12.0 }
    }
}

/// Пул обработчиков очереди историй
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Каталог хранилища синтезированных клипов
    pub clip_store_dir: Option<PathBuf>,
    /// Максимальный размер хранилища в байтах
    pub max_clip_store_bytes: Option<u64>,
    /// Через сколько секунд PROCESSING считается зависшим
    pub stuck_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            clip_store_dir: None,
            max_clip_store_bytes: Some(2 * 1024 * 1024 * 1024), // 2 GB
            stuck_after_secs: 30 * 60,
        }
    }
}

/// Конфигурация конвейера
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub toolchain: ToolchainConfig,
    pub transcription: TranscriptionConfig,
    pub providers: ProvidersConfig,
    pub resync: ResyncConfig,
    pub mixer: MixerConfig,
    pub worker: WorkerConfig,
    /// Каталог для временных файлов прогонов
    pub work_dir: Option<PathBuf>,
    /// Оставлять ли временные файлы после прогона
    pub keep_temp_files: bool,
}

impl PipelineConfig {
    /// Загрузить конфигурацию из JSON файла
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Заполнить учётные данные и пути из переменных окружения
    pub fn apply_env_overrides(&mut self) {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(key) = env("ELEVENLABS_API_KEY") {
            self.providers.elevenlabs.api_key = key;
        }
        if let Some(key) = env("GEMINI_API_KEY") {
            self.transcription.api_key = key;
        }
        if let Some(url) = env("F5_SERVER_URL") {
            self.providers.f5.base_url = url;
        }
        if let Some(url) = env("RVC_SERVER_URL") {
            self.providers.rvc.base_url = url;
        }
        if let Some(path) = env("FFMPEG_PATH") {
            self.toolchain.ffmpeg_path = path;
        }
        if let Some(path) = env("FFPROBE_PATH") {
            self.toolchain.ffprobe_path = path;
        }
    }

    /// Проверить значения на допустимость
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(PipelineError::Configuration(msg.to_string()));

        if self.toolchain.process_timeout_secs == 0 {
            return fail("toolchain.process_timeout_secs must be positive");
        }
        if self.transcription.max_concurrent_requests == 0 {
            return fail("transcription.max_concurrent_requests must be at least 1");
        }
        if self.transcription.max_attempts == 0 {
            return fail("transcription.max_attempts must be at least 1");
        }
        if !(self.transcription.safety_factor > 0.0 && self.transcription.safety_factor <= 1.0) {
            return fail("transcription.safety_factor must be in (0, 1]");
        }
        if self.transcription.inline_limit_bytes == 0 {
            return fail("transcription.inline_limit_bytes must be positive");
        }
        if self.worker.concurrency == 0 {
            return fail("worker.concurrency must be at least 1");
        }
        if self.resync.parallel_synthesis && self.resync.max_parallel_synthesis == 0 {
            return fail("resync.max_parallel_synthesis must be at least 1");
        }
        if self.mixer.duck_level_db > 0.0 || !self.mixer.duck_level_db.is_finite() {
            return fail("mixer.duck_level_db must be a finite value <= 0 dB");
        }
        if self.resync.noise_threshold < 0.0 || self.resync.stretch_tolerance < 0.0 {
            return fail("resync thresholds must not be negative");
        }
        Ok(())
    }

    /// Каталог для временных файлов прогонов
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("voice-resync"))
    }
}
