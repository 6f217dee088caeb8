//! Единый интерфейс провайдеров синтеза речи

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::StyleParams;
use crate::error::{PipelineError, Result};
use crate::media::decode::approximate_duration;
use crate::model::{ProviderKind, VoiceReference};

/// Запрос на синтез одного фрагмента текста
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceReference,
    /// Подсказка модели (например, идентификатор модели облачного API)
    pub model_hint: Option<String>,
    pub style: StyleParams,
    /// Опорная дорожка для конвертации голоса
    pub guide_track: Option<PathBuf>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice: VoiceReference) -> Self {
        Self {
            text: text.into(),
            voice,
            model_hint: None,
            style: StyleParams::default(),
            guide_track: None,
        }
    }

    pub fn with_style(mut self, style: StyleParams) -> Self {
        self.style = style;
        self
    }

    pub fn with_guide_track(mut self, guide_track: impl Into<PathBuf>) -> Self {
        self.guide_track = Some(guide_track.into());
        self
    }
}

/// Результат синтеза
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Bytes,
    /// Оценка длительности; для расчётов используется только probe
    pub approx_duration: Option<f64>,
    /// MD5 содержимого
    pub checksum: String,
    /// Ключ/URL хранилища, если провайдер его вернул
    pub storage_key: Option<String>,
    /// Расширение файла без точки
    pub extension: String,
}

impl AudioClip {
    pub fn new(bytes: impl Into<Bytes>, extension: impl Into<String>) -> Self {
        let bytes = bytes.into();
        let extension = extension.into();
        let checksum = format!("{:x}", md5::compute(&bytes));
        let approx_duration = approximate_duration(&bytes, Some(&extension));
        Self {
            bytes,
            approx_duration,
            checksum,
            storage_key: None,
            extension,
        }
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    /// Оценка длительности, сообщённая провайдером, имеет приоритет
    pub fn with_reported_duration(mut self, duration: Option<f64>) -> Self {
        if let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) {
            self.approx_duration = Some(duration);
        }
        self
    }

    /// Записать клип на диск
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &self.bytes).await?;
        Ok(())
    }
}

/// Состояние провайдера
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub healthy: bool,
    pub detail: String,
}

/// Провайдер синтеза речи.
///
/// Реализации не хранят состояния между вызовами и допускают
/// конкурентные вызовы. Повторы и переключение на запасной провайдер
/// решает вызывающая сторона.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioClip>;

    async fn health(&self) -> ProviderHealth;
}

/// Ответ инференс-сервера (F5, RVC)
#[derive(Debug, Deserialize)]
pub(crate) struct InferenceResponse {
    pub audio_url: String,
    #[serde(default)]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// HTTP клиент с таймаутом провайдера
pub(crate) fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(PipelineError::from)
}

/// Прочитать ответ с ошибкой провайдера
pub(crate) async fn read_failure(provider: &str, response: reqwest::Response) -> PipelineError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("failed to read error body: {}", e));
    PipelineError::synthesis(provider, format!("HTTP {}: {}", status, body.trim()))
}

/// Перевести ошибку транспорта в ошибку синтеза с именем провайдера
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::synthesis(provider, format!("request timed out: {}", err))
    } else {
        PipelineError::synthesis(provider, err.to_string())
    }
}

/// Расширение файла по адресу; запрос и фрагмент URL не учитываются
fn audio_extension(location: &str) -> String {
    let path = match reqwest::Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location.to_string(),
    };
    Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or("wav")
        .to_ascii_lowercase()
}

/// Получить аудио по `audio_url` инференс-сервера: HTTP(S) или локальный путь
pub(crate) async fn fetch_inference_audio(
    provider: &str,
    client: &Client,
    response: InferenceResponse,
) -> Result<AudioClip> {
    if let Some(status) = response.status.as_deref() {
        if status != "success" && status != "ok" {
            return Err(PipelineError::synthesis(
                provider,
                format!("server reported status '{}'", status),
            ));
        }
    }

    let url = response.audio_url;
    let bytes: Bytes = if url.starts_with("http://") || url.starts_with("https://") {
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(provider, e))?;
        if !resp.status().is_success() {
            return Err(read_failure(provider, resp).await);
        }
        resp.bytes().await.map_err(|e| transport_error(provider, e))?
    } else {
        let path = url.strip_prefix("file://").unwrap_or(&url);
        tokio::fs::read(path)
            .await
            .map_err(|e| {
                PipelineError::synthesis(provider, format!("cannot read {}: {}", path, e))
            })?
            .into()
    };

    let extension = audio_extension(&url);

    Ok(AudioClip::new(bytes, extension)
        .with_storage_key(url)
        .with_reported_duration(response.duration_sec))
}
