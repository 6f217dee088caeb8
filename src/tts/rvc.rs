//! Конвертация голоса по опорной дорожке (RVC) для пения

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::InferenceServerConfig;
use crate::error::{PipelineError, Result};
use crate::model::ProviderKind;
use crate::tts::f5::server_health;
use crate::tts::provider::{
    fetch_inference_audio, http_client, read_failure, transport_error, AudioClip,
    InferenceResponse, ProviderHealth, SpeechProvider, SynthesisRequest,
};

const PROVIDER: &str = "rvc";

#[derive(Debug, Serialize)]
struct ConvertBody<'a> {
    guide_audio_path: String,
    voice_model_path: &'a str,
    output_path: String,
    f0_method: &'a str,
    pitch_change: i32,
}

pub struct RvcProvider {
    client: Client,
    base_url: String,
    output_dir: PathBuf,
    f0_method: String,
    pitch_change: i32,
}

impl RvcProvider {
    pub fn new(
        config: &InferenceServerConfig,
        f0_method: impl Into<String>,
        pitch_change: i32,
        timeout_secs: u64,
        default_output_dir: PathBuf,
    ) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "RVC server URL is not configured".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            output_dir: config.output_dir.clone().unwrap_or(default_output_dir),
            f0_method: f0_method.into(),
            pitch_change,
        })
    }
}

#[async_trait]
impl SpeechProvider for RvcProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Rvc
    }

    /// Текст не используется: голос берётся из опорной дорожки,
    /// `voice` указывает на файл модели
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioClip> {
        let guide = request.guide_track.as_ref().ok_or_else(|| {
            PipelineError::Configuration("voice conversion requires a guide track".to_string())
        })?;
        if request.voice.as_str().is_empty() {
            return Err(PipelineError::Configuration(
                "voice profile has no conversion model".to_string(),
            ));
        }

        let body = ConvertBody {
            guide_audio_path: guide.to_string_lossy().into_owned(),
            voice_model_path: request.voice.as_str(),
            output_path: self
                .output_dir
                .join(format!("rvc_{}.wav", uuid::Uuid::new_v4().simple()))
                .to_string_lossy()
                .into_owned(),
            f0_method: &self.f0_method,
            pitch_change: self.pitch_change,
        };
        log::debug!(
            "RVC convert {} with {}",
            body.guide_audio_path,
            body.voice_model_path
        );

        let response = self
            .client
            .post(format!("{}/convert", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        if !response.status().is_success() {
            let err = read_failure(PROVIDER, response).await;
            log::error!("{}", err);
            return Err(err);
        }

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        fetch_inference_audio(PROVIDER, &self.client, parsed).await
    }

    async fn health(&self) -> ProviderHealth {
        server_health(PROVIDER, &self.client, &self.base_url).await
    }
}
