//! Облачный провайдер клонированных голосов (ElevenLabs)

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::{ElevenLabsConfig, StyleParams};
use crate::error::{PipelineError, Result};
use crate::model::ProviderKind;
use crate::tts::provider::{
    http_client, read_failure, transport_error, AudioClip, ProviderHealth, SpeechProvider,
    SynthesisRequest,
};
use crate::tts::text::prepare_text_for_tts;

const PROVIDER: &str = "elevenlabs";

pub struct ElevenLabsProvider {
    client: Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsProvider {
    pub fn new(config: ElevenLabsConfig, timeout_secs: u64) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "ElevenLabs API key is required".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(timeout_secs)?,
            config,
        })
    }

    fn extension(&self) -> &'static str {
        let format = self.config.output_format.as_str();
        if format.starts_with("pcm") {
            "pcm"
        } else if format.starts_with("ulaw") {
            "ulaw"
        } else {
            "mp3"
        }
    }
}

/// Тело запроса синтеза
pub fn request_body(text: &str, model_id: &str, style: &StyleParams) -> serde_json::Value {
    json!({
        "text": text,
        "model_id": model_id,
        "voice_settings": {
            "stability": style.stability,
            "similarity_boost": style.similarity,
            "style": style.expressiveness,
            "use_speaker_boost": style.speaker_boost,
        }
    })
}

#[async_trait]
impl SpeechProvider for ElevenLabsProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ElevenLabs
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioClip> {
        let text = prepare_text_for_tts(&request.text);
        if text.is_empty() {
            return Err(PipelineError::synthesis(PROVIDER, "empty text"));
        }
        if request.voice.as_str().is_empty() {
            return Err(PipelineError::Configuration(
                "voice profile has no cloud voice id".to_string(),
            ));
        }

        let model_id = request
            .model_hint
            .as_deref()
            .unwrap_or(&self.config.model_id);
        let url = format!(
            "{}/text-to-speech/{}",
            self.config.base_url.trim_end_matches('/'),
            request.voice.as_str()
        );

        log::debug!(
            "ElevenLabs request: voice={}, model={}, {} chars",
            request.voice,
            model_id,
            text.chars().count()
        );

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.config.output_format.as_str())])
            .header("xi-api-key", &self.config.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request_body(&text, model_id, &request.style))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        if !response.status().is_success() {
            let err = read_failure(PROVIDER, response).await;
            log::error!("{}", err);
            return Err(err);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        if bytes.is_empty() {
            return Err(PipelineError::synthesis(PROVIDER, "empty audio response"));
        }

        Ok(AudioClip::new(bytes, self.extension()))
    }

    async fn health(&self) -> ProviderHealth {
        let url = format!("{}/user", self.config.base_url.trim_end_matches('/'));
        let result = self
            .client
            .get(&url)
            .header("xi-api-key", &self.config.api_key)
            .send()
            .await;
        let (healthy, detail) = match result {
            Ok(resp) if resp.status().is_success() => (true, "API key accepted".to_string()),
            Ok(resp) => (false, format!("HTTP {}", resp.status())),
            Err(e) => (false, e.to_string()),
        };
        ProviderHealth {
            provider: PROVIDER.to_string(),
            healthy,
            detail,
        }
    }
}
