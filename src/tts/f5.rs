//! Локальная нейросетевая модель на GPU-сервере (F5-TTS)

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::InferenceServerConfig;
use crate::error::{PipelineError, Result};
use crate::model::ProviderKind;
use crate::tts::provider::{
    fetch_inference_audio, http_client, read_failure, transport_error, AudioClip,
    InferenceResponse, ProviderHealth, SpeechProvider, SynthesisRequest,
};
use crate::tts::text::prepare_text_for_tts;

const PROVIDER: &str = "f5";

#[derive(Debug, Serialize)]
struct SynthesizeBody<'a> {
    text: &'a str,
    voice_ref_path: &'a str,
    output_path: String,
    remove_silence: bool,
}

pub struct F5Provider {
    client: Client,
    base_url: String,
    output_dir: PathBuf,
    remove_silence: bool,
}

impl F5Provider {
    pub fn new(
        config: &InferenceServerConfig,
        remove_silence: bool,
        timeout_secs: u64,
        default_output_dir: PathBuf,
    ) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "F5 server URL is not configured".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            output_dir: config.output_dir.clone().unwrap_or(default_output_dir),
            remove_silence,
        })
    }

    fn output_path(&self) -> String {
        self.output_dir
            .join(format!("f5_{}.wav", uuid::Uuid::new_v4().simple()))
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl SpeechProvider for F5Provider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::F5
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioClip> {
        let text = prepare_text_for_tts(&request.text);
        if text.is_empty() {
            return Err(PipelineError::synthesis(PROVIDER, "empty text"));
        }
        if request.voice.as_str().is_empty() {
            return Err(PipelineError::Configuration(
                "voice profile has no reference prompt".to_string(),
            ));
        }

        let body = SynthesizeBody {
            text: &text,
            voice_ref_path: request.voice.as_str(),
            output_path: self.output_path(),
            remove_silence: self.remove_silence,
        };
        log::debug!("F5 synthesize -> {}", body.output_path);

        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
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

/// Опросить `GET {base}/health` инференс-сервера
pub(crate) async fn server_health(provider: &str, client: &Client, base_url: &str) -> ProviderHealth {
    let result = client.get(format!("{}/health", base_url)).send().await;
    let (healthy, detail) = match result {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.text().await.unwrap_or_default();
            (true, body.trim().to_string())
        }
        Ok(resp) => (false, format!("HTTP {}", resp.status())),
        Err(e) => (false, e.to_string()),
    };
    ProviderHealth {
        provider: provider.to_string(),
        healthy,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_server_is_rejected() {
        let err = F5Provider::new(
            &InferenceServerConfig::default(),
            true,
            30,
            std::env::temp_dir(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn body_matches_server_contract() {
        let body = SynthesizeBody {
            text: "hi",
            voice_ref_path: "/voices/ref.wav",
            output_path: "/out/a.wav".to_string(),
            remove_silence: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["voice_ref_path"], "/voices/ref.wav");
        assert_eq!(value["remove_silence"], true);
    }

    #[tokio::test]
    async fn unreachable_server_is_unhealthy() {
        let config = InferenceServerConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            output_dir: None,
        };
        let provider = F5Provider::new(&config, true, 2, std::env::temp_dir()).unwrap();
        let health = provider.health().await;
        assert!(!health.healthy);
        assert_eq!(health.provider, "f5");
    }
}
