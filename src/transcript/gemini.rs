//! Провайдер транскрибации на базе Gemini (аудио передаётся inline)

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::config::TranscriptionConfig;
use crate::error::{PipelineError, Result};
use crate::transcript::adapter::TranscriptionProvider;

pub struct GeminiTranscriber {
    client: Client,
    config: TranscriptionConfig,
}

impl GeminiTranscriber {
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "Gemini API key is required for transcription".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }
}

/// Классифицировать неуспешный ответ: квоты и 429 можно повторить
pub fn classify_failure(status: StatusCode, body: &str) -> PipelineError {
    let message = format!("HTTP {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || body.contains("RESOURCE_EXHAUSTED")
        || body.to_lowercase().contains("quota")
    {
        PipelineError::RateLimited(message)
    } else {
        PipelineError::Transcription(message)
    }
}

/// Извлечь текст из ответа generateContent
pub fn extract_text(response: &Value) -> Result<String> {
    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = response
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates in response");
            PipelineError::Transcription(format!("empty transcription response: {}", reason))
        })?;

    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

#[async_trait]
impl TranscriptionProvider for GeminiTranscriber {
    fn name(&self) -> &str {
        "gemini"
    }

    fn inline_limit_bytes(&self) -> u64 {
        self.config.inline_limit_bytes
    }

    async fn transcribe_chunk(&self, audio: Bytes, mime_type: &str, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": mime_type, "data": BASE64.encode(&audio) } }
                ]
            }],
            "generationConfig": { "temperature": 0.0 }
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transcription(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::Transcription(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let value: Value = serde_json::from_str(&text)?;
        extract_text(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_retryable() {
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_failure(
            StatusCode::FORBIDDEN,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
        )
        .is_retryable());
        assert!(!classify_failure(StatusCode::BAD_REQUEST, "invalid audio").is_retryable());
    }

    #[test]
    fn text_parts_are_joined() {
        let response = json!({
            "candidates": [{ "content": { "parts": [{ "text": "[{\"start\":0," }, { "text": "\"end\":1,\"text\":\"a\"}]" }] } }]
        });
        assert_eq!(
            extract_text(&response).unwrap(),
            "[{\"start\":0,\"end\":1,\"text\":\"a\"}]"
        );
    }

    #[test]
    fn blocked_prompt_is_fatal() {
        let response = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = extract_text(&response).unwrap_err();
        assert!(matches!(err, PipelineError::Transcription(ref m) if m.contains("SAFETY")));
    }

    #[test]
    fn api_key_is_required() {
        assert!(GeminiTranscriber::new(TranscriptionConfig::default()).is_err());
    }
}
