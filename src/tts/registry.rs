//! Реестр провайдеров синтеза
//!
//! Создаётся при старте процесса и передаётся оркестраторам по ссылке.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::model::ProviderKind;
use crate::tts::elevenlabs::ElevenLabsProvider;
use crate::tts::f5::F5Provider;
use crate::tts::provider::{ProviderHealth, SpeechProvider};
use crate::tts::rvc::RvcProvider;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn SpeechProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Зарегистрировать все провайдеры, для которых есть настройки.
    /// Ненастроенные провайдеры пропускаются с предупреждением.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        let providers = &config.providers;
        let timeout = providers.request_timeout_secs;
        let output_dir = config.work_dir().join("inference");

        match ElevenLabsProvider::new(providers.elevenlabs.clone(), timeout) {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => log::warn!("ElevenLabs provider disabled: {}", e),
        }
        match F5Provider::new(
            &providers.f5,
            providers.remove_silence,
            timeout,
            output_dir.clone(),
        ) {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => log::warn!("F5 provider disabled: {}", e),
        }
        match RvcProvider::new(
            &providers.rvc,
            providers.f0_method.clone(),
            providers.pitch_change,
            timeout,
            output_dir,
        ) {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => log::warn!("RVC provider disabled: {}", e),
        }

        log::info!("Registered synthesis providers: {:?}", registry.kinds());
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn SpeechProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn SpeechProvider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            PipelineError::Configuration(format!("synthesis provider '{}' is not configured", kind))
        })
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Опросить все зарегистрированные провайдеры
    pub async fn health_report(&self) -> Vec<ProviderHealth> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        join_all(providers.iter().map(|p| p.health())).await
    }
}
