//! Выбор стратегии синтеза
//!
//! Стратегия определяется один раз на единицу работы (проект или секцию)
//! до начала цикла синтеза. Во время цикла решение не пересматривается,
//! кроме перехода на запасную стратегию при ошибке основной.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StyleParams;
use crate::error::{PipelineError, Result};
use crate::model::{ProviderKind, SectionKind, StorySection, VoiceProfile, VoiceReference};
use crate::tts::provider::{AudioClip, SpeechProvider, SynthesisRequest};
use crate::tts::registry::ProviderRegistry;

/// Стратегия синтеза
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisStrategy {
    /// Облачный API, голос по идентификатору
    Cloud(VoiceReference),
    /// Локальная модель с референсной записью голоса
    LocalNeural(VoiceReference),
    /// Конвертация голоса поверх опорной дорожки
    VoiceConversion {
        guide_track: PathBuf,
        model: VoiceReference,
    },
}

impl SynthesisStrategy {
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            Self::Cloud(_) => ProviderKind::ElevenLabs,
            Self::LocalNeural(_) => ProviderKind::F5,
            Self::VoiceConversion { .. } => ProviderKind::Rvc,
        }
    }

    /// Запрос провайдеру для фрагмента текста
    pub fn request(&self, text: &str, style: StyleParams) -> SynthesisRequest {
        match self {
            Self::Cloud(voice) | Self::LocalNeural(voice) => {
                SynthesisRequest::new(text, voice.clone()).with_style(style)
            }
            Self::VoiceConversion { guide_track, model } => {
                SynthesisRequest::new(text, model.clone())
                    .with_style(style)
                    .with_guide_track(guide_track.clone())
            }
        }
    }
}

/// Основная стратегия и необязательная запасная
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPlan {
    pub primary: SynthesisStrategy,
    pub fallback: Option<SynthesisStrategy>,
}

fn missing(profile: &VoiceProfile, what: &str) -> PipelineError {
    PipelineError::Configuration(format!("voice profile '{}' has no {}", profile.id, what))
}

impl StrategyPlan {
    /// Стратегия для интерактивного прогона по ключу провайдера в профиле
    pub fn for_profile(profile: &VoiceProfile) -> Result<Self> {
        let cloud = profile.cloud_voice_id.clone().map(SynthesisStrategy::Cloud);
        match profile.provider {
            ProviderKind::ElevenLabs => Ok(Self {
                primary: cloud.ok_or_else(|| missing(profile, "cloud voice id"))?,
                fallback: None,
            }),
            ProviderKind::F5 => {
                let local = profile
                    .prompt_path
                    .clone()
                    .map(SynthesisStrategy::LocalNeural)
                    .ok_or_else(|| missing(profile, "reference prompt"))?;
                Ok(Self {
                    primary: local,
                    fallback: cloud,
                })
            }
            ProviderKind::Rvc => Err(PipelineError::Configuration(format!(
                "voice profile '{}' uses voice conversion, which needs a guide track per section",
                profile.id
            ))),
        }
    }

    /// Стратегия для секции истории: пение идёт через конвертацию голоса,
    /// речь предпочитает локальную модель с облачным запасным вариантом
    pub fn for_section(profile: &VoiceProfile, section: &StorySection) -> Result<Self> {
        match section.kind {
            SectionKind::Singing => {
                let guide_track = section.guide_track.clone().ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "singing section '{}' has no guide track",
                        section.id
                    ))
                })?;
                let model = profile
                    .conversion_model
                    .clone()
                    .ok_or_else(|| missing(profile, "conversion model"))?;
                Ok(Self {
                    primary: SynthesisStrategy::VoiceConversion { guide_track, model },
                    fallback: None,
                })
            }
            SectionKind::Speech => {
                let cloud = profile.cloud_voice_id.clone().map(SynthesisStrategy::Cloud);
                match profile.prompt_path.clone() {
                    Some(prompt) => Ok(Self {
                        primary: SynthesisStrategy::LocalNeural(prompt),
                        fallback: cloud,
                    }),
                    None => Ok(Self {
                        primary: cloud
                            .ok_or_else(|| missing(profile, "reference prompt or cloud voice id"))?,
                        fallback: None,
                    }),
                }
            }
        }
    }

    /// Связать стратегии с зарегистрированными провайдерами
    pub fn resolve(&self, registry: &ProviderRegistry, style: StyleParams) -> Result<Synthesizer> {
        let fallback = match &self.fallback {
            Some(strategy) => match registry.get(strategy.provider_kind()) {
                Ok(provider) => Some((strategy.clone(), provider)),
                Err(e) => {
                    log::warn!("Fallback strategy unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        match registry.get(self.primary.provider_kind()) {
            Ok(provider) => Ok(Synthesizer {
                primary: (self.primary.clone(), provider),
                fallback,
                style,
            }),
            Err(e) => match fallback {
                Some(fallback) => {
                    log::warn!("{}; using {} instead", e, fallback.1.name());
                    Ok(Synthesizer {
                        primary: fallback,
                        fallback: None,
                        style,
                    })
                }
                None => Err(e),
            },
        }
    }
}

/// Разрешённая стратегия: провайдеры выбраны, можно синтезировать
#[derive(Clone)]
pub struct Synthesizer {
    primary: (SynthesisStrategy, Arc<dyn SpeechProvider>),
    fallback: Option<(SynthesisStrategy, Arc<dyn SpeechProvider>)>,
    style: StyleParams,
}

impl Synthesizer {
    pub fn primary_name(&self) -> &str {
        self.primary.1.name()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn fallback_name(&self) -> Option<&str> {
        self.fallback.as_ref().map(|(_, provider)| provider.name())
    }

    /// Синтезировать только запасной стратегией; `None`, если её нет
    pub async fn synthesize_fallback(&self, text: &str) -> Option<Result<AudioClip>> {
        let (strategy, provider) = self.fallback.as_ref()?;
        Some(provider.synthesize(&strategy.request(text, self.style)).await)
    }

    /// Синтезировать текст; при ошибке основной стратегии пробуется запасная
    pub async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        let (strategy, provider) = &self.primary;
        match provider.synthesize(&strategy.request(text, self.style)).await {
            Ok(clip) => Ok(clip),
            Err(primary_err) => match &self.fallback {
                Some((fallback_strategy, fallback_provider)) => {
                    log::warn!(
                        "{} failed ({}), falling back to {}",
                        provider.name(),
                        primary_err,
                        fallback_provider.name()
                    );
                    fallback_provider
                        .synthesize(&fallback_strategy.request(text, self.style))
                        .await
                }
                None => Err(primary_err),
            },
        }
    }
}
