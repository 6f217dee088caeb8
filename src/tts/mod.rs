//! Модуль синтеза речи
//!
//! Единый интерфейс провайдеров клонированных голосов, выбор стратегии,
//! реестр провайдеров и хранилище готовых клипов.

pub mod elevenlabs;
pub mod f5;
pub mod provider;
pub mod registry;
pub mod rvc;
pub mod store;
pub mod strategy;
pub mod text;

pub use provider::{AudioClip, ProviderHealth, SpeechProvider, SynthesisRequest};
pub use registry::ProviderRegistry;
pub use store::{ClipStore, StoredClip};
pub use strategy::{StrategyPlan, SynthesisStrategy, Synthesizer};
