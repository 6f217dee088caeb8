//! Оркестраторы: интерактивный прогон проекта и пакетная озвучка историй

pub mod batch;
pub mod interactive;
pub mod store;
pub mod tracker;

pub use batch::{JobHandle, JobHooks, JobKey, JobOutcome, LogJobHooks, StoryQueue, StoryWorker};
pub use interactive::{DubRequest, ProjectPipeline};
pub use store::{
    MemoryStore, ProviderTranscript, RunStore, SectionStore, StoryCatalog, TranscriptStore,
    VoiceProfiles,
};
pub use tracker::{RunTracker, Stage};
