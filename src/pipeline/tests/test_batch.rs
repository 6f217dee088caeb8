use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::config::StyleParams;
use crate::error::PipelineError;
use crate::model::{
    ProviderKind, SectionAudio, SectionKind, SectionStatus, StoryJob, StorySection, VoiceProfile,
    VoiceReference,
};
use crate::pipeline::batch::STUCK_MESSAGE;
use crate::pipeline::store::{MemoryStore, SectionStore};
use crate::pipeline::{JobHooks, JobKey, JobOutcome, StoryQueue, StoryWorker};
use crate::progress::DefaultProgressReporter;
use crate::testing::FakeSpeechProvider;
use crate::tts::{ClipStore, ProviderRegistry};

fn section(id: &str, index: usize, text: &str) -> StorySection {
    StorySection {
        id: id.to_string(),
        story_id: "story".to_string(),
        index,
        text: text.to_string(),
        kind: SectionKind::Speech,
        guide_track: None,
    }
}

fn profile() -> VoiceProfile {
    VoiceProfile {
        id: "v1".to_string(),
        name: "Narrator".to_string(),
        provider: ProviderKind::F5,
        cloud_voice_id: Some(VoiceReference::new("cloud-v1")),
        prompt_path: Some(VoiceReference::new("/voices/v1.wav")),
        conversion_model: Some(VoiceReference::new("/models/v1.pth")),
    }
}

struct Providers {
    local: Arc<FakeSpeechProvider>,
    cloud: Arc<FakeSpeechProvider>,
    conversion: Arc<FakeSpeechProvider>,
}

impl Providers {
    fn healthy() -> Self {
        Self::new(
            FakeSpeechProvider::new(ProviderKind::F5),
            FakeSpeechProvider::new(ProviderKind::ElevenLabs),
        )
    }

    fn new(local: FakeSpeechProvider, cloud: FakeSpeechProvider) -> Self {
        Self {
            local: Arc::new(local),
            cloud: Arc::new(cloud),
            conversion: Arc::new(FakeSpeechProvider::new(ProviderKind::Rvc)),
        }
    }

    fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(self.local.clone());
        registry.register(self.cloud.clone());
        registry.register(self.conversion.clone());
        registry
    }

    fn total_calls(&self) -> usize {
        self.local.calls() + self.cloud.calls() + self.conversion.calls()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clips: Arc<ClipStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(sections: Vec<StorySection>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.add_voice_profile(profile()).unwrap();
        store.add_story("story", sections).unwrap();
        let clips = Arc::new(ClipStore::new(dir.path().join("clips"), None).unwrap());
        Self {
            store,
            clips,
            _dir: dir,
        }
    }

    fn standard() -> Self {
        Self::new(vec![
            section("s0", 0, "Once upon a time."),
            section("s1", 1, "There was a <em>fox</em>."),
            section("s2", 2, "The end."),
        ])
    }

    fn worker(&self, providers: &Providers) -> StoryWorker {
        StoryWorker::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            providers.registry(),
            self.clips.clone(),
            StyleParams::default(),
            Arc::new(DefaultProgressReporter::new()),
        )
    }

    fn record(&self, section_id: &str) -> Option<SectionAudio> {
        self.store.get_section_audio(section_id, "v1").unwrap()
    }

    fn job(&self) -> StoryJob {
        self.store.get_story_job("story", "v1").unwrap().unwrap()
    }
}

#[tokio::test]
async fn story_sections_are_completed_in_order() {
    let harness = Harness::standard();
    let providers = Providers::healthy();

    let job = harness
        .worker(&providers)
        .run_story("story", "v1", false)
        .await
        .unwrap();

    assert_eq!(job.status, SectionStatus::Complete);
    assert_eq!(job.completed_sections, 3);
    assert_eq!(job.total_sections, 3);
    assert_eq!(harness.job(), job);
    assert_eq!(providers.local.calls(), 3);
    assert_eq!(providers.cloud.calls(), 0);

    for id in ["s0", "s1", "s2"] {
        let record = harness.record(id).unwrap();
        assert_eq!(record.status, SectionStatus::Complete);
        assert!(record.completed_at.is_some());
        let path = PathBuf::from(record.audio_url.unwrap());
        assert!(harness.clips.verify(&path, &record.checksum.unwrap()).unwrap());
    }

    // Разметка убирается перед синтезом
    let fox = std::fs::read_to_string(harness.clips.get("s1", "v1").unwrap()).unwrap();
    assert!(fox.ends_with("say:There was a fox."));
}

#[tokio::test]
async fn rerun_of_complete_story_synthesizes_nothing() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);

    worker.run_story("story", "v1", false).await.unwrap();
    let calls_after_first = providers.total_calls();
    let first_completion = harness.record("s0").unwrap().completed_at;

    let job = worker.run_story("story", "v1", false).await.unwrap();

    assert_eq!(providers.total_calls(), calls_after_first);
    assert_eq!(job.status, SectionStatus::Complete);
    assert_eq!(job.completed_sections, 3);
    assert_eq!(harness.record("s0").unwrap().completed_at, first_completion);
}

#[tokio::test]
async fn force_resynthesizes_complete_sections() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);

    worker.run_story("story", "v1", false).await.unwrap();
    worker.run_story("story", "v1", true).await.unwrap();

    assert_eq!(providers.local.calls(), 6);
}

#[tokio::test]
async fn failure_stops_story_and_resume_skips_finished_sections() {
    let harness = Harness::new(vec![
        section("s0", 0, "All good here."),
        section("s1", 1, "This one goes boom."),
        section("s2", 2, "Never reached."),
    ]);
    let broken = Providers::new(
        FakeSpeechProvider::new(ProviderKind::F5).failing_on("boom"),
        FakeSpeechProvider::new(ProviderKind::ElevenLabs).failing_on("boom"),
    );

    let err = harness
        .worker(&broken)
        .run_story("story", "v1", false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SegmentFailed { index: 1, .. }));

    let s0 = harness.record("s0").unwrap();
    assert_eq!(s0.status, SectionStatus::Complete);
    let s1 = harness.record("s1").unwrap();
    assert_eq!(s1.status, SectionStatus::Error);
    assert!(s1.error.unwrap().contains("boom"));
    assert!(harness.record("s2").is_none());

    let job = harness.job();
    assert_eq!(job.status, SectionStatus::Error);
    assert_eq!(job.completed_sections, 1);
    assert!(job.error.is_some());

    let healthy = Providers::healthy();
    let job = harness
        .worker(&healthy)
        .run_story("story", "v1", false)
        .await
        .unwrap();

    assert_eq!(healthy.local.calls(), 2);
    assert_eq!(job.status, SectionStatus::Complete);
    assert_eq!(harness.record("s0").unwrap().completed_at, s0.completed_at);
    let s1 = harness.record("s1").unwrap();
    assert_eq!(s1.status, SectionStatus::Complete);
    assert!(s1.error.is_none());
}

#[tokio::test]
async fn local_failure_falls_back_to_cloud() {
    let harness = Harness::standard();
    let providers = Providers::new(
        FakeSpeechProvider::new(ProviderKind::F5).failing_on(""),
        FakeSpeechProvider::new(ProviderKind::ElevenLabs),
    );

    harness
        .worker(&providers)
        .run_story("story", "v1", false)
        .await
        .unwrap();

    assert_eq!(providers.local.calls(), 3);
    assert_eq!(providers.cloud.calls(), 3);
}

#[tokio::test]
async fn singing_sections_use_voice_conversion() {
    let mut singing = section("s1", 1, "La la la");
    singing.kind = SectionKind::Singing;
    singing.guide_track = Some(PathBuf::from("/guides/s1.wav"));
    let harness = Harness::new(vec![section("s0", 0, "Spoken intro."), singing]);
    let providers = Providers::healthy();

    harness
        .worker(&providers)
        .run_story("story", "v1", false)
        .await
        .unwrap();

    assert_eq!(providers.local.calls(), 1);
    assert_eq!(providers.conversion.calls(), 1);
}

#[tokio::test]
async fn singing_without_guide_track_is_an_error() {
    let mut singing = section("s0", 0, "La la la");
    singing.kind = SectionKind::Singing;
    let harness = Harness::new(vec![singing]);
    let providers = Providers::healthy();

    let err = harness
        .worker(&providers)
        .run_story("story", "v1", false)
        .await
        .unwrap_err();

    match err {
        PipelineError::SegmentFailed { source, .. } => {
            assert!(matches!(*source, PipelineError::Configuration(_)))
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(harness.record("s0").unwrap().status, SectionStatus::Error);
    assert_eq!(providers.total_calls(), 0);
}

#[tokio::test]
async fn unknown_voice_or_story_is_rejected() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);

    assert!(matches!(
        worker.run_story("story", "nobody", false).await,
        Err(PipelineError::Configuration(_))
    ));
    assert!(matches!(
        worker.run_story("missing", "v1", false).await,
        Err(PipelineError::Configuration(_))
    ));
}

#[test]
fn stuck_sections_become_errors() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);

    let mut stuck = SectionAudio::pending(&section("s0", 0, "x"), "v1");
    stuck.status = SectionStatus::Processing;
    stuck.updated_at = Utc::now() - chrono::Duration::hours(2);
    harness.store.put_section_audio(&stuck).unwrap();

    let mut fresh = SectionAudio::pending(&section("s1", 1, "y"), "v1");
    fresh.status = SectionStatus::Processing;
    harness.store.put_section_audio(&fresh).unwrap();

    harness
        .store
        .put_story_job(&StoryJob {
            story_id: "story".to_string(),
            voice_id: "v1".to_string(),
            status: SectionStatus::Processing,
            completed_sections: 0,
            total_sections: 3,
            error: None,
            updated_at: Utc::now() - chrono::Duration::hours(2),
        })
        .unwrap();

    let reset = worker.reset_stuck(Duration::from_secs(3600)).unwrap();

    assert_eq!(reset, 1);
    let s0 = harness.record("s0").unwrap();
    assert_eq!(s0.status, SectionStatus::Error);
    assert_eq!(s0.error.as_deref(), Some(STUCK_MESSAGE));
    assert_eq!(harness.record("s1").unwrap().status, SectionStatus::Processing);
    assert_eq!(harness.job().status, SectionStatus::Error);
}

#[derive(Default)]
struct RecordingHooks {
    failed: Mutex<Vec<JobKey>>,
    completed: Mutex<Vec<String>>,
}

impl JobHooks for RecordingHooks {
    fn on_failed(&self, job: &JobKey, _error: &PipelineError) {
        self.failed.lock().push(job.clone());
    }

    fn on_completed(&self, job: &StoryJob) {
        self.completed.lock().push(job.story_id.clone());
    }
}

#[tokio::test]
async fn duplicate_enqueue_reuses_the_running_job() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let hooks = Arc::new(RecordingHooks::default());
    let queue = StoryQueue::new(Arc::new(harness.worker(&providers)), 2, hooks.clone());

    let first = queue.enqueue("story", "v1", false).unwrap();
    let second = queue.enqueue("story", "v1", false).unwrap();
    assert!(first.same_job(&second));
    assert_eq!(queue.in_flight(), 1);

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert!(matches!(a, JobOutcome::Completed(_)));
    assert_eq!(a, b);
    assert_eq!(providers.local.calls(), 3);
    assert_eq!(*hooks.completed.lock(), vec!["story".to_string()]);
    assert_eq!(queue.in_flight(), 0);

    // Завершённое задание не мешает новой постановке
    let third = queue.enqueue("story", "v1", false).unwrap();
    assert!(!third.same_job(&first));
    assert!(matches!(third.wait().await, JobOutcome::Completed(_)));
    assert_eq!(providers.local.calls(), 3);
}

#[tokio::test]
async fn failed_job_invokes_hook() {
    let harness = Harness::new(vec![section("s0", 0, "boom")]);
    let providers = Providers::new(
        FakeSpeechProvider::new(ProviderKind::F5).failing_on("boom"),
        FakeSpeechProvider::new(ProviderKind::ElevenLabs).failing_on("boom"),
    );
    let hooks = Arc::new(RecordingHooks::default());
    let queue = StoryQueue::new(Arc::new(harness.worker(&providers)), 2, hooks.clone());

    let outcome = queue.enqueue("story", "v1", false).unwrap().wait().await;

    assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("boom")));
    assert_eq!(
        *hooks.failed.lock(),
        vec![JobKey {
            story_id: "story".to_string(),
            voice_id: "v1".to_string()
        }]
    );
}

#[tokio::test]
async fn different_voices_are_separate_jobs() {
    let harness = Harness::standard();
    let mut other = profile();
    other.id = "v2".to_string();
    harness.store.add_voice_profile(other).unwrap();
    let providers = Providers::healthy();
    let queue = StoryQueue::new(
        Arc::new(harness.worker(&providers)),
        2,
        Arc::new(RecordingHooks::default()),
    );

    let v1 = queue.enqueue("story", "v1", false).unwrap();
    let v2 = queue.enqueue("story", "v2", false).unwrap();
    assert!(!v1.same_job(&v2));
    assert_eq!(queue.in_flight(), 2);

    v1.wait().await;
    v2.wait().await;
    assert_eq!(providers.local.calls(), 6);
    assert!(v1.is_done() && v2.is_done());
}

#[tokio::test]
async fn complete_section_with_missing_audio_is_resynthesized() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);
    worker.run_story("story", "v1", false).await.unwrap();
    assert_eq!(providers.total_calls(), 3);

    // Клип вытеснен из хранилища, запись по-прежнему COMPLETE
    assert!(harness.clips.remove("s1", "v1").unwrap());

    let job = worker.run_story("story", "v1", false).await.unwrap();

    assert_eq!(job.status, SectionStatus::Complete);
    assert_eq!(job.completed_sections, 3);
    assert_eq!(providers.total_calls(), 4);
    let record = harness.record("s1").unwrap();
    assert_eq!(record.status, SectionStatus::Complete);
    let path = PathBuf::from(record.audio_url.unwrap());
    assert!(path.exists());
    assert!(harness.clips.verify(&path, &record.checksum.unwrap()).unwrap());
}

#[tokio::test]
async fn complete_section_with_corrupt_audio_is_resynthesized() {
    let harness = Harness::standard();
    let providers = Providers::healthy();
    let worker = harness.worker(&providers);
    worker.run_story("story", "v1", false).await.unwrap();

    let path = PathBuf::from(harness.record("s0").unwrap().audio_url.unwrap());
    std::fs::write(&path, b"truncated").unwrap();

    worker.run_story("story", "v1", false).await.unwrap();

    assert_eq!(providers.total_calls(), 4);
    let record = harness.record("s0").unwrap();
    let path = PathBuf::from(record.audio_url.unwrap());
    assert!(harness.clips.verify(&path, &record.checksum.unwrap()).unwrap());
}

#[tokio::test]
async fn crashed_job_is_recorded_and_released() {
    let harness = Harness::new(vec![section("s0", 0, "fine"), section("s1", 1, "boom")]);
    let providers = Providers::new(
        FakeSpeechProvider::new(ProviderKind::F5).panicking_on("boom"),
        FakeSpeechProvider::new(ProviderKind::ElevenLabs),
    );
    let hooks = Arc::new(RecordingHooks::default());
    let queue = StoryQueue::new(Arc::new(harness.worker(&providers)), 2, hooks.clone());

    let first = queue.enqueue("story", "v1", false).unwrap();
    let outcome = first.wait().await;

    assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("crashed")), "{:?}", outcome);
    assert_eq!(hooks.failed.lock().len(), 1);
    assert_eq!(queue.in_flight(), 0);

    assert_eq!(harness.record("s0").unwrap().status, SectionStatus::Complete);
    let crashed = harness.record("s1").unwrap();
    assert_eq!(crashed.status, SectionStatus::Error);
    assert!(crashed.error.unwrap().contains("crashed"));
    let job = harness.job();
    assert_eq!(job.status, SectionStatus::Error);
    assert!(job.error.unwrap().contains("crashed"));

    // Ключ освобождён: новая постановка создаёт новое задание
    let second = queue.enqueue("story", "v1", false).unwrap();
    assert!(!second.same_job(&first));
    assert!(matches!(second.wait().await, JobOutcome::Failed(_)));
    assert_eq!(providers.local.calls(), 3);
}
