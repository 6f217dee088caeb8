//! Ресинхронизация синтезированной речи с исходной временной шкалой
//!
//! Каждый сегмент синтезируется отдельно и растягивается ровно в своё
//! окно `[start, end]`; промежутки между сегментами заполняются тишиной.
//! Склеенная дорожка совпадает по длительности с исходником.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::config::ResyncConfig;
use crate::error::{PipelineError, Result};
use crate::media::{MediaToolchain, StretchPlan};
use crate::model::{validate_segments, SyncMode, SynthesizedClip, TranscriptSegment};
use crate::tts::{AudioClip, Synthesizer};

/// Обратный вызов прогресса: (готово сегментов, всего сегментов)
pub type SegmentProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Элемент временной шкалы
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Silence { duration: f64 },
    Speech { index: usize, start: f64, end: f64 },
}

impl TimelineItem {
    pub fn duration(&self) -> f64 {
        match self {
            Self::Silence { duration } => *duration,
            Self::Speech { start, end, .. } => end - start,
        }
    }
}

/// Построить временную шкалу: речь в окнах сегментов, тишина в промежутках
pub fn plan_timeline(
    segments: &[TranscriptSegment],
    total_duration: f64,
    config: &ResyncConfig,
) -> Vec<TimelineItem> {
    let mut items = Vec::with_capacity(segments.len() * 2 + 1);
    let mut cursor = 0.0;

    for (index, segment) in segments.iter().enumerate() {
        if segment.is_noise(config.noise_threshold) {
            log::debug!(
                "Skipping noise segment {} ([{:.3}, {:.3}])",
                index,
                segment.start,
                segment.end
            );
            continue;
        }
        if segment.start > cursor + config.gap_threshold {
            items.push(TimelineItem::Silence {
                duration: segment.start - cursor,
            });
        }
        items.push(TimelineItem::Speech {
            index,
            start: segment.start,
            end: segment.end,
        });
        cursor = segment.end;
    }

    if total_duration > cursor + config.trailing_threshold {
        items.push(TimelineItem::Silence {
            duration: total_duration - cursor,
        });
    }
    items
}

/// Фрагмент итоговой дорожки
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPiece {
    pub item: TimelineItem,
    pub path: PathBuf,
}

/// Результат ресинхронизации
#[derive(Debug, Clone)]
pub struct ResyncOutcome {
    pub track: PathBuf,
    pub mode: SyncMode,
    pub pieces: Vec<TrackPiece>,
    pub clips: Vec<SynthesizedClip>,
}

pub struct Resynchronizer<'a> {
    toolchain: &'a dyn MediaToolchain,
    synthesizer: &'a Synthesizer,
    config: &'a ResyncConfig,
}

impl<'a> Resynchronizer<'a> {
    pub fn new(
        toolchain: &'a dyn MediaToolchain,
        synthesizer: &'a Synthesizer,
        config: &'a ResyncConfig,
    ) -> Self {
        Self {
            toolchain,
            synthesizer,
            config,
        }
    }

    /// Записать сырой клип и измерить его длительность
    async fn store_raw(&self, clip: &AudioClip, path: &Path) -> Result<f64> {
        clip.write_to(path).await?;
        self.toolchain.probe_duration(path).await
    }

    /// Синтезировать сегмент и записать сырой клип.
    ///
    /// Клип нулевой длительности считается ошибкой синтеза; если у стратегии
    /// есть запасной провайдер, сегмент синтезируется им повторно.
    async fn synthesize_segment(
        &self,
        index: usize,
        segment: &TranscriptSegment,
        work_dir: &Path,
    ) -> Result<SynthesizedClip> {
        let fail = |e| PipelineError::segment(index, &segment.text, e);

        let clip = self.synthesizer.synthesize(&segment.text).await.map_err(fail)?;
        let mut raw_path = raw_clip_path(work_dir, index, &clip.extension);
        let mut raw_duration = self.store_raw(&clip, &raw_path).await.map_err(fail)?;

        if !is_audible(raw_duration) {
            let empty = empty_clip_error(self.synthesizer.primary_name(), raw_duration);
            let Some(retried) = self.synthesizer.synthesize_fallback(&segment.text).await else {
                return Err(fail(empty));
            };
            log::warn!("Segment {}: {}, retrying with the fallback provider", index, empty);
            if let Err(e) = tokio::fs::remove_file(&raw_path).await {
                log::debug!("Could not remove {}: {}", raw_path.display(), e);
            }

            let clip = retried.map_err(fail)?;
            raw_path = raw_clip_path(work_dir, index, &clip.extension);
            raw_duration = self.store_raw(&clip, &raw_path).await.map_err(fail)?;
            if !is_audible(raw_duration) {
                let name = self.synthesizer.fallback_name().unwrap_or("fallback");
                return Err(fail(empty_clip_error(name, raw_duration)));
            }
        }

        log::debug!(
            "Segment {} synthesized: {:.3}s raw for a {:.3}s window",
            index,
            raw_duration,
            segment.duration()
        );
        Ok(SynthesizedClip {
            source_segment_index: index,
            raw_path,
            raw_duration,
            target_duration: segment.duration(),
        })
    }

    /// Синтезировать все речевые элементы. Результат упорядочен по индексу сегмента.
    async fn synthesize_all(
        &self,
        segments: &[TranscriptSegment],
        timeline: &[TimelineItem],
        work_dir: &Path,
        progress: Option<SegmentProgress<'_>>,
    ) -> Result<Vec<SynthesizedClip>> {
        let indices: Vec<usize> = timeline
            .iter()
            .filter_map(|item| match item {
                TimelineItem::Speech { index, .. } => Some(*index),
                TimelineItem::Silence { .. } => None,
            })
            .collect();
        let total = indices.len();
        let report = |done: usize| {
            if let Some(progress) = progress {
                progress(done, total);
            }
        };

        if !self.config.parallel_synthesis {
            let mut clips = Vec::with_capacity(total);
            for index in indices {
                clips.push(
                    self.synthesize_segment(index, &segments[index], work_dir)
                        .await?,
                );
                report(clips.len());
            }
            return Ok(clips);
        }

        let done = std::sync::atomic::AtomicUsize::new(0);
        let mut clips: Vec<SynthesizedClip> = stream::iter(indices)
            .map(|index| {
                let done = &done;
                let report = &report;
                async move {
                    let clip = self
                        .synthesize_segment(index, &segments[index], work_dir)
                        .await?;
                    report(done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1);
                    Ok::<_, PipelineError>(clip)
                }
            })
            .buffer_unordered(self.config.max_parallel_synthesis.max(1))
            .try_collect()
            .await?;
        // Вызовы завершаются в произвольном порядке; сборка строго по индексу
        clips.sort_by_key(|c| c.source_segment_index);
        Ok(clips)
    }

    /// Растянуть клип в окно сегмента или скопировать без изменений
    async fn fit_clip(&self, clip: &SynthesizedClip, text: &str, output: &Path) -> Result<()> {
        let plan = StretchPlan::for_durations(
            clip.raw_duration,
            clip.target_duration,
            self.config.stretch_tolerance,
        )
        .map_err(|e| PipelineError::segment(clip.source_segment_index, text, e))?;
        let result = match &plan {
            StretchPlan::Verbatim => self.toolchain.normalize(&clip.raw_path, output).await,
            StretchPlan::Tempo { tempo, passes } => {
                log::debug!(
                    "Segment {}: atempo {:.4} in {} pass(es)",
                    clip.source_segment_index,
                    tempo,
                    passes.len()
                );
                self.toolchain
                    .time_stretch(&clip.raw_path, passes, clip.target_duration, output)
                    .await
            }
        };
        result.map_err(|e| PipelineError::segment(clip.source_segment_index, text, e))
    }

    /// Выполнить ресинхронизацию по сегментам
    pub async fn run(
        &self,
        segments: &[TranscriptSegment],
        total_duration: f64,
        work_dir: &Path,
        progress: Option<SegmentProgress<'_>>,
    ) -> Result<ResyncOutcome> {
        let segments = validate_segments(
            segments,
            self.config.overlap_policy,
            self.config.noise_threshold,
        )?;
        let timeline = plan_timeline(&segments, total_duration, self.config);
        log::info!(
            "Resynchronizing {} segments into {:.3}s ({} timeline items) with {}",
            segments.len(),
            total_duration,
            timeline.len(),
            self.synthesizer.primary_name()
        );

        let mut created: Vec<PathBuf> = Vec::new();
        match self
            .assemble(&segments, &timeline, work_dir, progress, &mut created)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                discard(&created).await;
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        segments: &[TranscriptSegment],
        timeline: &[TimelineItem],
        work_dir: &Path,
        progress: Option<SegmentProgress<'_>>,
        created: &mut Vec<PathBuf>,
    ) -> Result<ResyncOutcome> {
        let synthesized = self.synthesize_all(segments, timeline, work_dir, progress).await;
        let clips = match synthesized {
            Ok(clips) => clips,
            Err(e) => {
                created.extend(raw_clip_paths(work_dir, timeline));
                return Err(e);
            }
        };
        created.extend(clips.iter().map(|c| c.raw_path.clone()));

        let mut pieces = Vec::with_capacity(timeline.len());
        let mut clip_iter = clips.iter();
        let mut silence_count = 0;

        for item in timeline {
            match item {
                TimelineItem::Silence { duration } => {
                    let path = work_dir.join(format!("gap_{:04}.wav", silence_count));
                    silence_count += 1;
                    created.push(path.clone());
                    self.toolchain.silence(*duration, &path).await?;
                    pieces.push(TrackPiece {
                        item: item.clone(),
                        path,
                    });
                }
                TimelineItem::Speech { index, .. } => {
                    let clip = clip_iter
                        .next()
                        .filter(|c| c.source_segment_index == *index)
                        .ok_or_else(|| {
                            PipelineError::Stretch(format!("no synthesized clip for segment {}", index))
                        })?;
                    let path = work_dir.join(format!("seg_{:04}.wav", index));
                    created.push(path.clone());
                    self.fit_clip(clip, &segments[*index].text, &path).await?;
                    pieces.push(TrackPiece {
                        item: item.clone(),
                        path,
                    });
                }
            }
        }

        let track = work_dir.join("resynced.wav");
        created.push(track.clone());
        let inputs: Vec<PathBuf> = pieces.iter().map(|p| p.path.clone()).collect();
        self.toolchain.concat(&inputs, &track).await?;

        Ok(ResyncOutcome {
            track,
            mode: SyncMode::Aligned,
            pieces,
            clips,
        })
    }

    /// Резервный режим без разметки времени: весь текст одним клипом.
    ///
    /// Короткий клип дополняется тишиной до длительности исходника,
    /// длинный сжимается до неё.
    pub async fn run_best_effort(
        &self,
        text: &str,
        total_duration: f64,
        work_dir: &Path,
    ) -> Result<ResyncOutcome> {
        log::warn!(
            "No timed segments, synthesizing full text as one clip (sync is best-effort)"
        );
        let mut created: Vec<PathBuf> = Vec::new();
        match self
            .assemble_best_effort(text, total_duration, work_dir, &mut created)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let whole = [TimelineItem::Speech {
                    index: 0,
                    start: 0.0,
                    end: total_duration,
                }];
                created.extend(raw_clip_paths(work_dir, &whole));
                discard(&created).await;
                Err(e)
            }
        }
    }

    async fn assemble_best_effort(
        &self,
        text: &str,
        total_duration: f64,
        work_dir: &Path,
        created: &mut Vec<PathBuf>,
    ) -> Result<ResyncOutcome> {
        let segment = TranscriptSegment::new(0.0, total_duration, text);
        let clip = self.synthesize_segment(0, &segment, work_dir).await?;
        created.push(clip.raw_path.clone());

        let speech = work_dir.join("seg_0000.wav");
        created.push(speech.clone());
        let speech_end = if clip.raw_duration > total_duration + self.config.stretch_tolerance {
            log::warn!(
                "Synthesized speech ({:.3}s) is longer than the source ({:.3}s), compressing",
                clip.raw_duration,
                total_duration
            );
            self.fit_clip(&clip, text, &speech).await?;
            total_duration
        } else {
            self.toolchain
                .normalize(&clip.raw_path, &speech)
                .await
                .map_err(|e| PipelineError::segment(0, text, e))?;
            clip.raw_duration
        };

        let mut pieces = vec![TrackPiece {
            item: TimelineItem::Speech {
                index: 0,
                start: 0.0,
                end: speech_end,
            },
            path: speech,
        }];

        if total_duration > speech_end + self.config.trailing_threshold {
            let gap = work_dir.join("gap_0000.wav");
            created.push(gap.clone());
            let duration = total_duration - speech_end;
            self.toolchain.silence(duration, &gap).await?;
            pieces.push(TrackPiece {
                item: TimelineItem::Silence { duration },
                path: gap,
            });
        }

        let track = work_dir.join("resynced.wav");
        created.push(track.clone());
        let inputs: Vec<PathBuf> = pieces.iter().map(|p| p.path.clone()).collect();
        self.toolchain.concat(&inputs, &track).await?;

        Ok(ResyncOutcome {
            track,
            mode: SyncMode::BestEffort,
            pieces,
            clips: vec![clip],
        })
    }
}

fn raw_clip_path(work_dir: &Path, index: usize, extension: &str) -> PathBuf {
    work_dir.join(format!("seg_{:04}_raw.{}", index, extension))
}

fn is_audible(duration: f64) -> bool {
    duration.is_finite() && duration > 0.0
}

fn empty_clip_error(provider: &str, duration: f64) -> PipelineError {
    PipelineError::synthesis(
        provider,
        format!("provider returned an empty clip ({:.3}s)", duration),
    )
}

/// Пути сырых клипов, которые могли появиться до ошибки синтеза
fn raw_clip_paths(work_dir: &Path, timeline: &[TimelineItem]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return paths;
    };
    let prefixes: Vec<String> = timeline
        .iter()
        .filter_map(|item| match item {
            TimelineItem::Speech { index, .. } => Some(format!("seg_{:04}_raw.", index)),
            TimelineItem::Silence { .. } => None,
        })
        .collect();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            paths.push(entry.path());
        }
    }
    paths
}

/// Удалить частично созданные клипы
async fn discard(paths: &[PathBuf]) {
    for path in paths {
        if tokio::fs::remove_file(path).await.is_ok() {
            log::debug!("Discarded partial clip {}", path.display());
        }
    }
}
