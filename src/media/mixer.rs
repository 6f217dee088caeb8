//! Сохранение фоновой дорожки
//!
//! Оригинальная дорожка приглушается в окнах речи и смешивается с
//! синтезированной дорожкой.

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::media::MediaToolchain;
use crate::model::TranscriptSegment;

/// Размер кадра при пересчёте усиления (около 1.5 мс на 44.1 кГц)
pub const DUCK_FRAME_SAMPLES: usize = 64;

/// Перевести уровень в дБ в линейный коэффициент усиления
pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Объединить окна сегментов в непересекающиеся интервалы речи
pub fn speech_windows(segments: &[TranscriptSegment]) -> Vec<(f64, f64)> {
    let mut windows: Vec<(f64, f64)> = segments
        .iter()
        .filter(|s| s.end > s.start)
        .map(|s| (s.start, s.end))
        .collect();
    windows.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(windows.len());
    for (start, end) in windows {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// План приглушения оригинальной дорожки
#[derive(Debug, Clone, PartialEq)]
pub enum DuckingPlan {
    /// Приглушать только внутри окон речи
    Windowed { windows: Vec<(f64, f64)>, gain: f64 },
    /// Сегментов нет: приглушается вся дорожка
    Uniform { gain: f64 },
}

impl DuckingPlan {
    /// Построить план по сегментам и уровню приглушения
    pub fn from_segments(segments: &[TranscriptSegment], duck_level_db: f64) -> Self {
        let gain = db_to_gain(duck_level_db);
        let windows = speech_windows(segments);
        if windows.is_empty() {
            Self::Uniform { gain }
        } else {
            Self::Windowed { windows, gain }
        }
    }

    /// Усиление оригинальной дорожки в момент `t`
    pub fn gain_at(&self, t: f64) -> f64 {
        match self {
            Self::Uniform { gain } => *gain,
            Self::Windowed { windows, gain } => {
                if windows.iter().any(|(start, end)| t >= *start && t <= *end) {
                    *gain
                } else {
                    1.0
                }
            }
        }
    }

    /// Цепочка фильтров для оригинальной дорожки.
    ///
    /// `volume` с `eval=frame` пересчитывает усиление раз на кадр, а не на
    /// отсчёт, поэтому перед ним кадры режутся до [`DUCK_FRAME_SAMPLES`]
    /// отсчётов: граница окна смещается не более чем на один такой кадр.
    pub fn volume_filter(&self) -> String {
        match self {
            Self::Uniform { gain } => format!("volume={:.6}", gain),
            Self::Windowed { windows, gain } => {
                let condition = windows
                    .iter()
                    .map(|(start, end)| format!("between(t\\,{:.3}\\,{:.3})", start, end))
                    .collect::<Vec<_>>()
                    .join("+");
                format!(
                    "asetnsamples=n={}:p=0,volume='if({}\\,{:.6}\\,1)':eval=frame",
                    DUCK_FRAME_SAMPLES, condition, gain
                )
            }
        }
    }
}

/// Микшер, сохраняющий фон под новым голосом
pub struct BackgroundMixer<'a> {
    toolchain: &'a dyn MediaToolchain,
    duck_level_db: f64,
}

impl<'a> BackgroundMixer<'a> {
    pub fn new(toolchain: &'a dyn MediaToolchain, duck_level_db: f64) -> Self {
        Self {
            toolchain,
            duck_level_db,
        }
    }

    /// Смешать приглушённый оригинал с синтезированной дорожкой.
    /// Длительность результата не меньше длительности каждой из дорожек.
    pub async fn mix(
        &self,
        original: &Path,
        synthesized: &Path,
        segments: &[TranscriptSegment],
        output: &Path,
    ) -> Result<PathBuf> {
        let plan = DuckingPlan::from_segments(segments, self.duck_level_db);
        match &plan {
            DuckingPlan::Uniform { gain } => log::info!(
                "No speech windows, attenuating the whole original track (gain {:.3})",
                gain
            ),
            DuckingPlan::Windowed { windows, gain } => log::info!(
                "Ducking original track in {} speech windows (gain {:.3})",
                windows.len(),
                gain
            ),
        }

        self.toolchain
            .duck_mix(original, synthesized, &plan, output)
            .await
            .map_err(|e| match e {
                PipelineError::Mix(_) | PipelineError::Timeout { .. } => e,
                other => PipelineError::Mix(other.to_string()),
            })?;

        Ok(output.to_path_buf())
    }
}
