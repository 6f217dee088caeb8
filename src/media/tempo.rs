//! Разложение коэффициента изменения темпа на допустимые проходы
//!
//! Фильтр `atempo` принимает коэффициент только из диапазона [0.5, 2.0].
//! Коэффициенты вне диапазона раскладываются на цепочку проходов,
//! произведение которых равно исходному коэффициенту.

use crate::error::{PipelineError, Result};

/// Минимальный коэффициент одного прохода
pub const MIN_PASS_RATIO: f64 = 0.5;
/// Максимальный коэффициент одного прохода
pub const MAX_PASS_RATIO: f64 = 2.0;

const UNITY_EPSILON: f64 = 1e-9;

/// Разложить коэффициент на проходы из диапазона [0.5, 2.0].
///
/// Пока остаток больше 2.0, добавляется проход 2.0; пока меньше 0.5,
/// проход 0.5; последний проход несёт оставшийся коэффициент.
/// Для коэффициента 1.0 возвращается пустой список.
pub fn decompose_ratio(ratio: f64) -> Result<Vec<f64>> {
    if !(ratio.is_finite() && ratio > 0.0) {
        return Err(PipelineError::Stretch(format!(
            "tempo ratio must be positive and finite, got {}",
            ratio
        )));
    }

    let mut passes = Vec::new();
    let mut remaining = ratio;

    while remaining > MAX_PASS_RATIO {
        passes.push(MAX_PASS_RATIO);
        remaining /= MAX_PASS_RATIO;
    }
    while remaining < MIN_PASS_RATIO {
        passes.push(MIN_PASS_RATIO);
        remaining /= MIN_PASS_RATIO;
    }
    if (remaining - 1.0).abs() > UNITY_EPSILON {
        passes.push(remaining);
    }

    Ok(passes)
}

/// План растяжения клипа до целевой длительности
#[derive(Debug, Clone, PartialEq)]
pub enum StretchPlan {
    /// Расхождение в пределах допуска: клип копируется без изменения темпа
    Verbatim,
    /// Цепочка проходов `atempo`
    Tempo {
        /// Итоговый коэффициент `atempo` (исходная / целевая длительность)
        tempo: f64,
        passes: Vec<f64>,
    },
}

impl StretchPlan {
    /// Построить план для клипа длительностью `raw` и окна `target` секунд
    pub fn for_durations(raw: f64, target: f64, tolerance: f64) -> Result<Self> {
        if (raw - target).abs() < tolerance {
            return Ok(Self::Verbatim);
        }
        let tempo = raw / target;
        Ok(Self::Tempo {
            tempo,
            passes: decompose_ratio(tempo)?,
        })
    }

    /// Коэффициенты растяжения длительности (обратные к `atempo`)
    pub fn stretch_factors(&self) -> Vec<f64> {
        match self {
            Self::Verbatim => Vec::new(),
            Self::Tempo { passes, .. } => passes.iter().map(|p| 1.0 / p).collect(),
        }
    }
}

/// Строка фильтра ffmpeg для цепочки проходов
pub fn atempo_filter(passes: &[f64]) -> String {
    passes
        .iter()
        .map(|p| format!("atempo={:.6}", p))
        .collect::<Vec<_>>()
        .join(",")
}
