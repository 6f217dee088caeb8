//! Парсинг субтитров WebVTT в сегменты транскрипта

use crate::error::{PipelineError, Result};
use crate::model::TranscriptSegment;
use crate::tts::text::prepare_text_for_tts;

/// Разобрать документ WebVTT
pub fn parse_vtt(content: &str) -> Result<Vec<TranscriptSegment>> {
    let content = content.trim_start_matches('\u{feff}');
    let mut lines = content.lines();

    match lines.next() {
        Some(header) if header.trim_start().starts_with("WEBVTT") => {}
        _ => {
            return Err(PipelineError::DataQuality(
                "invalid VTT document: missing WEBVTT header".to_string(),
            ))
        }
    }

    let mut segments = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            if let Some(segment) = parse_cue_block(&block) {
                segments.push(segment);
            }
            block.clear();
        } else {
            block.push(line);
        }
    }
    if let Some(segment) = parse_cue_block(&block) {
        segments.push(segment);
    }

    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(segments)
}

fn parse_cue_block(lines: &[&str]) -> Option<TranscriptSegment> {
    let timing_pos = lines.iter().position(|line| line.contains("-->"))?;
    let (start, rest) = lines[timing_pos].split_once("-->")?;
    // После конечной метки могут идти настройки отображения
    let end = rest.split_whitespace().next()?;

    let start = parse_timestamp(start.trim())?;
    let end = parse_timestamp(end)?;

    let text = prepare_text_for_tts(&lines[timing_pos + 1..].join(" "));
    if text.is_empty() || end <= start {
        return None;
    }
    Some(TranscriptSegment::new(start, end, text))
}

/// Разобрать метку времени `HH:MM:SS.mmm`, `MM:SS.mmm` или секунды
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim().replace(',', ".");
    let parts: Vec<&str> = value.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [s] => (0.0, 0.0, s.parse::<f64>().ok()?),
        [m, s] => (0.0, m.parse::<f64>().ok()?, s.parse::<f64>().ok()?),
        [h, m, s] => (
            h.parse::<f64>().ok()?,
            m.parse::<f64>().ok()?,
            s.parse::<f64>().ok()?,
        ),
        _ => return None,
    };
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}
