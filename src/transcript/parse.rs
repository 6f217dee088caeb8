//! Разбор ответа провайдера транскрибации для одного фрагмента
//!
//! Сначала ответ разбирается как структурированный список сегментов.
//! Разобранный список окончателен, даже пустой: `[]` означает отсутствие речи.
//! Если разбор не удался, весь текст фрагмента становится одним сегментом,
//! занимающим всё окно фрагмента.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::model::TranscriptSegment;
use crate::transcript::vtt::parse_timestamp;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").unwrap();
}

/// Окно фрагмента на общей временной шкале
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkWindow {
    pub index: usize,
    pub offset: f64,
    pub duration: f64,
}

/// Убрать обрамление блоком кода
fn strip_code_fence(raw: &str) -> &str {
    match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

fn value_to_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn segment_from_value(value: &Value) -> Option<TranscriptSegment> {
    let start = value.get("start").and_then(value_to_seconds)?;
    let end = value.get("end").and_then(value_to_seconds)?;
    let text = value.get("text")?.as_str()?.trim();
    Some(TranscriptSegment::new(start, end, text))
}

/// Разобрать структурированный ответ (относительные метки времени)
pub fn parse_structured(raw: &str) -> Option<Vec<TranscriptSegment>> {
    let value: Value = serde_json::from_str(strip_code_fence(raw)).ok()?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("segments")?.as_array()?,
        _ => return None,
    };
    items.iter().map(segment_from_value).collect()
}

/// Разобрать ответ фрагмента и перевести метки на общую шкалу.
///
/// Относительные метки ограничиваются окном `[0, duration]`, поэтому
/// сегменты соседних фрагментов не перекрываются.
pub fn parse_chunk_response(raw: &str, window: ChunkWindow) -> Vec<TranscriptSegment> {
    if let Some(segments) = parse_structured(raw) {
        return segments
            .into_iter()
            .filter_map(|s| {
                let start = s.start.max(0.0).min(window.duration);
                let end = s.end.max(0.0).min(window.duration);
                if end <= start || s.text.is_empty() {
                    return None;
                }
                if end < s.end {
                    log::debug!(
                        "Chunk {}: segment [{:.3}, {:.3}] spills past the chunk end, trimmed",
                        window.index,
                        s.start,
                        s.end
                    );
                }
                Some(TranscriptSegment::new(
                    start + window.offset,
                    end + window.offset,
                    s.text,
                ))
            })
            .collect();
    }

    let text = strip_code_fence(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return Vec::new();
    }
    log::debug!(
        "Chunk {} response is not structured, using it as a single segment",
        window.index
    );
    vec![TranscriptSegment::new(
        window.offset,
        window.offset + window.duration,
        text,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(offset: f64) -> ChunkWindow {
        ChunkWindow {
            index: 1,
            offset,
            duration: 30.0,
        }
    }

    #[test]
    fn fenced_json_array_is_offset() {
        let raw = "```json\n[{\"start\": 0.5, \"end\": 2.0, \"text\": \"Hi\"}, {\"start\": \"00:03.000\", \"end\": \"00:04.500\", \"text\": \"there\"}]\n```";
        let segments = parse_chunk_response(raw, window(30.0));
        assert_eq!(
            segments,
            vec![
                TranscriptSegment::new(30.5, 32.0, "Hi"),
                TranscriptSegment::new(33.0, 34.5, "there"),
            ]
        );
    }

    #[test]
    fn object_with_segments_key() {
        let raw = r#"{"segments": [{"start": 1, "end": 2, "text": "a"}]}"#;
        assert_eq!(parse_structured(raw).unwrap().len(), 1);
    }

    #[test]
    fn plain_text_spans_the_chunk() {
        let segments = parse_chunk_response("just some words\n", window(60.0));
        assert_eq!(
            segments,
            vec![TranscriptSegment::new(60.0, 90.0, "just some words")]
        );
    }

    #[test]
    fn malformed_items_fall_back_to_text() {
        let raw = r#"[{"start": 1, "text": "no end"}]"#;
        let segments = parse_chunk_response(raw, window(0.0));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 30.0);
    }

    #[test]
    fn empty_array_means_no_speech() {
        assert!(parse_chunk_response("[]", window(30.0)).is_empty());
        assert!(parse_chunk_response("```json\n[]\n```", window(30.0)).is_empty());
        assert!(parse_chunk_response(r#"{"segments": []}"#, window(0.0)).is_empty());
    }

    #[test]
    fn segments_are_clamped_to_the_chunk() {
        let raw = r#"[{"start": -0.2, "end": 1.0, "text": "early"}, {"start": 28.0, "end": 30.4, "text": "late"}, {"start": 31.0, "end": 32.0, "text": "outside"}]"#;
        let segments = parse_chunk_response(raw, window(30.0));
        assert_eq!(
            segments,
            vec![
                TranscriptSegment::new(30.0, 31.0, "early"),
                TranscriptSegment::new(58.0, 60.0, "late"),
            ]
        );
    }

    #[test]
    fn empty_response_yields_nothing() {
        assert!(parse_chunk_response("   ", window(0.0)).is_empty());
    }
}
