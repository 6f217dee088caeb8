//! Приблизительная длительность клипа по байтам ответа провайдера
//!
//! Используется только как подсказка для журнала и записей. Окончательная
//! длительность всегда определяется через `MediaToolchain::probe_duration`.

use std::io::Cursor;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

/// Оценить длительность закодированного аудио в секундах.
///
/// Возвращает `None`, если формат не распознан.
pub fn approximate_duration(bytes: &[u8], extension_hint: Option<&str>) -> Option<f64> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
        if rate > 0 {
            return Some(frames as f64 / rate as f64);
        }
    }

    // Число кадров неизвестно (например, MP3 без заголовка Xing): суммируем пакеты
    let time_base = params
        .time_base
        .or_else(|| params.sample_rate.map(|rate| TimeBase::new(1, rate)))?;
    let mut total: u64 = 0;
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() == track_id {
            total += packet.dur;
        }
    }
    if total == 0 {
        return None;
    }
    let time = time_base.calc_time(total);
    Some(time.seconds as f64 + time.frac)
}
