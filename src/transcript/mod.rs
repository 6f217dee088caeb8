//! Модуль получения транскрипта
//!
//! Транскрипт берётся из сохранённых метаданных или запрашивается у
//! внешнего провайдера с разбиением аудио на фрагменты.

pub mod adapter;
pub mod gemini;
pub mod parse;
pub mod retry;
pub mod vtt;

pub use adapter::{TranscriptAdapter, TranscriptionProvider, TRANSCRIPTION_PROMPT};
pub use gemini::GeminiTranscriber;
pub use retry::RetryPolicy;

#[cfg(test)]
mod tests {
    mod test_adapter;
}
