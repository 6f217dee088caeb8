//! Модуль обработки ошибок библиотеки voice-resync
//!
//! Каждый этап конвейера либо завершается полностью, либо возвращает
//! фатальную ошибку. Единственное исключение: ограничение частоты запросов
//! у провайдера транскрибации, которое допускает локальный повтор.

use thiserror::Error;

/// Ошибки конвейера синтеза и ресинхронизации
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Не удалось определить длительность медиафайла
    #[error("Probe error: {0}")]
    Probe(String),

    /// Фатальная ошибка транскрибации
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// Провайдер транскрибации ограничил частоту запросов (можно повторить)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Ошибка провайдера синтеза речи
    #[error("Synthesis error ({provider}): {message}")]
    Synthesis { provider: String, message: String },

    /// Синтез конкретного сегмента завершился ошибкой
    #[error("Segment {index} (\"{excerpt}\") failed: {source}")]
    SegmentFailed {
        index: usize,
        excerpt: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Ошибка изменения темпа
    #[error("Stretch error: {0}")]
    Stretch(String),

    /// Ошибка микширования
    #[error("Mix error: {0}")]
    Mix(String),

    /// Ошибка сборки итогового видео
    #[error("Mux error: {0}")]
    Mux(String),

    /// Ошибка конфигурации
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Нарушение инвариантов входных данных (например, пересечение сегментов)
    #[error("Data quality error: {0}")]
    DataQuality(String),

    /// Внешний процесс или запрос не уложился в отведённое время
    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    /// Для этой единицы работы уже выполняется прогон
    #[error("A run is already in progress for {0}")]
    AlreadyRunning(String),

    /// Ошибка хранилища записей
    #[error("Store error: {0}")]
    Store(String),

    /// Фоновая задача аварийно завершилась (паника)
    #[error("Worker crashed: {0}")]
    Crashed(String),

    /// Ошибка ввода-вывода
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибка HTTP запроса
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Ошибка сериализации/десериализации JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Создать ошибку синтеза с именем провайдера
    pub fn synthesis(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Synthesis {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Обернуть ошибку сегмента, добавив индекс и фрагмент текста
    pub fn segment(index: usize, text: &str, source: PipelineError) -> Self {
        Self::SegmentFailed {
            index,
            excerpt: excerpt(text, 40),
            source: Box::new(source),
        }
    }

    /// Только ограничение частоты запросов допускает повтор
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Сообщение для записи в статус прогона, без отладочных деталей
    pub fn user_message(&self) -> String {
        match self {
            Self::Io(_) => "Internal file error while processing media".to_string(),
            Self::Json(_) => "Malformed data received from a collaborator".to_string(),
            Self::Http(e) if e.is_timeout() => "Upstream service timed out".to_string(),
            Self::Http(_) => "Upstream service request failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Текст паники из полезной нагрузки `catch_unwind`
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Обрезать текст до `max_chars` символов для сообщений об ошибках
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}

impl From<&str> for PipelineError {
    fn from(s: &str) -> Self {
        PipelineError::Configuration(s.to_string())
    }
}

/// Тип Result для библиотеки voice-resync
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_is_retryable() {
        assert!(PipelineError::RateLimited("429".into()).is_retryable());
        assert!(!PipelineError::Transcription("bad audio".into()).is_retryable());
        assert!(!PipelineError::synthesis("elevenlabs", "quota").is_retryable());
    }

    #[test]
    fn segment_error_names_index_and_excerpt() {
        let err = PipelineError::segment(
            3,
            "  a rather long sentence that keeps going well past the excerpt limit  ",
            PipelineError::synthesis("f5", "server down"),
        );
        let message = err.user_message();
        assert!(message.contains("Segment 3"));
        assert!(message.contains("a rather long sentence"));
        assert!(message.contains('…'));
        assert!(message.contains("f5"));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(payload.as_ref()), "index out of bounds");
        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("bad {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "bad 7");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn io_errors_are_not_leaked_verbatim() {
        let err = PipelineError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "/secret/path/missing.wav",
        ));
        assert!(!err.user_message().contains("/secret"));
    }
}
