//! Повтор запросов при ограничении частоты
//!
//! Повторяются только ошибки `RateLimited`; остальные ошибки возвращаются
//! сразу. Задержка растёт экспоненциально и ограничена сверху.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::TranscriptionConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Базовая задержка перед повтором номер `attempt` (с 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Задержка со случайной добавкой до 10%
    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Выполнить операцию с повторами
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.jittered(attempt);
                    log::warn!(
                        "{} rate limited (attempt {}/{}), retrying in {:?}: {}",
                        label,
                        attempt,
                        self.max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(PipelineError::RateLimited(message)) => {
                    return Err(PipelineError::Transcription(format!(
                        "{} still rate limited after {} attempts: {}",
                        label, attempt, message
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn rate_limit_is_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy(5)
            .run("chunk 0", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::RateLimited("429".into()))
                } else {
                    Ok("text")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "text");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_abort_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast_policy(5)
            .run("chunk 0", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Transcription("bad audio".into()))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Transcription(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_becomes_fatal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast_policy(3)
            .run("chunk 2", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::RateLimited("quota".into()))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Transcription(_)));
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
