//! Модуль для отслеживания прогресса выполнения прогонов
//!
//! Реализация паттерна Observer: трекер прогона рассылает обновления всем
//! подписанным наблюдателям (журнал, канал для UI, тесты).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Информация о прогрессе прогона
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Идентификатор единицы работы (проект или история)
    pub unit_id: String,
    /// Текущий этап
    pub stage: String,
    /// Общий процент выполнения (0..=100)
    pub percent: u8,
    /// Дополнительная информация о текущем этапе
    pub details: Option<String>,
}

impl ProgressInfo {
    pub fn new(
        unit_id: impl Into<String>,
        stage: impl Into<String>,
        percent: u8,
        details: Option<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            stage: stage.into(),
            percent: percent.min(100),
            details,
        }
    }
}

/// Наблюдатель, получающий уведомления о прогрессе
pub trait ProgressObserver: Send + Sync {
    fn on_progress_update(&self, progress: &ProgressInfo);
}

/// Рассылка уведомлений наблюдателям
#[derive(Default)]
pub struct DefaultProgressReporter {
    observers: RwLock<HashMap<usize, Box<dyn ProgressObserver>>>,
    next_id: AtomicUsize,
}

impl DefaultProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавить наблюдателя
    ///
    /// Возвращает идентификатор, по которому наблюдателя можно удалить.
    pub fn add_observer(&self, observer: Box<dyn ProgressObserver>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers.write().insert(id, observer);
        id
    }

    /// Удалить наблюдателя по идентификатору
    pub fn remove_observer(&self, id: usize) -> Option<Box<dyn ProgressObserver>> {
        self.observers.write().remove(&id)
    }

    /// Уведомить всех наблюдателей
    pub fn notify(&self, progress: &ProgressInfo) {
        for observer in self.observers.read().values() {
            observer.on_progress_update(progress);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

/// Наблюдатель, пишущий прогресс в журнал
pub struct LogProgressObserver;

impl ProgressObserver for LogProgressObserver {
    fn on_progress_update(&self, progress: &ProgressInfo) {
        match &progress.details {
            Some(details) => log::info!(
                "[{}] {} {}% ({})",
                progress.unit_id,
                progress.stage,
                progress.percent,
                details
            ),
            None => log::info!(
                "[{}] {} {}%",
                progress.unit_id,
                progress.stage,
                progress.percent
            ),
        }
    }
}

/// Наблюдатель, пересылающий прогресс в широковещательный канал Tokio
pub struct ChannelProgressObserver {
    tx: broadcast::Sender<ProgressInfo>,
}

impl ChannelProgressObserver {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<ProgressInfo>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressInfo> {
        self.tx.subscribe()
    }
}

impl ProgressObserver for ChannelProgressObserver {
    fn on_progress_update(&self, progress: &ProgressInfo) {
        // Нет подписчиков: обновление просто теряется
        if self.tx.send(progress.clone()).is_err() {
            log::trace!("No progress subscribers for {}", progress.unit_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct TestObserver {
        updates: Arc<Mutex<Vec<ProgressInfo>>>,
    }

    #[test]
    fn reporter_fans_out_and_removes() {
        let reporter = DefaultProgressReporter::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let id = reporter.add_observer(Box::new(TestObserver {
            updates: updates.clone(),
        }));
        reporter.add_observer(Box::new(LogProgressObserver));
        assert_eq!(reporter.observer_count(), 2);

        reporter.notify(&ProgressInfo::new("p1", "Transcribing", 10, None));
        assert_eq!(updates.lock().unwrap().len(), 1);

        assert!(reporter.remove_observer(id).is_some());
        reporter.notify(&ProgressInfo::new("p1", "Mixing", 85, None));
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[test]
    fn percent_is_capped() {
        assert_eq!(ProgressInfo::new("p", "s", 250, None).percent, 100);
    }

    #[tokio::test]
    async fn channel_observer_forwards_updates() {
        let (observer, mut rx) = ChannelProgressObserver::new(8);
        observer.on_progress_update(&ProgressInfo::new("p1", "Muxing", 92, None));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.stage, "Muxing");
        assert_eq!(received.percent, 92);
    }

    impl ProgressObserver for TestObserver {
        fn on_progress_update(&self, progress: &ProgressInfo) {
            self.updates.lock().unwrap().push(progress.clone());
        }
    }
}
