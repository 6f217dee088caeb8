//! Модуль ресинхронизации речи по сегментам транскрипта

pub mod resync;

pub use resync::{plan_timeline, ResyncOutcome, Resynchronizer, TimelineItem, TrackPiece};
