use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

const DEFAULT_FILTER: &str = "warn,voice_resync=info";

pub fn init_logger() {
    // Базовый фильтр переопределяется через RUST_LOG
    let env = Env::default().filter_or("RUST_LOG", DEFAULT_FILTER);

    let mut builder = Builder::from_env(env);

    builder
        .filter_module("mio", LevelFilter::Error)
        .filter_module("tokio_util", LevelFilter::Error)
        .filter_module("hyper", LevelFilter::Error)
        .filter_module("symphonia_core", LevelFilter::Warn)
        .filter_module("symphonia_bundle_mp3", LevelFilter::Warn)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} {}: {}",
                record.level(),
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}
