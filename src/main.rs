use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use voice_resync::config::PipelineConfig;
use voice_resync::media;
use voice_resync::model::{StorySection, VoiceProfile};
use voice_resync::pipeline::{LogJobHooks, MemoryStore, ProviderTranscript};
use voice_resync::progress::LogProgressObserver;
use voice_resync::utils::logger::init_logger;
use voice_resync::{DubRequest, JobOutcome, RunStatus, VoiceResync};

/// Озвучка видео клонированным голосом с посегментной синхронизацией
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Файл конфигурации (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Файл состояния (прогоны, секции, транскрипты)
    #[arg(short, long, global = true)]
    state: Option<PathBuf>,

    /// Профили голосов (JSON-массив), загружаемые в состояние перед командой
    #[arg(long, global = true)]
    voices: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Озвучить видео проекта
    Dub {
        /// Идентификатор проекта
        #[arg(long)]
        project: String,
        /// Идентификатор голоса
        #[arg(long)]
        voice: String,
        /// Исходное видео
        #[arg(short, long)]
        input: PathBuf,
        /// Итоговое видео
        #[arg(short, long)]
        output: PathBuf,
        /// Субтитры WebVTT, если у источника они есть
        #[arg(long)]
        captions: Option<PathBuf>,
        /// Сохранить фон оригинала под новой речью
        #[arg(long)]
        preserve_background: bool,
    },

    /// Озвучить историю по секциям
    Story {
        #[arg(long)]
        story: String,
        #[arg(long)]
        voice: String,
        /// Секции истории (JSON-массив); заменяют сохранённые
        #[arg(long)]
        sections: Option<PathBuf>,
        /// Пересинтезировать готовые секции
        #[arg(long)]
        force: bool,
    },

    /// Сбросить секции, зависшие в обработке
    ResetStuck {
        /// Порог в секундах (по умолчанию из конфигурации)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Показать длительность медиафайла
    Probe { path: PathBuf },

    /// Проверить ffmpeg и провайдеров синтеза
    Doctor,
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| config.work_dir().join("state.json"));
    let store = Arc::new(
        MemoryStore::open(&state_path)
            .with_context(|| format!("failed to open state {}", state_path.display()))?,
    );
    if let Some(path) = &cli.voices {
        let profiles: Vec<VoiceProfile> = read_json(path)?;
        for profile in profiles {
            store.add_voice_profile(profile)?;
        }
    }

    let app = VoiceResync::new(config, store.clone()).context("invalid configuration")?;
    app.add_observer(Box::new(LogProgressObserver));

    match cli.command {
        Commands::Dub {
            project,
            voice,
            input,
            output,
            captions,
            preserve_background,
        } => {
            if let Some(path) = captions {
                let vtt = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read captions {}", path.display()))?;
                store.set_provider_transcript(&project, ProviderTranscript::Captions(vtt))?;
            }
            let pipeline = app.project_pipeline();
            pipeline.start(DubRequest {
                unit_id: project.clone(),
                voice_id: voice,
                source_video: input,
                output_path: output,
                preserve_background,
            })?;

            let run = pipeline
                .wait(&project)
                .await?
                .context("run record disappeared")?;
            match run.status {
                RunStatus::Completed => {
                    if let Some(path) = &run.output_path {
                        println!("{}", path.display());
                    }
                }
                _ => bail!(
                    "run {} {}: {}",
                    project,
                    run.status.as_str(),
                    run.error.unwrap_or_default()
                ),
            }
        }

        Commands::Story {
            story,
            voice,
            sections,
            force,
        } => {
            if let Some(path) = sections {
                let sections: Vec<StorySection> = read_json(&path)?;
                store.add_story(&story, sections)?;
            }
            let queue = app.story_queue(Arc::new(LogJobHooks))?;
            match queue.enqueue(&story, &voice, force)?.wait().await {
                JobOutcome::Completed(job) => println!(
                    "story {} complete ({}/{} sections)",
                    job.story_id, job.completed_sections, job.total_sections
                ),
                JobOutcome::Failed(message) => bail!("story {} failed: {}", story, message),
            }
        }

        Commands::ResetStuck { older_than_secs } => {
            let secs = older_than_secs.unwrap_or(app.config().worker.stuck_after_secs);
            let reset = app.story_worker()?.reset_stuck(Duration::from_secs(secs))?;
            println!("reset {} stuck section(s)", reset);
        }

        Commands::Probe { path } => {
            let toolchain = app.toolchain();
            let duration = media::probe(toolchain.as_ref(), &path)
                .await
                .with_context(|| format!("failed to probe {}", path.display()))?;
            println!("{:.3}", duration);
        }

        Commands::Doctor => {
            let report = app.doctor().await;
            match &report.ffmpeg {
                Ok(version) => println!("ffmpeg: {}", version),
                Err(e) => println!("ffmpeg: unavailable ({})", e),
            }
            if report.providers.is_empty() {
                println!("providers: none configured");
            }
            for health in &report.providers {
                println!(
                    "{}: {} ({})",
                    health.provider,
                    if health.healthy { "ok" } else { "unhealthy" },
                    health.detail
                );
            }
            if !report.is_healthy() {
                bail!("environment check failed");
            }
        }
    }

    Ok(())
}
