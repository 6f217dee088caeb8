//! Реализация медиа-инструментария поверх ffmpeg/ffprobe
//!
//! Каждый вызов запускается как дочерний процесс Tokio с ограничением по
//! времени. По истечении времени процесс принудительно завершается, а этап
//! считается проваленным.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use path_clean::PathClean;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ToolchainConfig;
use crate::error::{PipelineError, Result};
use crate::media::mixer::DuckingPlan;
use crate::media::tempo::atempo_filter;
use crate::media::MediaToolchain;

/// Этап, к которому относится вызов инструмента (определяет тип ошибки)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolStage {
    Probe,
    Extract,
    Stretch,
    Assemble,
    Mix,
    Mux,
}

impl ToolStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Extract => "extract",
            Self::Stretch => "stretch",
            Self::Assemble => "assemble",
            Self::Mix => "mix",
            Self::Mux => "mux",
        }
    }

    fn error(&self, message: String) -> PipelineError {
        match self {
            Self::Probe => PipelineError::Probe(message),
            Self::Extract => PipelineError::Transcription(message),
            Self::Stretch => PipelineError::Stretch(message),
            Self::Assemble | Self::Mux => PipelineError::Mux(message),
            Self::Mix => PipelineError::Mix(message),
        }
    }
}

/// Последние `max_bytes` байт stderr в читаемом виде
pub fn stderr_tail(stderr: &[u8], max_bytes: usize) -> String {
    let start = stderr.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Экранировать путь для списка concat demuxer
fn concat_entry(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{}'", escaped)
}

/// Обёртка над ffmpeg и ffprobe
#[derive(Debug, Clone)]
pub struct FfmpegToolchain {
    config: ToolchainConfig,
}

impl FfmpegToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    /// Проверить наличие ffmpeg и ffprobe, вернуть строку версии ffmpeg
    pub async fn check_installed(&self) -> Result<String> {
        let mut version = String::new();
        for binary in [&self.config.ffmpeg_path, &self.config.ffprobe_path] {
            let output = Command::new(binary)
                .arg("-version")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    PipelineError::Configuration(format!("{} is not available: {}", binary, e))
                })?;
            if !output.status.success() {
                return Err(PipelineError::Configuration(format!(
                    "{} -version exited with {}",
                    binary, output.status
                )));
            }
            if version.is_empty() {
                version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
            }
        }
        Ok(version)
    }

    fn clip_format_args(&self) -> Vec<String> {
        vec![
            "-ar".into(),
            self.config.sample_rate.to_string(),
            "-ac".into(),
            "1".into(),
            "-c:a".into(),
            "pcm_s16le".into(),
        ]
    }

    /// Подготовить выходной путь: нормализовать и создать каталог
    fn prepare_output(output: &Path) -> Result<PathBuf> {
        let cleaned = output.to_path_buf().clean();
        if let Some(parent) = cleaned.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(cleaned)
    }

    async fn run_tool(&self, binary: &str, stage: ToolStage, args: &[String]) -> Result<Vec<u8>> {
        log::debug!("{} [{}]: {} {}", stage.as_str(), binary, binary, args.join(" "));

        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| stage.error(format!("failed to start {}: {}", binary, e)))?;

        let seconds = self.config.process_timeout_secs;
        // При истечении времени future сбрасывается и kill_on_drop завершает процесс
        let output = match timeout(Duration::from_secs(seconds), child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| stage.error(format!("{} failed: {}", binary, e)))?,
            Err(_) => {
                log::error!("{} exceeded {}s, process killed", binary, seconds);
                return Err(PipelineError::Timeout {
                    stage: stage.as_str().to_string(),
                    seconds,
                });
            }
        };

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr, self.config.stderr_tail_bytes);
            log::error!("{} exited with {}: {}", binary, output.status, tail);
            return Err(stage.error(format!(
                "{} exited with {}: {}",
                binary, output.status, tail
            )));
        }

        Ok(output.stdout)
    }

    async fn ffmpeg(&self, stage: ToolStage, args: Vec<String>) -> Result<()> {
        let mut full = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
        ];
        full.extend(args);
        self.run_tool(&self.config.ffmpeg_path, stage, &full).await?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl MediaToolchain for FfmpegToolchain {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        if !path.exists() {
            return Err(PipelineError::Probe(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path_arg(path),
        ];
        let stdout = self
            .run_tool(&self.config.ffprobe_path, ToolStage::Probe, &args)
            .await?;

        let text = String::from_utf8_lossy(&stdout);
        parse_probe_output(&text).map_err(|e| {
            PipelineError::Probe(format!("{} for {}", e, path.display()))
        })
    }

    async fn extract_speech_audio(
        &self,
        input: &Path,
        sample_rate: u32,
        output: &Path,
    ) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let args = vec![
            "-i".into(),
            path_arg(input),
            "-vn".into(),
            "-ac".into(),
            "1".into(),
            "-ar".into(),
            sample_rate.to_string(),
            "-c:a".into(),
            "pcm_s16le".into(),
            path_arg(&output),
        ];
        self.ffmpeg(ToolStage::Extract, args).await
    }

    async fn slice(&self, input: &Path, start: f64, duration: f64, output: &Path) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let args = vec![
            "-ss".into(),
            format!("{:.3}", start),
            "-t".into(),
            format!("{:.3}", duration),
            "-i".into(),
            path_arg(input),
            "-c:a".into(),
            "pcm_s16le".into(),
            path_arg(&output),
        ];
        self.ffmpeg(ToolStage::Extract, args).await
    }

    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let mut args = vec!["-i".into(), path_arg(input), "-vn".into()];
        args.extend(self.clip_format_args());
        args.push(path_arg(&output));
        self.ffmpeg(ToolStage::Stretch, args).await
    }

    async fn time_stretch(
        &self,
        input: &Path,
        passes: &[f64],
        target_duration: f64,
        output: &Path,
    ) -> Result<()> {
        let output = Self::prepare_output(output)?;
        // apad + -t дают ровно целевую длительность независимо от округлений atempo
        let filter = if passes.is_empty() {
            "apad".to_string()
        } else {
            format!("{},apad", atempo_filter(passes))
        };
        let mut args = vec![
            "-i".into(),
            path_arg(input),
            "-vn".into(),
            "-filter:a".into(),
            filter,
            "-t".into(),
            format!("{:.6}", target_duration),
        ];
        args.extend(self.clip_format_args());
        args.push(path_arg(&output));
        self.ffmpeg(ToolStage::Stretch, args).await
    }

    async fn silence(&self, duration: f64, output: &Path) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let mut args = vec![
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={}:cl=mono", self.config.sample_rate),
            "-t".into(),
            format!("{:.6}", duration),
        ];
        args.extend(self.clip_format_args());
        args.push(path_arg(&output));
        self.ffmpeg(ToolStage::Stretch, args).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(PipelineError::Mux("nothing to concatenate".to_string()));
        }
        let output = Self::prepare_output(output)?;
        let list_path = output.with_extension("concat.txt");
        let list = inputs
            .iter()
            .map(|p| concat_entry(p))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&list_path, list).await?;

        let args = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            path_arg(&list_path),
            "-c".into(),
            "copy".into(),
            path_arg(&output),
        ];
        let result = self.ffmpeg(ToolStage::Assemble, args).await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result
    }

    async fn duck_mix(
        &self,
        original: &Path,
        speech: &Path,
        plan: &DuckingPlan,
        output: &Path,
    ) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let format = format!(
            "aformat=sample_rates={}:channel_layouts=mono",
            self.config.sample_rate
        );
        let graph = format!(
            "[0:a]{fmt},{volume}[bg];[1:a]{fmt}[fg];[bg][fg]amix=inputs=2:duration=longest:weights=1 1[out]",
            fmt = format,
            volume = plan.volume_filter()
        );
        let mut args = vec![
            "-i".into(),
            path_arg(original),
            "-i".into(),
            path_arg(speech),
            "-filter_complex".into(),
            graph,
            "-map".into(),
            "[out]".into(),
        ];
        args.extend(self.clip_format_args());
        args.push(path_arg(&output));
        self.ffmpeg(ToolStage::Mix, args).await
    }

    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        let output = Self::prepare_output(output)?;
        let args = vec![
            "-i".into(),
            path_arg(video),
            "-i".into(),
            path_arg(audio),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            self.config.audio_bitrate.clone(),
            path_arg(&output),
        ];
        self.ffmpeg(ToolStage::Mux, args).await?;
        log::info!("Muxed {}", output.display());
        Ok(())
    }
}

/// Разобрать вывод ffprobe с длительностью
fn parse_probe_output(text: &str) -> std::result::Result<f64, String> {
    let value = text.trim();
    let duration = value
        .parse::<f64>()
        .map_err(|_| format!("unparseable duration '{}'", value))?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(format!("invalid duration {}", duration));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_parsing() {
        assert_eq!(parse_probe_output("12.345000\n").unwrap(), 12.345);
        assert!(parse_probe_output("N/A").is_err());
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("-1.0").is_err());
    }

    #[test]
    fn stderr_tail_keeps_last_bytes() {
        let stderr = b"line one\nline two\nfatal: bad codec\n";
        assert_eq!(stderr_tail(stderr, 16), "fatal: bad codec");
        assert_eq!(stderr_tail(b"short", 100), "short");
    }

    #[test]
    fn concat_entries_escape_quotes() {
        assert_eq!(
            concat_entry(Path::new("/tmp/it's.wav")),
            "file '/tmp/it'\\''s.wav'"
        );
    }

    #[test]
    fn stage_maps_to_error_kind() {
        assert!(matches!(ToolStage::Probe.error("x".into()), PipelineError::Probe(_)));
        assert!(matches!(ToolStage::Mix.error("x".into()), PipelineError::Mix(_)));
        assert!(matches!(ToolStage::Mux.error("x".into()), PipelineError::Mux(_)));
        assert!(matches!(ToolStage::Stretch.error("x".into()), PipelineError::Stretch(_)));
    }

    #[tokio::test]
    async fn missing_file_is_probe_error() {
        let toolchain = FfmpegToolchain::new(ToolchainConfig::default());
        let err = toolchain
            .probe_duration(Path::new("/definitely/not/here.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Probe(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let config = ToolchainConfig {
            ffmpeg_path: "/nonexistent/ffmpeg-binary".to_string(),
            ..ToolchainConfig::default()
        };
        let toolchain = FfmpegToolchain::new(config);
        let dir = tempfile::tempdir().unwrap();
        let err = toolchain
            .silence(1.0, &dir.path().join("s.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stretch(_)));
        assert!(toolchain.check_installed().await.is_err());
    }
}
