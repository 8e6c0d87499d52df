use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::{wrappers::LinesStream, StreamExt};

use crate::error::EngineError;
use crate::models::VideoInfo;
use crate::strategy::{is_youtube, StrategyProfile};

static YTDLP_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(?P<progress>[\d\.]+)%").unwrap()
});

/// Receives whole-percent progress from a running transfer.
pub type ProgressCallback<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// What to download and where to put it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSpec {
    pub format: String,
    pub audio_only: bool,
    /// Engine output template, e.g. `/downloads/temp_<id>.%(ext)s`.
    pub output_template: String,
}

/// The external extraction/transfer capability.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn inspect(&self, url: &str, profile: &StrategyProfile) -> Result<VideoInfo, EngineError>;

    async fn fetch(
        &self,
        url: &str,
        profile: &StrategyProfile,
        transfer: &TransferSpec,
        progress: ProgressCallback<'_>,
    ) -> Result<(), EngineError>;
}

/// Parses a `[download]  42.0% of ...` line into a percentage.
pub fn parse_progress(line: &str) -> Option<u8> {
    let caps = YTDLP_PROGRESS.captures(line)?;
    let value: f64 = caps.name("progress")?.as_str().parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

/// Drives the `yt-dlp` binary as a subprocess.
pub struct YtDlpEngine {
    binary: String,
}

impl YtDlpEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        YtDlpEngine { binary: binary.into() }
    }

    fn command(&self, profile: &StrategyProfile) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-color")
            .arg("--socket-timeout").arg(profile.socket_timeout_secs.to_string())
            .arg("--extractor-retries").arg(profile.extractor_retries.to_string())
            .arg("--user-agent").arg(&profile.user_agent);
        if let Some(client) = &profile.player_client {
            cmd.arg("--extractor-args").arg(format!("youtube:player_client={}", client));
        }
        if let Some(cookies) = &profile.cookies_file {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn { tool: self.binary.clone(), source }
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    async fn inspect(&self, url: &str, profile: &StrategyProfile) -> Result<VideoInfo, EngineError> {
        let output = self
            .command(profile)
            .arg("--dump-json")
            .arg(url)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(info)
    }

    async fn fetch(
        &self,
        url: &str,
        profile: &StrategyProfile,
        transfer: &TransferSpec,
        progress: ProgressCallback<'_>,
    ) -> Result<(), EngineError> {
        let mut cmd = self.command(profile);
        cmd.arg("-f").arg(&transfer.format)
           .arg("--newline")
           .arg("--retries").arg("3")
           .arg("--fragment-retries").arg("3")
           .arg("--restrict-filenames")
           .arg("-o").arg(&transfer.output_template);

        if transfer.audio_only {
            cmd.arg("--extract-audio").arg("--audio-format").arg("mp3").arg("--audio-quality").arg("192K");
        } else if is_youtube(url) {
            cmd.arg("--merge-output-format").arg("mp4");
        }

        cmd.arg(url).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // Drain stderr alongside stdout so a chatty engine cannot fill the pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout).lines();
            let mut lines = LinesStream::new(reader);
            while let Some(Ok(line)) = lines.next().await {
                if let Some(percent) = parse_progress(&line) {
                    progress(percent);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}
