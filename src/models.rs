use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::CreateError;

// === Task Models ===

/// Lifecycle states of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "downloading" => Some(TaskStatus::Downloading),
            "retrying" => Some(TaskStatus::Retrying),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested video quality tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    High,
    Medium,
    Low,
}

impl Quality {
    /// Engine format selector for this tier.
    pub fn format_selector(self) -> &'static str {
        match self {
            Quality::High => "bestvideo[height<=2160][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=2160]+bestaudio/bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=1080]+bestaudio/best",
            Quality::Medium => "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=720]+bestaudio/best[height<=720]",
            Quality::Low => "bestvideo[height<=480][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=480]+bestaudio/worst[height>=360]/worst",
        }
    }
}

/// Caller-supplied configuration snapshot for a task. Immutable after creation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub audio_only: bool,
    /// Explicit engine format selector; wins over `quality`.
    #[serde(default)]
    pub format: Option<String>,
    /// Who asked for the download, e.g. "api" or a chat user id.
    #[serde(default)]
    pub requester: Option<String>,
    /// Overrides the configured retry ceiling for this task.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskOptions {
    pub fn validate(&self) -> Result<(), CreateError> {
        if let Some(format) = &self.format {
            if format.trim().is_empty() {
                return Err(CreateError::BlankFormat);
            }
        }
        Ok(())
    }

    /// The format selector handed to the engine for a transfer.
    pub fn format_selector(&self, default_format: &str) -> String {
        if self.audio_only {
            return "bestaudio/best".to_string();
        }
        if let Some(format) = &self.format {
            return format.clone();
        }
        match self.quality {
            Some(quality) => quality.format_selector().to_string(),
            None => default_format.to_string(),
        }
    }
}

/// The authoritative record of one download.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub title: Option<String>,
    pub output_path: Option<PathBuf>,
    pub output_size: Option<u64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub options: TaskOptions,
}

impl TaskRecord {
    pub fn new(id: String, url: String, options: TaskOptions, max_retries: u32) -> Self {
        TaskRecord {
            id,
            url,
            status: TaskStatus::Pending,
            progress: 0,
            title: None,
            output_path: None,
            output_size: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            completed_at: None,
            options,
        }
    }
}

// === Metadata Models ===

/// Represents the top-level JSON output from `yt-dlp --dump-json`.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct VideoInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub formats: Vec<Format>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub ext: Option<String>,
}

/// Represents a single format available for download.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Format {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub tbr: Option<f64>, // Total Bitrate in KBit/s
}

/// One selectable bucket in a format analysis.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct QualityOption {
    pub key: String,
    pub display_label: String,
    pub size_estimate: Option<String>,
    pub resolution_height: u32,
    pub format_id: Option<String>,
    pub ext: Option<String>,
}

// === API Request/Response Models ===

/// The query parameters for a `GET /formats` request.
#[derive(Deserialize, Debug)]
pub struct FormatRequest {
    pub url: String,
}

/// The response of a `GET /formats` request.
#[derive(Serialize, Debug)]
pub struct FormatResponse {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub strategy: String,
    pub qualities: Vec<QualityOption>,
}

/// The JSON body for a `POST /downloads` request.
#[derive(Deserialize, Debug)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(flatten)]
    pub options: TaskOptions,
}

/// The response sent after successfully creating a download task.
#[derive(Serialize, Debug)]
pub struct DownloadResponse {
    pub message: String,
    pub task_id: String,
}

/// The response of a `POST /downloads/:id/cancel` request.
#[derive(Serialize, Debug)]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}
