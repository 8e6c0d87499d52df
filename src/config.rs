use anyhow::{anyhow, bail, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "MediaDownloader";
const APPLICATION: &str = "media-downloader";

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub download_directory: String,
    /// Worker pool size; the number of transfers running at once.
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_backoff_base: u32,
    pub retry_backoff_max_secs: u64,
    /// Byte budget for final output filenames, extension included.
    pub max_filename_length: usize,
    /// Engine format selector used when a task names neither quality nor format.
    pub default_format: String,
    pub ytdlp_path: String,
    /// Netscape cookie file; enables the credential-based extraction profile.
    pub cookies_file: Option<String>,
    pub database_path: Option<String>,

    // Retention
    pub auto_cleanup: bool,
    pub cleanup_interval_secs: u64,
    pub file_retention_hours: u64,
    pub max_storage_mb: u64,
    pub keep_recent_files: usize,
    pub min_file_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        // Use the 'directories' crate to find the user's download directory.
        // This works on Windows, macOS, and Linux.
        let default_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|p| p.to_string_lossy().to_string()))
            .unwrap_or_else(|| "downloads".to_string()); // Fallback

        Config {
            download_directory: default_dir,
            max_concurrent: 3,
            max_retries: 3,
            retry_backoff_base: 2,
            retry_backoff_max_secs: 60,
            max_filename_length: 200,
            default_format: "best[height<=720]".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            cookies_file: None,
            database_path: None,
            auto_cleanup: true,
            cleanup_interval_secs: 3600,
            file_retention_hours: 24,
            max_storage_mb: 2048,
            keep_recent_files: 20,
            min_file_age_secs: 3600,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.retry_backoff_base == 0 {
            bail!("retry_backoff_base must be at least 1");
        }
        if self.max_filename_length < 32 {
            bail!("max_filename_length must be at least 32 bytes");
        }
        Ok(())
    }

    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(&self.download_directory)
    }

    pub fn cookies_path(&self) -> Option<PathBuf> {
        self.cookies_file
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_max_secs)
    }

    /// Resolves the persistence file, defaulting to the platform data dir.
    pub fn database_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(PathBuf::from(path));
        }
        Ok(project_dirs()?.data_local_dir().join("tasks.sqlite"))
    }
}

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;
    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;

    if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config(&default_config).await?;
        return Ok(default_config);
    }

    load_config_from(&config_path).await
}

/// Reads and validates a config file at an explicit location.
pub async fn load_config_from(path: &Path) -> Result<Config> {
    let config_content = fs::read_to_string(path).await?;
    let config = parse_config(&config_content)
        .map_err(|e| anyhow!("Failed to parse config file at {}: {}", path.display(), e))?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Saves the provided configuration object to the file.
pub async fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path().await?;
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = parse_config("download_directory = \"/srv/media\"\nmax_concurrent = 5\n").unwrap();
        assert_eq!(config.download_directory, "/srv/media");
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_base, 2);
        assert_eq!(config.default_format, "best[height<=720]");
        assert!(config.cookies_path().is_none());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = parse_config("max_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn blank_cookie_path_is_ignored() {
        let config = parse_config("cookies_file = \"  \"\n").unwrap();
        assert!(config.cookies_path().is_none());
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = parse_config(&text).unwrap();
        assert_eq!(parsed.max_filename_length, 200);
        assert_eq!(parsed.keep_recent_files, 20);
    }
}
