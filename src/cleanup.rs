//! Retention sweeps over the output directory.
//!
//! Three policies run in order: age, count, then total size. Files younger
//! than `min_age` are never touched. Task working files only go once they are
//! stale, and never count toward the count or size passes.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::Config;
use crate::filename;

/// Size sweeps stop once usage drops to this share of the cap.
const SIZE_TARGET_PERCENT: u64 = 80;

/// Staleness limit for working files when the age pass is disabled.
const WORKING_FILE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    /// Files older than this are removed. Zero disables the age pass.
    pub retention: Duration,
    /// Storage cap in bytes. Zero disables the size pass.
    pub max_storage_bytes: u64,
    /// Number of newest files always kept. Zero disables the count pass.
    pub keep_recent: usize,
    pub min_age: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetentionPolicy {
            retention: Duration::from_secs(config.file_retention_hours * 3600),
            max_storage_bytes: config.max_storage_mb * 1024 * 1024,
            keep_recent: config.keep_recent_files,
            min_age: Duration::from_secs(config.min_file_age_secs),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub remaining: usize,
}

struct Candidate {
    path: PathBuf,
    size: u64,
    age: Duration,
    working: bool,
}

fn collect(dir: &Path, now: SystemTime) -> Vec<Candidate> {
    let mut files: Vec<Candidate> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            let modified = meta.modified().ok()?;
            Some(Candidate {
                age: now.duration_since(modified).unwrap_or_default(),
                size: meta.len(),
                working: filename::is_working_file(&entry.file_name().to_string_lossy()),
                path: entry.into_path(),
            })
        })
        .collect();
    // Newest first.
    files.sort_by_key(|file| file.age);
    files
}

/// One retention pass over `dir`, judged at time `now`.
pub fn sweep(dir: &Path, policy: &RetentionPolicy, now: SystemTime) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let files = collect(dir, now);
    let mut doomed = vec![false; files.len()];

    let working_max_age = if policy.retention.is_zero() {
        WORKING_FILE_MAX_AGE
    } else {
        policy.retention
    };
    for (index, file) in files.iter().enumerate() {
        if file.working {
            doomed[index] = file.age > working_max_age;
        } else if !policy.retention.is_zero() && file.age > policy.retention {
            doomed[index] = true;
        }
    }

    // Count and size passes only look at finished files.
    let finished: Vec<usize> = (0..files.len()).filter(|&index| !files[index].working).collect();

    if policy.keep_recent > 0 {
        for &index in finished.iter().skip(policy.keep_recent) {
            doomed[index] = true;
        }
    }

    if policy.max_storage_bytes > 0 {
        let mut used: u64 = finished
            .iter()
            .filter(|&&index| !doomed[index])
            .map(|&index| files[index].size)
            .sum();
        if used > policy.max_storage_bytes {
            let target = policy.max_storage_bytes / 100 * SIZE_TARGET_PERCENT;
            for &index in finished.iter().rev() {
                if used <= target {
                    break;
                }
                if !doomed[index] && files[index].age >= policy.min_age {
                    doomed[index] = true;
                    used -= files[index].size;
                }
            }
        }
    }

    for (file, doomed) in files.iter().zip(doomed) {
        if !doomed || file.age < policy.min_age {
            report.remaining += 1;
            continue;
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                report.freed_bytes += file.size;
                report.removed.push(file.path.display().to_string());
            }
            Err(e) => {
                tracing::warn!("Cleanup could not remove {}: {}", file.path.display(), e);
                report.remaining += 1;
            }
        }
    }

    if !report.removed.is_empty() {
        tracing::info!(
            "Cleanup removed {} file(s), freed {:.1} MB",
            report.removed.len(),
            report.freed_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(report)
}

pub struct Cleanup {
    dir: PathBuf,
    policy: RetentionPolicy,
}

impl Cleanup {
    pub fn new(dir: PathBuf, policy: RetentionPolicy) -> Self {
        Cleanup { dir, policy }
    }

    pub fn from_config(config: &Config) -> Self {
        Cleanup::new(config.download_dir(), RetentionPolicy::from_config(config))
    }

    pub async fn run_once(&self) -> Result<CleanupReport> {
        let dir = self.dir.clone();
        let policy = self.policy.clone();
        tokio::task::spawn_blocking(move || sweep(&dir, &policy, SystemTime::now()))
            .await
            .context("cleanup task did not complete")?
    }

    /// Runs a sweep every `every`, starting after the first period.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!("Scheduled cleanup failed: {:#}", e);
                }
            }
        })
    }
}
