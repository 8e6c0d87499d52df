//! Download task orchestrator.
//!
//! Owns every status/progress/error mutation of a task:
//!
//! ```text
//! pending -> downloading -> completed
//!                 |   ^
//!                 v   |  (backoff timer)
//!              retrying
//! downloading -> failed
//! pending | downloading | retrying -> cancelled
//! ```
//!
//! Cancellation is cooperative: an in-flight engine call finishes, then the
//! task body notices the status and stops.
//!
//! Every mutation is queued to the persistence mirror before the store lock
//! is released, so the mirrored order of writes matches the store's.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classifier::{Decision, RetryPolicy};
use crate::config::Config;
use crate::engine::TransferSpec;
use crate::error::{CreateError, EngineError, TaskError};
use crate::events::{EventKind, NotificationBus, TaskEvent};
use crate::filename::{self, FilenameResolver};
use crate::models::{FormatResponse, TaskOptions, TaskRecord, TaskStatus};
use crate::persistence::PersistenceMirror;
use crate::pool::{TaskRunner, WorkerPool};
use crate::quality;
use crate::store::TaskStore;
use crate::strategy::StrategyChain;

const CANCELLED_MESSAGE: &str = "cancelled by user";

/// Knobs the orchestrator reads once at construction.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub output_dir: PathBuf,
    pub max_concurrent: usize,
    pub default_max_retries: u32,
    pub retry: RetryPolicy,
    pub max_filename_length: usize,
    pub default_format: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        OrchestratorSettings {
            output_dir: config.download_dir(),
            max_concurrent: config.max_concurrent,
            default_max_retries: config.max_retries,
            retry: RetryPolicy::from_config(config),
            max_filename_length: config.max_filename_length,
            default_format: config.default_format.clone(),
        }
    }
}

/// Why a task body stopped early.
enum Abort {
    Cancelled,
    Failed(TaskError),
}

impl From<TaskError> for Abort {
    fn from(err: TaskError) -> Self {
        Abort::Failed(err)
    }
}

struct Core {
    settings: OrchestratorSettings,
    store: Arc<TaskStore>,
    chain: StrategyChain,
    bus: Arc<NotificationBus>,
    mirror: Arc<PersistenceMirror>,
    resolver: FilenameResolver,
    pool: WorkerPool,
}

pub struct Orchestrator {
    core: Arc<Core>,
}

impl Orchestrator {
    /// Builds the orchestrator and starts its workers. Needs a tokio runtime.
    pub fn new(
        settings: OrchestratorSettings,
        chain: StrategyChain,
        store: Arc<TaskStore>,
        bus: Arc<NotificationBus>,
        mirror: Arc<PersistenceMirror>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.output_dir).with_context(|| {
            format!("creating output directory {}", settings.output_dir.display())
        })?;

        let pool = WorkerPool::new(settings.max_concurrent);
        let core = Arc::new(Core {
            resolver: FilenameResolver::new(settings.max_filename_length),
            settings,
            store,
            chain,
            bus,
            mirror,
            pool: pool.clone(),
        });
        pool.start(core.clone());

        Ok(Orchestrator { core })
    }

    /// Registers a task and queues it. Returns without waiting for any work.
    pub fn create(&self, url: &str, options: TaskOptions) -> Result<String, CreateError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(CreateError::EmptyUrl);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CreateError::UnsupportedScheme(url.to_string()));
        }
        options.validate()?;

        let core = &self.core;
        let id = uuid::Uuid::new_v4().to_string();
        let max_retries = options.max_retries.unwrap_or(core.settings.default_max_retries);
        let record = TaskRecord::new(id.clone(), url.to_string(), options.clone(), max_retries);
        let requester = options.requester.clone();

        core.store.insert(record);
        core.commit(&id, |_| Some(()));
        core.bus.emit(&TaskEvent {
            task_id: id.clone(),
            url: url.to_string(),
            requester,
            kind: EventKind::Started { options },
        });

        if !core.pool.submit(id.clone()) {
            core.fail_task(&id, "worker pool is shut down".to_string());
            return Err(CreateError::PoolClosed);
        }

        tracing::info!(task_id = %id, "Created download task for {}", url);
        Ok(id)
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.core.store.get(task_id)
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        self.core.store.list()
    }

    /// Cancels a task that has not reached a terminal state.
    pub fn cancel(&self, task_id: &str) -> bool {
        let core = &self.core;
        let cancelled = core.commit(task_id, |task| {
            if task.status.is_terminal() {
                return None;
            }
            let previous = task.status;
            task.status = TaskStatus::Cancelled;
            task.error_message = Some(CANCELLED_MESSAGE.to_string());
            Some(previous)
        });

        let Some((previous, _)) = cancelled else {
            return false;
        };
        tracing::info!(task_id = %task_id, "Cancelled download");
        // A running body cleans up after itself; a waiting retry has no body.
        if previous != TaskStatus::Downloading {
            filename::remove_working_files(&core.settings.output_dir, task_id);
        }
        true
    }

    /// Runs the strategy chain and summarizes the available qualities.
    pub async fn analyze(&self, url: &str) -> Result<FormatResponse, EngineError> {
        let extraction = self.core.chain.extract(url).await?;
        Ok(FormatResponse {
            qualities: quality::analyze_formats(&extraction.info.formats),
            title: extraction.info.title,
            thumbnail: extraction.info.thumbnail,
            duration: extraction.info.duration,
            strategy: extraction.profile.name,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.core.settings.output_dir
    }

    /// Stops accepting new task bodies and retries.
    pub fn shutdown(&self) {
        self.core.pool.shutdown();
    }
}

impl Core {
    /// Applies `f` under the store lock. When it returns `Some`, the updated
    /// record is mirrored before the lock is released.
    fn commit<R>(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord) -> Option<R>) -> Option<(R, TaskRecord)> {
        self.store
            .update(task_id, |task| {
                let out = f(task)?;
                self.mirror.mirror(task.clone());
                Some((out, task.clone()))
            })
            .flatten()
    }

    fn emit(&self, task: &TaskRecord, kind: EventKind) {
        self.bus.emit(&TaskEvent {
            task_id: task.id.clone(),
            url: task.url.clone(),
            requester: task.options.requester.clone(),
            kind,
        });
    }

    /// pending|retrying -> downloading. `None` when the task should not run.
    fn begin_attempt(&self, task_id: &str) -> Option<TaskRecord> {
        let (_, snapshot) = self.commit(task_id, |task| match task.status {
            TaskStatus::Pending | TaskStatus::Retrying => {
                task.status = TaskStatus::Downloading;
                task.progress = 0;
                Some(())
            }
            _ => None,
        })?;
        Some(snapshot)
    }

    fn ensure_active(&self, task_id: &str) -> Result<(), Abort> {
        match self.store.status(task_id) {
            Some(TaskStatus::Downloading) => Ok(()),
            Some(_) => Err(Abort::Cancelled),
            None => Err(Abort::Failed(TaskError::Internal(format!("task {} vanished from the store", task_id)))),
        }
    }

    fn on_progress(&self, task_id: &str, progress: u8) {
        let advanced = self
            .store
            .advance_progress(task_id, progress, |task| self.mirror.mirror(task.clone()));
        if let Some(task) = advanced {
            self.emit(&task, EventKind::Progress { progress: task.progress });
        }
    }

    async fn attempt(&self, task: &TaskRecord) -> Result<(), Abort> {
        let id = task.id.as_str();

        let extraction = self
            .chain
            .extract(&task.url)
            .await
            .map_err(|e| TaskError::Extraction(e.to_string()))?;
        self.ensure_active(id)?;

        let title = extraction.info.title.clone();
        self.commit(id, |t| {
            t.title = Some(title.clone());
            Some(())
        });

        let transfer = TransferSpec {
            format: task.options.format_selector(&self.settings.default_format),
            audio_only: task.options.audio_only,
            output_template: self
                .settings
                .output_dir
                .join(format!("{}.%(ext)s", filename::working_stem(id)))
                .to_string_lossy()
                .to_string(),
        };
        let progress = |percent: u8| self.on_progress(id, percent);
        self.chain
            .engine()
            .fetch(&task.url, &extraction.profile, &transfer, &progress)
            .await
            .map_err(|e| TaskError::Transfer(e.to_string()))?;
        self.ensure_active(id)?;

        let output_dir = &self.settings.output_dir;
        let (working, output_size) = filename::find_working_file(output_dir, id)
            .ok_or_else(|| TaskError::MissingOutput(filename::working_stem(id)))?;
        if output_size == 0 {
            // An empty leftover would be taken as already downloaded next time.
            filename::remove_working_files(output_dir, id);
            let name = working.file_name().unwrap_or_default().to_string_lossy().to_string();
            return Err(TaskError::MissingOutput(format!("{} is empty", name)).into());
        }
        let final_path = self.resolver.finalize(&working, &title);

        let completed = self.commit(id, |t| {
            if t.status != TaskStatus::Downloading {
                return None;
            }
            t.status = TaskStatus::Completed;
            t.progress = 100;
            t.output_path = Some(final_path.clone());
            t.output_size = Some(output_size);
            t.error_message = None;
            if t.completed_at.is_none() {
                t.completed_at = Some(Utc::now());
            }
            Some(())
        });

        let Some((_, task)) = completed else {
            // Cancelled between the last check and completion.
            if let Err(e) = std::fs::remove_file(&final_path) {
                tracing::warn!(task_id = %id, "Could not remove output of cancelled task: {}", e);
            }
            return Err(Abort::Cancelled);
        };

        tracing::info!(task_id = %id, "Download completed: {}", final_path.display());
        self.emit(
            &task,
            EventKind::Completed {
                title: task.title.clone(),
                output_path: final_path,
                output_size,
            },
        );
        Ok(())
    }

    /// Routes a failed attempt through the classifier: retry or give up.
    fn handle_failure(&self, task_id: &str, err: TaskError) {
        let text = err.to_string();
        let policy = &self.settings.retry;

        let outcome = self.commit(task_id, |task| {
            if task.status != TaskStatus::Downloading {
                return None;
            }
            let decision = if err.is_classifiable() {
                policy.classify(&text, task.retry_count, task.max_retries)
            } else {
                Decision::Fail { message: text.clone() }
            };
            match decision {
                Decision::Retry { delay } => {
                    task.status = TaskStatus::Retrying;
                    task.retry_count += 1;
                    task.progress = 0;
                    task.error_message = Some(text.clone());
                    Some(Some(delay))
                }
                Decision::Fail { message } => {
                    task.status = TaskStatus::Failed;
                    task.error_message = Some(message);
                    Some(None)
                }
            }
        });

        let Some((retry_delay, task)) = outcome else {
            tracing::debug!(task_id = %task_id, "Dropping failure of inactive task: {}", text);
            return;
        };

        match retry_delay {
            Some(delay) => {
                tracing::warn!(
                    task_id = %task_id,
                    "Attempt failed, retry {}/{} in {:?}: {}",
                    task.retry_count,
                    task.max_retries,
                    delay,
                    text
                );
                self.pool.submit_after(task_id.to_string(), delay);
            }
            None => {
                let error = task.error_message.clone().unwrap_or(text);
                tracing::error!(task_id = %task_id, "Download failed: {}", error);
                filename::remove_working_files(&self.settings.output_dir, task_id);
                self.emit(&task, EventKind::Failed { error });
            }
        }
    }

    /// Terminal failure that skips classification.
    fn fail_task(&self, task_id: &str, message: String) {
        let failed = self.commit(task_id, |task| {
            if task.status.is_terminal() {
                return None;
            }
            task.status = TaskStatus::Failed;
            task.error_message = Some(message.clone());
            Some(())
        });
        if let Some((_, task)) = failed {
            self.emit(&task, EventKind::Failed { error: message });
        }
    }
}

#[async_trait]
impl TaskRunner for Core {
    async fn run(&self, task_id: String) {
        let Some(task) = self.begin_attempt(&task_id) else {
            tracing::debug!(task_id = %task_id, "Skipping task that is no longer runnable");
            return;
        };
        tracing::info!(task_id = %task_id, attempt = task.retry_count + 1, "Starting download of {}", task.url);

        match self.attempt(&task).await {
            Ok(()) => {}
            Err(Abort::Cancelled) => {
                tracing::info!(task_id = %task_id, "Task cancelled, stopping");
                filename::remove_working_files(&self.settings.output_dir, &task_id);
            }
            Err(Abort::Failed(err)) => self.handle_failure(&task_id, err),
        }
    }

    fn on_panic(&self, task_id: &str, message: String) {
        self.handle_failure(task_id, TaskError::Internal(message));
    }
}
