//! Fire-and-forget task notifications.
//!
//! Subscribers run synchronously, in registration order, on the thread that
//! emitted the event. A failing or panicking subscriber is logged and skipped.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::TaskOptions;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EventKind {
    Started { options: TaskOptions },
    Progress { progress: u8 },
    Completed { title: Option<String>, output_path: PathBuf, output_size: u64 },
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub url: String,
    pub requester: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Started { .. } => "started",
            EventKind::Progress { .. } => "progress",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
        }
    }
}

pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_event(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

/// Adapts a closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnSubscriber { name: name.into(), f }
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }
}

#[derive(Default)]
pub struct NotificationBus {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        tracing::debug!("Registered event subscriber '{}'", subscriber.name());
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn emit(&self, event: &TaskEvent) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for subscriber in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    task_id = %event.task_id,
                    "Subscriber '{}' failed on {} event: {:#}",
                    subscriber.name(),
                    event.name(),
                    e
                ),
                Err(_) => tracing::error!(
                    task_id = %event.task_id,
                    "Subscriber '{}' panicked on {} event",
                    subscriber.name(),
                    event.name()
                ),
            }
        }
    }
}

/// Writes task outcomes to the log. Stands where a chat notifier plugs in.
pub struct LogNotifier;

impl Subscriber for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::Started { .. } => {
                tracing::info!(task_id = %event.task_id, "Download queued: {}", event.url)
            }
            EventKind::Progress { .. } => {}
            EventKind::Completed { title, output_path, output_size } => tracing::info!(
                task_id = %event.task_id,
                "Download completed: {} -> {} ({} bytes)",
                title.as_deref().unwrap_or("untitled"),
                output_path.display(),
                output_size
            ),
            EventKind::Failed { error } => {
                tracing::warn!(task_id = %event.task_id, "Download failed: {}", error)
            }
        }
        Ok(())
    }
}
