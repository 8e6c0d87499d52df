//! Fixed-size worker pool for task bodies.
//!
//! Workers pull task ids from a shared queue. Retries are re-queued by a
//! detached timer, so no worker ever sleeps through a backoff delay.

use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Executes the body of one task.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task_id: String);

    /// Called when `run` panicked; the worker survives.
    fn on_panic(&self, task_id: &str, message: String);
}

struct PoolInner {
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "task body panicked".to_string()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        WorkerPool {
            inner: Arc::new(PoolInner {
                size: size.max(1),
                sender: Mutex::new(Some(tx)),
                receiver: tokio::sync::Mutex::new(rx),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the workers. Must be called from within a tokio runtime; later
    /// calls are ignored.
    pub fn start(&self, runner: Arc<dyn TaskRunner>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for index in 0..self.inner.size {
            tokio::spawn(worker_loop(index, self.inner.clone(), runner.clone()));
        }
        tracing::info!("Worker pool started with {} workers", self.inner.size);
    }

    /// Queues a task body. Returns false once the pool is shut down.
    pub fn submit(&self, task_id: String) -> bool {
        let sender = self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(task_id).is_ok(),
            None => false,
        }
    }

    /// Queues a task body after `delay` from a detached timer.
    pub fn submit_after(&self, task_id: String, delay: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !pool.submit(task_id.clone()) {
                tracing::warn!(task_id = %task_id, "Pool shut down before retry could be queued");
            }
        });
    }

    /// Stops accepting work; workers exit once the queue drains.
    pub fn shutdown(&self) {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn worker_loop(index: usize, pool: Arc<PoolInner>, runner: Arc<dyn TaskRunner>) {
    loop {
        let next = pool.receiver.lock().await.recv().await;
        let Some(task_id) = next else {
            break;
        };

        let body_runner = runner.clone();
        let body_id = task_id.clone();
        // Run the body as its own task so a panic is observed, not inherited.
        let outcome = tokio::spawn(async move { body_runner.run(body_id).await }).await;
        if let Err(e) = outcome {
            if e.is_panic() {
                let message = panic_message(e.into_panic());
                tracing::error!(task_id = %task_id, worker = index, "Task body panicked: {}", message);
                runner.on_panic(&task_id, message);
            }
        }
    }
    tracing::debug!(worker = index, "Worker exiting");
}
