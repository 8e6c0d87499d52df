//! One-way mirror of task records into durable storage.
//!
//! The in-memory store stays the source of truth while the process runs.
//! Writes are queued to a background thread; storage failures are logged and
//! never reach the orchestrator.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::filename;
use crate::models::{TaskOptions, TaskRecord, TaskStatus};
use crate::store::TaskStore;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

pub trait TaskPersistence: Send + Sync {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()>;
    fn read_tasks(&self) -> Result<Vec<TaskRecord>>;
}

// ===================================================================
//                          SQLITE
// ===================================================================

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("opening task database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS download_task (
  id TEXT PRIMARY KEY,
  url TEXT NOT NULL,
  status TEXT NOT NULL,
  progress INTEGER NOT NULL,
  title TEXT,
  output_path TEXT,
  output_size INTEGER,
  error_message TEXT,
  retry_count INTEGER NOT NULL,
  max_retries INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  completed_at TEXT,
  options_json TEXT NOT NULL
);
"#,
        )?;
        Ok(SqlitePersistence { conn: Mutex::new(conn) })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn record_from_row(row: &Row<'_>) -> Result<TaskRecord> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let options_json: String = row.get("options_json")?;
    let output_path: Option<String> = row.get("output_path")?;
    let output_size: Option<i64> = row.get("output_size")?;
    let progress: i64 = row.get("progress")?;

    Ok(TaskRecord {
        id: row.get("id")?,
        url: row.get("url")?,
        status: TaskStatus::parse(&status).ok_or_else(|| anyhow!("unknown task status '{}'", status))?,
        progress: progress.clamp(0, 100) as u8,
        title: row.get("title")?,
        output_path: output_path.map(PathBuf::from),
        output_size: output_size.map(|size| size.max(0) as u64),
        error_message: row.get("error_message")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        created_at: parse_time(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
        options: serde_json::from_str::<TaskOptions>(&options_json)?,
    })
}

impl TaskPersistence for SqlitePersistence {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            r#"
INSERT INTO download_task (
  id, url, status, progress, title, output_path, output_size, error_message,
  retry_count, max_retries, created_at, completed_at, options_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT(id) DO UPDATE SET
  status = excluded.status,
  progress = excluded.progress,
  title = excluded.title,
  output_path = excluded.output_path,
  output_size = excluded.output_size,
  error_message = excluded.error_message,
  retry_count = excluded.retry_count,
  max_retries = excluded.max_retries,
  completed_at = excluded.completed_at
"#,
            params![
                record.id,
                record.url,
                record.status.as_str(),
                record.progress,
                record.title,
                record.output_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                record.output_size.map(|size| size as i64),
                record.error_message,
                record.retry_count,
                record.max_retries,
                record.created_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&record.options)?,
            ],
        )?;
        Ok(())
    }

    fn read_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT * FROM download_task ORDER BY created_at ASC")?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            match record_from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable task row: {:#}", e),
            }
        }
        Ok(records)
    }
}

// ===================================================================
//                          IN-MEMORY
// ===================================================================

/// Keeps records in memory; for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryPersistence {
    records: Mutex<Vec<TaskRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<TaskRecord>) -> Self {
        InMemoryPersistence { records: Mutex::new(records) }
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }
}

impl TaskPersistence for InMemoryPersistence {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    fn read_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

// ===================================================================
//                          MIRROR
// ===================================================================

enum MirrorMessage {
    Upsert(TaskRecord),
    Flush(mpsc::Sender<()>),
}

/// Queues record snapshots to a writer thread, preserving write order.
pub struct PersistenceMirror {
    tx: Mutex<mpsc::Sender<MirrorMessage>>,
}

impl PersistenceMirror {
    pub fn spawn(backend: Arc<dyn TaskPersistence>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<MirrorMessage>();
        std::thread::Builder::new()
            .name("task-mirror".to_string())
            .spawn(move || {
                for message in rx {
                    match message {
                        MirrorMessage::Upsert(record) => {
                            if let Err(e) = backend.upsert_task(&record) {
                                tracing::error!(task_id = %record.id, "Failed to persist task: {:#}", e);
                            }
                        }
                        MirrorMessage::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .context("spawning persistence thread")?;
        Ok(PersistenceMirror { tx: Mutex::new(tx) })
    }

    pub fn mirror(&self, record: TaskRecord) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send(MirrorMessage::Upsert(record)).is_err() {
            tracing::error!("Persistence thread is gone; task update not mirrored");
        }
    }

    /// Blocks until every queued write has been attempted.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        let sent = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(MirrorMessage::Flush(done_tx));
        if sent.is_ok() {
            let _ = done_rx.recv();
        }
    }
}

/// Loads persisted tasks into `store`, rewriting unfinished ones as failed.
///
/// Working files of those tasks are removed from `output_dir`. Returns how
/// many tasks were marked interrupted.
pub fn reconcile(backend: &dyn TaskPersistence, store: &TaskStore, output_dir: &Path) -> Result<usize> {
    let mut interrupted = 0;
    for mut record in backend.read_tasks()? {
        if !record.status.is_terminal() {
            record.status = TaskStatus::Failed;
            record.error_message = Some(INTERRUPTED_MESSAGE.to_string());
            backend.upsert_task(&record)?;
            filename::remove_working_files(output_dir, &record.id);
            interrupted += 1;
        }
        store.insert(record);
    }
    if interrupted > 0 {
        tracing::warn!("Marked {} unfinished task(s) as {}", interrupted, INTERRUPTED_MESSAGE);
    }
    Ok(interrupted)
}
