use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use media_downloader::classifier::RetryPolicy;
use media_downloader::engine::{ExtractionEngine, ProgressCallback, TransferSpec};
use media_downloader::error::{CreateError, EngineError};
use media_downloader::events::{EventKind, FnSubscriber, NotificationBus, TaskEvent};
use media_downloader::models::{TaskOptions, TaskRecord, TaskStatus, VideoInfo};
use media_downloader::orchestrator::{Orchestrator, OrchestratorSettings};
use media_downloader::persistence::{PersistenceMirror, TaskPersistence};
use media_downloader::store::TaskStore;
use media_downloader::strategy::{StrategyChain, StrategyProfile};

const URL: &str = "https://media.example.com/watch/1";

/// Engine double: lookups return a fixed title, fetches write a working file.
struct FakeEngine {
    title: String,
    inspect_error: Option<String>,
    fetch_error: String,
    failures_left: AtomicU32,
    fetch_delay: Duration,
    progress: Vec<u8>,
    fetch_calls: AtomicUsize,
    fetch_started: Mutex<Vec<Instant>>,
    panic_on_fetch: bool,
    /// Successful fetches that still leave a zero-byte file.
    empty_outputs: AtomicU32,
    /// Failing fetches leave a `.part` file behind.
    partial_on_failure: bool,
}

impl FakeEngine {
    fn new(title: &str) -> Self {
        FakeEngine {
            title: title.to_string(),
            inspect_error: None,
            fetch_error: "ERROR: Read timed out.".to_string(),
            failures_left: AtomicU32::new(0),
            fetch_delay: Duration::from_millis(10),
            progress: vec![10, 50, 100],
            fetch_calls: AtomicUsize::new(0),
            fetch_started: Mutex::new(Vec::new()),
            panic_on_fetch: false,
            empty_outputs: AtomicU32::new(0),
            partial_on_failure: false,
        }
    }

    fn failing_fetches(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ExtractionEngine for FakeEngine {
    async fn inspect(&self, _url: &str, _profile: &StrategyProfile) -> Result<VideoInfo, EngineError> {
        if let Some(error) = &self.inspect_error {
            return Err(EngineError::Failed { code: Some(1), stderr: error.clone() });
        }
        Ok(VideoInfo {
            id: Some("1".to_string()),
            title: self.title.clone(),
            ..Default::default()
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        _profile: &StrategyProfile,
        transfer: &TransferSpec,
        progress: ProgressCallback<'_>,
    ) -> Result<(), EngineError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_started.lock().unwrap().push(Instant::now());
        for percent in &self.progress {
            progress(*percent);
        }
        sleep(self.fetch_delay).await;
        if self.panic_on_fetch {
            panic!("engine exploded");
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            if self.partial_on_failure {
                let partial = transfer.output_template.replace("%(ext)s", "mp4.part");
                tokio::fs::write(partial, b"half a video").await?;
            }
            return Err(EngineError::Failed { code: Some(1), stderr: self.fetch_error.clone() });
        }

        let empty = self
            .empty_outputs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        let body: &[u8] = if empty { b"" } else { b"not really a video" };
        let output = transfer.output_template.replace("%(ext)s", "mp4");
        tokio::fs::write(output, body).await?;
        Ok(())
    }
}

/// Persistence double that keeps every mirrored snapshot in order.
#[derive(Default)]
struct Journal {
    writes: Mutex<Vec<TaskRecord>>,
}

impl TaskPersistence for Journal {
    fn upsert_task(&self, record: &TaskRecord) -> anyhow::Result<()> {
        self.writes.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn read_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(Vec::new())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    engine: Arc<FakeEngine>,
    journal: Arc<Journal>,
    mirror: Arc<PersistenceMirror>,
    events: Arc<Mutex<Vec<TaskEvent>>>,
    dir: TempDir,
}

impl Harness {
    fn new(engine: FakeEngine, max_concurrent: usize, max_retries: u32) -> Self {
        Harness::build(engine, |settings| {
            settings.max_concurrent = max_concurrent;
            settings.default_max_retries = max_retries;
        })
    }

    fn build(engine: FakeEngine, tweak: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine);
        let journal = Arc::new(Journal::default());
        let mirror = Arc::new(PersistenceMirror::spawn(journal.clone()).unwrap());

        let events = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(NotificationBus::new());
        let sink = events.clone();
        bus.subscribe(Arc::new(FnSubscriber::new("recorder", move |event: &TaskEvent| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        })));

        let mut settings = OrchestratorSettings {
            output_dir: dir.path().to_path_buf(),
            max_concurrent: 1,
            default_max_retries: 0,
            retry: RetryPolicy {
                backoff_base: 2,
                max_delay: Duration::from_secs(1),
                unit: Duration::from_millis(20),
            },
            max_filename_length: 200,
            default_format: "best".to_string(),
        };
        tweak(&mut settings);
        let orchestrator = Orchestrator::new(
            settings,
            StrategyChain::new(engine.clone(), None),
            Arc::new(TaskStore::new()),
            bus,
            mirror.clone(),
        )
        .unwrap();

        Harness { orchestrator, engine, journal, mirror, events, dir }
    }

    async fn wait_terminal(&self, id: &str) -> TaskRecord {
        timeout(Duration::from_secs(20), async {
            loop {
                let task = self.orchestrator.get(id).unwrap();
                if task.status.is_terminal() {
                    return task;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not reach a terminal state")
    }

    async fn wait_status(&self, id: &str, status: TaskStatus) {
        timeout(Duration::from_secs(5), async {
            while self.orchestrator.get(id).unwrap().status != status {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("task never reached the expected status");
    }

    fn events_for(&self, id: &str) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.task_id == id)
            .cloned()
            .collect()
    }

    /// Mirrored (status, retry_count) pairs with consecutive repeats folded.
    fn status_history(&self, id: &str) -> Vec<(TaskStatus, u32)> {
        self.mirror.flush();
        let mut history: Vec<(TaskStatus, u32)> = Vec::new();
        for record in self.journal.writes.lock().unwrap().iter().filter(|r| r.id == id) {
            let entry = (record.status, record.retry_count);
            if history.last() != Some(&entry) {
                history.push(entry);
            }
        }
        history
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_task_has_final_output() {
    let harness = Harness::new(FakeEngine::new("Demo"), 2, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.title.as_deref(), Some("Demo"));
    assert!(task.completed_at.is_some());

    let output = task.output_path.unwrap();
    assert_eq!(output, harness.dir.path().join("Demo.mp4"));
    assert_eq!(std::fs::metadata(&output).unwrap().len(), task.output_size.unwrap());
    assert!(task.output_size.unwrap() > 0);
    assert_eq!(file_names(harness.dir.path()), vec!["Demo.mp4"]);

    let names: Vec<_> = harness.events_for(&id).iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"started"));
    assert_eq!(names.last(), Some(&"completed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_events_only_increase() {
    let mut engine = FakeEngine::new("Demo");
    engine.progress = vec![10, 50, 30, 50, 90];
    let harness = Harness::new(engine, 1, 0);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();
    harness.wait_terminal(&id).await;

    let progress: Vec<u8> = harness
        .events_for(&id)
        .iter()
        .filter_map(|event| match event.kind {
            EventKind::Progress { progress } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 50, 90]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_content_fails_without_retry() {
    let mut engine = FakeEngine::new("Demo");
    engine.inspect_error = Some("ERROR: [media] 1: Private video".to_string());
    let harness = Harness::new(engine, 1, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.error_message.unwrap().contains("private"));
    assert_eq!(harness.engine.fetch_calls.load(Ordering::SeqCst), 0);

    let failed = harness.events_for(&id).iter().filter(|e| e.name() == "failed").count();
    assert_eq!(failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_retry_until_the_ceiling() {
    let harness = Harness::new(FakeEngine::new("Demo").failing_fetches(u32::MAX), 1, 2);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task
        .error_message
        .unwrap()
        .starts_with("failed after 2 retries: ERROR: Read timed out."));

    assert_eq!(
        harness.status_history(&id),
        vec![
            (TaskStatus::Pending, 0),
            (TaskStatus::Downloading, 0),
            (TaskStatus::Retrying, 1),
            (TaskStatus::Downloading, 1),
            (TaskStatus::Retrying, 2),
            (TaskStatus::Downloading, 2),
            (TaskStatus::Failed, 2),
        ]
    );

    // Backoff of 20ms then 40ms between attempts, on top of the fetch itself.
    let started = harness.engine.fetch_started.lock().unwrap().clone();
    assert_eq!(started.len(), 3);
    assert!(started[1] - started[0] >= Duration::from_millis(20));
    assert!(started[2] - started[1] >= Duration::from_millis(40));

    let failed = harness.events_for(&id).iter().filter(|e| e.name() == "failed").count();
    assert_eq!(failed, 1);
    assert!(file_names(harness.dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovers_after_a_transient_failure() {
    let harness = Harness::new(FakeEngine::new("Demo").failing_fetches(1), 1, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.error_message, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_title_gets_distinct_names() {
    let mut engine = FakeEngine::new("Demo");
    engine.fetch_delay = Duration::from_millis(50);
    let harness = Harness::new(engine, 2, 0);

    let first = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();
    let second = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();
    let a = harness.wait_terminal(&first).await;
    let b = harness.wait_terminal(&second).await;

    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);
    assert_ne!(a.output_path, b.output_path);
    assert_eq!(file_names(harness.dir.path()), vec!["Demo (2).mp4", "Demo.mp4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_wins_over_in_flight_transfer() {
    let mut engine = FakeEngine::new("Demo");
    engine.fetch_delay = Duration::from_millis(200);
    let harness = Harness::new(engine, 1, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    harness.wait_status(&id, TaskStatus::Downloading).await;
    assert!(harness.orchestrator.cancel(&id));
    assert!(!harness.orchestrator.cancel(&id));

    // Let the transfer finish and the body notice the cancellation.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.engine.fetch_calls.load(Ordering::SeqCst), 1);

    let task = harness.orchestrator.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.output_path, None);
    assert!(file_names(harness.dir.path()).is_empty());
    assert!(harness.events_for(&id).iter().all(|e| e.name() != "completed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_a_noop_on_finished_or_unknown_tasks() {
    let harness = Harness::new(FakeEngine::new("Demo"), 1, 0);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();
    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    assert!(!harness.orchestrator.cancel(&id));
    assert!(!harness.orchestrator.cancel("no-such-task"));
    assert_eq!(harness.orchestrator.get(&id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn create_rejects_invalid_input() {
    let harness = Harness::new(FakeEngine::new("Demo"), 1, 0);
    let orchestrator = &harness.orchestrator;

    assert_eq!(orchestrator.create("  ", TaskOptions::default()), Err(CreateError::EmptyUrl));
    assert!(matches!(
        orchestrator.create("ftp://media.example.com/1", TaskOptions::default()),
        Err(CreateError::UnsupportedScheme(_))
    ));
    let blank = TaskOptions { format: Some(" ".to_string()), ..Default::default() };
    assert_eq!(orchestrator.create(URL, blank), Err(CreateError::BlankFormat));
    assert!(orchestrator.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_keeps_creation_order() {
    let harness = Harness::new(FakeEngine::new("Demo"), 2, 0);
    let ids: Vec<String> = (0..3)
        .map(|_| harness.orchestrator.create(URL, TaskOptions::default()).unwrap())
        .collect();
    for id in &ids {
        harness.wait_terminal(id).await;
    }

    let listed: Vec<String> = harness.orchestrator.list().into_iter().map(|t| t.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mirrored_state_matches_store_under_concurrent_cancels() {
    let mut engine = FakeEngine::new("Demo");
    engine.progress = (1..=100).collect();
    engine.fetch_delay = Duration::from_millis(1);
    let harness = Harness::new(engine, 8, 0);

    let ids: Vec<String> = (0..400)
        .map(|_| harness.orchestrator.create(URL, TaskOptions::default()).unwrap())
        .collect();

    // Cancel every other task while the pool is busy with the rest.
    let cancelled = std::thread::scope(|scope| {
        let handle = scope.spawn(|| {
            ids.iter()
                .step_by(2)
                .filter(|id| {
                    std::thread::sleep(Duration::from_micros(500));
                    harness.orchestrator.cancel(id)
                })
                .count()
        });
        handle.join().unwrap()
    });
    assert!(cancelled > 0);

    for id in &ids {
        harness.wait_terminal(id).await;
    }
    harness.mirror.flush();

    let writes = harness.journal.writes.lock().unwrap();
    for id in &ids {
        let last = writes.iter().rev().find(|record| &record.id == id).unwrap();
        assert_eq!(Some(last), harness.orchestrator.get(id).as_ref(), "journal diverged for {}", id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_body_fails_the_task() {
    let mut engine = FakeEngine::new("Demo");
    engine.panic_on_fetch = true;
    let harness = Harness::new(engine, 1, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    let error = task.error_message.unwrap();
    assert!(error.contains("internal error"), "{}", error);
    assert!(error.contains("engine exploded"), "{}", error);

    let failed = harness.events_for(&id).iter().filter(|e| e.name() == "failed").count();
    assert_eq!(failed, 1);

    // The worker survived the panic and picks up the next task.
    let next = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();
    assert_eq!(harness.wait_terminal(&next).await.status, TaskStatus::Failed);
    assert_eq!(harness.engine.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_retrying_drops_the_scheduled_retry() {
    let mut engine = FakeEngine::new("Demo").failing_fetches(u32::MAX);
    engine.partial_on_failure = true;
    let harness = Harness::build(engine, |settings| {
        settings.default_max_retries = 3;
        settings.retry.unit = Duration::from_millis(500);
    });
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    harness.wait_status(&id, TaskStatus::Retrying).await;
    assert_eq!(file_names(harness.dir.path()), vec![format!("temp_{}.mp4.part", id)]);
    assert!(harness.orchestrator.cancel(&id));
    assert!(file_names(harness.dir.path()).is_empty());

    // Past the backoff: the timer fires but the task must not run again.
    sleep(Duration::from_millis(800)).await;
    assert_eq!(harness.engine.fetch_calls.load(Ordering::SeqCst), 1);

    let task = harness.orchestrator.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retry_count, 1);
    assert!(file_names(harness.dir.path()).is_empty());
    assert!(harness.events_for(&id).iter().all(|e| e.name() != "failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_output_is_retried_not_completed() {
    let engine = FakeEngine::new("Demo");
    engine.empty_outputs.store(1, Ordering::SeqCst);
    let harness = Harness::new(engine, 1, 3);
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.output_path, Some(harness.dir.path().join("Demo.mp4")));
    assert!(task.output_size.unwrap() > 0);
    assert_eq!(file_names(harness.dir.path()), vec!["Demo.mp4"]);
    assert_eq!(harness.engine.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_rename_completes_under_the_working_name() {
    // Longer than any filesystem allows for a single name component.
    let title = "a".repeat(290);
    let harness = Harness::build(FakeEngine::new(&title), |settings| {
        settings.max_filename_length = 300;
    });
    let id = harness.orchestrator.create(URL, TaskOptions::default()).unwrap();

    let task = harness.wait_terminal(&id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    let working = harness.dir.path().join(format!("temp_{}.mp4", id));
    assert_eq!(task.output_path, Some(working.clone()));
    assert_eq!(std::fs::metadata(&working).unwrap().len(), task.output_size.unwrap());
    assert!(task.output_size.unwrap() > 0);
}
