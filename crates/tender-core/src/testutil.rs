//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::AppError;
use crate::health::{ResourceProbe, ResourceUsage};
use crate::models::ExtractedRecord;
use crate::orchestrator::Orchestrator;
use crate::registry::ScraperConfig;
use crate::scheduler::{SchedulerEvent, SchedulerReporter, TaskScheduler};
use crate::session::{Session, SessionManager, SessionStatus};
use crate::task::{ProgressUpdate, Task, TaskContext, TaskFuture, TaskOutput, TaskStatus, TaskWork};
use crate::traits::{RecordSink, Scraper};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// ScriptedWork
// ---------------------------------------------------------------------------

/// Task body that plays back a list of outcomes, one per attempt.
///
/// Once the script is exhausted every further attempt succeeds with a
/// default output.
pub struct ScriptedWork {
    label: String,
    outcomes: Arc<Mutex<VecDeque<Result<TaskOutput, AppError>>>>,
    always_fail: Option<String>,
    invalid: Option<String>,
    delay: Option<Duration>,
    progress: Option<ProgressUpdate>,
    order_log: Option<Arc<Mutex<Vec<String>>>>,
    gauge: Option<ConcurrencyGauge>,
    /// Start time of every attempt.
    pub attempts: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedWork {
    pub fn new(label: &str, outcomes: Vec<Result<TaskOutput, AppError>>) -> Self {
        Self {
            label: label.to_string(),
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            always_fail: None,
            invalid: None,
            delay: None,
            progress: None,
            order_log: None,
            gauge: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always_failing(label: &str, message: &str) -> Self {
        Self {
            always_fail: Some(message.to_string()),
            ..Self::new(label, Vec::new())
        }
    }

    /// Make `validate` reject the payload.
    pub fn invalid(mut self, reason: &str) -> Self {
        self.invalid = Some(reason.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_progress(mut self, progress: ProgressUpdate) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Append the label to `log` when an attempt starts.
    pub fn with_order_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.order_log = Some(log);
        self
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }
}

impl TaskWork for ScriptedWork {
    fn label(&self) -> &str {
        &self.label
    }

    fn validate(&self) -> Result<(), AppError> {
        match &self.invalid {
            Some(reason) => Err(AppError::ConfigError(reason.clone())),
            None => Ok(()),
        }
    }

    fn run(&self, ctx: TaskContext) -> TaskFuture<'_> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(Instant::now());
            if let Some(log) = &self.order_log {
                log.lock().unwrap().push(self.label.clone());
            }
            let _inside = self.gauge.as_ref().map(ConcurrencyGauge::enter);

            if let Some(progress) = self.progress {
                ctx.report_progress(progress);
            }
            if let Some(delay) = self.delay {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.cancel_token().cancelled() => return Err(AppError::Cancelled),
                }
            }

            if let Some(message) = &self.always_fail {
                return Err(AppError::ExecutionError(message.clone()));
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(TaskOutput {
                    progress: ctx.progress(),
                    records_handed_off: 0,
                })
            })
        })
    }
}

// ---------------------------------------------------------------------------
// BlockingWork
// ---------------------------------------------------------------------------

/// Task body that never finishes on its own.
pub struct BlockingWork {
    label: String,
    cooperative: bool,
}

impl BlockingWork {
    /// Returns `Cancelled` as soon as the token fires.
    pub fn cooperative(label: &str) -> Self {
        Self {
            label: label.to_string(),
            cooperative: true,
        }
    }

    /// Ignores the token entirely.
    pub fn stubborn(label: &str) -> Self {
        Self {
            label: label.to_string(),
            cooperative: false,
        }
    }
}

impl TaskWork for BlockingWork {
    fn label(&self) -> &str {
        &self.label
    }

    fn run(&self, ctx: TaskContext) -> TaskFuture<'_> {
        Box::pin(async move {
            if self.cooperative {
                ctx.cancel_token().cancelled().await;
                Err(AppError::Cancelled)
            } else {
                std::future::pending::<()>().await;
                Ok(TaskOutput::default())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyGauge
// ---------------------------------------------------------------------------

/// Tracks how many task bodies run at once and the peak seen.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            current: self.current.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ScriptedScraper
// ---------------------------------------------------------------------------

/// Scraper that fails its first `n` calls, then walks `pages` pages of
/// `items_per_page` records each, reporting progress after every page.
///
/// Record URLs depend only on source, page and item, so retried runs
/// produce the same upsert keys.
#[derive(Clone)]
pub struct ScriptedScraper {
    pages: u32,
    items_per_page: u32,
    fail_first: usize,
    page_delay: Option<Duration>,
    gauge: Option<ConcurrencyGauge>,
    calls: Arc<AtomicUsize>,
    configs: Arc<Mutex<Vec<ScraperConfig>>>,
}

impl ScriptedScraper {
    pub fn new(pages: u32, items_per_page: u32) -> Self {
        Self {
            pages,
            items_per_page,
            fail_first: 0,
            page_delay: None,
            gauge: None,
            calls: Arc::new(AtomicUsize::new(0)),
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_first(mut self, calls: usize) -> Self {
        self.fail_first = calls;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = Some(delay);
        self
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Effective configs received, one per call.
    pub fn configs(&self) -> Vec<ScraperConfig> {
        self.configs.lock().unwrap().clone()
    }
}

impl Scraper for ScriptedScraper {
    fn run<'a>(
        &'a self,
        config: &'a ScraperConfig,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Vec<ExtractedRecord>, AppError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.configs.lock().unwrap().push(config.clone());
            let _inside = self.gauge.as_ref().map(ConcurrencyGauge::enter);
            ctx.checkpoint()?;

            if call <= self.fail_first {
                return Err(AppError::ExecutionError(format!("scripted failure {call}")));
            }

            let pages = self.pages.min(config.max_pages);
            let mut records = Vec::new();
            for page in 1..=pages {
                ctx.checkpoint()?;
                if let Some(delay) = self.page_delay {
                    tokio::time::sleep(delay).await;
                }
                for item in 1..=self.items_per_page {
                    records.push(ExtractedRecord::new(
                        &config.source,
                        format!("https://tenders.example/{}/{page}/{item}", config.source),
                        format!("Tender {page}-{item}"),
                        serde_json::json!({"page": page, "item": item}),
                    ));
                }
                ctx.report_progress(ProgressUpdate::new(
                    u64::from(page),
                    records.len() as u64,
                ));
            }
            Ok(records)
        })
    }
}

// ---------------------------------------------------------------------------
// SlowScraper
// ---------------------------------------------------------------------------

/// Scraper that keeps producing pages until its token is cancelled.
#[derive(Clone)]
pub struct SlowScraper {
    page_delay: Duration,
    gauge: Option<ConcurrencyGauge>,
    pages_seen: Arc<AtomicUsize>,
}

impl SlowScraper {
    pub fn new(page_delay: Duration) -> Self {
        Self {
            page_delay,
            gauge: None,
            pages_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Pages produced across all calls.
    pub fn pages_seen(&self) -> usize {
        self.pages_seen.load(Ordering::SeqCst)
    }
}

impl Scraper for SlowScraper {
    fn run<'a>(
        &'a self,
        _config: &'a ScraperConfig,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Vec<ExtractedRecord>, AppError>> {
        Box::pin(async move {
            let _inside = self.gauge.as_ref().map(ConcurrencyGauge::enter);
            let mut page = 0u64;
            loop {
                ctx.checkpoint()?;
                tokio::time::sleep(self.page_delay).await;
                page += 1;
                self.pages_seen.fetch_add(1, Ordering::SeqCst);
                ctx.report_progress(ProgressUpdate::new(page, page * 2));
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// In-memory record sink keyed by [`ExtractedRecord::key`].
#[derive(Clone, Default)]
pub struct MockSink {
    records: Arc<Mutex<HashMap<String, ExtractedRecord>>>,
    failures: Arc<Mutex<VecDeque<AppError>>>,
    upserts: Arc<AtomicUsize>,
}

impl MockSink {
    /// Queue an error for the next `upsert` call.
    pub fn failing_next(self, error: AppError) -> Self {
        self.failures.lock().unwrap().push_back(error);
        self
    }

    /// Number of distinct records stored.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<ExtractedRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }
}

impl RecordSink for MockSink {
    async fn upsert(&self, records: &[ExtractedRecord]) -> Result<usize, AppError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut stored = self.records.lock().unwrap();
        for record in records {
            stored.insert(record.key.clone(), record.clone());
        }
        Ok(records.len())
    }
}

// ---------------------------------------------------------------------------
// StaticProbe
// ---------------------------------------------------------------------------

/// Resource probe returning whatever the test last set.
pub struct StaticProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    /// Comfortably below every default threshold.
    pub fn healthy() -> Self {
        Self::new(ResourceUsage::new(20.0, 40.0, 30.0))
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn set_memory(&self, percent: f64) {
        self.usage.lock().unwrap().memory_percent = percent;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Scheduler reporter that records event names.
#[derive(Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SchedulerReporter for RecordingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match &event {
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::TaskCreated { .. } => "task_created",
            SchedulerEvent::TaskDispatched { .. } => "task_dispatched",
            SchedulerEvent::TaskSucceeded { .. } => "task_succeeded",
            SchedulerEvent::TaskRetrying { .. } => "task_retrying",
            SchedulerEvent::TaskFailed { .. } => "task_failed",
            SchedulerEvent::TaskCancelled { .. } => "task_cancelled",
            SchedulerEvent::CleanedUp { .. } => "cleaned_up",
            SchedulerEvent::Stopped => "stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Poll until the task is terminal. Panics after `timeout`.
pub async fn wait_for_task(scheduler: &TaskScheduler, task_id: Uuid, timeout: Duration) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = scheduler.status(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} still {} after {timeout:?}",
            task.status
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the task reaches `status`. Panics after `timeout`.
pub async fn wait_for_status(
    scheduler: &TaskScheduler,
    task_id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = scheduler.status(task_id).await.unwrap();
        if task.status == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} is {} after {timeout:?}, expected {status}",
            task.status
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the session is terminal. Panics after `timeout`.
pub async fn wait_for_session<S: RecordSink>(
    manager: &SessionManager<S>,
    session_id: Uuid,
    timeout: Duration,
) -> Session {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let session = manager.status(session_id).await.unwrap();
        if session.status.is_terminal() {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} still {} after {timeout:?}",
            session.status
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until the session reaches `status`. Panics after `timeout`.
pub async fn wait_for_session_status<S: RecordSink>(
    manager: &SessionManager<S>,
    session_id: Uuid,
    status: SessionStatus,
    timeout: Duration,
) -> Session {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let session = manager.status(session_id).await.unwrap();
        if session.status == status {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} is {} after {timeout:?}, expected {status}",
            session.status
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// [`wait_for_session`] through the orchestrator facade.
pub async fn wait_for_orchestrated_session<S: RecordSink>(
    orchestrator: &Orchestrator<S>,
    session_id: Uuid,
    timeout: Duration,
) -> Session {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let session = orchestrator.session_status(session_id).await.unwrap();
        if session.status.is_terminal() {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} still {} after {timeout:?}",
            session.status
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
