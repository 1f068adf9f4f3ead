use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;

/// Status of a task owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the task lifecycle graph:
    ///
    /// ```text
    /// PENDING -> RUNNING -> SUCCESS | FAILED | CANCELLED
    ///                    -> RETRYING -> PENDING
    /// PENDING | RETRYING -> CANCELLED
    /// ```
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Dispatch priority. Higher variants are serviced first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            _ => Err(format!("Unknown task priority: {}", s)),
        }
    }
}

/// Cumulative progress counters reported by a running unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub pages_processed: u64,
    pub items_found: u64,
    pub items_processed: u64,
}

impl ProgressUpdate {
    pub fn new(pages_processed: u64, items_found: u64) -> Self {
        Self {
            pages_processed,
            items_found,
            items_processed: 0,
        }
    }

    /// Raise each counter to at least the value in `other`.
    ///
    /// Returns true if any counter changed. Counters never decrease, even
    /// when a retried attempt starts counting from zero again.
    pub fn absorb(&mut self, other: &ProgressUpdate) -> bool {
        let before = *self;
        self.pages_processed = self.pages_processed.max(other.pages_processed);
        self.items_found = self.items_found.max(other.items_found);
        self.items_processed = self.items_processed.max(other.items_processed);
        before != *self
    }
}

/// Result handle stored on a successful task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub progress: ProgressUpdate,
    pub records_handed_off: usize,
}

/// Boxed future returned by [`TaskWork::run`].
pub type TaskFuture<'a> = BoxFuture<'a, Result<TaskOutput, AppError>>;

/// A unit of work the scheduler can execute.
///
/// The scheduler knows nothing about scraping: sessions bind a resolved
/// scraper and its effective config into an implementation of this trait.
pub trait TaskWork: Send + Sync {
    /// Short label for logs (e.g. the source name).
    fn label(&self) -> &str;

    /// Reject malformed payloads before anything is scheduled.
    fn validate(&self) -> Result<(), AppError> {
        Ok(())
    }

    /// Execute one attempt. Implementations must check `ctx` for
    /// cancellation between logical units of work.
    fn run(&self, ctx: TaskContext) -> TaskFuture<'_>;
}

/// A lifecycle or progress notification emitted by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn new(task_id: Uuid, kind: TaskEventKind) -> Self {
        Self {
            task_id,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskEventKind {
    Started {
        attempt: u32,
    },
    Progress(ProgressUpdate),
    Retrying {
        attempt: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    Requeued {
        attempt: u32,
    },
    Succeeded {
        attempt: u32,
        output: TaskOutput,
    },
    Failed {
        attempt: u32,
        error: String,
    },
    Cancelled,
}

impl TaskEventKind {
    /// Status the task holds after this event, if the event is a transition.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskEventKind::Started { .. } => Some(TaskStatus::Running),
            TaskEventKind::Progress(_) => None,
            TaskEventKind::Retrying { .. } => Some(TaskStatus::Retrying),
            TaskEventKind::Requeued { .. } => Some(TaskStatus::Pending),
            TaskEventKind::Succeeded { .. } => Some(TaskStatus::Success),
            TaskEventKind::Failed { .. } => Some(TaskStatus::Failed),
            TaskEventKind::Cancelled => Some(TaskStatus::Cancelled),
        }
    }
}

pub type TaskEventSender = mpsc::UnboundedSender<TaskEvent>;
pub type TaskEventReceiver = mpsc::UnboundedReceiver<TaskEvent>;

/// Forwards progress from the executing unit of work to event subscribers.
///
/// Keeps the highest counters reported during the attempt so the final
/// task output can include them.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    events: Option<TaskEventSender>,
    latest: Arc<Mutex<ProgressUpdate>>,
}

impl ProgressReporter {
    pub fn new(task_id: Uuid, events: Option<TaskEventSender>) -> Self {
        Self {
            task_id,
            events,
            latest: Arc::new(Mutex::new(ProgressUpdate::default())),
        }
    }

    /// A reporter that only remembers the latest counters.
    pub fn detached() -> Self {
        Self::new(Uuid::nil(), None)
    }

    pub fn report(&self, update: ProgressUpdate) {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .absorb(&update);
        if let Some(tx) = &self.events {
            let _ = tx.send(TaskEvent::new(self.task_id, TaskEventKind::Progress(update)));
        }
    }

    pub fn latest(&self) -> ProgressUpdate {
        *self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-attempt context threaded into [`TaskWork::run`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub attempt: u32,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    pub fn new(
        task_id: Uuid,
        attempt: u32,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
            progress,
        }
    }

    /// Context with a fresh token and no progress subscriber.
    pub fn detached() -> Self {
        Self::new(
            Uuid::nil(),
            1,
            CancellationToken::new(),
            ProgressReporter::detached(),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: fails with [`AppError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn report_progress(&self, update: ProgressUpdate) {
        self.progress.report(update);
    }

    /// Highest counters reported so far in this attempt.
    pub fn progress(&self) -> ProgressUpdate {
        self.progress.latest()
    }
}

/// Point-in-time view of a task, as returned by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub label: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Number of executions started so far.
    pub attempt: u32,
    /// Retries allowed after the first execution.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<TaskOutput>,
    pub cancel_requested: bool,
}

impl Task {
    /// True while another execution is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.max_retries
    }
}

/// Request to register a new task.
#[derive(Clone)]
pub struct CreateTaskRequest {
    pub work: Arc<dyn TaskWork>,
    pub max_retries: u32,
    pub priority: TaskPriority,
}

impl fmt::Debug for CreateTaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateTaskRequest")
            .field("work", &self.work.label())
            .field("max_retries", &self.max_retries)
            .field("priority", &self.priority)
            .finish()
    }
}

impl CreateTaskRequest {
    pub fn new(work: Arc<dyn TaskWork>) -> Self {
        Self {
            work,
            max_retries: 0,
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Configuration for the scheduler loop and its worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    pub retry_delay: Duration,
    pub task_timeout: Duration,
    /// Upper bound applied to every task's `max_retries`.
    pub max_retry_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            tick_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(60),
            task_timeout: Duration::from_secs(1800),
            max_retry_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}
