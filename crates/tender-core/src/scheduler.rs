//! Task scheduler: a single owning loop plus a fixed pool of workers.
//!
//! ```text
//!  TaskScheduler (handle) --Command--> SchedulerLoop --WorkItem--> worker 0..N
//!                                          ^                          |
//!                                          +-------- Finished --------+
//! ```
//!
//! The loop is the only writer of task state. Workers execute task bodies
//! and report back; the periodic tick promotes tasks whose backoff elapsed
//! and evicts old terminal tasks. It never runs a task body itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::task::{
    CreateTaskRequest, ProgressReporter, SchedulerConfig, Task, TaskContext, TaskEvent,
    TaskEventKind, TaskEventSender, TaskOutput, TaskPriority, TaskStatus, TaskWork,
};

const COMMAND_BUFFER: usize = 1024;

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        workers: usize,
    },
    TaskCreated {
        task_id: Uuid,
        label: &'a str,
        priority: TaskPriority,
    },
    TaskDispatched {
        task_id: Uuid,
        label: &'a str,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: Uuid,
        attempt: u32,
    },
    TaskRetrying {
        task_id: Uuid,
        attempt: u32,
        error: &'a str,
        delay: Duration,
    },
    TaskFailed {
        task_id: Uuid,
        attempt: u32,
        error: &'a str,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    CleanedUp {
        evicted: usize,
    },
    Stopped,
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started { workers } => {
                tracing::info!(%workers, "Scheduler started");
            }
            SchedulerEvent::TaskCreated {
                task_id,
                label,
                priority,
            } => {
                tracing::debug!(%task_id, %label, %priority, "Task created");
            }
            SchedulerEvent::TaskDispatched {
                task_id,
                label,
                attempt,
            } => {
                tracing::info!(%task_id, %label, attempt, "Task dispatched");
            }
            SchedulerEvent::TaskSucceeded { task_id, attempt } => {
                tracing::info!(%task_id, attempt, "Task succeeded");
            }
            SchedulerEvent::TaskRetrying {
                task_id,
                attempt,
                error,
                delay,
            } => {
                tracing::warn!(
                    %task_id,
                    attempt,
                    %error,
                    delay_ms = delay.as_millis() as u64,
                    "Task attempt failed, will retry"
                );
            }
            SchedulerEvent::TaskFailed {
                task_id,
                attempt,
                error,
            } => {
                tracing::warn!(%task_id, attempt, %error, "Task failed");
            }
            SchedulerEvent::TaskCancelled { task_id } => {
                tracing::info!(%task_id, "Task cancelled");
            }
            SchedulerEvent::CleanedUp { evicted } => {
                if evicted > 0 {
                    tracing::info!(%evicted, "Evicted finished tasks");
                }
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler stopped");
            }
        }
    }
}

/// Task counts by status plus worker pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub max_workers: usize,
    pub idle_workers: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SchedulerStats {
    /// Tasks that still hold or wait for a worker slot.
    pub fn active(&self) -> usize {
        self.pending + self.running + self.retrying
    }
}

enum Command {
    Create {
        request: CreateTaskRequest,
        reply: oneshot::Sender<Result<Uuid, AppError>>,
    },
    Submit {
        task_id: Uuid,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Status {
        task_id: Uuid,
        reply: oneshot::Sender<Result<Task, AppError>>,
    },
    Cancel {
        task_id: Uuid,
        reply: oneshot::Sender<Result<TaskStatus, AppError>>,
    },
    Cleanup {
        older_than: Duration,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Finished {
        task_id: Uuid,
        attempt: u32,
        outcome: Result<TaskOutput, AppError>,
    },
}

/// Handle to the scheduler loop. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    commands: mpsc::Sender<Command>,
}

impl TaskScheduler {
    /// Spawn the scheduler loop and its workers onto `tracker`.
    ///
    /// Lifecycle and progress events are forwarded to `events` when given.
    /// Everything stops once `shutdown` is cancelled.
    pub fn spawn(
        config: SchedulerConfig,
        events: Option<TaskEventSender>,
        reporter: Arc<dyn SchedulerReporter>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Self, AppError> {
        if config.max_workers == 0 {
            return Err(AppError::ConfigError(
                "max_workers must be at least 1".into(),
            ));
        }
        if config.tick_interval.is_zero() {
            return Err(AppError::ConfigError(
                "scheduler interval must be greater than zero".into(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (work_tx, work_rx) = mpsc::channel(config.max_workers);
        let work_rx = Arc::new(Mutex::new(work_rx));

        for worker_id in 0..config.max_workers {
            tracker.spawn(worker_loop(
                worker_id,
                work_rx.clone(),
                command_tx.clone(),
                events.clone(),
            ));
        }

        reporter.report(SchedulerEvent::Started {
            workers: config.max_workers,
        });

        let scheduler_loop = SchedulerLoop {
            idle_workers: config.max_workers,
            config,
            tasks: HashMap::new(),
            ready: BinaryHeap::new(),
            next_seq: 0,
            work_tx,
            events,
            reporter,
            last_cleanup: Instant::now(),
        };
        tracker.spawn(scheduler_loop.run(command_rx, shutdown));

        Ok(Self {
            commands: command_tx,
        })
    }

    /// Register a task in PENDING. Fails with `ConfigError` on a malformed payload.
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Uuid, AppError> {
        self.request(|reply| Command::Create { request, reply })
            .await?
    }

    /// Enqueue a task for execution. No-op if already queued or running.
    pub async fn submit(&self, task_id: Uuid) -> Result<(), AppError> {
        self.request(|reply| Command::Submit { task_id, reply })
            .await?
    }

    pub async fn status(&self, task_id: Uuid) -> Result<Task, AppError> {
        self.request(|reply| Command::Status { task_id, reply })
            .await?
    }

    /// Request cancellation; returns the status right after the request.
    ///
    /// Pending and retrying tasks become CANCELLED immediately. A running
    /// task only has its token cancelled and stays RUNNING until its worker
    /// reports back.
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskStatus, AppError> {
        self.request(|reply| Command::Cancel { task_id, reply })
            .await?
    }

    /// Evict terminal tasks that finished more than `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, AppError> {
        self.request(|reply| Command::Cleanup { older_than, reply })
            .await
    }

    pub async fn stats(&self) -> Result<SchedulerStats, AppError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        rx.await.map_err(|_| AppError::ShuttingDown)
    }
}

struct WorkItem {
    task_id: Uuid,
    attempt: u32,
    work: Arc<dyn TaskWork>,
    cancel: CancellationToken,
    timeout: Duration,
    grace: Duration,
}

/// Ready-queue key: higher priority first, then lower submission sequence.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: TaskPriority,
    seq: Reverse<u64>,
    task_id: Uuid,
}

struct TaskEntry {
    task: Task,
    work: Arc<dyn TaskWork>,
    cancel: CancellationToken,
    /// Submission sequence, assigned once by `submit`.
    submit_seq: Option<u64>,
    queued: bool,
    retry_at: Option<Instant>,
    finished: Option<Instant>,
}

struct SchedulerLoop {
    config: SchedulerConfig,
    tasks: HashMap<Uuid, TaskEntry>,
    ready: BinaryHeap<ReadyKey>,
    next_seq: u64,
    idle_workers: usize,
    work_tx: mpsc::Sender<WorkItem>,
    events: Option<TaskEventSender>,
    reporter: Arc<dyn SchedulerReporter>,
    last_cleanup: Instant,
}

impl SchedulerLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
            }
            self.dispatch();
        }

        for entry in self.tasks.values() {
            if entry.task.status == TaskStatus::Running {
                entry.cancel.cancel();
            }
        }
        self.reporter.report(SchedulerEvent::Stopped);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Create { request, reply } => {
                let _ = reply.send(self.create(request));
            }
            Command::Submit { task_id, reply } => {
                let _ = reply.send(self.submit(task_id));
            }
            Command::Status { task_id, reply } => {
                let result = self
                    .tasks
                    .get(&task_id)
                    .map(|entry| entry.task.clone())
                    .ok_or_else(|| not_found(task_id));
                let _ = reply.send(result);
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id));
            }
            Command::Cleanup { older_than, reply } => {
                let _ = reply.send(self.cleanup(older_than));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Finished {
                task_id,
                attempt,
                outcome,
            } => self.on_finished(task_id, attempt, outcome),
        }
    }

    fn create(&mut self, request: CreateTaskRequest) -> Result<Uuid, AppError> {
        request.work.validate()?;
        if request.max_retries > self.config.max_retry_attempts {
            return Err(AppError::ConfigError(format!(
                "max_retries {} exceeds the configured limit of {}",
                request.max_retries, self.config.max_retry_attempts
            )));
        }

        let id = Uuid::new_v4();
        let task = Task {
            id,
            label: request.work.label().to_string(),
            status: TaskStatus::Pending,
            priority: request.priority,
            attempt: 0,
            max_retries: request.max_retries,
            created_at: Utc::now(),
            submitted_at: None,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            last_error: None,
            result: None,
            cancel_requested: false,
        };
        self.reporter.report(SchedulerEvent::TaskCreated {
            task_id: id,
            label: &task.label,
            priority: task.priority,
        });
        self.tasks.insert(
            id,
            TaskEntry {
                task,
                work: request.work,
                cancel: CancellationToken::new(),
                submit_seq: None,
                queued: false,
                retry_at: None,
                finished: None,
            },
        );
        Ok(id)
    }

    fn submit(&mut self, task_id: Uuid) -> Result<(), AppError> {
        let entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found(task_id))?;

        match entry.task.status {
            TaskStatus::Pending if !entry.queued && entry.submit_seq.is_none() => {
                let seq = self.next_seq;
                self.next_seq += 1;
                entry.submit_seq = Some(seq);
                entry.queued = true;
                entry.task.submitted_at = Some(Utc::now());
                self.ready.push(ReadyKey {
                    priority: entry.task.priority,
                    seq: Reverse(seq),
                    task_id,
                });
                Ok(())
            }
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retrying => Ok(()),
            status => Err(AppError::InvalidState(format!(
                "task {task_id} is {status} and cannot be submitted"
            ))),
        }
    }

    fn cancel(&mut self, task_id: Uuid) -> Result<TaskStatus, AppError> {
        let entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found(task_id))?;

        entry.task.cancel_requested = true;
        entry.cancel.cancel();

        match entry.task.status {
            TaskStatus::Pending | TaskStatus::Retrying => {
                transition(&mut entry.task, TaskStatus::Cancelled);
                entry.queued = false;
                entry.retry_at = None;
                entry.task.next_retry_at = None;
                mark_finished(entry);
                self.reporter
                    .report(SchedulerEvent::TaskCancelled { task_id });
                self.emit(task_id, TaskEventKind::Cancelled);
                Ok(TaskStatus::Cancelled)
            }
            status => Ok(status),
        }
    }

    fn cleanup(&mut self, older_than: Duration) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| match entry.finished {
            Some(finished) => {
                !(entry.task.status.is_terminal() && finished.elapsed() >= older_than)
            }
            None => true,
        });
        let evicted = before - self.tasks.len();
        self.reporter.report(SchedulerEvent::CleanedUp { evicted });
        evicted
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            max_workers: self.config.max_workers,
            idle_workers: self.idle_workers,
            ..Default::default()
        };
        for entry in self.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Success => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut promoted = Vec::new();
        for (task_id, entry) in self.tasks.iter_mut() {
            if entry.task.status != TaskStatus::Retrying {
                continue;
            }
            if entry.retry_at.is_some_and(|at| at <= now) {
                transition(&mut entry.task, TaskStatus::Pending);
                entry.retry_at = None;
                entry.task.next_retry_at = None;
                entry.queued = true;
                self.ready.push(ReadyKey {
                    priority: entry.task.priority,
                    seq: Reverse(entry.submit_seq.unwrap_or(0)),
                    task_id: *task_id,
                });
                promoted.push((*task_id, entry.task.attempt));
            }
        }
        for (task_id, attempt) in promoted {
            tracing::debug!(%task_id, attempt, "Backoff elapsed, task requeued");
            self.emit(task_id, TaskEventKind::Requeued { attempt });
        }

        if self.last_cleanup.elapsed() >= self.config.cleanup_interval {
            self.last_cleanup = now;
            self.cleanup(self.config.retention);
        }
    }

    /// Hand ready tasks to idle workers in priority order.
    fn dispatch(&mut self) {
        while self.idle_workers > 0 {
            let Some(key) = self.ready.pop() else {
                break;
            };
            let Some(entry) = self.tasks.get_mut(&key.task_id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Pending || !entry.queued {
                continue;
            }

            entry.queued = false;
            entry.task.attempt += 1;
            transition(&mut entry.task, TaskStatus::Running);
            entry.task.started_at.get_or_insert_with(Utc::now);

            let item = WorkItem {
                task_id: key.task_id,
                attempt: entry.task.attempt,
                work: entry.work.clone(),
                cancel: entry.cancel.child_token(),
                timeout: self.config.task_timeout,
                grace: self.config.tick_interval,
            };

            if let Err(e) = self.work_tx.try_send(item) {
                tracing::error!(
                    task_id = %key.task_id,
                    error = %e,
                    "Failed to hand task to a worker"
                );
                entry.task.attempt -= 1;
                entry.task.status = TaskStatus::Pending;
                entry.queued = true;
                self.ready.push(key);
                break;
            }

            self.idle_workers -= 1;
            let attempt = entry.task.attempt;
            self.reporter.report(SchedulerEvent::TaskDispatched {
                task_id: key.task_id,
                label: &entry.task.label,
                attempt,
            });
            self.emit(key.task_id, TaskEventKind::Started { attempt });
        }
    }

    fn on_finished(&mut self, task_id: Uuid, attempt: u32, outcome: Result<TaskOutput, AppError>) {
        self.idle_workers += 1;

        let Some(entry) = self.tasks.get_mut(&task_id) else {
            tracing::error!(%task_id, "Worker finished an unknown task");
            return;
        };
        if entry.task.status != TaskStatus::Running || entry.task.attempt != attempt {
            tracing::error!(
                %task_id,
                attempt,
                status = %entry.task.status,
                "Stale worker report ignored"
            );
            return;
        }

        let kind = match outcome {
            Ok(output) => {
                transition(&mut entry.task, TaskStatus::Success);
                entry.task.result = Some(output.clone());
                mark_finished(entry);
                self.reporter
                    .report(SchedulerEvent::TaskSucceeded { task_id, attempt });
                TaskEventKind::Succeeded { attempt, output }
            }
            Err(error) => {
                let message = error.to_string();
                entry.task.last_error = Some(message.clone());

                if matches!(error, AppError::Cancelled) || entry.task.cancel_requested {
                    transition(&mut entry.task, TaskStatus::Cancelled);
                    mark_finished(entry);
                    self.reporter
                        .report(SchedulerEvent::TaskCancelled { task_id });
                    TaskEventKind::Cancelled
                } else if error.is_retryable() && entry.task.can_retry() {
                    let delay = self.config.retry_delay;
                    let retry_at = Utc::now()
                        + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
                    transition(&mut entry.task, TaskStatus::Retrying);
                    entry.retry_at = Some(Instant::now() + delay);
                    entry.task.next_retry_at = Some(retry_at);
                    self.reporter.report(SchedulerEvent::TaskRetrying {
                        task_id,
                        attempt,
                        error: &message,
                        delay,
                    });
                    TaskEventKind::Retrying {
                        attempt,
                        error: message,
                        retry_at,
                    }
                } else {
                    transition(&mut entry.task, TaskStatus::Failed);
                    mark_finished(entry);
                    self.reporter.report(SchedulerEvent::TaskFailed {
                        task_id,
                        attempt,
                        error: &message,
                    });
                    TaskEventKind::Failed {
                        attempt,
                        error: message,
                    }
                }
            }
        };
        self.emit(task_id, kind);
    }

    fn emit(&self, task_id: Uuid, kind: TaskEventKind) {
        if let Some(tx) = &self.events {
            let _ = tx.send(TaskEvent::new(task_id, kind));
        }
    }
}

fn transition(task: &mut Task, next: TaskStatus) {
    debug_assert!(
        task.status.can_transition_to(next),
        "illegal task transition {} -> {}",
        task.status,
        next
    );
    task.status = next;
}

fn mark_finished(entry: &mut TaskEntry) {
    entry.task.finished_at = Some(Utc::now());
    entry.finished = Some(Instant::now());
}

fn not_found(task_id: Uuid) -> AppError {
    AppError::NotFound {
        kind: "task",
        id: task_id.to_string(),
    }
}

async fn worker_loop(
    worker_id: usize,
    work: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    commands: mpsc::Sender<Command>,
    events: Option<TaskEventSender>,
) {
    loop {
        let item = { work.lock().await.recv().await };
        let Some(item) = item else {
            break;
        };

        let outcome = execute(&item, events.clone()).await;
        let finished = Command::Finished {
            task_id: item.task_id,
            attempt: item.attempt,
            outcome,
        };
        if commands.send(finished).await.is_err() {
            break;
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Run one attempt under the task deadline.
///
/// Once the attempt's token is cancelled, the work gets one grace period to
/// observe it before the attempt is abandoned and reported as cancelled.
async fn execute(item: &WorkItem, events: Option<TaskEventSender>) -> Result<TaskOutput, AppError> {
    let ctx = TaskContext::new(
        item.task_id,
        item.attempt,
        item.cancel.clone(),
        ProgressReporter::new(item.task_id, events),
    );
    let run = tokio::time::timeout(item.timeout, item.work.run(ctx));
    tokio::pin!(run);

    let timed_out = |_| AppError::Timeout(item.timeout);

    tokio::select! {
        biased;
        result = &mut run => {
            let result = result.unwrap_or_else(|e| Err(timed_out(e)));
            if matches!(result, Err(AppError::Timeout(_))) {
                item.cancel.cancel();
            }
            return result;
        }
        () = item.cancel.cancelled() => {}
    }

    match tokio::time::timeout(item.grace, &mut run).await {
        Ok(result) => result.unwrap_or_else(|e| Err(timed_out(e))),
        Err(_) => {
            tracing::warn!(
                task_id = %item.task_id,
                "Work did not observe cancellation in time, abandoning attempt"
            );
            Err(AppError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ProgressUpdate, TaskEventReceiver};
    use crate::testutil::*;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_workers(2)
            .with_tick_interval(Duration::from_millis(10))
            .with_retry_delay(Duration::from_millis(40))
            .with_task_timeout(Duration::from_secs(5))
    }

    fn spawn(config: SchedulerConfig) -> (TaskScheduler, TaskEventReceiver, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let scheduler = TaskScheduler::spawn(
            config,
            Some(tx),
            Arc::new(TracingReporter),
            shutdown.clone(),
            &tracker,
        )
        .unwrap();
        (scheduler, rx, shutdown)
    }

    async fn run_to_end(scheduler: &TaskScheduler, work: ScriptedWork, max_retries: u32) -> Task {
        let request = CreateTaskRequest::new(Arc::new(work)).with_max_retries(max_retries);
        let id = scheduler.create(request).await.unwrap();
        scheduler.submit(id).await.unwrap();
        wait_for_task(scheduler, id, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let result = TaskScheduler::spawn(
            SchedulerConfig::default().with_max_workers(0),
            None,
            Arc::new(TracingReporter),
            CancellationToken::new(),
            &TaskTracker::new(),
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_successful_task_stores_result() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let output = TaskOutput {
            progress: ProgressUpdate::new(2, 7),
            records_handed_off: 7,
        };
        let work = ScriptedWork::new("ok", vec![Ok(output.clone())]);
        let task = run_to_end(&scheduler, work, 0).await;

        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.result, Some(output));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_with_fixed_backoff() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::new(
            "flaky",
            vec![
                Err(AppError::ExecutionError("boom".into())),
                Err(AppError::ExecutionError("boom".into())),
            ],
        );
        let attempts = work.attempts.clone();

        let task = run_to_end(&scheduler, work, 3).await;

        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.attempt, 3);
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::always_failing("broken", "still broken");
        let attempts = work.attempts.clone();

        let task = run_to_end(&scheduler, work, 2).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 3);
        assert_eq!(attempts.lock().unwrap().len(), 3);
        assert!(task.last_error.unwrap().contains("still broken"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::new(
            "bad",
            vec![Err(AppError::ConfigError("bad selector".into()))],
        );

        let task = run_to_end(&scheduler, work, 3).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let config = fast_config().with_task_timeout(Duration::from_millis(30));
        let (scheduler, _rx, _shutdown) = spawn(config);
        let work = ScriptedWork::new("slow", vec![]).with_delay(Duration::from_millis(500));

        let task = run_to_end(&scheduler, work, 1).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 2);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_payload() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::new("invalid", vec![]).invalid("missing config");

        let result = scheduler.create(CreateTaskRequest::new(Arc::new(work))).await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
        assert_eq!(scheduler.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_retries_above_limit() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let request = CreateTaskRequest::new(Arc::new(ScriptedWork::new("x", vec![])))
            .with_max_retries(50);
        assert!(matches!(
            scheduler.create(request).await,
            Err(AppError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_task_is_immediate() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let id = scheduler
            .create(CreateTaskRequest::new(Arc::new(ScriptedWork::new("idle", vec![]))))
            .await
            .unwrap();

        assert_eq!(scheduler.cancel(id).await.unwrap(), TaskStatus::Cancelled);
        let task = scheduler.status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.cancel_requested);
        assert!(matches!(
            scheduler.submit(id).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_task_frees_worker() {
        let config = fast_config().with_max_workers(1);
        let (scheduler, _rx, _shutdown) = spawn(config);

        let blocker = scheduler
            .create(CreateTaskRequest::new(Arc::new(BlockingWork::cooperative("blocker"))))
            .await
            .unwrap();
        scheduler.submit(blocker).await.unwrap();
        wait_for_status(&scheduler, blocker, TaskStatus::Running, Duration::from_secs(2)).await;

        assert_eq!(scheduler.cancel(blocker).await.unwrap(), TaskStatus::Running);
        let cancelled = wait_for_task(&scheduler, blocker, Duration::from_secs(2)).await;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let next = run_to_end(&scheduler, ScriptedWork::new("next", vec![]), 0).await;
        assert_eq!(next.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_uncooperative_work_abandoned_after_grace() {
        let config = fast_config().with_max_workers(1);
        let (scheduler, _rx, _shutdown) = spawn(config);

        let id = scheduler
            .create(CreateTaskRequest::new(Arc::new(BlockingWork::stubborn("stubborn"))))
            .await
            .unwrap();
        scheduler.submit(id).await.unwrap();
        wait_for_status(&scheduler, id, TaskStatus::Running, Duration::from_secs(2)).await;

        scheduler.cancel(id).await.unwrap();
        let task = wait_for_task(&scheduler, id, Duration::from_secs(1)).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(scheduler.stats().await.unwrap().idle_workers, 1);
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let config = fast_config().with_max_workers(1);
        let (scheduler, _rx, _shutdown) = spawn(config);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let blocker = scheduler
            .create(CreateTaskRequest::new(Arc::new(
                ScriptedWork::new("blocker", vec![]).with_delay(Duration::from_millis(100)),
            )))
            .await
            .unwrap();
        scheduler.submit(blocker).await.unwrap();
        wait_for_status(&scheduler, blocker, TaskStatus::Running, Duration::from_secs(2)).await;

        let mut ids = Vec::new();
        for (label, priority) in [
            ("low", TaskPriority::Low),
            ("normal-1", TaskPriority::Normal),
            ("high", TaskPriority::High),
            ("normal-2", TaskPriority::Normal),
        ] {
            let work = ScriptedWork::new(label, vec![]).with_order_log(order.clone());
            let id = scheduler
                .create(CreateTaskRequest::new(Arc::new(work)).with_priority(priority))
                .await
                .unwrap();
            scheduler.submit(id).await.unwrap();
            ids.push(id);
        }
        for id in ids {
            wait_for_task(&scheduler, id, Duration::from_secs(5)).await;
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["high", "normal-1", "normal-2", "low"]
        );
    }

    #[tokio::test]
    async fn test_running_never_exceeds_pool_size() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let gauge = ConcurrencyGauge::default();

        let mut ids = Vec::new();
        for i in 0..6 {
            let work = ScriptedWork::new(&format!("job-{i}"), vec![])
                .with_delay(Duration::from_millis(30))
                .with_gauge(gauge.clone());
            let id = scheduler
                .create(CreateTaskRequest::new(Arc::new(work)))
                .await
                .unwrap();
            scheduler.submit(id).await.unwrap();
            ids.push(id);
        }
        for id in ids {
            assert_eq!(
                wait_for_task(&scheduler, id, Duration::from_secs(5)).await.status,
                TaskStatus::Success
            );
        }
        let peak = gauge.peak();
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn test_submit_twice_is_noop() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::new("once", vec![]);
        let attempts = work.attempts.clone();
        let id = scheduler
            .create(CreateTaskRequest::new(Arc::new(work)))
            .await
            .unwrap();
        scheduler.submit(id).await.unwrap();
        scheduler.submit(id).await.unwrap();

        wait_for_task(&scheduler, id, Duration::from_secs(2)).await;
        assert_eq!(attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_only_old_terminal_tasks() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        let done = run_to_end(&scheduler, ScriptedWork::new("done", vec![]), 0).await;
        let idle = scheduler
            .create(CreateTaskRequest::new(Arc::new(ScriptedWork::new("idle", vec![]))))
            .await
            .unwrap();

        assert_eq!(scheduler.cleanup(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.cleanup(Duration::from_millis(10)).await.unwrap(), 1);

        assert!(matches!(
            scheduler.status(done.id).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(scheduler.status(idle).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_stream_follows_lifecycle_graph() {
        let (scheduler, mut rx, _shutdown) = spawn(fast_config());
        let work = ScriptedWork::new(
            "flaky",
            vec![Err(AppError::ExecutionError("once".into()))],
        )
        .with_progress(ProgressUpdate::new(1, 3));
        let task = run_to_end(&scheduler, work, 2).await;
        assert_eq!(task.status, TaskStatus::Success);

        let mut status = TaskStatus::Pending;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.task_id, task.id);
            if let Some(next) = event.kind.status() {
                assert!(status.can_transition_to(next), "{status} -> {next}");
                status = next;
                seen.push(next);
            }
        }
        assert_eq!(
            seen,
            vec![
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Success,
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (scheduler, _rx, _shutdown) = spawn(fast_config());
        assert!(matches!(
            scheduler.status(Uuid::new_v4()).await,
            Err(AppError::NotFound { kind: "task", .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_commands() {
        let (scheduler, _rx, shutdown) = spawn(fast_config());
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            scheduler.stats().await,
            Err(AppError::ShuttingDown)
        ));
    }
}
