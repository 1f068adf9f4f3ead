//! Session manager: wraps scraping requests in trackable sessions.
//!
//! ```text
//!  SessionManager (handle) --SessionCommand--> SessionLoop <--TaskEvent-- TaskScheduler
//!                                                  |
//!                                                  +-- submit / cancel --> TaskScheduler
//! ```
//!
//! The loop owns every session. It admits a session's task to the scheduler
//! only once a per-source slot is free, and folds task lifecycle and progress
//! events into session state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::health::HealthMonitor;
use crate::registry::{CapabilityLevel, ConfigOverrides, ScraperConfig, ScraperRegistry};
use crate::scheduler::TaskScheduler;
use crate::task::{
    CreateTaskRequest, ProgressUpdate, TaskContext, TaskEvent, TaskEventKind, TaskEventReceiver,
    TaskFuture, TaskOutput, TaskPriority, TaskWork,
};
use crate::traits::{RecordSink, Scraper};

const COMMAND_BUFFER: usize = 256;

/// Status of a scraping session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// One execution of the session's task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetadata {
    pub requester: String,
    pub priority: TaskPriority,
    pub capability: CapabilityLevel,
    /// Source whose implementation actually runs (differs when DEGRADED).
    pub implementation: String,
    pub profile: Option<String>,
    pub config: ScraperConfig,
    pub attempts: Vec<AttemptRecord>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub source: String,
    pub status: SessionStatus,
    /// Bound once at creation, never reassigned.
    pub task_id: Uuid,
    pub progress: ProgressUpdate,
    pub records_handed_off: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: SessionMetadata,
}

/// Request to start a scraping session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub source: String,
    pub requester: String,
    pub overrides: ConfigOverrides,
    pub profile: Option<String>,
    pub priority: TaskPriority,
}

impl SessionRequest {
    pub fn new(source: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            requester: requester.into(),
            overrides: ConfigOverrides::default(),
            profile: None,
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Predicates for [`SessionManager::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub source: Option<String>,
    pub status: Option<SessionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.source.as_ref().is_none_or(|s| *s == session.source)
            && self.status.is_none_or(|s| s == session.status)
            && self.created_after.is_none_or(|t| session.created_at >= t)
            && self.created_before.is_none_or(|t| session.created_at < t)
    }
}

/// Session counts by status, plus per-source slot usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Pending sessions still waiting for a per-source slot.
    pub waiting: usize,
    /// Sessions holding a per-source slot. Includes admitted sessions that
    /// are still PENDING until their task reaches a worker.
    pub admitted_by_source: BTreeMap<String, usize>,
    pub limit_per_source: usize,
}

impl SessionStats {
    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

/// Unit of work bound to one session: run the resolved scraper with the
/// effective config, then hand the records to the sink.
pub struct ScrapeWork<S> {
    source: String,
    scraper: Arc<dyn Scraper>,
    config: ScraperConfig,
    sink: S,
}

impl<S: RecordSink> ScrapeWork<S> {
    pub fn new(
        source: impl Into<String>,
        scraper: Arc<dyn Scraper>,
        config: ScraperConfig,
        sink: S,
    ) -> Self {
        Self {
            source: source.into(),
            scraper,
            config,
            sink,
        }
    }
}

impl<S: RecordSink> TaskWork for ScrapeWork<S> {
    fn label(&self) -> &str {
        &self.source
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.config.max_pages == 0 {
            return Err(AppError::ConfigError("max_pages must be at least 1".into()));
        }
        if self.config.timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn run(&self, ctx: TaskContext) -> TaskFuture<'_> {
        Box::pin(async move {
            let records = self.scraper.run(&self.config, &ctx).await?;
            ctx.checkpoint()?;

            let handed_off = self.sink.upsert(&records).await?;
            let mut progress = ctx.progress();
            progress.items_found = progress.items_found.max(records.len() as u64);
            progress.items_processed = handed_off as u64;
            ctx.report_progress(progress);

            tracing::debug!(
                source = %self.source,
                task_id = %ctx.task_id,
                records = records.len(),
                handed_off,
                "Records handed off"
            );
            Ok(TaskOutput {
                progress,
                records_handed_off: handed_off,
            })
        })
    }
}

/// Limits applied by the session manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub max_sessions_per_source: usize,
    /// Global cap on retries, applied on top of each scraper's own setting.
    pub max_retry_attempts: u32,
}

enum SessionCommand {
    Open {
        session: Box<Session>,
        reply: oneshot::Sender<Uuid>,
    },
    Status {
        session_id: Uuid,
        reply: oneshot::Sender<Result<Session, AppError>>,
    },
    Cancel {
        session_id: Uuid,
        reply: oneshot::Sender<Result<SessionStatus, AppError>>,
    },
    List {
        filter: SessionFilter,
        reply: oneshot::Sender<Vec<Session>>,
    },
    Cleanup {
        older_than: Duration,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Handle to the session loop. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager<S: RecordSink> {
    commands: mpsc::Sender<SessionCommand>,
    registry: Arc<ScraperRegistry>,
    scheduler: TaskScheduler,
    health: Arc<HealthMonitor>,
    sink: S,
    settings: SessionSettings,
}

impl<S: RecordSink> SessionManager<S> {
    /// Spawn the session loop onto `tracker`. `events` must be the receiving
    /// end of the scheduler's event channel.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        settings: SessionSettings,
        registry: Arc<ScraperRegistry>,
        scheduler: TaskScheduler,
        health: Arc<HealthMonitor>,
        sink: S,
        events: TaskEventReceiver,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Self, AppError> {
        if settings.max_sessions_per_source == 0 {
            return Err(AppError::ConfigError(
                "max_sessions_per_source must be at least 1".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let session_loop = SessionLoop {
            sessions: HashMap::new(),
            by_task: HashMap::new(),
            slots: HashMap::new(),
            waiting: VecDeque::new(),
            limit: settings.max_sessions_per_source,
            scheduler: scheduler.clone(),
            health: health.clone(),
        };
        tracker.spawn(session_loop.run(rx, events, shutdown));

        Ok(Self {
            commands: tx,
            registry,
            scheduler,
            health,
            sink,
            settings,
        })
    }

    pub fn registry(&self) -> &ScraperRegistry {
        &self.registry
    }

    /// Start a session and return its id.
    ///
    /// Fails without creating a session or task when the health monitor
    /// refuses admission, the source cannot be resolved, or the effective
    /// config is invalid.
    pub async fn start_session(&self, request: SessionRequest) -> Result<Uuid, AppError> {
        if !self.health.admit_new_session() {
            let reasons = self.health.latest_reasons().join("; ");
            tracing::warn!(
                source = %request.source,
                %reasons,
                "Session refused, health is critical"
            );
            return Err(AppError::ResourceExhausted(reasons));
        }

        let resolved = self.registry.resolve(&request.source)?;
        let config = self.registry.resolve_config(
            &request.source,
            request.profile.as_deref(),
            &request.overrides,
        )?;

        let max_retries = config.retry_attempts.min(self.settings.max_retry_attempts);
        if max_retries < config.retry_attempts {
            tracing::debug!(
                source = %request.source,
                requested = config.retry_attempts,
                max_retries,
                "Retry attempts capped by orchestrator limit"
            );
        }

        let work = ScrapeWork::new(
            request.source.clone(),
            resolved.scraper.clone(),
            config.clone(),
            self.sink.clone(),
        );
        let task_id = self
            .scheduler
            .create(
                CreateTaskRequest::new(Arc::new(work))
                    .with_max_retries(max_retries)
                    .with_priority(request.priority),
            )
            .await?;

        let session = Session {
            id: Uuid::new_v4(),
            source: request.source,
            status: SessionStatus::Pending,
            task_id,
            progress: ProgressUpdate::default(),
            records_handed_off: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            metadata: SessionMetadata {
                requester: request.requester,
                priority: request.priority,
                capability: resolved.capability,
                implementation: resolved.implementation,
                profile: request.profile,
                config,
                attempts: Vec::new(),
            },
        };

        let opened = self
            .request(|reply| SessionCommand::Open {
                session: Box::new(session),
                reply,
            })
            .await;
        if opened.is_err() {
            let _ = self.scheduler.cancel(task_id).await;
        }
        opened
    }

    pub async fn status(&self, session_id: Uuid) -> Result<Session, AppError> {
        self.request(|reply| SessionCommand::Status { session_id, reply })
            .await?
    }

    /// Cancel the session and its task. Idempotent on terminal sessions:
    /// returns their current status unchanged.
    pub async fn cancel(&self, session_id: Uuid) -> Result<SessionStatus, AppError> {
        self.request(|reply| SessionCommand::Cancel { session_id, reply })
            .await?
    }

    /// Sessions matching `filter`, newest first.
    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, AppError> {
        self.request(|reply| SessionCommand::List { filter, reply })
            .await
    }

    /// Evict terminal sessions that ended more than `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, AppError> {
        self.request(|reply| SessionCommand::Cleanup { older_than, reply })
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats, AppError> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        rx.await.map_err(|_| AppError::ShuttingDown)
    }
}

struct SessionEntry {
    session: Session,
    /// Per-source slot, held from admission until the session is terminal.
    permit: Option<OwnedSemaphorePermit>,
}

enum Admission {
    Admitted,
    NoSlot,
    Dropped,
}

struct SessionLoop {
    sessions: HashMap<Uuid, SessionEntry>,
    by_task: HashMap<Uuid, Uuid>,
    slots: HashMap<String, Arc<Semaphore>>,
    /// Pending sessions not yet admitted, in arrival order.
    waiting: VecDeque<Uuid>,
    limit: usize,
    scheduler: TaskScheduler,
    health: Arc<HealthMonitor>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: TaskEventReceiver,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event).await,
            }
        }
        tracing::info!(sessions = self.sessions.len(), "Session manager stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open { session, reply } => {
                let id = self.open(*session).await;
                let _ = reply.send(id);
            }
            SessionCommand::Status { session_id, reply } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(|entry| entry.session.clone())
                    .ok_or_else(|| not_found(session_id));
                let _ = reply.send(result);
            }
            SessionCommand::Cancel { session_id, reply } => {
                let result = self.cancel(session_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::List { filter, reply } => {
                let _ = reply.send(self.list(&filter));
            }
            SessionCommand::Cleanup { older_than, reply } => {
                let _ = reply.send(self.cleanup(older_than));
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn open(&mut self, session: Session) -> Uuid {
        let id = session.id;
        let source = session.source.clone();
        tracing::info!(
            session_id = %id,
            task_id = %session.task_id,
            %source,
            capability = %session.metadata.capability,
            implementation = %session.metadata.implementation,
            requester = %session.metadata.requester,
            "Session created"
        );

        self.by_task.insert(session.task_id, id);
        self.sessions.insert(
            id,
            SessionEntry {
                session,
                permit: None,
            },
        );
        self.waiting.push_back(id);
        self.admit_waiting(&source).await;

        if self.waiting.contains(&id) {
            tracing::info!(
                session_id = %id,
                %source,
                limit = self.limit,
                "Session waiting for a free source slot"
            );
        }
        id
    }

    /// Admit waiting sessions of `source`, oldest first, while slots are free.
    async fn admit_waiting(&mut self, source: &str) {
        let mut i = 0;
        while i < self.waiting.len() {
            let session_id = self.waiting[i];
            let same_source = self
                .sessions
                .get(&session_id)
                .is_some_and(|entry| entry.session.source == source);
            if !same_source && self.sessions.contains_key(&session_id) {
                i += 1;
                continue;
            }
            match self.admit(session_id).await {
                Admission::Admitted | Admission::Dropped => {
                    self.waiting.remove(i);
                }
                Admission::NoSlot => break,
            }
        }
    }

    async fn admit(&mut self, session_id: Uuid) -> Admission {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return Admission::Dropped;
        };
        if entry.session.status != SessionStatus::Pending || entry.permit.is_some() {
            return Admission::Dropped;
        }

        let limit = self.limit;
        let slots = self
            .slots
            .entry(entry.session.source.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone();
        let Ok(permit) = slots.try_acquire_owned() else {
            return Admission::NoSlot;
        };
        entry.permit = Some(permit);
        let task_id = entry.session.task_id;

        match self.scheduler.submit(task_id).await {
            Ok(()) => {
                tracing::debug!(%session_id, %task_id, "Session admitted");
                Admission::Admitted
            }
            Err(e) => {
                tracing::error!(%session_id, %task_id, error = %e, "Failed to submit session task");
                self.finish(session_id, SessionStatus::Failed, Some(e.to_string()));
                Admission::Dropped
            }
        }
    }

    async fn cancel(&mut self, session_id: Uuid) -> Result<SessionStatus, AppError> {
        let entry = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| not_found(session_id))?;
        if entry.session.status.is_terminal() {
            return Ok(entry.session.status);
        }

        let task_id = entry.session.task_id;
        let source = entry.session.source.clone();
        match self.scheduler.cancel(task_id).await {
            Ok(_) | Err(AppError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        self.waiting.retain(|id| *id != session_id);
        self.finish(session_id, SessionStatus::Cancelled, None);
        self.admit_waiting(&source).await;
        Ok(SessionStatus::Cancelled)
    }

    async fn on_event(&mut self, event: TaskEvent) {
        let Some(&session_id) = self.by_task.get(&event.task_id) else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if entry.session.status.is_terminal() {
            return;
        }
        let session = &mut entry.session;

        match event.kind {
            TaskEventKind::Started { attempt } => {
                if session.status == SessionStatus::Pending {
                    session.status = SessionStatus::Running;
                    session.started_at = Some(event.at);
                    tracing::info!(%session_id, source = %session.source, "Session running");
                }
                session.metadata.attempts.push(AttemptRecord {
                    attempt,
                    started_at: event.at,
                    finished_at: None,
                    error: None,
                });
            }
            TaskEventKind::Progress(update) => {
                if session.status == SessionStatus::Running {
                    session.progress.absorb(&update);
                }
            }
            TaskEventKind::Retrying { attempt, error, .. } => {
                close_attempt(session, attempt, event.at, Some(error));
            }
            TaskEventKind::Requeued { attempt } => {
                tracing::debug!(%session_id, attempt, "Session task requeued");
            }
            TaskEventKind::Succeeded { attempt, output } => {
                close_attempt(session, attempt, event.at, None);
                session.progress.absorb(&output.progress);
                session.records_handed_off = output.records_handed_off;
                let source = session.source.clone();
                self.finish(session_id, SessionStatus::Completed, None);
                self.admit_waiting(&source).await;
            }
            TaskEventKind::Failed { attempt, error } => {
                close_attempt(session, attempt, event.at, Some(error.clone()));
                let source = session.source.clone();
                self.finish(session_id, SessionStatus::Failed, Some(error));
                self.admit_waiting(&source).await;
            }
            TaskEventKind::Cancelled => {
                let source = session.source.clone();
                self.finish(session_id, SessionStatus::Cancelled, None);
                self.admit_waiting(&source).await;
            }
        }
    }

    /// Move a session to a terminal status and release its source slot.
    fn finish(&mut self, session_id: Uuid, status: SessionStatus, error: Option<String>) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let session = &mut entry.session;
        session.status = status;
        session.ended_at = Some(Utc::now());
        if error.is_some() {
            session.error = error;
        }
        drop(entry.permit.take());

        match status {
            SessionStatus::Completed => {
                self.health.record_outcome(true);
                tracing::info!(
                    %session_id,
                    source = %session.source,
                    items_found = session.progress.items_found,
                    records = session.records_handed_off,
                    "Session completed"
                );
            }
            SessionStatus::Failed => {
                self.health.record_outcome(false);
                tracing::warn!(
                    %session_id,
                    source = %session.source,
                    error = session.error.as_deref().unwrap_or_default(),
                    "Session failed"
                );
            }
            _ => {
                tracing::info!(%session_id, source = %session.source, %status, "Session ended");
            }
        }
    }

    fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|entry| filter.matches(&entry.session))
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        sessions
    }

    fn cleanup(&mut self, older_than: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let before = self.sessions.len();
        let by_task = &mut self.by_task;
        self.sessions.retain(|_, entry| {
            let expired = entry.session.status.is_terminal()
                && entry.session.ended_at.is_some_and(|ended| ended <= cutoff);
            if expired {
                by_task.remove(&entry.session.task_id);
            }
            !expired
        });
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            tracing::info!(%evicted, "Evicted finished sessions");
        }
        evicted
    }

    fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            total: self.sessions.len(),
            waiting: self.waiting.len(),
            limit_per_source: self.limit,
            ..Default::default()
        };
        for entry in self.sessions.values() {
            match entry.session.status {
                SessionStatus::Pending => stats.pending += 1,
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Cancelled => stats.cancelled += 1,
            }
            if entry.permit.is_some() {
                *stats
                    .admitted_by_source
                    .entry(entry.session.source.clone())
                    .or_default() += 1;
            }
        }
        stats
    }
}

fn close_attempt(session: &mut Session, attempt: u32, at: DateTime<Utc>, error: Option<String>) {
    if let Some(record) = session
        .metadata
        .attempts
        .iter_mut()
        .rev()
        .find(|r| r.attempt == attempt)
    {
        record.finished_at = Some(at);
        record.error = error;
    }
}

fn not_found(session_id: Uuid) -> AppError {
    AppError::NotFound {
        kind: "session",
        id: session_id.to_string(),
    }
}
