//! Orchestrator facade: composes scheduler, registry, session manager and
//! health monitor, and owns their background tasks.
//!
//! This is the only type the API layer talks to. Every call returns
//! promptly; session execution happens on the scheduler's workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::health::{
    ActivityCounts, AlertLevel, HealthMonitor, HealthSnapshot, PerformanceReport, ResourceProbe,
};
use crate::registry::{ConfigOverrides, ScraperConfig, ScraperRegistry};
use crate::scheduler::{SchedulerReporter, SchedulerStats, TaskScheduler, TracingReporter};
use crate::session::{
    Session, SessionFilter, SessionManager, SessionRequest, SessionSettings, SessionStats,
    SessionStatus,
};
use crate::task::Task;
use crate::traits::RecordSink;

/// Everything `metrics()` exposes, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub collected_at: DateTime<Utc>,
    pub scheduler: SchedulerStats,
    pub sessions: SessionStats,
    pub health: Option<HealthSnapshot>,
    pub alert_level: AlertLevel,
}

pub struct Orchestrator<S: RecordSink> {
    config: OrchestratorConfig,
    scheduler: TaskScheduler,
    sessions: SessionManager<S>,
    health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<S: RecordSink> Orchestrator<S> {
    /// Start every component. Must be called from within a Tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        registry: ScraperRegistry,
        sink: S,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, AppError> {
        Self::start_with_reporter(config, registry, sink, probe, Arc::new(TracingReporter))
    }

    pub fn start_with_reporter(
        config: OrchestratorConfig,
        registry: ScraperRegistry,
        sink: S,
        probe: Arc<dyn ResourceProbe>,
        reporter: Arc<dyn SchedulerReporter>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let scheduler = TaskScheduler::spawn(
            config.scheduler_config(),
            Some(events_tx),
            reporter,
            shutdown.child_token(),
            &tracker,
        )?;
        let health = Arc::new(HealthMonitor::new(probe, config.health_config()));
        let sessions = SessionManager::spawn(
            SessionSettings {
                max_sessions_per_source: config.max_sessions_per_source,
                max_retry_attempts: config.max_retry_attempts,
            },
            Arc::new(registry),
            scheduler.clone(),
            health.clone(),
            sink,
            events_rx,
            shutdown.child_token(),
            &tracker,
        )?;

        tracker.spawn(maintenance_loop(
            scheduler.clone(),
            sessions.clone(),
            health.clone(),
            config.clone(),
            shutdown.child_token(),
        ));

        tracing::info!(
            workers = config.max_workers,
            per_source = config.max_sessions_per_source,
            sources = ?sessions.registry().list_available(),
            "Orchestrator started"
        );

        Ok(Self {
            config,
            scheduler,
            sessions,
            health,
            shutdown,
            tracker,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn start_session(&self, request: SessionRequest) -> Result<Uuid, AppError> {
        self.sessions.start_session(request).await
    }

    pub async fn session_status(&self, session_id: Uuid) -> Result<Session, AppError> {
        self.sessions.status(session_id).await
    }

    pub async fn cancel_session(&self, session_id: Uuid) -> Result<SessionStatus, AppError> {
        self.sessions.cancel(session_id).await
    }

    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, AppError> {
        self.sessions.list(filter).await
    }

    /// Snapshot of the task bound to a session.
    pub async fn task_status(&self, task_id: Uuid) -> Result<Task, AppError> {
        self.scheduler.status(task_id).await
    }

    pub fn list_sources(&self) -> Vec<String> {
        self.sessions.registry().list_available()
    }

    /// Effective config a session for `source` would run with.
    pub fn resolve_config(
        &self,
        source: &str,
        profile: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<ScraperConfig, AppError> {
        self.sessions
            .registry()
            .resolve_config(source, profile, overrides)
    }

    /// Alert level of the latest health sample.
    pub fn health_summary(&self) -> AlertLevel {
        self.health.summary()
    }

    /// Take a health sample now instead of waiting for the next tick.
    pub async fn sample_health(&self) -> Result<HealthSnapshot, AppError> {
        sample(&self.scheduler, &self.sessions, &self.health).await
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.health.performance_report()
    }

    pub async fn metrics(&self) -> Result<OrchestratorMetrics, AppError> {
        Ok(OrchestratorMetrics {
            collected_at: Utc::now(),
            scheduler: self.scheduler.stats().await?,
            sessions: self.sessions.stats().await?,
            health: self.health.latest(),
            alert_level: self.health.summary(),
        })
    }

    /// Start a session from `request` every `every`, beginning now.
    ///
    /// Refused or failed starts are logged and skipped; the next tick tries
    /// again. Cancel the returned token to stop the schedule.
    pub fn schedule_every(
        &self,
        request: SessionRequest,
        every: Duration,
    ) -> Result<CancellationToken, AppError> {
        if every.is_zero() {
            return Err(AppError::ConfigError(
                "schedule interval must be greater than zero".into(),
            ));
        }
        self.sessions.registry().resolve(&request.source)?;

        let stop = self.shutdown.child_token();
        let sessions = self.sessions.clone();
        let token = stop.clone();
        self.tracker.spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                source = %request.source,
                every_secs = every.as_secs_f64(),
                "Recurring schedule started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                match sessions.start_session(request.clone()).await {
                    Ok(session_id) => {
                        tracing::info!(
                            %session_id,
                            source = %request.source,
                            "Scheduled session started"
                        );
                    }
                    Err(AppError::ShuttingDown) => break,
                    Err(e) => {
                        tracing::warn!(
                            source = %request.source,
                            error = %e,
                            "Scheduled session skipped"
                        );
                    }
                }
            }
            tracing::info!(source = %request.source, "Recurring schedule stopped");
        });
        Ok(stop)
    }

    /// Stop every background task and wait for them to exit.
    pub async fn shutdown(self) {
        tracing::info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Orchestrator stopped");
    }
}

async fn sample<S: RecordSink>(
    scheduler: &TaskScheduler,
    sessions: &SessionManager<S>,
    health: &HealthMonitor,
) -> Result<HealthSnapshot, AppError> {
    let activity = ActivityCounts {
        active_tasks: scheduler.stats().await?.active(),
        active_sessions: sessions.stats().await?.active(),
    };
    Ok(health.sample(activity))
}

/// Periodic health sampling and session cleanup.
async fn maintenance_loop<S: RecordSink>(
    scheduler: TaskScheduler,
    sessions: SessionManager<S>,
    health: Arc<HealthMonitor>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
) {
    let mut health_tick = tokio::time::interval(config.health_check_interval);
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_tick = tokio::time::interval(config.cleanup_interval);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup_tick.reset();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = health_tick.tick() => {
                match sample(&scheduler, &sessions, &health).await {
                    Ok(snapshot) => tracing::debug!(
                        level = %snapshot.alert_level,
                        cpu = snapshot.cpu_percent,
                        memory = snapshot.memory_percent,
                        disk = snapshot.disk_percent,
                        "Health sampled"
                    ),
                    Err(AppError::ShuttingDown) => break,
                    Err(e) => tracing::error!(error = %e, "Health sample failed"),
                }
            }
            _ = cleanup_tick.tick() => {
                if let Err(AppError::ShuttingDown) = sessions.cleanup(config.task_retention).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("Maintenance loop stopped");
}
