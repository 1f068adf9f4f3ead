use std::time::Duration;

use crate::error::AppError;
use crate::health::HealthConfig;
use crate::task::SchedulerConfig;

/// Process-wide orchestration settings. Read-only after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub scheduler_interval: Duration,
    pub cleanup_interval: Duration,
    /// Terminal tasks and sessions older than this are evicted.
    pub task_retention: Duration,
    /// Upper bound on per-task retries, whatever the scraper config asks for.
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub task_timeout: Duration,
    pub max_sessions_per_source: usize,
    /// Percent thresholds (0-100).
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    /// Failure ratio (0-1) above which the monitor goes CRITICAL.
    pub failure_alert_threshold: f64,
    pub health_check_interval: Duration,
    /// Relative margin below a threshold that already counts as WARN.
    pub warn_margin: f64,
    pub failure_window: Duration,
    pub min_outcomes_for_failure_rate: usize,
    /// Number of health snapshots kept for reporting.
    pub health_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            scheduler_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(300),
            task_retention: Duration::from_secs(3600),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(60),
            task_timeout: Duration::from_secs(1800),
            max_sessions_per_source: 2,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            failure_alert_threshold: 0.5,
            health_check_interval: Duration::from_secs(30),
            warn_margin: 0.1,
            failure_window: Duration::from_secs(600),
            min_outcomes_for_failure_rate: 5,
            health_history: 120,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from environment variables, falling back to defaults.
    ///
    /// - `TENDER_MAX_WORKERS`
    /// - `TENDER_SCHEDULER_INTERVAL_MS`
    /// - `TENDER_CLEANUP_INTERVAL_SECS`
    /// - `TENDER_TASK_RETENTION_SECS`
    /// - `TENDER_MAX_RETRY_ATTEMPTS`
    /// - `TENDER_RETRY_DELAY_SECS`
    /// - `TENDER_TASK_TIMEOUT_SECS`
    /// - `TENDER_MAX_SESSIONS_PER_SOURCE`
    /// - `TENDER_CPU_THRESHOLD`, `TENDER_MEMORY_THRESHOLD`, `TENDER_DISK_THRESHOLD`
    /// - `TENDER_FAILURE_ALERT_THRESHOLD`
    /// - `TENDER_HEALTH_CHECK_INTERVAL_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        let env = EnvReader { lookup: &lookup };

        let config = Self {
            max_workers: env.parse("TENDER_MAX_WORKERS", defaults.max_workers)?,
            scheduler_interval: env.millis(
                "TENDER_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval,
            )?,
            cleanup_interval: env.secs("TENDER_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            task_retention: env.secs("TENDER_TASK_RETENTION_SECS", defaults.task_retention)?,
            max_retry_attempts: env.parse(
                "TENDER_MAX_RETRY_ATTEMPTS",
                defaults.max_retry_attempts,
            )?,
            retry_delay: env.secs("TENDER_RETRY_DELAY_SECS", defaults.retry_delay)?,
            task_timeout: env.secs("TENDER_TASK_TIMEOUT_SECS", defaults.task_timeout)?,
            max_sessions_per_source: env.parse(
                "TENDER_MAX_SESSIONS_PER_SOURCE",
                defaults.max_sessions_per_source,
            )?,
            cpu_threshold: env.parse("TENDER_CPU_THRESHOLD", defaults.cpu_threshold)?,
            memory_threshold: env.parse("TENDER_MEMORY_THRESHOLD", defaults.memory_threshold)?,
            disk_threshold: env.parse("TENDER_DISK_THRESHOLD", defaults.disk_threshold)?,
            failure_alert_threshold: env.parse(
                "TENDER_FAILURE_ALERT_THRESHOLD",
                defaults.failure_alert_threshold,
            )?,
            health_check_interval: env.secs(
                "TENDER_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("max_workers", self.max_workers),
            ("max_sessions_per_source", self.max_sessions_per_source),
            ("health_history", self.health_history),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::ConfigError(format!("{name} must be at least 1")));
            }
        }

        let intervals = [
            ("scheduler_interval", self.scheduler_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("task_timeout", self.task_timeout),
            ("health_check_interval", self.health_check_interval),
            ("failure_window", self.failure_window),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(AppError::ConfigError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        for (name, value) in [
            ("cpu_threshold", self.cpu_threshold),
            ("memory_threshold", self.memory_threshold),
            ("disk_threshold", self.disk_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(AppError::ConfigError(format!(
                    "{name} must be a percentage in (0, 100], got {value}"
                )));
            }
        }
        if !(self.failure_alert_threshold > 0.0 && self.failure_alert_threshold <= 1.0) {
            return Err(AppError::ConfigError(format!(
                "failure_alert_threshold must be a ratio in (0, 1], got {}",
                self.failure_alert_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.warn_margin) {
            return Err(AppError::ConfigError(format!(
                "warn_margin must be in [0, 1), got {}",
                self.warn_margin
            )));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            tick_interval: self.scheduler_interval,
            cleanup_interval: self.cleanup_interval,
            retention: self.task_retention,
            retry_delay: self.retry_delay,
            task_timeout: self.task_timeout,
            max_retry_attempts: self.max_retry_attempts,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            cpu_threshold: self.cpu_threshold,
            memory_threshold: self.memory_threshold,
            disk_threshold: self.disk_threshold,
            failure_alert_threshold: self.failure_alert_threshold,
            warn_margin: self.warn_margin,
            failure_window: self.failure_window,
            min_outcomes: self.min_outcomes_for_failure_rate,
            history: self.health_history,
        }
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {key} '{raw}'"))
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
