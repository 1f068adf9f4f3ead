//! Health monitor: resource sampling, rolling failure rate and admission gating.
//!
//! Each sample evaluates every metric against its threshold:
//!
//! ```text
//! value > threshold                      -> CRITICAL
//! value >= threshold * (1 - warn_margin) -> WARN
//! otherwise                              -> OK
//! ```
//!
//! The snapshot level is the worst of the metric levels. The failure rate
//! only takes part once enough session outcomes fall inside the window.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::time::Instant;

/// Minimum snapshots before a pattern counts as sustained.
const MIN_SUSTAINED_SAMPLES: usize = 3;

/// Point-in-time resource utilization, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceUsage {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }
}

/// Source of resource utilization samples.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Probe backed by `sysinfo`. Disk usage is that of the fullest mounted disk.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let (cpu_percent, memory_percent) = {
            let mut system = self
                .system
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            system.refresh_cpu_all();
            system.refresh_memory();
            let total = system.total_memory();
            let memory = if total > 0 {
                system.used_memory() as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (f64::from(system.global_cpu_usage()), memory)
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let used = disk.total_space().saturating_sub(disk.available_space());
                used as f64 / disk.total_space() as f64 * 100.0
            })
            .fold(0.0, f64::max);

        ResourceUsage::new(cpu_percent, memory_percent, disk_percent)
    }
}

/// Overall health level. Ordered from best to worst.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    #[default]
    Ok,
    Warn,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Ok => "OK",
            AlertLevel::Warn => "WARN",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    pub failure_alert_threshold: f64,
    pub warn_margin: f64,
    pub failure_window: Duration,
    pub min_outcomes: usize,
    pub history: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            failure_alert_threshold: 0.5,
            warn_margin: 0.1,
            failure_window: Duration::from_secs(600),
            min_outcomes: 5,
            history: 120,
        }
    }
}

impl HealthConfig {
    fn level(&self, value: f64, threshold: f64) -> AlertLevel {
        if value > threshold {
            AlertLevel::Critical
        } else if value >= threshold * (1.0 - self.warn_margin) {
            AlertLevel::Warn
        } else {
            AlertLevel::Ok
        }
    }
}

/// Work in flight when a sample is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    pub active_tasks: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_tasks: usize,
    pub active_sessions: usize,
    /// Failure ratio over the window, `None` below the minimum sample size.
    pub failure_rate: Option<f64>,
    pub outcomes_in_window: usize,
    pub alert_level: AlertLevel,
    /// Human-readable reasons for a non-OK level.
    pub reasons: Vec<String>,
}

/// Counts of snapshots per alert level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub ok: usize,
    pub warn: usize,
    pub critical: usize,
}

/// Advisory summary of the retained health history. Has no side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub samples: usize,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub avg_disk_percent: f64,
    pub peak_disk_percent: f64,
    pub avg_failure_rate: Option<f64>,
    pub levels: LevelCounts,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<HealthSnapshot>,
    outcomes: VecDeque<(Instant, bool)>,
}

/// Samples resources, tracks session outcomes and gates admission.
///
/// Shared between the session manager (outcomes, admission) and the
/// orchestrator's sampler tick. State sits behind a short-lived mutex; no
/// lock is held across an await.
pub struct HealthMonitor {
    probe: Arc<dyn ResourceProbe>,
    config: HealthConfig,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>, config: HealthConfig) -> Self {
        Self {
            probe,
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Take a sample and record it in the history.
    pub fn sample(&self, activity: ActivityCounts) -> HealthSnapshot {
        let usage = self.probe.sample();
        let mut state = self.lock_state();

        let cutoff = Instant::now().checked_sub(self.config.failure_window);
        if let Some(cutoff) = cutoff {
            while state.outcomes.front().is_some_and(|(at, _)| *at < cutoff) {
                state.outcomes.pop_front();
            }
        }
        let outcomes_in_window = state.outcomes.len();
        let failure_rate = self.failure_rate_of(&state.outcomes);

        let (alert_level, reasons) = self.evaluate(&usage, failure_rate);
        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            disk_percent: usage.disk_percent,
            active_tasks: activity.active_tasks,
            active_sessions: activity.active_sessions,
            failure_rate,
            outcomes_in_window,
            alert_level,
            reasons,
        };

        let previous = state.history.back().map(|s| s.alert_level);
        if previous != Some(alert_level) {
            match alert_level {
                AlertLevel::Ok => tracing::info!(level = %alert_level, "Health level changed"),
                AlertLevel::Warn | AlertLevel::Critical => tracing::warn!(
                    level = %alert_level,
                    reasons = ?snapshot.reasons,
                    "Health level changed"
                ),
            }
        }

        state.history.push_back(snapshot.clone());
        while state.history.len() > self.config.history {
            state.history.pop_front();
        }
        snapshot
    }

    /// Record a session outcome for the rolling failure rate.
    pub fn record_outcome(&self, success: bool) {
        self.lock_state()
            .outcomes
            .push_back((Instant::now(), success));
    }

    /// Alert level of the latest snapshot, `Ok` before the first sample.
    pub fn summary(&self) -> AlertLevel {
        self.lock_state()
            .history
            .back()
            .map(|s| s.alert_level)
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.lock_state().history.back().cloned()
    }

    pub fn history(&self) -> Vec<HealthSnapshot> {
        self.lock_state().history.iter().cloned().collect()
    }

    /// False while the latest snapshot is CRITICAL.
    pub fn admit_new_session(&self) -> bool {
        self.summary() != AlertLevel::Critical
    }

    /// Reasons recorded on the latest snapshot.
    pub fn latest_reasons(&self) -> Vec<String> {
        self.lock_state()
            .history
            .back()
            .map(|s| s.reasons.clone())
            .unwrap_or_default()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let history = self.history();
        let samples = history.len();

        let mut levels = LevelCounts::default();
        for snapshot in &history {
            match snapshot.alert_level {
                AlertLevel::Ok => levels.ok += 1,
                AlertLevel::Warn => levels.warn += 1,
                AlertLevel::Critical => levels.critical += 1,
            }
        }

        let rates: Vec<f64> = history.iter().filter_map(|s| s.failure_rate).collect();
        let avg_failure_rate = (!rates.is_empty()).then(|| mean(&rates));

        let cpu: Vec<f64> = history.iter().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = history.iter().map(|s| s.memory_percent).collect();
        let disk: Vec<f64> = history.iter().map(|s| s.disk_percent).collect();

        PerformanceReport {
            generated_at: Utc::now(),
            samples,
            window_start: history.first().map(|s| s.timestamp),
            window_end: history.last().map(|s| s.timestamp),
            avg_cpu_percent: mean(&cpu),
            peak_cpu_percent: peak(&cpu),
            avg_memory_percent: mean(&memory),
            peak_memory_percent: peak(&memory),
            avg_disk_percent: mean(&disk),
            peak_disk_percent: peak(&disk),
            avg_failure_rate,
            levels,
            recommendations: self.recommendations(&history, &levels),
        }
    }

    fn recommendations(&self, history: &[HealthSnapshot], levels: &LevelCounts) -> Vec<String> {
        if history.is_empty() {
            return vec!["No health samples collected yet".to_string()];
        }

        let config = &self.config;
        let pressured =
            |value: f64, threshold: f64| config.level(value, threshold) != AlertLevel::Ok;
        let sustained = |count: usize| {
            history.len() >= MIN_SUSTAINED_SAMPLES && count * 2 >= history.len()
        };

        let mut out = Vec::new();
        let cpu = history
            .iter()
            .filter(|s| pressured(s.cpu_percent, config.cpu_threshold))
            .count();
        if sustained(cpu) {
            out.push(
                "Sustained CPU pressure: reduce the concurrent scraper limit or the worker pool size"
                    .to_string(),
            );
        }
        let memory = history
            .iter()
            .filter(|s| pressured(s.memory_percent, config.memory_threshold))
            .count();
        if sustained(memory) {
            out.push(
                "Sustained memory pressure: lower max_pages for large sources or reduce concurrent sessions"
                    .to_string(),
            );
        }
        let disk = history
            .iter()
            .filter(|s| pressured(s.disk_percent, config.disk_threshold))
            .count();
        if sustained(disk) {
            out.push(
                "Disk usage near capacity: shorten task retention or free space on the data volume"
                    .to_string(),
            );
        }
        let failing = history
            .iter()
            .filter(|s| {
                s.failure_rate
                    .is_some_and(|rate| pressured(rate, config.failure_alert_threshold))
            })
            .count();
        if sustained(failing) {
            out.push(
                "High failure rate: review failing scrapers and consider a longer retry delay"
                    .to_string(),
            );
        }

        if out.is_empty() {
            if levels.warn + levels.critical > 0 {
                out.push("Resource pressure was transient; no action needed".to_string());
            } else {
                out.push("All metrics within limits; no action needed".to_string());
            }
        }
        out
    }

    fn evaluate(
        &self,
        usage: &ResourceUsage,
        failure_rate: Option<f64>,
    ) -> (AlertLevel, Vec<String>) {
        let config = &self.config;
        let mut metrics = vec![
            ("cpu", usage.cpu_percent, config.cpu_threshold),
            ("memory", usage.memory_percent, config.memory_threshold),
            ("disk", usage.disk_percent, config.disk_threshold),
        ];
        if let Some(rate) = failure_rate {
            metrics.push(("failure rate", rate * 100.0, config.failure_alert_threshold * 100.0));
        }

        let mut level = AlertLevel::Ok;
        let mut reasons = Vec::new();
        for (name, value, threshold) in metrics {
            match config.level(value, threshold) {
                AlertLevel::Critical => {
                    reasons.push(format!("{name} at {value:.1}% exceeds {threshold:.1}%"));
                    level = AlertLevel::Critical;
                }
                AlertLevel::Warn => {
                    reasons.push(format!("{name} at {value:.1}% is close to {threshold:.1}%"));
                    level = level.max(AlertLevel::Warn);
                }
                AlertLevel::Ok => {}
            }
        }
        (level, reasons)
    }

    fn failure_rate_of(&self, outcomes: &VecDeque<(Instant, bool)>) -> Option<f64> {
        if outcomes.is_empty() || outcomes.len() < self.config.min_outcomes {
            return None;
        }
        let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
        Some(failures as f64 / outcomes.len() as f64)
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned health monitor mutex");
            poisoned.into_inner()
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn peak(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}
