pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod testutil;
pub mod traits;

pub use config::OrchestratorConfig;
pub use error::AppError;
pub use health::{AlertLevel, HealthMonitor, HealthSnapshot, ResourceProbe, SysinfoProbe};
pub use models::{ExtractedRecord, compute_hash};
pub use orchestrator::{Orchestrator, OrchestratorMetrics};
pub use registry::{
    CapabilityLevel, ConfigOverrides, ScraperCatalog, ScraperConfig, ScraperDescriptor,
    ScraperRegistry,
};
pub use scheduler::{SchedulerReporter, TaskScheduler, TracingReporter};
pub use session::{Session, SessionFilter, SessionRequest, SessionStatus};
pub use task::{ProgressUpdate, TaskContext, TaskPriority, TaskStatus};
pub use traits::{NullSink, RecordSink, Scraper};
