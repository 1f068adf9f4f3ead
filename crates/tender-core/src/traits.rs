use std::future::Future;

use futures::future::BoxFuture;

use crate::error::AppError;
use crate::models::ExtractedRecord;
use crate::registry::ScraperConfig;
use crate::task::TaskContext;

/// An extraction implementation for one source.
///
/// Registered in the [`ScraperRegistry`](crate::registry::ScraperRegistry)
/// at startup. Implementations report progress through `ctx` and must call
/// [`TaskContext::checkpoint`] between logical units of work (pages).
pub trait Scraper: Send + Sync {
    fn run<'a>(
        &'a self,
        config: &'a ScraperConfig,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Vec<ExtractedRecord>, AppError>>;
}

/// Persistence layer for extracted records.
///
/// `upsert` must be idempotent on [`ExtractedRecord::key`]: a retried task
/// may hand off the same records more than once.
pub trait RecordSink: Send + Sync + Clone + 'static {
    /// Store the records. Returns the number of records accepted.
    fn upsert(
        &self,
        records: &[ExtractedRecord],
    ) -> impl Future<Output = Result<usize, AppError>> + Send;
}

/// A no-op RecordSink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    async fn upsert(&self, records: &[ExtractedRecord]) -> Result<usize, AppError> {
        Ok(records.len())
    }
}
