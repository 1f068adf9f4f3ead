//! Simulated extraction and a JSON-lines record sink, so the orchestrator
//! can be exercised end to end without a browser or a database.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use tender_core::{
    AppError, ExtractedRecord, ProgressUpdate, RecordSink, Scraper, ScraperConfig, TaskContext,
};

/// Catalog used when no `--catalog` file is given.
pub const DEMO_CATALOG: &str = r#"{
  "scrapers": [
    {
      "source": "ted",
      "priority_keywords": ["software", "cloud", "maintenance"],
      "focus_regions": ["IT", "FR", "DE"],
      "tunables": {"max_pages": 5, "request_delay_ms": 200},
      "fallback": "ted_rss"
    },
    {
      "source": "ted_rss",
      "priority_keywords": ["services"],
      "tunables": {"max_pages": 2, "request_delay_ms": 100}
    },
    {
      "source": "anac",
      "enabled": false,
      "priority_keywords": ["lavori", "forniture"],
      "focus_regions": ["Lombardia", "Lazio"],
      "tunables": {"request_delay_ms": 300},
      "fallback": "ted_rss"
    }
  ],
  "profiles": {
    "quick": {"max_pages": 1, "request_delay_ms": 50},
    "nightly": {"max_pages": 50, "request_delay_ms": 1000, "retry_attempts": 5}
  }
}"#;

/// Pretends to walk a paginated tender listing.
///
/// Each page waits the configured request delay and yields one notice per
/// keyword/region pair. The first `fail_first` calls fail.
pub struct SimulatedScraper {
    listing_pages: u32,
    fail_first: usize,
    calls: AtomicUsize,
}

impl SimulatedScraper {
    pub fn new(listing_pages: u32, fail_first: usize) -> Self {
        Self {
            listing_pages,
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Scraper for SimulatedScraper {
    fn run<'a>(
        &'a self,
        config: &'a ScraperConfig,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Vec<ExtractedRecord>, AppError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(AppError::ExecutionError(format!(
                    "listing for {} unreachable (simulated failure {call})",
                    config.source
                )));
            }

            let keywords = non_empty(&config.priority_keywords, "general");
            let regions = non_empty(&config.focus_regions, "EU");
            let pages = self.listing_pages.min(config.max_pages);
            let mut records = Vec::new();

            for page in 1..=pages {
                ctx.checkpoint()?;
                if page > 1 {
                    tokio::time::sleep(config.request_delay()).await;
                }
                for keyword in &keywords {
                    for region in &regions {
                        let url = format!(
                            "https://tenders.example/{}/notice/{page}-{keyword}-{region}",
                            config.source
                        );
                        records.push(ExtractedRecord::new(
                            &config.source,
                            url,
                            format!("{keyword} tender ({region})"),
                            serde_json::json!({
                                "page": page,
                                "keyword": keyword,
                                "region": region,
                            }),
                        ));
                    }
                }
                tracing::debug!(
                    source = %config.source,
                    page,
                    records = records.len(),
                    "Page scraped"
                );
                ctx.report_progress(ProgressUpdate::new(u64::from(page), records.len() as u64));
            }
            Ok(records)
        })
    }
}

fn non_empty(values: &[String], default: &str) -> Vec<String> {
    if values.is_empty() {
        vec![default.to_string()]
    } else {
        values.to_vec()
    }
}

/// Appends each new record as one JSON line. Keys already written by this
/// process are skipped, so retried hand-offs stay idempotent.
#[derive(Clone)]
pub struct JsonLinesSink {
    path: Option<PathBuf>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl JsonLinesSink {
    /// `None` keeps only the key set and writes nothing.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn written(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl RecordSink for JsonLinesSink {
    async fn upsert(&self, records: &[ExtractedRecord]) -> Result<usize, AppError> {
        let fresh: Vec<&ExtractedRecord> = {
            let seen = self
                .seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            records.iter().filter(|r| !seen.contains(&r.key)).collect()
        };

        if let Some(path) = &self.path {
            let mut buf = Vec::new();
            for record in &fresh {
                serde_json::to_writer(&mut buf, record)?;
                buf.push(b'\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| AppError::PersistenceError(format!("{}: {e}", path.display())))?;
            file.write_all(&buf)
                .await
                .map_err(|e| AppError::PersistenceError(format!("{}: {e}", path.display())))?;
        }

        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.extend(fresh.iter().map(|r| r.key.clone()));
        Ok(records.len())
    }
}
