use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// A tender opportunity extracted by a scraper, ready for hand-off to storage.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExtractedRecord {
    /// Stable upsert key: SHA-256 of the record's source URL.
    pub key: String,
    /// Scraper source that produced the record.
    pub source: String,
    pub url: String,
    pub title: String,
    /// Source-specific fields (buyer, deadline, value, ...).
    pub data: serde_json::Value,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractedRecord {
    pub fn new(
        source: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let url = url.into();
        Self {
            key: compute_hash(&url),
            source: source.into(),
            url,
            title: title.into(),
            data,
            extracted_at: Utc::now(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
