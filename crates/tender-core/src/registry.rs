//! Scraper registry: a registration-time table from source name to
//! descriptor and extraction implementation, plus layered config resolution.
//!
//! Config layers, lowest precedence first:
//!
//! ```text
//! built-in defaults < descriptor tunables < environment < profile < caller
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::Scraper;

pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

const MAX_PAGES_LIMIT: i64 = 10_000;
const MAX_REQUEST_DELAY_MS: i64 = 60_000;
const MAX_TIMEOUT_SECS: i64 = 86_400;
const MAX_RETRY_ATTEMPTS: i64 = 20;

/// Whether a resolved implementation is the preferred one or a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapabilityLevel {
    Primary,
    Degraded,
}

impl CapabilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityLevel::Primary => "PRIMARY",
            CapabilityLevel::Degraded => "DEGRADED",
        }
    }
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One layer of per-field scraper overrides. Unset fields defer to lower layers.
///
/// Numeric fields are signed so that out-of-range input (e.g. a negative
/// page count) is rejected by validation instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub max_pages: Option<i64>,
    pub request_delay_ms: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub retry_attempts: Option<i64>,
    pub priority_keywords: Option<Vec<String>>,
    pub focus_regions: Option<Vec<String>>,
}

impl ConfigOverrides {
    pub fn with_max_pages(mut self, pages: i64) -> Self {
        self.max_pages = Some(pages);
        self
    }

    pub fn with_request_delay_ms(mut self, delay: i64) -> Self {
        self.request_delay_ms = Some(delay);
        self
    }

    pub fn with_timeout_secs(mut self, secs: i64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: i64) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_priority_keywords(mut self, keywords: Vec<String>) -> Self {
        self.priority_keywords = Some(keywords);
        self
    }

    pub fn with_focus_regions(mut self, regions: Vec<String>) -> Self {
        self.focus_regions = Some(regions);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Read the environment layer from the process environment.
    ///
    /// - `TENDER_SCRAPER_MAX_PAGES`
    /// - `TENDER_SCRAPER_REQUEST_DELAY_MS`
    /// - `TENDER_SCRAPER_TIMEOUT_SECS`
    /// - `TENDER_SCRAPER_RETRY_ATTEMPTS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let int = |key: &str| -> Result<Option<i64>, AppError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                    AppError::ConfigError(format!("Invalid {key} '{raw}': must be an integer"))
                }),
            }
        };

        Ok(Self {
            max_pages: int("TENDER_SCRAPER_MAX_PAGES")?,
            request_delay_ms: int("TENDER_SCRAPER_REQUEST_DELAY_MS")?,
            timeout_secs: int("TENDER_SCRAPER_TIMEOUT_SECS")?,
            retry_attempts: int("TENDER_SCRAPER_RETRY_ATTEMPTS")?,
            priority_keywords: None,
            focus_regions: None,
        })
    }

    fn apply_to(&self, draft: &mut Draft) {
        if let Some(v) = self.max_pages {
            draft.max_pages = v;
        }
        if let Some(v) = self.request_delay_ms {
            draft.request_delay_ms = v;
        }
        if let Some(v) = self.timeout_secs {
            draft.timeout_secs = v;
        }
        if let Some(v) = self.retry_attempts {
            draft.retry_attempts = v;
        }
        if let Some(v) = &self.priority_keywords {
            draft.priority_keywords = v.clone();
        }
        if let Some(v) = &self.focus_regions {
            draft.focus_regions = v.clone();
        }
    }
}

/// Registered metadata for one source. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperDescriptor {
    pub source: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority_keywords: Vec<String>,
    #[serde(default)]
    pub focus_regions: Vec<String>,
    #[serde(default)]
    pub tunables: ConfigOverrides,
    /// Source whose implementation runs when this one is unusable.
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ScraperDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            enabled: true,
            priority_keywords: Vec::new(),
            focus_regions: Vec::new(),
            tunables: ConfigOverrides::default(),
            fallback: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_priority_keywords(mut self, keywords: &[&str]) -> Self {
        self.priority_keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_focus_regions(mut self, regions: &[&str]) -> Self {
        self.focus_regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_tunables(mut self, tunables: ConfigOverrides) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_fallback(mut self, source: impl Into<String>) -> Self {
        self.fallback = Some(source.into());
        self
    }
}

/// Effective, validated configuration handed to an extraction implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub source: String,
    pub max_pages: u32,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub priority_keywords: Vec<String>,
    pub focus_regions: Vec<String>,
}

impl ScraperConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Unvalidated config while layers are being merged.
struct Draft {
    max_pages: i64,
    request_delay_ms: i64,
    timeout_secs: i64,
    retry_attempts: i64,
    priority_keywords: Vec<String>,
    focus_regions: Vec<String>,
}

impl Draft {
    fn defaults() -> Self {
        Self {
            max_pages: i64::from(DEFAULT_MAX_PAGES),
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS as i64,
            timeout_secs: DEFAULT_TIMEOUT_SECS as i64,
            retry_attempts: i64::from(DEFAULT_RETRY_ATTEMPTS),
            priority_keywords: Vec::new(),
            focus_regions: Vec::new(),
        }
    }

    fn validate(self, source: &str) -> Result<ScraperConfig, AppError> {
        check_range("max_pages", self.max_pages, 1, MAX_PAGES_LIMIT)?;
        check_range("request_delay_ms", self.request_delay_ms, 0, MAX_REQUEST_DELAY_MS)?;
        check_range("timeout_secs", self.timeout_secs, 1, MAX_TIMEOUT_SECS)?;
        check_range("retry_attempts", self.retry_attempts, 0, MAX_RETRY_ATTEMPTS)?;

        Ok(ScraperConfig {
            source: source.to_string(),
            max_pages: self.max_pages as u32,
            request_delay_ms: self.request_delay_ms as u64,
            timeout_secs: self.timeout_secs as u64,
            retry_attempts: self.retry_attempts as u32,
            priority_keywords: self.priority_keywords,
            focus_regions: self.focus_regions,
        })
    }
}

fn check_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), AppError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(AppError::ConfigError(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

/// Scraper descriptors, named profiles and the environment layer, as loaded
/// from a JSON catalog file.
///
/// ```json
/// {
///   "scrapers": [
///     {"source": "ted", "priority_keywords": ["IT"], "fallback": "ted_rss"},
///     {"source": "ted_rss", "tunables": {"max_pages": 3}}
///   ],
///   "profiles": {"nightly": {"max_pages": 200, "request_delay_ms": 2500}},
///   "environment": {"timeout_secs": 45}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperCatalog {
    pub scrapers: Vec<ScraperDescriptor>,
    pub profiles: HashMap<String, ConfigOverrides>,
    pub environment: ConfigOverrides,
}

impl ScraperCatalog {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid scraper catalog: {e}"))
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read scraper catalog {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }
}

/// Outcome of [`ScraperRegistry::resolve`].
#[derive(Clone)]
pub struct ResolvedScraper {
    /// Source that was requested.
    pub source: String,
    /// Source whose implementation will run.
    pub implementation: String,
    pub capability: CapabilityLevel,
    pub scraper: Arc<dyn Scraper>,
}

impl fmt::Debug for ResolvedScraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedScraper")
            .field("source", &self.source)
            .field("implementation", &self.implementation)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Read-only table of scraper capabilities. Build with [`ScraperRegistry::builder`].
pub struct ScraperRegistry {
    descriptors: HashMap<String, ScraperDescriptor>,
    implementations: HashMap<String, Arc<dyn Scraper>>,
    profiles: HashMap<String, ConfigOverrides>,
    environment: ConfigOverrides,
}

impl fmt::Debug for ScraperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut implemented: Vec<_> = self.implementations.keys().collect();
        implemented.sort();
        f.debug_struct("ScraperRegistry")
            .field("descriptors", &self.descriptors)
            .field("implemented", &implemented)
            .field("profiles", &self.profiles)
            .field("environment", &self.environment)
            .finish()
    }
}

impl ScraperRegistry {
    pub fn builder() -> ScraperRegistryBuilder {
        ScraperRegistryBuilder::default()
    }

    /// Names of enabled sources, sorted.
    pub fn list_available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .descriptors
            .values()
            .filter(|d| d.enabled)
            .map(|d| d.source.clone())
            .collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, source: &str) -> Option<&ScraperDescriptor> {
        self.descriptors.get(source)
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a source to its executable implementation.
    ///
    /// The primary implementation is used when the source is enabled and
    /// has one registered. Otherwise the descriptor's fallback (one hop) is
    /// used at [`CapabilityLevel::Degraded`].
    pub fn resolve(&self, source: &str) -> Result<ResolvedScraper, AppError> {
        let descriptor = self
            .descriptors
            .get(source)
            .ok_or_else(|| AppError::ScraperUnavailable(source.to_string()))?;

        if let Some(scraper) = self.usable(descriptor) {
            return Ok(ResolvedScraper {
                source: source.to_string(),
                implementation: source.to_string(),
                capability: CapabilityLevel::Primary,
                scraper,
            });
        }

        let fallback = descriptor
            .fallback
            .as_deref()
            .and_then(|name| self.descriptors.get(name))
            .and_then(|fb| self.usable(fb).map(|scraper| (fb, scraper)));

        match fallback {
            Some((fb, scraper)) => {
                tracing::warn!(
                    %source,
                    fallback = %fb.source,
                    enabled = descriptor.enabled,
                    "Primary scraper unusable, running fallback"
                );
                Ok(ResolvedScraper {
                    source: source.to_string(),
                    implementation: fb.source.clone(),
                    capability: CapabilityLevel::Degraded,
                    scraper,
                })
            }
            None => Err(AppError::ScraperUnavailable(source.to_string())),
        }
    }

    /// Merge every config layer for `source` and validate the result.
    ///
    /// Fails with `ConfigError` on an unknown profile or an out-of-range
    /// value. Nothing is stored; the registry stays unchanged either way.
    pub fn resolve_config(
        &self,
        source: &str,
        profile: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<ScraperConfig, AppError> {
        let descriptor = self
            .descriptors
            .get(source)
            .ok_or_else(|| AppError::ScraperUnavailable(source.to_string()))?;

        let profile = match profile {
            None => None,
            Some(name) => Some(self.profiles.get(name).ok_or_else(|| {
                AppError::ConfigError(format!("Unknown config profile '{name}'"))
            })?),
        };

        let mut draft = Draft::defaults();
        draft.priority_keywords = descriptor.priority_keywords.clone();
        draft.focus_regions = descriptor.focus_regions.clone();
        descriptor.tunables.apply_to(&mut draft);
        self.environment.apply_to(&mut draft);
        if let Some(profile) = profile {
            profile.apply_to(&mut draft);
        }
        overrides.apply_to(&mut draft);

        draft.validate(source)
    }

    fn usable(&self, descriptor: &ScraperDescriptor) -> Option<Arc<dyn Scraper>> {
        if !descriptor.enabled {
            return None;
        }
        self.implementations.get(&descriptor.source).cloned()
    }
}

/// Collects descriptors, implementations and config layers at startup.
#[derive(Default)]
pub struct ScraperRegistryBuilder {
    descriptors: Vec<ScraperDescriptor>,
    implementations: HashMap<String, Arc<dyn Scraper>>,
    profiles: HashMap<String, ConfigOverrides>,
    environment: ConfigOverrides,
}

impl ScraperRegistryBuilder {
    /// Register a descriptor together with its implementation.
    pub fn register(mut self, descriptor: ScraperDescriptor, scraper: Arc<dyn Scraper>) -> Self {
        self.implementations
            .insert(descriptor.source.clone(), scraper);
        self.descriptors.push(descriptor);
        self
    }

    /// Register a descriptor whose implementation is supplied separately (or not at all).
    pub fn describe(mut self, descriptor: ScraperDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn implement(mut self, source: impl Into<String>, scraper: Arc<dyn Scraper>) -> Self {
        self.implementations.insert(source.into(), scraper);
        self
    }

    pub fn profile(mut self, name: impl Into<String>, overrides: ConfigOverrides) -> Self {
        self.profiles.insert(name.into(), overrides);
        self
    }

    pub fn environment(mut self, overrides: ConfigOverrides) -> Self {
        self.environment = overrides;
        self
    }

    /// Add every descriptor and profile from a catalog; its environment
    /// layer replaces the current one when non-empty.
    pub fn catalog(mut self, catalog: ScraperCatalog) -> Self {
        self.descriptors.extend(catalog.scrapers);
        self.profiles.extend(catalog.profiles);
        if !catalog.environment.is_empty() {
            self.environment = catalog.environment;
        }
        self
    }

    /// Validate the table: unique sources, known fallbacks, no
    /// implementations without a descriptor, and tunables that resolve.
    pub fn build(self) -> Result<ScraperRegistry, AppError> {
        let mut descriptors = HashMap::with_capacity(self.descriptors.len());
        for descriptor in self.descriptors {
            if descriptor.source.trim().is_empty() {
                return Err(AppError::ConfigError(
                    "scraper source name must not be empty".into(),
                ));
            }
            let source = descriptor.source.clone();
            if descriptors.insert(source.clone(), descriptor).is_some() {
                return Err(AppError::ConfigError(format!(
                    "scraper '{source}' registered twice"
                )));
            }
        }

        for descriptor in descriptors.values() {
            if let Some(fallback) = &descriptor.fallback {
                if fallback == &descriptor.source {
                    return Err(AppError::ConfigError(format!(
                        "scraper '{fallback}' cannot fall back to itself"
                    )));
                }
                if !descriptors.contains_key(fallback) {
                    return Err(AppError::ConfigError(format!(
                        "scraper '{}' falls back to unknown source '{fallback}'",
                        descriptor.source
                    )));
                }
            }
        }

        if let Some(orphan) = self
            .implementations
            .keys()
            .find(|source| !descriptors.contains_key(*source))
        {
            return Err(AppError::ConfigError(format!(
                "implementation registered for unknown source '{orphan}'"
            )));
        }

        let registry = ScraperRegistry {
            descriptors,
            implementations: self.implementations,
            profiles: self.profiles,
            environment: self.environment,
        };

        for source in registry.descriptors.keys() {
            registry.resolve_config(source, None, &ConfigOverrides::default())?;
        }
        for name in registry.profiles.keys() {
            tracing::debug!(profile = %name, "Registered config profile");
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::models::ExtractedRecord;
    use crate::task::TaskContext;

    struct Noop;

    impl Scraper for Noop {
        fn run<'a>(
            &'a self,
            _config: &'a ScraperConfig,
            _ctx: &'a TaskContext,
        ) -> BoxFuture<'a, Result<Vec<ExtractedRecord>, AppError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn noop() -> Arc<dyn Scraper> {
        Arc::new(Noop)
    }

    fn registry() -> ScraperRegistry {
        ScraperRegistry::builder()
            .register(
                ScraperDescriptor::new("ted")
                    .with_priority_keywords(&["IT", "software"])
                    .with_tunables(ConfigOverrides::default().with_max_pages(50))
                    .with_fallback("ted_rss"),
                noop(),
            )
            .register(ScraperDescriptor::new("ted_rss"), noop())
            .register(
                ScraperDescriptor::new("anac").disabled().with_fallback("ted_rss"),
                noop(),
            )
            .describe(ScraperDescriptor::new("consip").with_fallback("ted_rss"))
            .describe(ScraperDescriptor::new("mepa"))
            .profile(
                "nightly",
                ConfigOverrides::default()
                    .with_max_pages(200)
                    .with_request_delay_ms(2500),
            )
            .environment(ConfigOverrides::default().with_timeout_secs(45))
            .build()
            .unwrap()
    }

    #[test]
    fn test_list_available_only_enabled() {
        assert_eq!(
            registry().list_available(),
            vec!["consip", "mepa", "ted", "ted_rss"]
        );
    }

    #[test]
    fn test_resolve_primary() {
        let resolved = registry().resolve("ted").unwrap();
        assert_eq!(resolved.capability, CapabilityLevel::Primary);
        assert_eq!(resolved.implementation, "ted");
    }

    #[test]
    fn test_disabled_primary_degrades_to_fallback() {
        let resolved = registry().resolve("anac").unwrap();
        assert_eq!(resolved.capability, CapabilityLevel::Degraded);
        assert_eq!(resolved.source, "anac");
        assert_eq!(resolved.implementation, "ted_rss");
    }

    #[test]
    fn test_missing_implementation_degrades_to_fallback() {
        let resolved = registry().resolve("consip").unwrap();
        assert_eq!(resolved.capability, CapabilityLevel::Degraded);
    }

    #[test]
    fn test_unresolvable_sources() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("mepa"),
            Err(AppError::ScraperUnavailable(s)) if s == "mepa"
        ));
        assert!(matches!(
            registry.resolve("nowhere"),
            Err(AppError::ScraperUnavailable(_))
        ));
    }

    #[test]
    fn test_config_layers_in_precedence_order() {
        let registry = registry();

        let base = registry
            .resolve_config("ted", None, &ConfigOverrides::default())
            .unwrap();
        assert_eq!(base.max_pages, 50);
        assert_eq!(base.timeout_secs, 45);
        assert_eq!(base.request_delay_ms, DEFAULT_REQUEST_DELAY_MS);
        assert_eq!(base.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(base.priority_keywords, vec!["IT", "software"]);

        let nightly = registry
            .resolve_config("ted", Some("nightly"), &ConfigOverrides::default())
            .unwrap();
        assert_eq!(nightly.max_pages, 200);
        assert_eq!(nightly.request_delay(), Duration::from_millis(2500));

        let caller = registry
            .resolve_config(
                "ted",
                Some("nightly"),
                &ConfigOverrides::default()
                    .with_max_pages(5)
                    .with_priority_keywords(vec!["bridges".into()]),
            )
            .unwrap();
        assert_eq!(caller.max_pages, 5);
        assert_eq!(caller.request_delay_ms, 2500);
        assert_eq!(caller.priority_keywords, vec!["bridges"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let registry = registry();
        for overrides in [
            ConfigOverrides::default().with_max_pages(0),
            ConfigOverrides::default().with_timeout_secs(0),
            ConfigOverrides::default().with_retry_attempts(-1),
            ConfigOverrides::default().with_request_delay_ms(-5),
        ] {
            assert!(matches!(
                registry.resolve_config("ted", None, &overrides),
                Err(AppError::ConfigError(_))
            ));
        }
        // Still resolves after the rejections.
        assert!(registry
            .resolve_config("ted", None, &ConfigOverrides::default())
            .is_ok());
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let result = registry().resolve_config("ted", Some("weekly"), &ConfigOverrides::default());
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_build_rejects_unknown_fallback() {
        let result = ScraperRegistry::builder()
            .describe(ScraperDescriptor::new("ted").with_fallback("missing"))
            .build();
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_build_rejects_invalid_tunables() {
        let result = ScraperRegistry::builder()
            .describe(
                ScraperDescriptor::new("ted")
                    .with_tunables(ConfigOverrides::default().with_max_pages(-3)),
            )
            .build();
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_build_rejects_duplicate_source() {
        let result = ScraperRegistry::builder()
            .describe(ScraperDescriptor::new("ted"))
            .describe(ScraperDescriptor::new("ted"))
            .build();
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_catalog_from_json() {
        let catalog = ScraperCatalog::from_json(
            r#"{
                "scrapers": [
                    {"source": "ted", "priority_keywords": ["IT"], "fallback": "ted_rss"},
                    {"source": "ted_rss", "enabled": false, "tunables": {"max_pages": 3}}
                ],
                "profiles": {"nightly": {"max_pages": 200}},
                "environment": {"timeout_secs": 45}
            }"#,
        )
        .unwrap();
        assert_eq!(catalog.scrapers.len(), 2);
        assert!(catalog.scrapers[0].enabled);
        assert!(!catalog.scrapers[1].enabled);

        let registry = ScraperRegistry::builder()
            .catalog(catalog)
            .implement("ted", noop())
            .build()
            .unwrap();
        assert_eq!(registry.list_available(), vec!["ted"]);
        assert_eq!(registry.profile_names(), vec!["nightly"]);
        let config = registry
            .resolve_config("ted_rss", None, &ConfigOverrides::default())
            .unwrap();
        assert_eq!(config.max_pages, 3);
        assert_eq!(config.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_catalog_rejects_unknown_tunable() {
        let result = ScraperCatalog::from_json(
            r#"{"scrapers": [{"source": "ted", "tunables": {"max_pagez": 3}}]}"#,
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_catalog_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrapers.json");
        std::fs::write(&path, r#"{"scrapers": [{"source": "ted"}]}"#).unwrap();
        assert_eq!(ScraperCatalog::from_path(&path).unwrap().scrapers.len(), 1);

        let missing = ScraperCatalog::from_path(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env = HashMap::from([
            ("TENDER_SCRAPER_MAX_PAGES", "25"),
            ("TENDER_SCRAPER_TIMEOUT_SECS", " 60 "),
        ]);
        let overrides =
            ConfigOverrides::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(overrides.max_pages, Some(25));
        assert_eq!(overrides.timeout_secs, Some(60));
        assert_eq!(overrides.retry_attempts, None);

        let bad = ConfigOverrides::from_lookup(|key| {
            (key == "TENDER_SCRAPER_RETRY_ATTEMPTS").then(|| "three".to_string())
        });
        assert!(matches!(bad, Err(AppError::ConfigError(_))));
    }
}
