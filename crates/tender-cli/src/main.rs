mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tender_core::{
    AppError, ConfigOverrides, NullSink, Orchestrator, OrchestratorConfig, RecordSink,
    ScraperCatalog, ScraperRegistry, SessionRequest, SessionStatus, SysinfoProbe,
    TaskPriority,
};

use crate::demo::{DEMO_CATALOG, JsonLinesSink, SimulatedScraper};

#[derive(Parser)]
#[command(name = "tender", about = "Tender scraping orchestrator")]
struct Cli {
    /// Scraper catalog (JSON). Defaults to the built-in demo catalog.
    #[arg(long, global = true, env = "TENDER_CATALOG")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog sources and how each one resolves
    Sources,

    /// Print the effective config a session would run with
    Config {
        /// Source name from the catalog
        source: String,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Sample system resources and print the health report
    Health {
        /// Number of samples to take
        #[arg(short = 'n', long, default_value = "3")]
        samples: u32,

        /// Pause between samples in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Run one scraping session with the simulated extractor
    Run {
        /// Source name from the catalog
        source: String,

        /// Who requested the session
        #[arg(long, default_value = "cli")]
        requester: String,

        /// Dispatch priority (low, normal, high)
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Pages the simulated listing has
        #[arg(long, default_value = "5")]
        listing_pages: u32,

        /// Make the first N extraction attempts fail
        #[arg(long, default_value = "0")]
        fail_first: usize,

        /// Append extracted records to this JSON-lines file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct OverrideArgs {
    /// Named config profile from the catalog
    #[arg(long)]
    profile: Option<String>,

    /// Override max pages
    #[arg(long)]
    max_pages: Option<i64>,

    /// Override delay between requests in milliseconds
    #[arg(long)]
    request_delay_ms: Option<i64>,

    /// Override per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<i64>,

    /// Override retry attempts
    #[arg(long)]
    retry_attempts: Option<i64>,
}

impl OverrideArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_pages: self.max_pages,
            request_delay_ms: self.request_delay_ms,
            timeout_secs: self.timeout_secs,
            retry_attempts: self.retry_attempts,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tender=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sources => cmd_sources(cli.catalog.as_ref()),
        Commands::Config { source, overrides } => {
            cmd_config(cli.catalog.as_ref(), &source, &overrides)
        }
        Commands::Health {
            samples,
            interval_ms,
        } => cmd_health(cli.catalog.as_ref(), samples, interval_ms).await,
        Commands::Run {
            source,
            requester,
            priority,
            overrides,
            listing_pages,
            fail_first,
            output,
        } => {
            let request = SessionRequest::new(&source, requester)
                .with_priority(priority)
                .with_overrides(overrides.overrides());
            let request = match overrides.profile {
                Some(profile) => request.with_profile(profile),
                None => request,
            };
            let registry = build_registry(cli.catalog.as_ref(), listing_pages, fail_first)?;
            let sink = JsonLinesSink::new(output);
            let result = cmd_run(registry, request, sink.clone()).await;
            tracing::info!(records = sink.written(), "Unique records handed off");
            result
        }
    }
}

fn load_catalog(path: Option<&PathBuf>) -> Result<ScraperCatalog> {
    let catalog = match path {
        Some(path) => ScraperCatalog::from_path(path),
        None => ScraperCatalog::from_json(DEMO_CATALOG),
    };
    catalog
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to load scraper catalog")
}

/// Every catalog source gets the simulated extractor. `TENDER_SCRAPER_*`
/// variables replace the catalog's environment layer when any is set.
fn build_registry(
    path: Option<&PathBuf>,
    listing_pages: u32,
    fail_first: usize,
) -> Result<ScraperRegistry> {
    let catalog = load_catalog(path)?;
    let sources: Vec<String> = catalog.scrapers.iter().map(|d| d.source.clone()).collect();

    let mut builder = ScraperRegistry::builder().catalog(catalog);
    let environment = ConfigOverrides::from_env().map_err(|e| anyhow::anyhow!(e))?;
    if !environment.is_empty() {
        builder = builder.environment(environment);
    }
    for source in sources {
        builder = builder.implement(
            source,
            Arc::new(SimulatedScraper::new(listing_pages, fail_first)),
        );
    }
    builder
        .build()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid scraper catalog")
}

fn cmd_sources(path: Option<&PathBuf>) -> Result<()> {
    let registry = build_registry(path, 1, 0)?;
    let available = registry.list_available();

    let mut names: Vec<String> = load_catalog(path)?
        .scrapers
        .into_iter()
        .map(|d| d.source)
        .collect();
    names.sort();

    println!("{:<20} {:<10} {:<10} IMPLEMENTATION", "SOURCE", "ENABLED", "CAPABILITY");
    println!("{}", "-".repeat(60));
    for name in names {
        let enabled = if available.contains(&name) { "yes" } else { "no" };
        match registry.resolve(&name) {
            Ok(resolved) => println!(
                "{:<20} {:<10} {:<10} {}",
                name,
                enabled,
                resolved.capability.as_str(),
                resolved.implementation
            ),
            Err(e) => println!("{:<20} {:<10} {:<10} {}", name, enabled, "-", e),
        }
    }

    let profiles = registry.profile_names();
    if !profiles.is_empty() {
        println!("\nProfiles: {}", profiles.join(", "));
    }
    Ok(())
}

fn cmd_config(path: Option<&PathBuf>, source: &str, args: &OverrideArgs) -> Result<()> {
    let registry = build_registry(path, 1, 0)?;
    let config = registry
        .resolve_config(source, args.profile.as_deref(), &args.overrides())
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Cannot resolve config for '{source}'"))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_health(path: Option<&PathBuf>, samples: u32, interval_ms: u64) -> Result<()> {
    let config = OrchestratorConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let registry = build_registry(path, 1, 0)?;
    let orchestrator = Orchestrator::start(
        config,
        registry,
        NullSink,
        Arc::new(SysinfoProbe::new()),
    )
    .map_err(|e| anyhow::anyhow!(e))?;

    let mut latest = None;
    for i in 0..samples.max(1) {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
        latest = Some(
            orchestrator
                .sample_health()
                .await
                .map_err(|e| anyhow::anyhow!(e))?,
        );
    }

    if let Some(snapshot) = latest {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.performance_report())?
    );
    orchestrator.shutdown().await;
    Ok(())
}

async fn cmd_run<S: RecordSink>(
    registry: ScraperRegistry,
    request: SessionRequest,
    sink: S,
) -> Result<()> {
    let config = OrchestratorConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = Orchestrator::start(config, registry, sink, Arc::new(SysinfoProbe::new()))
        .map_err(|e| anyhow::anyhow!(e))?;

    let source = request.source.clone();
    let session_id = match orchestrator.start_session(request).await {
        Ok(id) => id,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(anyhow::anyhow!(e)).with_context(|| format!("Cannot start '{source}'"));
        }
    };
    tracing::info!(%session_id, source = %source, "Session started");

    let session = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(%session_id, "Interrupted, cancelling session");
                orchestrator
                    .cancel_session(session_id)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        let session = orchestrator
            .session_status(session_id)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        if session.status.is_terminal() {
            break session;
        }
    };

    println!("{}", serde_json::to_string_pretty(&session)?);
    let metrics = orchestrator
        .metrics()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    orchestrator.shutdown().await;

    match session.status {
        SessionStatus::Failed => Err(anyhow::anyhow!(AppError::ExecutionError(
            session.error.unwrap_or_default()
        )))
        .context("Session failed"),
        _ => Ok(()),
    }
}
