use std::sync::Arc;
use std::time::Duration;

use tender_core::testutil::{MockSink, StaticProbe};
use tender_core::{Orchestrator, OrchestratorConfig, ScraperRegistry};

pub const WAIT: Duration = Duration::from_secs(5);

/// Short ticks and backoff so retry scenarios finish in milliseconds.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        scheduler_interval: Duration::from_millis(10),
        retry_delay: Duration::from_millis(30),
        health_check_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

pub struct TestApp {
    pub orchestrator: Orchestrator<MockSink>,
    pub sink: MockSink,
    pub probe: Arc<StaticProbe>,
}

pub fn start(config: OrchestratorConfig, registry: ScraperRegistry) -> TestApp {
    start_with_sink(config, registry, MockSink::default())
}

pub fn start_with_sink(
    config: OrchestratorConfig,
    registry: ScraperRegistry,
    sink: MockSink,
) -> TestApp {
    let probe = Arc::new(StaticProbe::healthy());
    let orchestrator = Orchestrator::start(config, registry, sink.clone(), probe.clone())
        .expect("orchestrator starts");
    TestApp {
        orchestrator,
        sink,
        probe,
    }
}
