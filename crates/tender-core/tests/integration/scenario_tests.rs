use std::sync::Arc;
use std::time::Duration;

use tender_core::testutil::{
    ConcurrencyGauge, ScriptedScraper, wait_for_orchestrated_session,
};
use tender_core::{
    AlertLevel, AppError, CapabilityLevel, ConfigOverrides, OrchestratorConfig, ScraperDescriptor,
    ScraperRegistry, SessionRequest, SessionStatus, TaskStatus,
};

use crate::integration::common::{WAIT, fast_config, start};

#[tokio::test]
async fn flaky_scraper_completes_on_third_attempt() {
    let scraper = ScriptedScraper::new(4, 5).failing_first(2);
    let registry = ScraperRegistry::builder()
        .register(ScraperDescriptor::new("ted"), Arc::new(scraper.clone()))
        .build()
        .unwrap();
    let app = start(fast_config(), registry);

    let overrides = ConfigOverrides::default()
        .with_max_pages(10)
        .with_timeout_secs(30)
        .with_retry_attempts(3);
    let id = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst").with_overrides(overrides))
        .await
        .unwrap();

    let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.progress.items_found > 0);
    assert_eq!(session.progress.items_found, 20);
    assert_eq!(session.error, None);

    let task = app.orchestrator.task_status(session.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.attempt, 3);
    assert_eq!(scraper.calls(), 3);

    let attempts = &session.metadata.attempts;
    assert_eq!(attempts.len(), 3);
    assert!(attempts[0].error.as_deref().unwrap().contains("scripted failure 1"));
    assert!(attempts[2].error.is_none());
    for pair in attempts.windows(2) {
        let gap = pair[1].started_at - pair[0].started_at;
        assert!(gap.num_milliseconds() >= 30, "attempts only {gap} apart");
    }

    assert_eq!(scraper.configs()[0].max_pages, 10);
    assert_eq!(app.sink.len(), 20);
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn third_session_waits_for_a_source_slot() {
    let gauge = ConcurrencyGauge::default();
    let scraper = ScriptedScraper::new(3, 2)
        .with_page_delay(Duration::from_millis(40))
        .with_gauge(gauge.clone());
    let registry = ScraperRegistry::builder()
        .register(ScraperDescriptor::new("ted"), Arc::new(scraper))
        .build()
        .unwrap();
    let app = start(
        OrchestratorConfig {
            max_sessions_per_source: 2,
            ..fast_config()
        },
        registry,
    );

    let mut ids = Vec::new();
    for requester in ["a", "b", "c"] {
        ids.push(
            app.orchestrator
                .start_session(SessionRequest::new("ted", requester))
                .await
                .unwrap(),
        );
    }

    let third = app.orchestrator.session_status(ids[2]).await.unwrap();
    assert_eq!(third.status, SessionStatus::Pending);
    let metrics = app.orchestrator.metrics().await.unwrap();
    assert_eq!(metrics.sessions.waiting, 1);
    assert_eq!(metrics.sessions.admitted_by_source.get("ted"), Some(&2));
    let task = app.orchestrator.task_status(third.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.submitted_at.is_none());

    let first = wait_for_orchestrated_session(&app.orchestrator, ids[0], WAIT).await;
    let second = wait_for_orchestrated_session(&app.orchestrator, ids[1], WAIT).await;
    let third = wait_for_orchestrated_session(&app.orchestrator, ids[2], WAIT).await;
    assert_eq!(third.status, SessionStatus::Completed);

    let first_free = first.ended_at.unwrap().min(second.ended_at.unwrap());
    assert!(third.started_at.unwrap() >= first_free);
    assert_eq!(gauge.peak(), 2);
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn critical_memory_refuses_new_sessions() {
    let scraper = ScriptedScraper::new(1, 1);
    let registry = ScraperRegistry::builder()
        .register(ScraperDescriptor::new("ted"), Arc::new(scraper.clone()))
        .build()
        .unwrap();
    let app = start(fast_config(), registry);

    app.probe.set_memory(96.0);
    let snapshot = app.orchestrator.sample_health().await.unwrap();
    assert_eq!(snapshot.alert_level, AlertLevel::Critical);
    assert_eq!(app.orchestrator.health_summary(), AlertLevel::Critical);

    let result = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst"))
        .await;
    assert!(matches!(result, Err(AppError::ResourceExhausted(_))));

    let metrics = app.orchestrator.metrics().await.unwrap();
    assert_eq!(metrics.sessions.total, 0);
    assert_eq!(metrics.scheduler.active(), 0);
    assert_eq!(metrics.scheduler.succeeded + metrics.scheduler.failed, 0);
    assert_eq!(scraper.calls(), 0);

    // Admission resumes once a healthy sample is recorded.
    app.probe.set_memory(40.0);
    app.orchestrator.sample_health().await.unwrap();
    assert!(
        app.orchestrator
            .start_session(SessionRequest::new("ted", "analyst"))
            .await
            .is_ok()
    );
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn disabled_primary_runs_fallback_degraded() {
    let primary = ScriptedScraper::new(2, 2);
    let fallback = ScriptedScraper::new(1, 3);
    let registry = ScraperRegistry::builder()
        .register(
            ScraperDescriptor::new("anac").disabled().with_fallback("anac_rss"),
            Arc::new(primary.clone()),
        )
        .register(ScraperDescriptor::new("anac_rss"), Arc::new(fallback.clone()))
        .build()
        .unwrap();
    let app = start(fast_config(), registry);
    assert_eq!(app.orchestrator.list_sources(), vec!["anac_rss"]);

    let id = app
        .orchestrator
        .start_session(SessionRequest::new("anac", "analyst"))
        .await
        .unwrap();
    let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.source, "anac");
    assert_eq!(session.metadata.capability, CapabilityLevel::Degraded);
    assert_eq!(session.metadata.implementation, "anac_rss");
    assert_eq!(primary.calls(), 0);
    assert_eq!(fallback.calls(), 1);

    let json = serde_json::to_value(&session).unwrap();
    assert_eq!(json["metadata"]["capability"], "DEGRADED");
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn profile_and_caller_overrides_reach_the_scraper() {
    let scraper = ScriptedScraper::new(50, 1);
    let registry = ScraperRegistry::builder()
        .register(
            ScraperDescriptor::new("ted")
                .with_tunables(ConfigOverrides::default().with_max_pages(20)),
            Arc::new(scraper.clone()),
        )
        .profile("quick", ConfigOverrides::default().with_max_pages(3))
        .build()
        .unwrap();
    let app = start(fast_config(), registry);

    let id = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst").with_profile("quick"))
        .await
        .unwrap();
    let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;
    assert_eq!(session.progress.pages_processed, 3);
    assert_eq!(session.metadata.profile.as_deref(), Some("quick"));

    let unknown = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst").with_profile("missing"))
        .await;
    assert!(matches!(unknown, Err(AppError::ConfigError(_))));
    app.orchestrator.shutdown().await;
}
