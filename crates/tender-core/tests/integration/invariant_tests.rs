use std::sync::Arc;
use std::time::Duration;

use tender_core::testutil::{
    ConcurrencyGauge, MockSink, ScriptedScraper, SlowScraper, wait_for_orchestrated_session,
};
use tender_core::{
    AppError, OrchestratorConfig, ScraperDescriptor, ScraperRegistry, SessionFilter,
    SessionRequest, SessionStatus, TaskStatus,
};

use crate::integration::common::{WAIT, fast_config, start, start_with_sink};

async fn wait_until_running(app: &crate::integration::common::TestApp, id: uuid::Uuid) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let session = app.orchestrator.session_status(id).await.unwrap();
        if session.status == SessionStatus::Running {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never ran");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn cancel_releases_worker_and_source_slot_within_a_tick() {
    let registry = ScraperRegistry::builder()
        .register(
            ScraperDescriptor::new("ted"),
            Arc::new(SlowScraper::new(Duration::from_millis(5))),
        )
        .build()
        .unwrap();
    let app = start(
        OrchestratorConfig {
            max_workers: 1,
            max_sessions_per_source: 1,
            ..fast_config()
        },
        registry,
    );

    let first = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "a"))
        .await
        .unwrap();
    wait_until_running(&app, first).await;
    let second = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "b"))
        .await
        .unwrap();

    assert_eq!(
        app.orchestrator.cancel_session(first).await.unwrap(),
        SessionStatus::Cancelled
    );
    let cancelled = app.orchestrator.session_status(first).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    // One scheduler tick (10ms) plus the page the scraper is in.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let task = app.orchestrator.task_status(cancelled.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(
        app.orchestrator
            .session_status(second)
            .await
            .unwrap()
            .status,
        SessionStatus::Running
    );

    app.orchestrator.cancel_session(second).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let metrics = app.orchestrator.metrics().await.unwrap();
    assert_eq!(metrics.scheduler.running, 0);
    assert_eq!(metrics.scheduler.idle_workers, 1);
    assert!(metrics.sessions.admitted_by_source.is_empty());
    assert_eq!(metrics.sessions.cancelled, 2);
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn progress_counters_never_decrease_while_running() {
    let registry = ScraperRegistry::builder()
        .register(
            ScraperDescriptor::new("ted"),
            Arc::new(SlowScraper::new(Duration::from_millis(3))),
        )
        .build()
        .unwrap();
    let app = start(fast_config(), registry);

    let id = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst"))
        .await
        .unwrap();
    wait_until_running(&app, id).await;

    let mut last = app.orchestrator.session_status(id).await.unwrap().progress;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(4)).await;
        let progress = app.orchestrator.session_status(id).await.unwrap().progress;
        assert!(progress.pages_processed >= last.pages_processed);
        assert!(progress.items_found >= last.items_found);
        last = progress;
    }
    assert!(last.pages_processed > 0);

    app.orchestrator.cancel_session(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let frozen = app.orchestrator.session_status(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        app.orchestrator.session_status(id).await.unwrap().progress,
        frozen.progress
    );
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn running_tasks_bounded_by_worker_pool() {
    let gauge = ConcurrencyGauge::default();
    let mut builder = ScraperRegistry::builder();
    for source in ["ted", "anac", "consip"] {
        builder = builder.register(
            ScraperDescriptor::new(source),
            Arc::new(
                ScriptedScraper::new(2, 1)
                    .with_page_delay(Duration::from_millis(15))
                    .with_gauge(gauge.clone()),
            ),
        );
    }
    let app = start(
        OrchestratorConfig {
            max_workers: 2,
            max_sessions_per_source: 2,
            ..fast_config()
        },
        builder.build().unwrap(),
    );

    let mut ids = Vec::new();
    for source in ["ted", "anac", "consip", "ted", "anac", "consip"] {
        ids.push(
            app.orchestrator
                .start_session(SessionRequest::new(source, "load"))
                .await
                .unwrap(),
        );
    }
    for id in ids {
        let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;
        assert_eq!(session.status, SessionStatus::Completed);
    }
    assert!(gauge.peak() <= 2, "peak concurrency was {}", gauge.peak());

    let completed = app
        .orchestrator
        .list_sessions(SessionFilter::default().with_status(SessionStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 6);
    assert!(completed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_hand_off_is_retried() {
    let registry = ScraperRegistry::builder()
        .register(ScraperDescriptor::new("ted"), Arc::new(ScriptedScraper::new(2, 2)))
        .build()
        .unwrap();
    let sink =
        MockSink::default().failing_next(AppError::PersistenceError("db unavailable".into()));
    let app = start_with_sink(fast_config(), registry, sink);

    let id = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst"))
        .await
        .unwrap();
    let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.metadata.attempts.len(), 2);
    assert_eq!(app.sink.upsert_calls(), 2);
    assert_eq!(app.sink.len(), 4);
    assert_eq!(session.records_handed_off, 4);
    app.orchestrator.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_session() {
    let registry = ScraperRegistry::builder()
        .register(
            ScraperDescriptor::new("ted"),
            Arc::new(ScriptedScraper::new(1, 1).failing_first(10)),
        )
        .build()
        .unwrap();
    let app = start(
        OrchestratorConfig {
            max_retry_attempts: 2,
            ..fast_config()
        },
        registry,
    );

    let id = app
        .orchestrator
        .start_session(SessionRequest::new("ted", "analyst"))
        .await
        .unwrap();
    let session = wait_for_orchestrated_session(&app.orchestrator, id, WAIT).await;

    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.error.as_deref().unwrap().contains("scripted failure 3"));
    let task = app.orchestrator.task_status(session.task_id).await.unwrap();
    assert_eq!(task.attempt, 3);
    assert_eq!(task.status, TaskStatus::Failed);
    app.orchestrator.shutdown().await;
}
