use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_include;
use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dialogue_translator::core::clock::{Clock, ManualClock};
use dialogue_translator::core::errors::ErrorKind;
use dialogue_translator::core::orchestrator::estimate_tokens;
use dialogue_translator::core::reservoir::RESERVOIR_KEY;
use dialogue_translator::core::scripted::{ScriptedBackend, Step};
use dialogue_translator::core::store::{load_progress, KeyValueStore};
use dialogue_translator::{
    BatchOutcome, BatchRequest, HealthStatus, MemoryStore, ModelChoice, Orchestrator,
    OrchestratorConfig, SubtitleCleaner, SubtitleFormat, TranslationContext, TranslationError,
};

const START_MS: i64 = 1_700_000_000_000;

struct Harness {
    orchestrator: Orchestrator,
    backend: ScriptedBackend,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

fn harness(backend: ScriptedBackend, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    let mut config = OrchestratorConfig {
        api_key: "test".to_string(),
        ..Default::default()
    };
    config.fill_default_models();
    tweak(&mut config);

    let clock = Arc::new(ManualClock::new(START_MS));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_parts(
        config,
        Arc::new(backend.clone()),
        store.clone(),
        clock.clone(),
        Arc::new(SubtitleCleaner),
    );

    Harness {
        orchestrator,
        backend,
        clock,
        store,
    }
}

fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

fn batch(raw: &[&str]) -> BatchRequest {
    BatchRequest {
        lines: lines(raw),
        format: SubtitleFormat::Plain,
        ..Default::default()
    }
}

#[tokio::test]
async fn reported_usage_is_charged_and_persisted() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("Mingalaba", 120)]),
        |_| {},
    );

    let result = tokio_test::assert_ok!(
        h.orchestrator
            .translate("Hello", &TranslationContext::new("Show"), &ModelChoice::Auto)
            .await
    );
    assert_eq!(result.tokens_used, 120);

    let reservoir = h.orchestrator.reservoir().await;
    assert_eq!(reservoir.remaining, 499_880);
    assert_eq!(reservoir.total_consumed, 120);

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.total_tokens_used, 120);
    assert_eq!(metrics.reservoir_tokens, 499_880);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.status, HealthStatus::Healthy);

    let persisted: serde_json::Value =
        serde_json::from_str(&h.store.get(RESERVOIR_KEY).unwrap()).unwrap();
    assert_json_include!(
        actual: persisted,
        expected: json!({ "capacity": 500_000, "remaining": 499_880, "totalConsumed": 120 })
    );
}

#[tokio::test]
async fn exhausted_reservoir_rejects_without_upstream_call() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("one", 150)]),
        |c| c.daily_token_limit = 100,
    );
    let ctx = TranslationContext::default();

    tokio_test::assert_ok!(h.orchestrator.translate("first", &ctx, &ModelChoice::Auto).await);
    assert_eq!(h.orchestrator.reservoir().await.remaining, 0);

    let err = h
        .orchestrator
        .translate("second", &ctx, &ModelChoice::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, TranslationError::QuotaExhausted));
    assert_eq!(h.backend.calls(), 1);

    // A new calendar day refills the reservoir
    h.clock.advance(48 * 60 * 60 * 1000);
    h.backend.push(Step::reply_with_usage("two", 10));
    tokio_test::assert_ok!(h.orchestrator.translate("second", &ctx, &ModelChoice::Auto).await);
    let reservoir = h.orchestrator.reservoir().await;
    assert_eq!(reservoir.remaining, 90);
    assert_eq!(reservoir.total_consumed, 160);
}

#[tokio::test(start_paused = true)]
async fn overloaded_upstream_opens_breaker() {
    let backend = ScriptedBackend::default()
        .with_responder(|_| Err(TranslationError::upstream(Some(503), "model overloaded")));
    let h = harness(backend, |_| {});
    let ctx = TranslationContext::default();

    // First call: initial attempt plus three retries
    let err = h
        .orchestrator
        .translate("a", &ctx, &ModelChoice::Auto)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceOverloaded);
    assert_eq!(h.backend.calls(), 4);
    assert!(!h.orchestrator.circuit_state().is_open);

    // The fifth consecutive failure opens the breaker mid-retry
    let err = h
        .orchestrator
        .translate("b", &ctx, &ModelChoice::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, TranslationError::CircuitOpen));
    assert_eq!(h.backend.calls(), 5);
    assert!(h.orchestrator.metrics().is_circuit_open);

    h.clock.advance(10_000);
    let err = h
        .orchestrator
        .translate("c", &ctx, &ModelChoice::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, TranslationError::CircuitOpen));
    assert_eq!(h.backend.calls(), 5);

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.failed_requests, 5);
    assert_eq!(metrics.status, HealthStatus::Down);
}

#[tokio::test(start_paused = true)]
async fn breaker_closes_after_cooldown() {
    let backend = ScriptedBackend::new((0..5).map(|_| Step::fail(Some(503), "unavailable")));
    let h = harness(backend, |c| c.max_retries = 4);
    let ctx = TranslationContext::default();

    assert!(h.orchestrator.translate("a", &ctx, &ModelChoice::Auto).await.is_err());
    assert!(h.orchestrator.circuit_state().is_open);

    h.clock.advance(60_000);
    h.backend.push(Step::reply_with_usage("ok", 5));
    let result = tokio_test::assert_ok!(h.orchestrator.translate("a", &ctx, &ModelChoice::Auto).await);
    assert_eq!(result.translation, "ok");

    let state = h.orchestrator.circuit_state();
    assert!(!state.is_open);
    assert_eq!(state.consecutive_failures, 0);
    let metrics = h.orchestrator.metrics();
    assert!(!metrics.is_circuit_open);
    assert_eq!(metrics.status, HealthStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_without_charging_breaker() {
    let backend = ScriptedBackend::new([
        Step::fail(Some(429), "Resource has been exhausted"),
        Step::reply_with_usage("done", 3),
    ]);
    let h = harness(backend, |_| {});

    let started = Instant::now();
    tokio_test::assert_ok!(
        h.orchestrator
            .translate("a", &TranslationContext::default(), &ModelChoice::Auto)
            .await
    );
    assert!(started.elapsed() >= Duration::from_secs(30));

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.rate_limit_count, 1);
    assert_eq!(metrics.failed_requests, 0);
    assert_eq!(h.orchestrator.circuit_state().consecutive_failures, 0);
}

#[tokio::test]
async fn newer_stream_silences_older_one() {
    let backend = ScriptedBackend::new([Step::stream(["a ", "b "]), Step::stream(["x ", "y"])]);
    let h = harness(backend, |_| {});
    let ctx = TranslationContext::default();

    let mut first = h.orchestrator.translate_stream("one", &ctx, &ModelChoice::Auto);
    assert_eq!(first.next().await.unwrap().unwrap(), "a ");

    let second = h.orchestrator.translate_stream("two", &ctx, &ModelChoice::Auto);
    assert!(first.next().await.is_none());

    let chunks: Vec<String> = second.map(|c| c.unwrap()).collect().await;
    assert_eq!(chunks, vec!["x ", "y"]);

    let requests = h.backend.requests();
    let expected = estimate_tokens(&requests[1].prompt, "x y");
    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.total_tokens_used, expected);
}

#[tokio::test]
async fn stream_started_later_supersedes_unpolled_stream() {
    let backend = ScriptedBackend::new([Step::stream(["only"])]);
    let h = harness(backend, |_| {});
    let ctx = TranslationContext::default();

    let stale = h.orchestrator.translate_stream("one", &ctx, &ModelChoice::Auto);
    let fresh = h.orchestrator.translate_stream("two", &ctx, &ModelChoice::Auto);

    let stale_items: Vec<_> = stale.collect().await;
    assert!(stale_items.is_empty());
    assert_eq!(h.backend.calls(), 0);

    let fresh_items: Vec<String> = fresh.map(|c| c.unwrap()).collect().await;
    assert_eq!(fresh_items, vec!["only"]);
}

#[tokio::test]
async fn stream_failure_is_yielded_without_retry() {
    let backend = ScriptedBackend::new([Step::Stream {
        chunks: vec!["a ".to_string()],
        fail: Some("503 overloaded".to_string()),
    }]);
    let h = harness(backend, |_| {});

    let items: Vec<_> = h
        .orchestrator
        .translate_stream("one", &TranslationContext::default(), &ModelChoice::Auto)
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceOverloaded);

    assert_eq!(h.backend.calls(), 1);
    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.total_tokens_used, 0);
    assert_eq!(h.orchestrator.circuit_state().consecutive_failures, 1);
}

#[tokio::test]
async fn metrics_subscribers_are_notified_until_unsubscribed() {
    let backend = ScriptedBackend::default().with_responder(|_| {
        Ok(dialogue_translator::core::models::UpstreamResponse {
            text: "ok".to_string(),
            total_tokens: Some(1),
        })
    });
    let h = harness(backend, |_| {});
    let ctx = TranslationContext::default();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let subscription = h.orchestrator.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.orchestrator.translate("a", &ctx, &ModelChoice::Auto).await.unwrap();
    let seen = hits.load(Ordering::SeqCst);
    assert!(seen > 0);

    subscription.unsubscribe();
    subscription.unsubscribe();
    h.orchestrator.translate("b", &ctx, &ModelChoice::Auto).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn batch_sends_each_unique_line_once() {
    let h = harness(ScriptedBackend::new([Step::reply("ka\nkha")]), |_| {});

    let report = h
        .orchestrator
        .translate_batch(batch(&["A", "A", "B", ""]), &CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(
        report.lines,
        vec![
            Some("ka".to_string()),
            Some("kha".to_string()),
            Some("ka".to_string()),
            Some(String::new())
        ]
    );
    assert_eq!(report.unique_contents, 2);
    assert_eq!(h.backend.calls(), 1);
    assert!(h.backend.requests()[0]
        .prompt
        .starts_with("[BATCH INPUT - 2 unique lines]\nA\nB"));
}

#[tokio::test]
async fn ass_batch_keeps_headers() {
    let h = harness(ScriptedBackend::new([Step::reply("Pyay")]), |_| {});
    let dialogue = "Dialogue: 0,0:00:01.00,0:00:02.00,Default,Mina,0,0,0,,Run!";
    let request = BatchRequest {
        lines: lines(&["[Events]", dialogue, dialogue]),
        format: SubtitleFormat::Ass,
        ..Default::default()
    };

    let report = h.orchestrator.translate_batch(request, &CancellationToken::new()).await;
    let expected = "Dialogue: 0,0:00:01.00,0:00:02.00,Default,Mina,0,0,0,,Pyay".to_string();
    assert_eq!(
        report.lines,
        vec![Some("[Events]".to_string()), Some(expected.clone()), Some(expected)]
    );
}

#[tokio::test(start_paused = true)]
async fn batch_chunks_are_paced() {
    let h = harness(
        ScriptedBackend::new([Step::reply("ka\nkha"), Step::reply("ga")]),
        |c| c.batch_size = 2,
    );

    let started = Instant::now();
    let report = h
        .orchestrator
        .translate_batch(batch(&["A", "B", "C"]), &CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.chunks_sent, 2);
    assert!(started.elapsed() >= Duration::from_millis(6000));
    assert!(started.elapsed() < Duration::from_millis(7000));
}

#[tokio::test(start_paused = true)]
async fn misaligned_batch_is_retried() {
    let h = harness(
        ScriptedBackend::new([Step::reply("only one"), Step::reply("ka\nkha")]),
        |_| {},
    );

    let report = h
        .orchestrator
        .translate_batch(batch(&["A", "B"]), &CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(h.backend.calls(), 2);
    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    // Both calls completed upstream, so both are charged
    assert!(metrics.total_tokens_used > 100);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_batch_shrinks_chunks() {
    let h = harness(
        ScriptedBackend::new([
            Step::fail(Some(429), "quota"),
            Step::reply("1\n2\n3\n4"),
            Step::reply("5\n6"),
        ]),
        |c| {
            c.batch_size = 6;
            c.max_retries = 0;
        },
    );

    let started = Instant::now();
    let report = h
        .orchestrator
        .translate_batch(batch(&["a", "b", "c", "d", "e", "f"]), &CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.final_chunk_size, 4);
    assert_eq!(report.chunks_sent, 2);
    assert!(started.elapsed() >= Duration::from_secs(36));

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].prompt.starts_with("[BATCH INPUT - 6 unique lines]"));
    assert!(requests[1].prompt.starts_with("[BATCH INPUT - 4 unique lines]"));
    assert!(requests[2].prompt.starts_with("[BATCH INPUT - 2 unique lines]"));
}

#[tokio::test(start_paused = true)]
async fn persistent_rate_limit_halts_batch() {
    let backend = ScriptedBackend::default()
        .with_responder(|_| Err(TranslationError::upstream(Some(429), "quota")));
    let h = harness(backend, |c| {
        c.batch_size = 4;
        c.max_retries = 0;
    });

    let report = h
        .orchestrator
        .translate_batch(batch(&["a", "b", "c", "d"]), &CancellationToken::new())
        .await;

    match &report.outcome {
        BatchOutcome::Halted(err) => assert!(err.is_rate_limited()),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.backend.calls(), 5);
    assert_eq!(report.final_chunk_size, 2);
    assert_eq!(report.completed_lines, 0);
}

#[tokio::test(start_paused = true)]
async fn halted_batch_resumes_from_saved_progress() {
    let h = harness(
        ScriptedBackend::new([Step::reply("ka"), Step::fail(Some(400), "bad request")]),
        |c| c.batch_size = 1,
    );
    let key = "progress_ep1.txt_4".to_string();
    let request = BatchRequest {
        progress_key: Some(key.clone()),
        ..batch(&["A", "B"])
    };

    let report = h
        .orchestrator
        .translate_batch(request.clone(), &CancellationToken::new())
        .await;
    assert!(matches!(report.outcome, BatchOutcome::Halted(_)));
    assert_eq!(report.lines, vec![Some("ka".to_string()), None]);
    assert_eq!(h.backend.calls(), 2);

    let progress = load_progress(h.store.as_ref(), &key, 2).unwrap();
    assert_eq!(progress.lines, vec![Some("ka".to_string()), None]);
    assert_eq!(progress.timestamp, h.clock.now_ms());

    h.backend.push(Step::reply("kha"));
    let resumed = BatchRequest {
        completed: progress.lines,
        ..request
    };
    let report = h
        .orchestrator
        .translate_batch(resumed, &CancellationToken::new())
        .await;
    assert!(report.is_complete());
    assert_eq!(report.merged(&lines(&["A", "B"])), vec!["ka", "kha"]);
    assert_eq!(h.backend.calls(), 3);
}

#[tokio::test]
async fn exhausted_quota_halts_batch() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("ka", 50)]),
        |c| {
            c.batch_size = 1;
            c.batch_delay_ms = 0;
            c.daily_token_limit = 10;
        },
    );

    let report = h
        .orchestrator
        .translate_batch(batch(&["A", "B"]), &CancellationToken::new())
        .await;
    assert!(matches!(
        report.outcome,
        BatchOutcome::Halted(TranslationError::QuotaExhausted)
    ));
    assert_eq!(report.completed_lines, 1);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn cancelled_batch_sends_nothing() {
    let h = harness(ScriptedBackend::default(), |_| {});
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.orchestrator.translate_batch(batch(&["A"]), &cancel).await;
    assert!(matches!(report.outcome, BatchOutcome::Cancelled));
    assert_eq!(h.backend.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_wakes_pacing_pause() {
    let h = harness(
        ScriptedBackend::new([Step::reply("ka"), Step::reply("kha")]),
        |c| c.batch_size = 1,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = h.orchestrator.translate_batch(batch(&["A", "B"]), &cancel).await;

    assert!(matches!(report.outcome, BatchOutcome::Cancelled));
    assert_eq!(report.completed_lines, 1);
    assert_eq!(h.backend.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn reset_metrics_keeps_reservoir_level() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("ok", 25)]),
        |_| {},
    );
    h.orchestrator
        .translate("a", &TranslationContext::default(), &ModelChoice::Auto)
        .await
        .unwrap();

    h.orchestrator.reset_metrics().await;
    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.total_requests, 0);
    assert_eq!(metrics.total_tokens_used, 0);
    assert_eq!(metrics.status, HealthStatus::Idle);
    assert_eq!(metrics.reservoir_tokens, 499_975);
}

#[tokio::test]
async fn superseded_stream_stays_silent_when_quota_is_gone() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("one", 150)]),
        |c| c.daily_token_limit = 100,
    );
    let ctx = TranslationContext::default();
    tokio_test::assert_ok!(h.orchestrator.translate("first", &ctx, &ModelChoice::Auto).await);

    let stale = h.orchestrator.translate_stream("two", &ctx, &ModelChoice::Auto);
    let fresh = h.orchestrator.translate_stream("three", &ctx, &ModelChoice::Auto);

    let stale_items: Vec<_> = stale.collect().await;
    assert!(stale_items.is_empty());

    let fresh_items: Vec<_> = fresh.collect().await;
    assert_eq!(fresh_items.len(), 1);
    assert!(matches!(fresh_items[0], Err(TranslationError::QuotaExhausted)));
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_usage_is_charged_as_estimate() {
    let backend = ScriptedBackend::new([Step::reply("Mingalaba"), Step::reply("ka\nkha")]);
    let h = harness(backend, |_| {});

    h.orchestrator
        .translate("Hello", &TranslationContext::new("Show"), &ModelChoice::Auto)
        .await
        .unwrap();
    let report = h
        .orchestrator
        .translate_batch(batch(&["A", "B"]), &CancellationToken::new())
        .await;
    assert!(report.is_complete());

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 2);
    let expected = estimate_tokens(&requests[0].prompt, "Mingalaba")
        + estimate_tokens(&requests[1].prompt, "ka\nkha");

    let reservoir = h.orchestrator.reservoir().await;
    assert_eq!(reservoir.remaining, 500_000 - expected);
    assert_eq!(reservoir.total_consumed, expected);

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.total_tokens_used, expected);
    assert_eq!(metrics.reservoir_tokens, 500_000 - expected);
}

#[tokio::test]
async fn day_rollover_refill_reaches_metrics() {
    let h = harness(
        ScriptedBackend::new([Step::reply_with_usage("one", 150)]),
        |c| c.daily_token_limit = 100,
    );
    h.orchestrator
        .translate("first", &TranslationContext::default(), &ModelChoice::Auto)
        .await
        .unwrap();
    assert_eq!(h.orchestrator.metrics().reservoir_tokens, 0);

    h.clock.advance(48 * 60 * 60 * 1000);
    assert_eq!(h.orchestrator.reservoir().await.remaining, 100);
    assert_eq!(h.orchestrator.metrics().reservoir_tokens, 100);
}
