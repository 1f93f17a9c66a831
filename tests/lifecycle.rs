mod common;

use cloudburst::{CleanupOptions, InvokeError, LogEvent};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn stats_ticker_emits_window_deltas() {
    let options = common::options().stats_interval(Duration::from_millis(100)).unwrap();
    let (driver, instance) = common::queued_instance(options).await;
    driver.register("tick", |_args| Ok(json!(1)));

    let mut events = instance.stats_events();
    let _: i64 = instance.invoke("tick", json!([])).await.unwrap();
    let _: i64 = instance.invoke("tick", json!([])).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("a stats tick arrives")
        .expect("channel open");
    assert_eq!(event.name, "tick");
    assert!(event.counters.invocations >= 1);
    assert!(event.counters.completed <= event.counters.invocations);
    // Cumulative counters keep the full totals regardless of window resets.
    assert_eq!(instance.counters("tick").completed, 2);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

#[tokio::test]
async fn log_follower_emits_each_event_once() {
    let (driver, instance) = common::queued_instance(common::options()).await;
    let event = |id: &str, ts: i64| LogEvent {
        event_id: id.to_owned(),
        timestamp: ts,
        message: format!("line {}", id),
    };
    // Overlapping pages, as cloud log APIs deliver them.
    driver.script_log_pages(vec![
        vec![event("a", 1_000), event("b", 1_100)],
        vec![event("b", 1_100), event("c", 1_200)],
    ]);

    let mut logs = instance.log_events();
    let mut received = Vec::new();
    while received.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), logs.recv())
            .await
            .expect("log events arrive")
            .expect("channel open");
        received.push(event.event_id);
    }
    received.sort();
    assert_eq!(received, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]);

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

#[tokio::test]
async fn cleanup_is_idempotent_and_deletion_is_opt_out() {
    let (driver, instance) = common::queued_instance(common::options()).await;
    driver.register("noop", |_args| Ok(json!(null)));
    let _: serde_json::Value = instance.invoke("noop", json!([])).await.unwrap();

    instance.cleanup(CleanupOptions { delete_resources: false }).await.unwrap();
    assert!(!driver.resources_deleted(), "first pass keeps resources for debugging");

    instance.cleanup(CleanupOptions::default()).await.unwrap();
    assert!(driver.resources_deleted());
}

#[tokio::test]
async fn invocations_after_stop_are_rejected() {
    let (driver, instance) = common::queued_instance(common::options()).await;
    driver.register("noop", |_args| Ok(json!(null)));

    instance.stop().await;
    let err = instance.invoke_raw("noop", json!([])).await.unwrap_err();
    assert!(matches!(err, InvokeError::RejectedPendingRequest));

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

#[tokio::test]
async fn cost_estimate_delegates_to_the_driver() {
    let (_driver, instance) = common::queued_instance(common::options()).await;
    // The loopback provider has no cost model.
    assert!(instance.cost_estimate().is_none());
    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

#[tokio::test]
async fn configured_rate_limit_gates_dispatch() {
    // Burst of 1 at 20 rps: each call past the first waits ~50 ms for a token.
    let options = common::options().rate_limit(20.0, 1).unwrap();
    let (driver, instance) = common::sync_instance(options).await;
    driver.register("quick", |_args| Ok(json!(null)));

    let start = Instant::now();
    for _ in 0..3 {
        let _: serde_json::Value = instance.invoke("quick", json!([])).await.unwrap();
    }
    assert!(
        start.elapsed() >= Duration::from_millis(80),
        "three dispatches finished in {:?}, rate limit did not gate",
        start.elapsed()
    );

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}

#[tokio::test]
async fn concurrency_limit_batches_queued_calls() {
    let options = common::options().concurrency(2);
    let (driver, instance) = common::queued_instance(options).await;
    driver.register("slow", |_args| Ok(json!(null)));
    driver.handler_delay(Duration::from_millis(50));
    let instance = std::sync::Arc::new(instance);

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..6 {
        let instance = instance.clone();
        handles.push(tokio::spawn(async move {
            instance.invoke_raw("slow", json!([])).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert!(
        start.elapsed() >= Duration::from_millis(140),
        "six 50 ms calls at concurrency 2 finished in {:?}",
        start.elapsed()
    );

    instance.cleanup(CleanupOptions::default()).await.unwrap();
}
