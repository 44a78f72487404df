//! Integration tests for the client-side metrics pipeline.
//!
//! These tests verify:
//! - Failed or crashed sends put every polled metric back
//! - Nothing is delivered twice once a send succeeds
//! - Remote config can disable metrics
//! - Lifecycle events produce one metric per slot

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::runtime::Handle;
use tokio::sync::Barrier;

use bid_common::{PlacementKey, RemoteConfig};
use bid_engine::api::scripted::Reply;
use bid_engine::{
    BidEngine, ConfigDelta, EngineConfig, FetchSettings, GlobalFetchState, ManualClock, Metric,
    MetricConsumer, MetricQueue, ScriptedBidApi,
};

fn metrics(count: usize) -> Vec<Metric> {
    (0..count)
        .map(|i| {
            Metric::builder(format!("imp-{}", i))
                .placement_id("p1")
                .cdb_call_start(1_000 + i as i64)
                .build()
        })
        .collect()
}

fn multiset(metrics: &[Metric]) -> HashMap<Metric, usize> {
    let mut counts = HashMap::new();
    for metric in metrics {
        *counts.entry(metric.clone()).or_insert(0) += 1;
    }
    counts
}

fn consumer(queue: Arc<MetricQueue>, api: Arc<ScriptedBidApi>, batch_size: u32) -> MetricConsumer {
    let state = Arc::new(GlobalFetchState::new(
        FetchSettings::initial(true, batch_size),
        Arc::new(ManualClock::new(0)),
    ));
    MetricConsumer::new(queue, api, state, "1.0.0".to_string(), 235, Handle::current())
}

#[tokio::test]
async fn test_failed_send_restores_queue_multiset() {
    let queue = Arc::new(MetricQueue::new(64));
    let api = Arc::new(ScriptedBidApi::new());
    api.push_metrics(Reply::Status(503));
    let consumer = consumer(queue.clone(), api.clone(), 4);

    let originals = metrics(10);
    for metric in originals.clone() {
        queue.offer(metric);
    }

    consumer.send_metric_batch().unwrap().await.unwrap();

    let remaining = queue.poll(usize::MAX);
    assert_eq!(multiset(&remaining), multiset(&originals));
    assert!(api.sent_metrics().is_empty());
    assert_eq!(queue.stats().rolled_back, 4);
}

#[tokio::test]
async fn test_crashed_send_restores_queue_multiset() {
    let queue = Arc::new(MetricQueue::new(64));
    let api = Arc::new(ScriptedBidApi::new());
    api.push_metrics(Reply::Panic);
    let consumer = consumer(queue.clone(), api.clone(), 10);

    let originals = metrics(6);
    for metric in originals.clone() {
        queue.offer(metric);
    }

    // The crash stays inside the send task
    consumer.send_metric_batch().unwrap().await.unwrap();

    assert_eq!(queue.len(), 6);
    assert_eq!(multiset(&queue.poll(usize::MAX)), multiset(&originals));
}

#[tokio::test]
async fn test_retry_after_failure_delivers_each_metric_once() {
    let queue = Arc::new(MetricQueue::new(64));
    let api = Arc::new(ScriptedBidApi::new());
    api.push_metrics(Reply::Unavailable);
    let consumer = consumer(queue.clone(), api.clone(), 100);

    let originals = metrics(7);
    for metric in originals.clone() {
        queue.offer(metric);
    }

    consumer.send_metric_batch().unwrap().await.unwrap();
    consumer.send_metric_batch().unwrap().await.unwrap();
    // Empty queue: no call
    consumer.send_metric_batch().unwrap().await.unwrap();

    assert_eq!(api.metric_calls(), 2);
    assert_eq!(multiset(&api.sent_metrics()), multiset(&originals));
    assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_never_duplicate() {
    let queue = Arc::new(MetricQueue::new(256));
    let api = Arc::new(ScriptedBidApi::new());
    api.set_delay(Some(Duration::from_millis(5)));
    let consumer = Arc::new(consumer(queue.clone(), api.clone(), 8));

    let originals = metrics(64);
    for metric in originals.clone() {
        queue.offer(metric);
    }

    let senders = 8;
    let barrier = Arc::new(Barrier::new(senders));
    let tasks: Vec<_> = (0..senders)
        .map(|_| {
            let consumer = consumer.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                if let Some(send) = consumer.send_metric_batch() {
                    send.await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(multiset(&api.sent_metrics()), multiset(&originals));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_engine_records_metric_per_fetched_slot() {
    let mut config = EngineConfig::default();
    config.publisher.publisher_id = "B-000042".to_string();
    config.placements = vec![
        PlacementKey::banner("p1", 320, 50),
        PlacementKey::banner("p2", 300, 250),
        PlacementKey::native("n1"),
    ];
    let api = Arc::new(ScriptedBidApi::auto_bidding(dec!(1), 60));
    let engine = BidEngine::with_parts(
        config,
        api.clone(),
        Arc::new(ManualClock::new(5_000)),
        Vec::new(),
        Handle::current(),
    );

    engine.prefetch_registered().unwrap().await.unwrap();
    assert_eq!(engine.pending_metrics(), 3);

    engine.send_metrics().unwrap().await.unwrap();
    let sent = api.sent_metrics();
    assert_eq!(sent.len(), 3);
    for metric in &sent {
        assert_eq!(metric.cdb_call_start_ms, Some(5_000));
        assert_eq!(metric.cdb_call_end_ms, Some(5_000));
        assert!(!metric.cdb_call_timeout);
        assert!(!metric.network_exception);
    }
}

#[tokio::test]
async fn test_remote_config_disables_metrics() {
    let mut config = EngineConfig::default();
    config.publisher.publisher_id = "B-000042".to_string();
    config.placements = vec![PlacementKey::banner("p1", 320, 50)];
    let api = Arc::new(ScriptedBidApi::auto_bidding(dec!(1), 60));
    api.push_config(Reply::Ok(RemoteConfig {
        csm_enabled: Some(false),
        ..Default::default()
    }));
    let engine = BidEngine::with_parts(
        config,
        api.clone(),
        Arc::new(ManualClock::new(0)),
        Vec::new(),
        Handle::current(),
    );

    engine.prefetch_registered().unwrap().await.unwrap();
    assert!(!engine.settings().csm_enabled);
    assert_eq!(engine.pending_metrics(), 0);

    // Manually reported metrics stay queued but are not sent
    engine.report_metric(Metric::builder("manual").build());
    assert!(engine.send_metrics().is_none());
    assert_eq!(engine.pending_metrics(), 1);

    engine.on_config_refresh(&ConfigDelta {
        csm_enabled: Some(true),
        ..Default::default()
    });
    engine.send_metrics().unwrap().await.unwrap();
    assert_eq!(api.sent_metrics().len(), 1);
}
