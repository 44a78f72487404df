//! Metric queue consumer.
//!
//! Each send polls a batch (destructively), posts it, and re-offers the batch
//! if the post fails or panics. A metric that was sent successfully is never
//! put back. Failures are logged and never reach the caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::metric::MetricRequest;
use super::queue::MetricQueue;
use crate::api::BidApi;
use crate::state::GlobalFetchState;

pub struct MetricConsumer {
    queue: Arc<MetricQueue>,
    api: Arc<dyn BidApi>,
    state: Arc<GlobalFetchState>,
    sdk_version: String,
    profile_id: i32,
    runtime: Handle,
}

impl MetricConsumer {
    pub fn new(
        queue: Arc<MetricQueue>,
        api: Arc<dyn BidApi>,
        state: Arc<GlobalFetchState>,
        sdk_version: String,
        profile_id: i32,
        runtime: Handle,
    ) -> Self {
        Self {
            queue,
            api,
            state,
            sdk_version,
            profile_id,
            runtime,
        }
    }

    /// Send one batch in the background.
    ///
    /// Returns `None` when metrics are disabled by the remote config. The
    /// returned task never fails; awaiting it is only useful to know the send
    /// is over.
    pub fn send_metric_batch(&self) -> Option<JoinHandle<()>> {
        let settings = self.state.snapshot();
        if !settings.csm_enabled {
            debug!("Metrics disabled, skipping send");
            return None;
        }

        let queue = self.queue.clone();
        let api = self.api.clone();
        let sdk_version = self.sdk_version.clone();
        let profile_id = self.profile_id;
        let batch_size = settings.csm_batch_size as usize;

        Some(self.runtime.spawn(async move {
            send_batch(queue, api, sdk_version, profile_id, batch_size).await;
        }))
    }

    /// Send a batch every `period` until shutdown, then send a final batch.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut flush_timer = interval(period);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        flush_timer.tick().await;

        info!(period_ms = period.as_millis() as u64, "Metric consumer started");

        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    self.send_metric_batch();
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, performing final metric send");
                    if let Some(task) = self.send_metric_batch() {
                        let _ = task.await;
                    }
                    break;
                }
            }
        }

        let stats = self.queue.stats();
        info!(
            offered = stats.offered,
            polled = stats.polled,
            dropped = stats.dropped,
            rolled_back = stats.rolled_back,
            pending = self.queue.len(),
            "Metric consumer stopped"
        );
    }
}

async fn send_batch(
    queue: Arc<MetricQueue>,
    api: Arc<dyn BidApi>,
    sdk_version: String,
    profile_id: i32,
    batch_size: usize,
) {
    let metrics = queue.poll(batch_size);
    if metrics.is_empty() {
        return;
    }

    let count = metrics.len();
    let request = MetricRequest::new(metrics, sdk_version, profile_id);
    let result = AssertUnwindSafe(api.post_metrics(&request))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => debug!(count, "Metrics sent"),
        Ok(Err(e)) => {
            warn!(count, error = %e, "Metric send failed, rolling back");
            queue.rollback(request.feedbacks);
        }
        Err(_) => {
            warn!(count, "Metric send panicked, rolling back");
            queue.rollback(request.feedbacks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScriptedBidApi;
    use crate::api::scripted::Reply;
    use crate::clock::ManualClock;
    use crate::csm::Metric;
    use crate::state::{ConfigDelta, FetchSettings};

    struct Fixture {
        queue: Arc<MetricQueue>,
        api: Arc<ScriptedBidApi>,
        state: Arc<GlobalFetchState>,
        consumer: Arc<MetricConsumer>,
    }

    fn fixture(batch_size: u32) -> Fixture {
        let queue = Arc::new(MetricQueue::new(100));
        let api = Arc::new(ScriptedBidApi::new());
        let state = Arc::new(GlobalFetchState::new(
            FetchSettings::initial(true, batch_size),
            Arc::new(ManualClock::new(0)),
        ));
        let consumer = Arc::new(MetricConsumer::new(
            queue.clone(),
            api.clone(),
            state.clone(),
            "1.0.0".to_string(),
            235,
            Handle::current(),
        ));
        Fixture {
            queue,
            api,
            state,
            consumer,
        }
    }

    fn fill(queue: &MetricQueue, n: usize) -> Vec<Metric> {
        let metrics: Vec<Metric> = (0..n)
            .map(|i| Metric::builder(format!("imp-{}", i)).build())
            .collect();
        for metric in &metrics {
            queue.offer(metric.clone());
        }
        metrics
    }

    fn sorted_ids(metrics: &[Metric]) -> Vec<String> {
        let mut ids: Vec<String> = metrics.iter().map(|m| m.impression_id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_successful_send_removes_batch() {
        let f = fixture(2);
        fill(&f.queue, 3);

        f.consumer.send_metric_batch().unwrap().await.unwrap();

        assert_eq!(f.queue.len(), 1);
        assert_eq!(sorted_ids(&f.api.sent_metrics()), vec!["imp-0", "imp-1"]);
        assert_eq!(f.queue.stats().rolled_back, 0);
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_everything() {
        let f = fixture(10);
        let before = fill(&f.queue, 4);
        f.api.push_metrics(Reply::Status(503));

        f.consumer.send_metric_batch().unwrap().await.unwrap();

        assert!(f.api.sent_metrics().is_empty());
        let after = f.queue.poll(100);
        assert_eq!(sorted_ids(&after), sorted_ids(&before));
        assert_eq!(f.queue.stats().rolled_back, 4);
    }

    #[tokio::test]
    async fn test_panicking_send_rolls_back() {
        let f = fixture(10);
        let before = fill(&f.queue, 2);
        f.api.push_metrics(Reply::Panic);

        // The task itself completes normally
        f.consumer.send_metric_batch().unwrap().await.unwrap();

        assert_eq!(sorted_ids(&f.queue.poll(100)), sorted_ids(&before));
    }

    #[tokio::test]
    async fn test_empty_queue_makes_no_call() {
        let f = fixture(10);
        f.consumer.send_metric_batch().unwrap().await.unwrap();
        assert_eq!(f.api.metric_calls(), 0);
    }

    #[tokio::test]
    async fn test_disabled_by_remote_config() {
        let f = fixture(10);
        fill(&f.queue, 2);
        f.state.apply(&ConfigDelta {
            csm_enabled: Some(false),
            ..Default::default()
        });

        assert!(f.consumer.send_metric_batch().is_none());
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.api.metric_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_batch_size_applies() {
        let f = fixture(10);
        fill(&f.queue, 5);
        f.state.apply(&ConfigDelta {
            csm_batch_size: Some(3),
            ..Default::default()
        });

        f.consumer.send_metric_batch().unwrap().await.unwrap();
        assert_eq!(f.api.sent_metrics().len(), 3);
        assert_eq!(f.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_sent_metrics_are_never_resent() {
        let f = fixture(1);
        fill(&f.queue, 3);
        f.api.push_metrics(Reply::Unavailable);

        for _ in 0..5 {
            f.consumer.send_metric_batch().unwrap().await.unwrap();
        }

        // One failed attempt, then each metric exactly once
        assert_eq!(f.api.metric_calls(), 4);
        assert_eq!(
            sorted_ids(&f.api.sent_metrics()),
            vec!["imp-0", "imp-1", "imp-2"]
        );
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let f = fixture(10);
        fill(&f.queue, 2);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(
            f.consumer
                .clone()
                .run(Duration::from_secs(3600), shutdown_rx),
        );

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(f.api.sent_metrics().len(), 2);
        assert!(f.queue.is_empty());
    }
}
