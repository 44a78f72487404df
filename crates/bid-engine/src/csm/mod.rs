//! Client-side metrics: records, the sending queue and its consumer.

pub mod consumer;
pub mod metric;
pub mod queue;

pub use consumer::MetricConsumer;
pub use metric::{Metric, MetricBuilder, MetricRequest};
pub use queue::{MetricQueue, QueueStats, QueueStatsSnapshot};
