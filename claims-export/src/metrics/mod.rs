//! Metrics publishing.
//!
//! The worker pool publishes the queue-depth gauge after each processed
//! entry. The sink is a trait so deployments can forward gauges to their
//! monitoring transport; the default emits structured tracing events, which
//! the log pipeline scrapes.

use async_trait::async_trait;
use tracing::info;

use crate::Result;

/// Gauge name for outstanding queue depth.
pub const JOB_QUEUE_COUNT: &str = "JobQueueCount";

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put_gauge(&self, name: &str, value: f64, dimensions: &[(&str, &str)]) -> Result<()>;
}

/// Default sink: structured log events.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn put_gauge(&self, name: &str, value: f64, dimensions: &[(&str, &str)]) -> Result<()> {
        info!(target: "claims_export::metrics", gauge = name, value, ?dimensions);
        Ok(())
    }
}
