use crate::metrics::hub::MetricsHub;
use crate::models::metric::{records_from_sample, TrainingSample};
use crate::repository::{MetricRepository, RepositoryError};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// MetricSink: persistence and fan-out for parsed training samples, kept
/// independent. A sample counts as delivered once persisted; broadcast is
/// best-effort on top and never blocks or fails the persist path.
pub struct MetricSink {
    metric_repository: Arc<dyn MetricRepository>,
    hub: Arc<MetricsHub>,
    batch_size: usize,
}

impl MetricSink {
    pub fn new(metric_repository: Arc<dyn MetricRepository>, hub: Arc<MetricsHub>, batch_size: usize) -> Self {
        MetricSink {
            metric_repository,
            hub,
            batch_size,
        }
    }

    pub fn hub(&self) -> &Arc<MetricsHub> {
        &self.hub
    }

    /// Persists the sample (one record per present field, batched), then fans
    /// it out to live subscribers.
    pub async fn record(&self, job_id: Uuid, sample: &TrainingSample) -> Result<(), RepositoryError> {
        let records = records_from_sample(job_id, Utc::now(), sample);
        for chunk in records.chunks(self.batch_size.max(1)) {
            self.metric_repository.insert_batch(chunk).await?;
        }

        match serde_json::to_value(sample) {
            Ok(payload) => self.hub.broadcast(job_id, "metrics", payload),
            Err(err) => error!("cannot encode metric sample for job {}: {}", job_id, err),
        }

        Ok(())
    }

    /// Broadcast-only path used by the resource sampler; nothing is persisted.
    pub fn publish_stats(&self, job_id: Uuid, payload: serde_json::Value) {
        self.hub.broadcast(job_id, "stats", payload);
    }
}
