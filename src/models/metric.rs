use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Loss,
    Accuracy,
    ValLoss,
    ValAccuracy,
    LearningRate,
    Custom,
}

/// TrainingSample: everything the parser extracted from a single log line.
/// Fields are optional because trainers print what they please; epoch and
/// step keep `Some(0)` distinct from absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TrainingSample {
    pub loss: Option<f64>,
    pub accuracy: Option<f64>,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub learning_rate: Option<f64>,
    pub epoch: Option<u64>,
    pub step: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, f64>,
}

impl TrainingSample {
    pub fn is_empty(&self) -> bool {
        self.loss.is_none()
            && self.accuracy.is_none()
            && self.val_loss.is_none()
            && self.val_accuracy.is_none()
            && self.learning_rate.is_none()
            && self.epoch.is_none()
            && self.step.is_none()
            && self.custom.is_empty()
    }

    /// True when at least one numeric metric value is present (epoch/step
    /// alone position a sample in time but carry no value to persist).
    pub fn has_values(&self) -> bool {
        self.loss.is_some()
            || self.accuracy.is_some()
            || self.val_loss.is_some()
            || self.val_accuracy.is_some()
            || self.learning_rate.is_some()
            || !self.custom.is_empty()
    }
}

/// MetricRecord: one persisted metric row, indexed by `(job_id, timestamp)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metric_type: MetricKind,
    pub epoch: Option<u64>,
    pub step: Option<u64>,
    pub value: f64,
    /// Custom metrics carry their name here under the `name` key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(job_id: Uuid, timestamp: DateTime<Utc>, metric_type: MetricKind, value: f64) -> Self {
        MetricRecord {
            job_id,
            timestamp,
            metric_type,
            epoch: None,
            step: None,
            value,
            tags: BTreeMap::new(),
        }
    }
}

/// Expands a sample into one record per present value field, all stamped with
/// the same timestamp and the sample's epoch/step.
pub fn records_from_sample(job_id: Uuid, timestamp: DateTime<Utc>, sample: &TrainingSample) -> Vec<MetricRecord> {
    let mut records = Vec::new();
    let mut push = |metric_type: MetricKind, value: f64| {
        let mut record = MetricRecord::new(job_id, timestamp, metric_type, value);
        record.epoch = sample.epoch;
        record.step = sample.step;
        records.push(record);
    };

    if let Some(value) = sample.loss {
        push(MetricKind::Loss, value);
    }
    if let Some(value) = sample.accuracy {
        push(MetricKind::Accuracy, value);
    }
    if let Some(value) = sample.val_loss {
        push(MetricKind::ValLoss, value);
    }
    if let Some(value) = sample.val_accuracy {
        push(MetricKind::ValAccuracy, value);
    }
    if let Some(value) = sample.learning_rate {
        push(MetricKind::LearningRate, value);
    }
    for (name, value) in &sample.custom {
        let mut record = MetricRecord::new(job_id, timestamp, MetricKind::Custom, *value);
        record.epoch = sample.epoch;
        record.step = sample.step;
        record.tags.insert("name".to_string(), name.clone());
        records.push(record);
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_from_sample_one_record_per_field() {
        let sample = TrainingSample {
            loss: Some(0.5),
            accuracy: Some(0.9),
            epoch: Some(0),
            ..Default::default()
        };
        let records = records_from_sample(Uuid::new_v4(), Utc::now(), &sample);

        assert_eq!(records.len(), 2);
        // epoch zero must survive, not be dropped as "absent"
        assert!(records.iter().all(|r| r.epoch == Some(0)));
        assert!(records.iter().any(|r| r.metric_type == MetricKind::Loss && r.value == 0.5));
        assert!(records.iter().any(|r| r.metric_type == MetricKind::Accuracy && r.value == 0.9));
    }

    #[test]
    fn test_custom_metric_carries_name_tag() {
        let mut sample = TrainingSample::default();
        sample.custom.insert("f1_score".to_string(), 0.87);
        let records = records_from_sample(Uuid::new_v4(), Utc::now(), &sample);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metric_type, MetricKind::Custom);
        assert_eq!(records[0].tags.get("name"), Some(&"f1_score".to_string()));
    }
}
