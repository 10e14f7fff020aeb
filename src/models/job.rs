use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use strum_macros::EnumString;
use uuid::Uuid;

/// Framework: the training framework declared at submission. Drives the
/// default image when the request leaves it blank.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash, EnumString, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Framework {
    Pytorch,
    Tensorflow,
    #[default]
    Other,
}

impl Display for Framework {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Framework::Pytorch => f.write_str("pytorch"),
            Framework::Tensorflow => f.write_str("tensorflow"),
            Framework::Other => f.write_str("other"),
        }
    }
}

/// JobStatus: `completed`, `failed` and `cancelled` are terminal and are
/// entered exactly once. `stopping` is transient, on operator request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Legal lifecycle moves. `cancelled` may follow `pending` directly,
    /// without visiting `running`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Stopping | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Stopping | JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Stopping => matches!(next, JobStatus::Cancelled | JobStatus::Failed | JobStatus::Completed),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stopping => "stopping",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceRequest {
    pub gpu_count: u32,
    pub gpu_type: Option<String>,
    pub cpu_count: u32,
    pub memory_gb: u32,
}

impl ResourceRequest {
    pub fn nano_cpus(&self) -> i64 {
        self.cpu_count as i64 * 1_000_000_000
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_gb as i64 * (1 << 30)
    }
}

/// Job: one user-submitted training run, one-to-one with a container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub project_id: Uuid,
    pub experiment_id: Option<Uuid>,
    pub user_id: Uuid,
    pub model_name: String,
    pub framework: Framework,
    pub image: String,
    pub command: Vec<String>,
    /// Use BTreeMap to keep a deterministic env var ordering in containers.
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    pub environment: BTreeMap<String, String>,
    pub dataset_path: String,
    pub output_path: String,
    pub resources: ResourceRequest,
    pub timeout_hours: u32,
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub progress: f32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn short_id(&self) -> String {
        crate::to_short_id(&self.id)
    }

    /// Total epochs declared in hyperparameters, when the user provided one.
    /// Used to derive progress from parsed epoch samples.
    pub fn declared_epochs(&self) -> Option<u64> {
        ["epochs", "num_epochs"]
            .iter()
            .find_map(|key| self.hyperparameters.get(*key))
            .and_then(|value| match value {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.parse::<u64>().ok(),
                _ => None,
            })
    }
}
