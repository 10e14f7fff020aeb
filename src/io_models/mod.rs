use crate::constants;
use crate::errors::EngineError;
use crate::models::job::{Framework, Job, JobStatus, ResourceRequest};
use crate::models::log::LogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;
const MAX_PATH_LEN: usize = 500;
const MAX_IMAGE_LEN: usize = 500;
const MAX_GPU_TYPE_LEN: usize = 50;

pub const DEFAULT_CPU_COUNT: u32 = 4;
pub const DEFAULT_MEMORY_GB: u32 = 16;
pub const DEFAULT_TIMEOUT_HOURS: u32 = 24;

/// SubmitJobRequest: the JSON shape accepted by the submission endpoint.
/// Optional numeric fields get defaults at normalization time; a blank image
/// is derived from the declared framework.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SubmitJobRequest {
    pub name: String,
    pub description: String,
    pub project_id: Option<Uuid>,
    pub experiment_id: Option<Uuid>,
    pub model_name: String,
    pub dataset_path: String,
    pub output_path: String,
    pub framework: Framework,
    pub image: String,
    pub command: Vec<String>,
    pub hyperparameters: BTreeMap<String, serde_json::Value>,
    pub environment: BTreeMap<String, String>,
    pub gpu_count: u32,
    pub gpu_type: Option<String>,
    pub cpu_count: Option<u32>,
    pub memory_gb: Option<u32>,
    pub timeout_hours: Option<u32>,
}

impl Default for SubmitJobRequest {
    fn default() -> Self {
        SubmitJobRequest {
            name: String::new(),
            description: String::new(),
            project_id: None,
            experiment_id: None,
            model_name: String::new(),
            dataset_path: String::new(),
            output_path: String::new(),
            framework: Framework::Other,
            image: String::new(),
            command: Vec::new(),
            hyperparameters: BTreeMap::new(),
            environment: BTreeMap::new(),
            gpu_count: 0,
            gpu_type: None,
            cpu_count: None,
            memory_gb: None,
            timeout_hours: None,
        }
    }
}

impl SubmitJobRequest {
    /// Validation aborts before any side effect; every violation is an
    /// `InvalidInput` carrying the offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let require_non_empty = |field: &str, value: &str| -> Result<(), EngineError> {
            if value.trim().is_empty() {
                return Err(EngineError::new_invalid_input(format!("`{field}` must not be empty")));
            }
            Ok(())
        };
        let require_max_len = |field: &str, value: &str, max: usize| -> Result<(), EngineError> {
            if value.len() > max {
                return Err(EngineError::new_invalid_input(format!(
                    "`{field}` must not exceed {max} characters"
                )));
            }
            Ok(())
        };

        require_non_empty("name", &self.name)?;
        require_max_len("name", &self.name, MAX_NAME_LEN)?;
        require_max_len("description", &self.description, MAX_DESCRIPTION_LEN)?;
        require_non_empty("model_name", &self.model_name)?;
        require_max_len("model_name", &self.model_name, MAX_NAME_LEN)?;
        require_non_empty("dataset_path", &self.dataset_path)?;
        require_max_len("dataset_path", &self.dataset_path, MAX_PATH_LEN)?;
        require_non_empty("output_path", &self.output_path)?;
        require_max_len("output_path", &self.output_path, MAX_PATH_LEN)?;
        require_max_len("image", &self.image, MAX_IMAGE_LEN)?;

        if self.project_id.is_none() {
            return Err(EngineError::new_invalid_input("`project_id` is required"));
        }

        if let Some(gpu_type) = &self.gpu_type {
            require_max_len("gpu_type", gpu_type, MAX_GPU_TYPE_LEN)?;
        }

        if self.gpu_count > 8 {
            return Err(EngineError::new_invalid_input("`gpu_count` must be within [0, 8]"));
        }
        if let Some(cpu_count) = self.cpu_count {
            if !(1..=64).contains(&cpu_count) {
                return Err(EngineError::new_invalid_input("`cpu_count` must be within [1, 64]"));
            }
        }
        if let Some(memory_gb) = self.memory_gb {
            if !(1..=256).contains(&memory_gb) {
                return Err(EngineError::new_invalid_input("`memory_gb` must be within [1, 256]"));
            }
        }
        if let Some(timeout_hours) = self.timeout_hours {
            if !(1..=168).contains(&timeout_hours) {
                return Err(EngineError::new_invalid_input("`timeout_hours` must be within [1, 168]"));
            }
        }

        Ok(())
    }

    /// The image to run: the user's, or a framework default when blank.
    pub fn effective_image(&self) -> String {
        if !self.image.trim().is_empty() {
            return self.image.clone();
        }
        match self.framework {
            Framework::Pytorch => constants::DEFAULT_PYTORCH_IMAGE.to_string(),
            Framework::Tensorflow => constants::DEFAULT_TENSORFLOW_IMAGE.to_string(),
            Framework::Other => constants::DEFAULT_GENERIC_IMAGE.to_string(),
        }
    }

    /// Builds the persisted job: defaults filled, standardized env vars
    /// injected, status pending, queued now.
    pub fn into_job(self, user_id: Uuid) -> Job {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let project_id = self.project_id.unwrap_or_default();
        let image = self.effective_image();

        let mut environment = self.environment.clone();
        environment.insert(constants::ENV_JOB_ID.to_string(), id.to_string());
        environment.insert(constants::ENV_PROJECT_ID.to_string(), project_id.to_string());
        environment.insert(constants::ENV_MODEL_NAME.to_string(), self.model_name.clone());
        environment.insert(
            constants::ENV_DATASET_PATH.to_string(),
            constants::DATASET_MOUNT_PATH.to_string(),
        );
        environment.insert(
            constants::ENV_OUTPUT_PATH.to_string(),
            constants::OUTPUT_MOUNT_PATH.to_string(),
        );
        environment.insert(
            constants::ENV_HYPERPARAMETERS.to_string(),
            serde_json::to_string(&self.hyperparameters).unwrap_or_else(|_| "{}".to_string()),
        );

        Job {
            id,
            name: self.name,
            description: self.description,
            project_id,
            experiment_id: self.experiment_id,
            user_id,
            model_name: self.model_name,
            framework: self.framework,
            image,
            command: self.command,
            hyperparameters: self.hyperparameters,
            environment,
            dataset_path: self.dataset_path,
            output_path: self.output_path,
            resources: ResourceRequest {
                gpu_count: self.gpu_count,
                gpu_type: self.gpu_type,
                cpu_count: self.cpu_count.unwrap_or(DEFAULT_CPU_COUNT),
                memory_gb: self.memory_gb.unwrap_or(DEFAULT_MEMORY_GB),
            },
            timeout_hours: self.timeout_hours.unwrap_or(DEFAULT_TIMEOUT_HOURS),
            status: JobStatus::Pending,
            status_message: None,
            progress: 0.0,
            queued_at: Some(now),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// UpdateJobRequest: partial update, refused while the job is running.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub hyperparameters: Option<BTreeMap<String, serde_json::Value>>,
    pub environment: Option<BTreeMap<String, String>>,
    pub timeout_hours: Option<u32>,
}

impl UpdateJobRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
                return Err(EngineError::new_invalid_input(format!(
                    "`name` must be non empty and not exceed {MAX_NAME_LEN} characters"
                )));
            }
        }
        if let Some(description) = &self.description {
            if description.len() > MAX_DESCRIPTION_LEN {
                return Err(EngineError::new_invalid_input(format!(
                    "`description` must not exceed {MAX_DESCRIPTION_LEN} characters"
                )));
            }
        }
        if let Some(timeout_hours) = self.timeout_hours {
            if !(1..=168).contains(&timeout_hours) {
                return Err(EngineError::new_invalid_input("`timeout_hours` must be within [1, 168]"));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, job: &mut Job) {
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(hyperparameters) = &self.hyperparameters {
            job.hyperparameters = hyperparameters.clone();
        }
        if let Some(environment) = &self.environment {
            job.environment.extend(environment.clone());
        }
        if let Some(timeout_hours) = self.timeout_hours {
            job.timeout_hours = timeout_hours;
        }
        job.updated_at = Utc::now();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(default)]
pub struct StopJobRequest {
    pub force: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ListJobsQuery {
    pub project_id: Option<Uuid>,
    pub experiment_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListJobsQuery {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(page) = self.page {
            if page < 1 {
                return Err(EngineError::new_invalid_input("`page` must be >= 1"));
            }
        }
        if let Some(page_size) = self.page_size {
            if !(1..=100).contains(&page_size) {
                return Err(EngineError::new_invalid_input("`page_size` must be within [1, 100]"));
            }
        }
        Ok(())
    }

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(20)
    }
}

/// JobPage: one page of the job listing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// LogStreamEvent: the text event stream emitted by log streaming. `log`
/// events carry entries; a final `end` event closes the stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LogStreamEvent {
    Log(LogEntry),
    End { job_id: Uuid, status: JobStatus, at: DateTime<Utc> },
}
