use crate::io_models::{JobPage, ListJobsQuery};
use crate::models::job::{Job, JobStatus};
use crate::models::metric::MetricRecord;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found: {id}")]
    NotFound { id: Uuid },

    #[error("storage error: {raw_error_message}")]
    Storage { raw_error_message: String },
}

/// JobRepository: persistent store for jobs. The core owns state transitions;
/// the repository owns durability.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Job, RepositoryError>;

    async fn update(&self, job: &Job) -> Result<(), RepositoryError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError>;

    async fn list(&self, query: &ListJobsQuery) -> Result<JobPage, RepositoryError>;

    /// Atomic status transition. Sets `started_at` on running, `completed_at`
    /// on terminal states, `updated_at` always.
    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<(), RepositoryError>;
}

/// MetricRepository: persisted training metric rows, indexed by
/// `(job_id, timestamp)`.
#[async_trait]
pub trait MetricRepository: Send + Sync {
    async fn insert_batch(&self, records: &[MetricRecord]) -> Result<(), RepositoryError>;

    async fn series(&self, job_id: Uuid) -> Result<Vec<MetricRecord>, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job, RepositoryError> {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(&id).cloned().ok_or(RepositoryError::NotFound { id })
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !jobs.contains_key(&job.id) {
            return Err(RepositoryError::NotFound { id: job.id });
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.remove(&id).map(|_| ()).ok_or(RepositoryError::NotFound { id })
    }

    async fn list(&self, query: &ListJobsQuery) -> Result<JobPage, RepositoryError> {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut items: Vec<Job> = jobs
            .values()
            .filter(|job| query.project_id.map(|id| job.project_id == id).unwrap_or(true))
            .filter(|job| query.experiment_id.map(|id| job.experiment_id == Some(id)).unwrap_or(true))
            .filter(|job| query.status.map(|status| job.status == status).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = items.len() as u64;
        let page = query.page();
        let page_size = query.page_size();
        let offset = ((page - 1) as usize).saturating_mul(page_size as usize);
        let items = items.into_iter().skip(offset).take(page_size as usize).collect();

        Ok(JobPage {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound { id })?;

        let now = Utc::now();
        if job.status == status {
            // idempotent re-application (e.g. a stop racing the watcher)
            if message.is_some() {
                job.status_message = message;
                job.updated_at = now;
            }
            return Ok(());
        }
        if !job.status.can_transition_to(status) {
            return Err(RepositoryError::Storage {
                raw_error_message: format!("illegal status transition {} -> {} for job {}", job.status, status, id),
            });
        }
        job.status = status;
        if message.is_some() {
            job.status_message = message;
        }
        match status {
            JobStatus::Running => {
                if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                if job.completed_at.is_none() {
                    job.completed_at = Some(now);
                }
            }
            _ => {}
        }
        job.updated_at = now;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: f32) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let job = jobs.get_mut(&id).ok_or(RepositoryError::NotFound { id })?;
        // progress never goes backwards within a run
        if progress > job.progress {
            job.progress = progress.clamp(0.0, 100.0);
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMetricRepository {
    records: RwLock<HashMap<Uuid, Vec<MetricRecord>>>,
}

impl InMemoryMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricRepository for InMemoryMetricRepository {
    async fn insert_batch(&self, records: &[MetricRecord]) -> Result<(), RepositoryError> {
        let mut store = self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for record in records {
            store.entry(record.job_id).or_default().push(record.clone());
        }
        Ok(())
    }

    async fn series(&self, job_id: Uuid) -> Result<Vec<MetricRecord>, RepositoryError> {
        let store = self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut series = store.get(&job_id).cloned().unwrap_or_default();
        series.sort_by_key(|record| record.timestamp);
        Ok(series)
    }
}
