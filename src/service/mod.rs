use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::executor::Executor;
use crate::io_models::{
    JobPage, ListJobsQuery, LogStreamEvent, StopJobRequest, SubmitJobRequest, UpdateJobRequest,
};
use crate::log_store::LogStore;
use crate::metrics::{MetricsHub, Subscription};
use crate::models::job::{Job, JobStatus};
use crate::models::log::LogEntry;
use crate::repository::JobRepository;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const STREAM_HISTORY_LIMIT: usize = 100;

/// JobService: the only entry point into the core. Accepts submissions,
/// orchestrates state transitions and owns the read paths for logs and live
/// metrics. Cheap to clone.
#[derive(Clone)]
pub struct JobService {
    job_repository: Arc<dyn JobRepository>,
    log_store: Arc<dyn LogStore>,
    executor: Executor,
    hub: Arc<MetricsHub>,
    config: Arc<EngineConfig>,
}

impl JobService {
    pub fn new(
        job_repository: Arc<dyn JobRepository>,
        log_store: Arc<dyn LogStore>,
        executor: Executor,
        hub: Arc<MetricsHub>,
        config: Arc<EngineConfig>,
    ) -> Self {
        JobService {
            job_repository,
            log_store,
            executor,
            hub,
            config,
        }
    }

    /// Validates and persists the submission, then returns immediately; the
    /// container start happens asynchronously.
    pub async fn submit(&self, user_id: Uuid, request: SubmitJobRequest) -> Result<Job, EngineError> {
        request.validate()?;
        let job = request.into_job(user_id);
        self.job_repository.insert(&job).await?;

        self.append_system_log(job.id, format!("Job `{}` accepted and queued for execution", job.name))
            .await;
        info!("job {} ({}) submitted by user {}", job.id, job.name, user_id);

        let service = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            service.start_job(job_id).await;
        });

        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, EngineError> {
        Ok(self.job_repository.get(id).await?)
    }

    pub async fn list(&self, query: ListJobsQuery) -> Result<JobPage, EngineError> {
        query.validate()?;
        Ok(self.job_repository.list(&query).await?)
    }

    /// Refused while the job runs; a running training cannot be reconfigured.
    pub async fn update(&self, id: Uuid, request: UpdateJobRequest) -> Result<Job, EngineError> {
        request.validate()?;
        let mut job = self.job_repository.get(id).await?;
        if job.status == JobStatus::Running {
            return Err(EngineError::new_conflict_state(format!(
                "job {id} is running and cannot be updated"
            )));
        }

        request.apply_to(&mut job);
        self.job_repository.update(&job).await?;
        Ok(job)
    }

    /// Deleting a live job forces a stop first.
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        let job = self.job_repository.get(id).await?;
        if !job.status.is_terminal() {
            if let Err(err) = self.stop(id, StopJobRequest { force: true }).await {
                warn!("cannot stop job {} before deletion: {}", id, err);
            }
        }
        self.job_repository.delete(id).await?;
        Ok(())
    }

    /// Stops a pending or running job. Errors from the container runtime are
    /// logged but never block the transition to `cancelled`.
    pub async fn stop(&self, id: Uuid, request: StopJobRequest) -> Result<Job, EngineError> {
        let job = self.job_repository.get(id).await?;
        match job.status {
            JobStatus::Pending | JobStatus::Running => {}
            JobStatus::Stopping => return Ok(job), // stop is idempotent
            status => {
                return Err(EngineError::new_conflict_state(format!(
                    "job {id} is already {status} and cannot be stopped"
                )));
            }
        }

        self.job_repository.update_status(id, JobStatus::Stopping, None).await?;

        match self.executor.stop(id, request.force).await {
            Ok(true) => {}
            Ok(false) => {
                // no live handle: either never started or this service restarted
                match self.executor.stop_orphaned_containers(id).await {
                    Ok(0) => {}
                    Ok(stopped) => info!("stopped {} orphaned container(s) of job {}", stopped, id),
                    Err(err) => warn!("orphan stop of job {} failed: {}", id, err),
                }
            }
            Err(err) => warn!("cannot stop container of job {}: {}", id, err),
        }

        self.job_repository
            .update_status(id, JobStatus::Cancelled, Some("Stopped by user".to_string()))
            .await?;
        self.append_system_log(id, "Stopped by user".to_string()).await;

        Ok(self.job_repository.get(id).await?)
    }

    /// Paged read of the job's log stream.
    pub async fn get_logs(&self, id: Uuid, start_cursor: u64, count: usize) -> Result<(Vec<LogEntry>, u64), EngineError> {
        self.job_repository.get(id).await?;
        self.log_store
            .range(id, start_cursor, count)
            .await
            .map_err(|err| EngineError::new_internal("cannot read job logs", Some(err.to_string())))
    }

    /// Streams the job's log as an event stream into `sender`: history first
    /// (up to 100 entries), then a blocking tail until the job leaves the
    /// running states, one final drain, and an `end` event.
    pub async fn stream_logs(&self, id: Uuid, sender: mpsc::Sender<LogStreamEvent>) -> Result<(), EngineError> {
        self.job_repository.get(id).await?;

        let (history, mut cursor) = self
            .log_store
            .range(id, 0, STREAM_HISTORY_LIMIT)
            .await
            .map_err(|err| EngineError::new_internal("cannot read job logs", Some(err.to_string())))?;
        for entry in history {
            if sender.send(LogStreamEvent::Log(entry)).await.is_err() {
                return Ok(()); // subscriber went away
            }
        }

        loop {
            let job = match self.job_repository.get(id).await {
                Ok(job) => job,
                Err(_) => break, // job deleted mid-stream
            };
            let terminal = job.status.is_terminal();

            let (entries, next_cursor) = match self.log_store.tail(id, cursor, self.config.log_tail_timeout).await {
                Ok(result) => result,
                Err(err) => {
                    warn!("log tail of job {} failed: {}", id, err);
                    break;
                }
            };
            cursor = next_cursor;
            for entry in entries {
                if sender.send(LogStreamEvent::Log(entry)).await.is_err() {
                    return Ok(());
                }
            }

            if terminal {
                // one final drain for entries appended while we were sending
                if let Ok((entries, next_cursor)) = self.log_store.range(id, cursor, usize::MAX).await {
                    cursor = next_cursor;
                    for entry in entries {
                        if sender.send(LogStreamEvent::Log(entry)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                let _ = sender
                    .send(LogStreamEvent::End {
                        job_id: id,
                        status: job.status,
                        at: chrono::Utc::now(),
                    })
                    .await;
                break;
            }
        }

        Ok(())
    }

    /// Live metric subscription for one job; envelopes are JSON strings.
    pub async fn subscribe_metrics(&self, id: Uuid) -> Result<Subscription, EngineError> {
        self.job_repository.get(id).await?;
        Ok(self.hub.subscribe(id))
    }

    /// Asynchronous start path: waits the settle delay so the submit write is
    /// visible, moves the job to running and hands it to the executor, then
    /// watches for completion.
    async fn start_job(&self, id: Uuid) {
        tokio::time::sleep(self.config.start_settle_delay).await;

        let job = match self.job_repository.get(id).await {
            Ok(job) => job,
            Err(err) => {
                error!("cannot reload job {} for start: {}", id, err);
                return;
            }
        };
        if job.status != JobStatus::Pending {
            info!("job {} is {} and will not be started", id, job.status);
            return;
        }

        if let Err(err) = self.job_repository.update_status(id, JobStatus::Running, None).await {
            error!("cannot move job {} to running: {}", id, err);
            return;
        }
        self.append_system_log(id, format!("Starting training with image `{}`", job.image))
            .await;

        let job = match self.job_repository.get(id).await {
            Ok(job) => job,
            Err(err) => {
                error!("cannot reload job {}: {}", id, err);
                return;
            }
        };

        if let Err(err) = self.executor.start(&job).await {
            let message = err.user_message();
            error!("cannot start job {}: {}", id, message);
            self.append_system_log(id, format!("Failed to start training: {message}")).await;
            if let Err(err) = self
                .job_repository
                .update_status(id, JobStatus::Failed, Some(message))
                .await
            {
                error!("cannot mark job {} failed: {}", id, err);
            }
            return;
        }

        self.spawn_completion_watcher(id);
    }

    /// Polls the executor and persists the terminal outcome on the first
    /// observation of not-running.
    fn spawn_completion_watcher(&self, id: Uuid) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.completion_poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                if service.executor.is_running(id) {
                    continue;
                }

                let job = match service.job_repository.get(id).await {
                    Ok(job) => job,
                    Err(_) => return, // deleted, nothing left to persist
                };
                if job.status.is_terminal() {
                    return; // stop path already persisted the outcome
                }

                let (status, message) = match service.executor.job_status(id).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!("cannot read final status of job {}: {}", id, err);
                        (JobStatus::Failed, Some("job finished with unknown status".to_string()))
                    }
                };
                let status = if status.is_terminal() { status } else { JobStatus::Failed };

                let terminal_line = match status {
                    JobStatus::Completed => "Training completed successfully".to_string(),
                    JobStatus::Cancelled => "Training cancelled".to_string(),
                    _ => match &message {
                        Some(message) => format!("Training failed: {message}"),
                        None => "Training failed".to_string(),
                    },
                };
                service.append_system_log(id, terminal_line).await;

                if let Err(err) = service.job_repository.update_status(id, status, message).await {
                    error!("cannot persist terminal status of job {}: {}", id, err);
                }
                return;
            }
        });
    }

    async fn append_system_log(&self, id: Uuid, message: String) {
        match tokio::time::timeout(
            self.config.log_append_timeout,
            self.log_store.append(id, LogEntry::system(message)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("cannot append system log of job {}: {}", id, err),
            Err(_) => warn!("system log append of job {} timed out", id),
        }
    }
}
