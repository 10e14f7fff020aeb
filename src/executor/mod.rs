pub mod classify;
pub mod log_pump;

pub use classify::{classify_exit, ErrorClassification, FailureKind};

use crate::config::EngineConfig;
use crate::constants;
use crate::container::{BindMount, ContainerRuntime, ContainerSpec, ContainerStatus, ResourceLimits};
use crate::errors::EngineError;
use crate::gpu::GpuProbe;
use crate::log_store::LogStore;
use crate::metrics::MetricSink;
use crate::models::job::{Job, JobStatus};
use crate::models::log::{LogEntry, LogLevel, LogSource};
use crate::repository::JobRepository;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use itertools::Itertools;
use log_pump::ProgressTracker;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const LOG_EXCERPT_LINES: usize = 50;

/// RunHandle: the live, in-memory side of a job. Exists only while the
/// container is live; owned exclusively by the executor.
#[derive(Clone, Debug)]
pub struct RunHandle {
    pub container_id: String,
    pub container_name: String,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// One started container attempt and its attached tasks.
struct LaunchedAttempt {
    container_id: String,
    pump: Option<tokio::task::JoinHandle<()>>,
    attempt_token: CancellationToken,
}

impl LaunchedAttempt {
    /// Waits (bounded) for the pump to drain the stream to EOF, then stops
    /// the sampler. Log delivery is complete within 5 s of stream EOF.
    async fn settle(&mut self) {
        if let Some(pump) = self.pump.take() {
            if let Err(err) = tokio::time::timeout(Duration::from_secs(5), pump).await {
                debug!("log pump still draining after container exit: {}", err);
            }
        }
        self.attempt_token.cancel();
    }
}

/// What remains of a job once its container is gone (auto-remove): enough to
/// answer status queries and let the completion watcher persist the outcome.
#[derive(Clone, Debug)]
pub struct FinishedRun {
    pub status: JobStatus,
    pub exit_code: Option<i64>,
    pub classification: Option<ErrorClassification>,
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Executor: converts jobs into running containers and owns every per-job
/// task (log pump, stats sampler, lifecycle watcher). Cheap to clone; all
/// state is shared.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    job_repository: Arc<dyn JobRepository>,
    log_store: Arc<dyn LogStore>,
    sink: Arc<MetricSink>,
    gpu_probe: Arc<dyn GpuProbe>,
    config: Arc<EngineConfig>,
    jobs: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
    finished: Arc<RwLock<HashMap<Uuid, FinishedRun>>>,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        job_repository: Arc<dyn JobRepository>,
        log_store: Arc<dyn LogStore>,
        sink: Arc<MetricSink>,
        gpu_probe: Arc<dyn GpuProbe>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Executor {
            runtime,
            job_repository,
            log_store,
            sink,
            gpu_probe,
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates and starts the container for `job`, then spawns its lifecycle
    /// tasks. Returns as soon as the container is confirmed started.
    pub async fn start(&self, job: &Job) -> Result<(), EngineError> {
        // reserve the slot first so a concurrent start of the same job loses
        let cancel = CancellationToken::new();
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if jobs.contains_key(&job.id) {
                return Err(EngineError::new_conflict_state(format!(
                    "job {} is already running",
                    job.id
                )));
            }
            jobs.insert(
                job.id,
                RunHandle {
                    container_id: String::new(),
                    container_name: self.container_name(job),
                    cancel: cancel.clone(),
                    started_at: Utc::now(),
                    retry_count: 0,
                    last_error: None,
                },
            );
        }
        self.finished
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&job.id);

        let launched = match self.launch_container(job, 1).await {
            Ok(launched) => launched,
            Err(err) => {
                self.remove_handle(job.id);
                self.record_finished(
                    job.id,
                    FinishedRun {
                        status: JobStatus::Failed,
                        exit_code: None,
                        classification: None,
                        message: Some(err.user_message()),
                        finished_at: Utc::now(),
                    },
                );
                return Err(err);
            }
        };

        let container_id = launched.container_id.clone();
        self.update_handle(job.id, |handle| handle.container_id = container_id);

        let executor = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            // the handle must leave the map however this task ends
            let guard = scopeguard::guard(executor.clone(), |executor| {
                executor.remove_handle(job_id);
            });

            let supervise = executor.clone().supervise(job, launched, cancel);
            if let Err(panic) = std::panic::AssertUnwindSafe(supervise).catch_unwind().await {
                error!("lifecycle watcher of job {} panicked: {:?}", job_id, panic);
                executor.record_finished(
                    job_id,
                    FinishedRun {
                        status: JobStatus::Failed,
                        exit_code: None,
                        classification: None,
                        message: Some("internal lifecycle failure".to_string()),
                        finished_at: Utc::now(),
                    },
                );
            }
            drop(guard);
        });

        Ok(())
    }

    /// Signals the job's cancel, stops the container (graceful then kill),
    /// waits for the not-running condition and deletes the in-memory handle.
    /// Idempotent; returns false when there was no live handle.
    pub async fn stop(&self, job_id: Uuid, force: bool) -> Result<bool, EngineError> {
        let handle = {
            let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            jobs.get(&job_id).cloned()
        };

        let Some(handle) = handle else {
            return Ok(false);
        };

        handle.cancel.cancel();
        if !handle.container_id.is_empty() {
            self.stop_container_with_escalation(&handle.container_id, force).await;
        }

        self.record_finished(
            job_id,
            FinishedRun {
                status: JobStatus::Cancelled,
                exit_code: None,
                classification: None,
                message: Some("Stopped by user".to_string()),
                finished_at: Utc::now(),
            },
        );
        self.remove_handle(job_id);
        Ok(true)
    }

    /// Stops containers that carry our job label even when the in-memory
    /// handle is missing; covers restarts of this service.
    pub async fn stop_orphaned_containers(&self, job_id: Uuid) -> Result<usize, EngineError> {
        let mut filter = BTreeMap::new();
        filter.insert(constants::LABEL_JOB_ID.to_string(), job_id.to_string());
        let containers = self.runtime.list_containers(&filter).await?;

        let prefix = format!("{}-", self.config.container_name_prefix);
        let mut stopped = 0;
        for container in containers {
            if !container.name.starts_with(&prefix) {
                continue;
            }
            info!("stopping orphaned container {} of job {}", container.name, job_id);
            self.stop_container_with_escalation(&container.id, false).await;
            stopped += 1;
        }
        Ok(stopped)
    }

    /// True while the executor owns a live handle for the job.
    pub fn is_running(&self, job_id: Uuid) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.contains_key(&job_id)
    }

    pub fn run_handle(&self, job_id: Uuid) -> Option<RunHandle> {
        let jobs = self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(&job_id).cloned()
    }

    pub fn finished_run(&self, job_id: Uuid) -> Option<FinishedRun> {
        let finished = self.finished.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.get(&job_id).cloned()
    }

    /// Maps the runtime's view of the job onto a job status. Consults the
    /// live container first, then the terminal record kept after auto-remove.
    pub async fn job_status(&self, job_id: Uuid) -> Result<(JobStatus, Option<String>), EngineError> {
        let handle = self.run_handle(job_id);
        if let Some(handle) = handle {
            if handle.container_id.is_empty() {
                return Ok((JobStatus::Pending, None));
            }
            return match self.runtime.inspect(&handle.container_id).await {
                Ok(state) => {
                    let status = match (state.status, state.exit_code) {
                        (ContainerStatus::Running, _) => JobStatus::Running,
                        (ContainerStatus::Exited, Some(0)) => JobStatus::Completed,
                        (ContainerStatus::Exited, _) | (ContainerStatus::Dead, _) => JobStatus::Failed,
                        _ => JobStatus::Pending,
                    };
                    Ok((status, None))
                }
                Err(crate::container::ContainerRuntimeError::ContainerNotFound { .. }) => {
                    Ok((JobStatus::Failed, Some("container disappeared".to_string())))
                }
                Err(err) => Err(err.into()),
            };
        }

        if let Some(finished) = self.finished_run(job_id) {
            return Ok((finished.status, finished.message));
        }

        Err(EngineError::new_not_found(job_id))
    }

    fn container_name(&self, job: &Job) -> String {
        format!("{}-{}", self.config.container_name_prefix, job.short_id())
    }

    /// Pulls the image (best-effort), builds the container spec and starts
    /// the container. `attempt` suffixes retry containers so a lingering
    /// auto-remove cannot collide on the name.
    async fn launch_container(&self, job: &Job, attempt: u32) -> Result<LaunchedAttempt, EngineError> {
        if let Err(err) = self.runtime.pull_image(&job.image).await {
            warn!("cannot pull image `{}`: {}, assuming it is local", job.image, err);
        }

        let spec = self.build_container_spec(job, attempt).await;
        let container_id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&container_id).await?;
        info!(
            "container {} ({}) started for job {}",
            spec.name, container_id, job.id
        );

        Ok(self.spawn_attempt_tasks(job, &container_id).await)
    }

    async fn build_container_spec(&self, job: &Job, attempt: u32) -> ContainerSpec {
        let mut env: Vec<(String, String)> = job
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for (key, value) in &job.hyperparameters {
            let flattened = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.push((
                format!("{}{}", constants::HYPERPARAMETER_ENV_PREFIX, key.to_uppercase()),
                flattened,
            ));
        }

        let mut labels = BTreeMap::new();
        labels.insert(constants::LABEL_JOB_ID.to_string(), job.id.to_string());
        labels.insert(constants::LABEL_JOB_NAME.to_string(), job.name.clone());
        labels.insert(constants::LABEL_PROJECT_ID.to_string(), job.project_id.to_string());
        labels.insert(constants::LABEL_FRAMEWORK.to_string(), job.framework.to_string());

        let mounts = vec![
            BindMount {
                host_path: job.dataset_path.clone(),
                container_path: constants::DATASET_MOUNT_PATH.to_string(),
                read_only: true,
            },
            BindMount {
                host_path: job.output_path.clone(),
                container_path: constants::OUTPUT_MOUNT_PATH.to_string(),
                read_only: false,
            },
            BindMount {
                host_path: format!("{}/{}", self.config.workspace_volume_base, job.id),
                container_path: constants::WORKSPACE_MOUNT_PATH.to_string(),
                read_only: false,
            },
        ];

        let mut device_requests = Vec::new();
        if job.resources.gpu_count > 0 {
            match self.gpu_probe.device_request(job.resources.gpu_count) {
                Some(request) => {
                    env.push((constants::ENV_NVIDIA_VISIBLE_DEVICES.to_string(), "all".to_string()));
                    env.push((constants::ENV_CUDA_VISIBLE_DEVICES.to_string(), "0".to_string()));
                    device_requests.push(request);
                }
                None => {
                    // requested GPUs on a CPU-only host: degrade, do not fail
                    warn!(
                        "job {} requested {} GPU(s) but none are available, continuing on CPU",
                        job.id, job.resources.gpu_count
                    );
                    self.append_log(
                        job.id,
                        LogEntry::new(
                            LogLevel::Warn,
                            LogSource::System,
                            format!(
                                "GPU requested but not available ({} requested), continuing without GPU",
                                job.resources.gpu_count
                            ),
                        ),
                    )
                    .await;
                }
            }
        }

        let name = if attempt <= 1 {
            self.container_name(job)
        } else {
            format!("{}-r{}", self.container_name(job), attempt)
        };

        ContainerSpec {
            name,
            image: job.image.clone(),
            command: job.command.clone(),
            env,
            labels,
            mounts,
            limits: ResourceLimits {
                nano_cpus: job.resources.nano_cpus(),
                memory_bytes: job.resources.memory_bytes(),
                memory_swap_bytes: job.resources.memory_bytes(),
                shm_size_bytes: self.config.shm_size_bytes,
            },
            device_requests,
            auto_remove: true,
        }
    }

    /// Spawns the log pump and the stats sampler for one container attempt.
    /// Children inherit the job's cancel through a child token that is also
    /// cancelled when the attempt's container exits.
    async fn spawn_attempt_tasks(&self, job: &Job, container_id: &str) -> LaunchedAttempt {
        let attempt_token = match self.run_handle(job.id) {
            Some(handle) => handle.cancel.child_token(),
            None => CancellationToken::new(),
        };

        let pump = match self.runtime.logs(container_id, true, false).await {
            Ok(stream) => {
                let progress = job.declared_epochs().map(|total_epochs| ProgressTracker {
                    job_id: job.id,
                    total_epochs,
                    job_repository: self.job_repository.clone(),
                });
                let pump = log_pump::pump_logs(
                    job.id,
                    stream,
                    self.log_store.clone(),
                    self.sink.clone(),
                    progress,
                    self.config.log_append_timeout,
                    attempt_token.clone(),
                );
                let job_id = job.id;
                Some(tokio::spawn(async move {
                    if let Err(panic) = std::panic::AssertUnwindSafe(pump).catch_unwind().await {
                        error!("log pump of job {} panicked: {:?}", job_id, panic);
                    }
                }))
            }
            Err(err) => {
                warn!("cannot attach to logs of job {}: {}", job.id, err);
                None
            }
        };

        self.spawn_sampler(job.id, container_id.to_string(), attempt_token.clone());

        LaunchedAttempt {
            container_id: container_id.to_string(),
            pump,
            attempt_token,
        }
    }

    fn spawn_sampler(&self, job_id: Uuid, container_id: String, cancel: CancellationToken) {
        let runtime = self.runtime.clone();
        let gpu_probe = self.gpu_probe.clone();
        let sink = self.sink.clone();
        let interval = self.config.sampler_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is pointless right after start
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match runtime.stats(&container_id, true).await {
                    Ok(stats) => {
                        let mut payload = serde_json::json!({
                            "cpu_percent": stats.cpu_percent,
                            "memory_used_bytes": stats.memory_used_bytes,
                            "memory_limit_bytes": stats.memory_limit_bytes,
                        });
                        if gpu_probe.is_available() {
                            let utilization: Vec<serde_json::Value> = gpu_probe
                                .inventory()
                                .devices
                                .iter()
                                .map(|device| {
                                    serde_json::json!({
                                        "index": device.index,
                                        "utilization_percent": device.utilization_percent,
                                        "memory_used_mb": device.memory_used_mb,
                                    })
                                })
                                .collect();
                            payload["gpus"] = serde_json::Value::Array(utilization);
                        }
                        debug!("stats of job {}: {}", job_id, payload);
                        sink.publish_stats(job_id, payload);
                    }
                    Err(err) => debug!("cannot sample stats of job {}: {}", job_id, err),
                }
            }
        });
    }

    /// Lifecycle watcher: awaits the container's exit, classifies it and
    /// retries recoverable failures with exponential backoff. Records the
    /// terminal outcome; the completion watcher persists it.
    async fn supervise(self, job: Job, first_attempt: LaunchedAttempt, cancel: CancellationToken) {
        let timeout = Duration::from_secs(job.timeout_hours as u64 * 3600);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut current = first_attempt;
        let mut attempt: u32 = 1;

        let finished = loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => {
                    // operator stop owns container teardown and the record
                    current.settle().await;
                    break FinishedRun {
                        status: JobStatus::Cancelled,
                        exit_code: None,
                        classification: None,
                        message: Some("Stopped by user".to_string()),
                        finished_at: Utc::now(),
                    };
                }
                _ = &mut deadline => {
                    warn!("job {} exceeded its {}h timeout, stopping", job.id, job.timeout_hours);
                    self.append_system_log(job.id, format!("Job exceeded its {}h timeout and was stopped", job.timeout_hours)).await;
                    self.stop_container_with_escalation(&current.container_id, false).await;
                    current.settle().await;
                    break FinishedRun {
                        status: JobStatus::Failed,
                        exit_code: None,
                        classification: None,
                        message: Some(format!("timed out after {} hour(s)", job.timeout_hours)),
                        finished_at: Utc::now(),
                    };
                }
                exit = self.runtime.wait_not_running(&current.container_id) => exit,
            };

            // drain the log stream to EOF before reading the excerpt
            current.settle().await;

            if cancel.is_cancelled() {
                // a stop raced the exit; the operator's intent wins
                break FinishedRun {
                    status: JobStatus::Cancelled,
                    exit_code: exit.ok(),
                    classification: None,
                    message: Some("Stopped by user".to_string()),
                    finished_at: Utc::now(),
                };
            }

            let exit_code = match exit {
                Ok(exit_code) => exit_code,
                Err(err) => {
                    error!("cannot wait on container of job {}: {}", job.id, err);
                    break FinishedRun {
                        status: JobStatus::Failed,
                        exit_code: None,
                        classification: None,
                        message: Some(format!("container wait failed: {err}")),
                        finished_at: Utc::now(),
                    };
                }
            };

            let excerpt = self.log_excerpt(job.id).await;
            let classification = classify_exit(exit_code, excerpt.as_deref());

            if classification.kind == FailureKind::None {
                break FinishedRun {
                    status: JobStatus::Completed,
                    exit_code: Some(exit_code),
                    classification: Some(classification),
                    message: None,
                    finished_at: Utc::now(),
                };
            }

            let retry = &self.config.retry;
            if classification.recoverable && attempt < retry.max_attempts {
                let delay = retry.delay_for_attempt(attempt);
                attempt += 1;
                self.update_handle(job.id, |handle| {
                    handle.retry_count = attempt - 1;
                    handle.last_error = Some(classification.description.clone());
                });
                self.append_system_log(
                    job.id,
                    format!(
                        "Retry attempt {} of {} after exit code {} ({})",
                        attempt - 1,
                        retry.max_attempts - 1,
                        exit_code,
                        classification.description
                    ),
                )
                .await;

                tokio::select! {
                    _ = cancel.cancelled() => {
                        break FinishedRun {
                            status: JobStatus::Cancelled,
                            exit_code: Some(exit_code),
                            classification: Some(classification),
                            message: Some("Stopped by user".to_string()),
                            finished_at: Utc::now(),
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.launch_container(&job, attempt).await {
                    Ok(launched) => {
                        let new_container_id = launched.container_id.clone();
                        self.update_handle(job.id, |handle| handle.container_id = new_container_id);
                        current = launched;
                        continue;
                    }
                    Err(err) => {
                        error!("retry of job {} cannot start a container: {}", job.id, err);
                        break FinishedRun {
                            status: JobStatus::Failed,
                            exit_code: Some(exit_code),
                            classification: Some(classification),
                            message: Some(err.user_message()),
                            finished_at: Utc::now(),
                        };
                    }
                }
            }

            break FinishedRun {
                status: JobStatus::Failed,
                exit_code: Some(exit_code),
                classification: Some(classification.clone()),
                message: Some(classification.user_message()),
                finished_at: Utc::now(),
            };
        };

        self.record_finished(job.id, finished);
    }

    async fn stop_container_with_escalation(&self, container_id: &str, force: bool) {
        if force {
            if let Err(err) = self.runtime.kill_container(container_id).await {
                warn!("cannot kill container {}: {}", container_id, err);
            }
        } else if let Err(err) = self
            .runtime
            .stop_container(container_id, self.config.stop_grace_timeout)
            .await
        {
            warn!("cannot stop container {}: {}", container_id, err);
        }

        match tokio::time::timeout(self.config.stop_wait_timeout, self.runtime.wait_not_running(container_id)).await
        {
            Ok(_) => {}
            Err(_) => {
                warn!("container {} ignored the stop, killing it", container_id);
                if let Err(err) = self.runtime.kill_container(container_id).await {
                    warn!("cannot kill container {}: {}", container_id, err);
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), self.runtime.wait_not_running(container_id))
                    .await;
            }
        }
    }

    async fn log_excerpt(&self, job_id: Uuid) -> Option<String> {
        let (entries, _) = self.log_store.range(job_id, 0, usize::MAX).await.ok()?;
        if entries.is_empty() {
            return None;
        }
        let start = entries.len().saturating_sub(LOG_EXCERPT_LINES);
        Some(entries[start..].iter().map(|entry| entry.message.as_str()).join("\n"))
    }

    async fn append_system_log(&self, job_id: Uuid, message: String) {
        self.append_log(job_id, LogEntry::system(message)).await;
    }

    async fn append_log(&self, job_id: Uuid, entry: LogEntry) {
        match tokio::time::timeout(self.config.log_append_timeout, self.log_store.append(job_id, entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("cannot append log entry of job {}: {}", job_id, err),
            Err(_) => warn!("log append of job {} timed out", job_id),
        }
    }

    fn update_handle(&self, job_id: Uuid, mutate: impl FnOnce(&mut RunHandle)) {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = jobs.get_mut(&job_id) {
            mutate(handle);
        }
    }

    fn remove_handle(&self, job_id: Uuid) {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.remove(&job_id);
    }

    /// First terminal record wins; a stop racing the lifecycle watcher must
    /// not flip an already recorded outcome.
    fn record_finished(&self, job_id: Uuid, run: FinishedRun) {
        let mut finished = self.finished.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.entry(job_id).or_insert(run);
    }
}
