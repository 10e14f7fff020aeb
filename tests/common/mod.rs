use async_trait::async_trait;
use modelforge_engine::config::{EngineConfig, RetryPolicy};
use modelforge_engine::container::{
    ContainerRuntime, ContainerRuntimeError, ContainerSpec, ContainerState, ContainerStats, ContainerStatus,
    ContainerSummary, LogByteStream, RuntimeInfo,
};
use modelforge_engine::executor::log_pump::{encode_frame, STREAM_STDERR, STREAM_STDOUT};
use modelforge_engine::executor::Executor;
use modelforge_engine::gpu::{GpuProbe, StaticGpuProbe};
use modelforge_engine::io_models::SubmitJobRequest;
use modelforge_engine::log_store::InMemoryLogStore;
use modelforge_engine::metrics::{MetricSink, MetricsHub};
use modelforge_engine::models::job::{Framework, JobStatus};
use modelforge_engine::repository::{InMemoryJobRepository, InMemoryMetricRepository, JobRepository};
use modelforge_engine::service::JobService;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Scripted behavior for one container, consumed in creation order.
#[derive(Clone)]
pub struct ContainerScript {
    /// Multiplexed log bytes handed out by `logs()`.
    pub log_bytes: Vec<u8>,
    /// Delay before the log stream starts producing bytes.
    pub log_open_delay: Duration,
    /// How long the container "runs" before exiting on its own.
    pub run_for: Duration,
    pub exit_code: i64,
    /// When set, `create_container` fails with this message.
    pub fail_create: Option<String>,
}

impl Default for ContainerScript {
    fn default() -> Self {
        ContainerScript {
            log_bytes: Vec::new(),
            log_open_delay: Duration::ZERO,
            run_for: Duration::from_millis(10),
            exit_code: 0,
            fail_create: None,
        }
    }
}

impl ContainerScript {
    pub fn exiting(exit_code: i64) -> Self {
        ContainerScript {
            exit_code,
            ..Default::default()
        }
    }

    pub fn with_stdout_lines(mut self, lines: &[&str]) -> Self {
        for line in lines {
            self.log_bytes.extend(encode_frame(STREAM_STDOUT, format!("{line}\n").as_bytes()));
        }
        self
    }

    pub fn with_stderr_lines(mut self, lines: &[&str]) -> Self {
        for line in lines {
            self.log_bytes.extend(encode_frame(STREAM_STDERR, format!("{line}\n").as_bytes()));
        }
        self
    }

    pub fn running_for(mut self, run_for: Duration) -> Self {
        self.run_for = run_for;
        self
    }

    pub fn logs_opening_after(mut self, delay: Duration) -> Self {
        self.log_open_delay = delay;
        self
    }
}

struct FakeContainer {
    name: String,
    labels: BTreeMap<String, String>,
    log_bytes: Vec<u8>,
    log_open_delay: Duration,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
    scripted_exit: i64,
    run_for: Duration,
    started: AtomicBool,
}

/// In-memory container runtime driven by `ContainerScript`s; stands in for
/// the host runtime in the end-to-end scenarios.
pub struct FakeRuntime {
    scripts: Mutex<VecDeque<ContainerScript>>,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    pulled_images: Mutex<Vec<String>>,
    pub fail_pulls: AtomicBool,
    pub created_specs: Mutex<Vec<ContainerSpec>>,
    next_id: AtomicU64,
    runtime_info: Mutex<RuntimeInfo>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRuntime {
            scripts: Mutex::new(VecDeque::new()),
            containers: Mutex::new(HashMap::new()),
            pulled_images: Mutex::new(Vec::new()),
            fail_pulls: AtomicBool::new(false),
            created_specs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            runtime_info: Mutex::new(RuntimeInfo::default()),
        })
    }

    pub fn push_script(&self, script: ContainerScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.pulled_images.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created_specs.lock().unwrap().len()
    }

    pub fn spec_at(&self, index: usize) -> ContainerSpec {
        self.created_specs.lock().unwrap()[index].clone()
    }

    fn container(&self, id: &str) -> Result<Arc<FakeContainer>, ContainerRuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerRuntimeError::ContainerNotFound {
                container_id: id.to_string(),
            })
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), ContainerRuntimeError> {
        if self.fail_pulls.load(Ordering::Relaxed) {
            return Err(ContainerRuntimeError::ImagePull {
                image: image.to_string(),
                raw_error_message: "registry unreachable".to_string(),
            });
        }
        self.pulled_images.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        if let Some(message) = script.fail_create {
            return Err(ContainerRuntimeError::Api {
                raw_error_message: message,
            });
        }

        self.created_specs.lock().unwrap().push(spec.clone());
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (exit_tx, exit_rx) = watch::channel(None);
        let container = Arc::new(FakeContainer {
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            log_bytes: script.log_bytes,
            log_open_delay: script.log_open_delay,
            exit_tx,
            exit_rx,
            scripted_exit: script.exit_code,
            run_for: script.run_for,
            started: AtomicBool::new(false),
        });
        self.containers.lock().unwrap().insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), ContainerRuntimeError> {
        let container = self.container(container_id)?;
        container.started.store(true, Ordering::Relaxed);

        let exit_tx = container.exit_tx.clone();
        let run_for = container.run_for;
        let exit_code = container.scripted_exit;
        tokio::spawn(async move {
            tokio::time::sleep(run_for).await;
            exit_tx.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(exit_code);
                    true
                } else {
                    false
                }
            });
        });
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> Result<(), ContainerRuntimeError> {
        let container = self.container(container_id)?;
        container.exit_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(143); // SIGTERM honored
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<(), ContainerRuntimeError> {
        let container = self.container(container_id)?;
        container.exit_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(137);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn wait_not_running(&self, container_id: &str) -> Result<i64, ContainerRuntimeError> {
        let container = self.container(container_id)?;
        let mut exit_rx = container.exit_rx.clone();
        loop {
            if let Some(exit_code) = *exit_rx.borrow() {
                return Ok(exit_code);
            }
            if exit_rx.changed().await.is_err() {
                return Err(ContainerRuntimeError::ContainerNotFound {
                    container_id: container_id.to_string(),
                });
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, ContainerRuntimeError> {
        let container = self.container(container_id)?;
        let exit = *container.exit_rx.borrow();
        Ok(match exit {
            None if !container.started.load(Ordering::Relaxed) => ContainerState {
                status: ContainerStatus::Created,
                exit_code: None,
                oom_killed: false,
            },
            None => ContainerState {
                status: ContainerStatus::Running,
                exit_code: None,
                oom_killed: false,
            },
            Some(exit_code) => ContainerState {
                status: ContainerStatus::Exited,
                exit_code: Some(exit_code),
                oom_killed: exit_code == 137,
            },
        })
    }

    async fn logs(
        &self,
        container_id: &str,
        _follow: bool,
        _timestamps: bool,
    ) -> Result<LogByteStream, ContainerRuntimeError> {
        let container = self.container(container_id)?;
        let bytes = container.log_bytes.clone();
        let delay = container.log_open_delay;

        // stream through a pipe so scripts can delay the first byte
        let (mut writer, reader) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            use tokio::io::AsyncWriteExt;
            let _ = writer.write_all(&bytes).await;
            // dropping the writer is the stream's EOF
        });
        Ok(Box::pin(reader))
    }

    async fn stats(&self, container_id: &str, _one_shot: bool) -> Result<ContainerStats, ContainerRuntimeError> {
        self.container(container_id)?;
        Ok(ContainerStats {
            cpu_percent: 42.0,
            memory_used_bytes: 512 * 1024 * 1024,
            memory_limit_bytes: 16 * 1024 * 1024 * 1024,
        })
    }

    async fn list_containers(
        &self,
        label_filter: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, ContainerRuntimeError> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .iter()
            .filter(|(_, container)| {
                label_filter
                    .iter()
                    .all(|(key, value)| container.labels.get(key) == Some(value))
            })
            .map(|(id, container)| ContainerSummary {
                id: id.clone(),
                name: container.name.clone(),
                labels: container.labels.clone(),
                status: if container.exit_rx.borrow().is_none() {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                },
            })
            .collect())
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo, ContainerRuntimeError> {
        Ok(self.runtime_info.lock().unwrap().clone())
    }
}

/// Everything a scenario needs, wired the way the hosted service wires it.
pub struct TestHarness {
    pub service: JobService,
    pub executor: Executor,
    pub runtime: Arc<FakeRuntime>,
    pub job_repository: Arc<InMemoryJobRepository>,
    pub metric_repository: Arc<InMemoryMetricRepository>,
    pub log_store: Arc<InMemoryLogStore>,
    pub hub: Arc<MetricsHub>,
    pub config: Arc<EngineConfig>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        start_settle_delay: Duration::from_millis(10),
        completion_poll_interval: Duration::from_millis(25),
        log_tail_timeout: Duration::from_millis(50),
        sampler_interval: Duration::from_millis(50),
        stop_grace_timeout: Duration::from_secs(1),
        stop_wait_timeout: Duration::from_secs(2),
        subscriber_ping_interval: Duration::from_secs(3600),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20),
            backoff_factor: 2,
            max_delay: Duration::from_millis(100),
        },
        ..EngineConfig::default()
    }
}

pub fn harness() -> TestHarness {
    harness_with(test_config(), Arc::new(StaticGpuProbe::disabled()))
}

pub fn harness_with(config: EngineConfig, gpu_probe: Arc<dyn GpuProbe>) -> TestHarness {
    let config = Arc::new(config);
    let runtime = FakeRuntime::new();
    let job_repository = Arc::new(InMemoryJobRepository::new());
    let metric_repository = Arc::new(InMemoryMetricRepository::new());
    let log_store = Arc::new(InMemoryLogStore::new(config.log_store_max_entries));
    let hub = Arc::new(MetricsHub::new(
        config.subscriber_buffer_size,
        config.subscriber_ping_interval,
    ));
    let sink = Arc::new(MetricSink::new(
        metric_repository.clone(),
        hub.clone(),
        config.metric_batch_size,
    ));

    let executor = Executor::new(
        runtime.clone(),
        job_repository.clone(),
        log_store.clone(),
        sink,
        gpu_probe,
        config.clone(),
    );
    let service = JobService::new(
        job_repository.clone(),
        log_store.clone(),
        executor.clone(),
        hub.clone(),
        config.clone(),
    );

    TestHarness {
        service,
        executor,
        runtime,
        job_repository,
        metric_repository,
        log_store,
        hub,
        config,
    }
}

pub fn pytorch_request() -> SubmitJobRequest {
    SubmitJobRequest {
        name: "resnet50-baseline".to_string(),
        project_id: Some(Uuid::new_v4()),
        model_name: "resnet50".to_string(),
        dataset_path: "/datasets/imagenet".to_string(),
        output_path: "/outputs/resnet50".to_string(),
        framework: Framework::Pytorch,
        image: "pytorch/pytorch:2.0.0".to_string(),
        command: vec!["python".to_string(), "train.py".to_string()],
        gpu_count: 1,
        cpu_count: Some(4),
        memory_gb: Some(16),
        timeout_hours: Some(1),
        ..Default::default()
    }
}

/// Polls the repository until the job reaches `expected` or the timeout hits.
pub async fn wait_for_status(
    repository: &Arc<InMemoryJobRepository>,
    id: Uuid,
    expected: JobStatus,
    timeout: Duration,
) -> JobStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = repository
            .get(id)
            .await
            .map(|job| job.status)
            .expect("job disappeared while waiting for status");
        if status == expected || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
