use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerRuntimeError {
    #[error("container runtime unavailable: {raw_error_message}")]
    Unavailable { raw_error_message: String },

    #[error("container not found: {container_id}")]
    ContainerNotFound { container_id: String },

    #[error("cannot pull image `{image}`: {raw_error_message}")]
    ImagePull { image: String, raw_error_message: String },

    #[error("container runtime api error: {raw_error_message}")]
    Api { raw_error_message: String },
}

/// Bind mount from a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Device request passed to the runtime; shape matches the nvidia runtime
/// contract (driver + count + capabilities).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub driver: String,
    pub count: u32,
    pub capabilities: Vec<String>,
}

impl DeviceRequest {
    pub fn nvidia_gpus(count: u32) -> Self {
        DeviceRequest {
            driver: "nvidia".to_string(),
            count,
            capabilities: vec!["gpu".to_string(), "compute".to_string(), "utility".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub shm_size_bytes: i64,
}

/// Everything the runtime needs to create one training container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    pub limits: ResourceLimits,
    pub device_requests: Vec<DeviceRequest>,
    /// Exited containers are removed by the runtime so they do not pile up;
    /// explicit removal stays best-effort.
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: ContainerStatus,
}

/// Runtime-level info used by the GPU probe to detect an nvidia runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeInfo {
    pub runtimes: Vec<String>,
    pub default_runtime: String,
}

/// The multiplexed log stream: stdout and stderr share one socket, framed
/// with an 8-byte header per chunk (stream-type byte, 3 padding bytes, u32
/// big-endian payload length).
pub type LogByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// ContainerRuntime: the narrow surface of the host's container runtime the
/// core consumes. Implementations must be concurrency-safe; the engine shares
/// one client across all jobs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), ContainerRuntimeError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ContainerRuntimeError>;

    async fn start_container(&self, container_id: &str) -> Result<(), ContainerRuntimeError>;

    /// Graceful stop; the runtime escalates internally after `timeout`.
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<(), ContainerRuntimeError>;

    async fn kill_container(&self, container_id: &str) -> Result<(), ContainerRuntimeError>;

    /// Resolves once the container leaves the running state, with its exit code.
    async fn wait_not_running(&self, container_id: &str) -> Result<i64, ContainerRuntimeError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, ContainerRuntimeError>;

    async fn logs(
        &self,
        container_id: &str,
        follow: bool,
        timestamps: bool,
    ) -> Result<LogByteStream, ContainerRuntimeError>;

    async fn stats(&self, container_id: &str, one_shot: bool) -> Result<ContainerStats, ContainerRuntimeError>;

    async fn list_containers(
        &self,
        label_filter: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, ContainerRuntimeError>;

    async fn runtime_info(&self) -> Result<RuntimeInfo, ContainerRuntimeError>;
}
