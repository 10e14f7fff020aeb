use serde::Deserialize;
use std::time::Duration;

/// Engine-wide settings. Everything an operator may want to tune lives here;
/// `Default` matches production values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for container names: `<prefix>-<short job id>`.
    pub container_name_prefix: String,
    /// Host directory mounted read-write at /workspace in every container.
    pub workspace_volume_base: String,
    /// Maximum retained log entries per job before oldest eviction.
    pub log_store_max_entries: usize,
    /// Deadline for a single log-store append.
    pub log_append_timeout: Duration,
    /// Blocking-tail timeout used by log streaming.
    pub log_tail_timeout: Duration,
    /// Delay before the asynchronous start task reloads the job, so the
    /// submit transaction is visible.
    pub start_settle_delay: Duration,
    /// Completion watcher poll interval.
    pub completion_poll_interval: Duration,
    /// Graceful container stop timeout before escalating to kill.
    pub stop_grace_timeout: Duration,
    /// How long to wait for the not-running condition after a stop.
    pub stop_wait_timeout: Duration,
    /// Container stats sampling interval.
    pub sampler_interval: Duration,
    /// Shared-memory size for training containers, in bytes.
    pub shm_size_bytes: i64,
    pub retry: RetryPolicy,
    /// Metric records per insert batch.
    pub metric_batch_size: usize,
    /// Bounded per-subscriber buffer; a full buffer evicts the subscriber.
    pub subscriber_buffer_size: usize,
    /// Liveness ping interval for metric subscribers.
    pub subscriber_ping_interval: Duration,
    /// Read timeout after which a silent peer is considered dead.
    pub subscriber_read_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            container_name_prefix: "mljob".to_string(),
            workspace_volume_base: "/var/lib/modelforge/workspaces".to_string(),
            log_store_max_entries: 10_000,
            log_append_timeout: Duration::from_secs(5),
            log_tail_timeout: Duration::from_secs(2),
            start_settle_delay: Duration::from_millis(100),
            completion_poll_interval: Duration::from_secs(5),
            stop_grace_timeout: Duration::from_secs(30),
            stop_wait_timeout: Duration::from_secs(35),
            sampler_interval: Duration::from_secs(10),
            shm_size_bytes: 2 * 1024 * 1024 * 1024, // multi-process data loaders need a big /dev/shm
            retry: RetryPolicy::default(),
            metric_batch_size: 100,
            subscriber_buffer_size: 256,
            subscriber_ping_interval: Duration::from_secs(30),
            subscriber_read_timeout: Duration::from_secs(60),
        }
    }
}

/// Backoff applied by the lifecycle watcher to recoverable failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            backoff_factor: 2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), exponential with cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_delay.saturating_mul(factor);
        std::cmp::min(delay, self.max_delay)
    }
}
