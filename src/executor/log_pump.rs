use crate::log_store::LogStore;
use crate::metrics::parser::parse_line;
use crate::metrics::MetricSink;
use crate::models::log::{LogEntry, LogSource};
use crate::repository::JobRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;

/// Derives job progress from parsed epoch samples when the user declared a
/// total epoch count in hyperparameters.
pub(crate) struct ProgressTracker {
    pub job_id: Uuid,
    pub total_epochs: u64,
    pub job_repository: Arc<dyn JobRepository>,
}

impl ProgressTracker {
    async fn on_epoch(&self, epoch: u64) {
        if self.total_epochs == 0 {
            return;
        }
        let progress = (epoch as f32 / self.total_epochs as f32 * 100.0).clamp(0.0, 100.0);
        if let Err(err) = self.job_repository.update_progress(self.job_id, progress).await {
            warn!("cannot update progress of job {}: {}", self.job_id, err);
        }
    }
}

/// Drains the container's multiplexed log stream until EOF or cancellation.
///
/// The stream interleaves stdout and stderr chunks, each preceded by an
/// 8-byte header: stream-type byte, 3 padding bytes, payload length as u32
/// big-endian. The decoder is stateful over bytes, not lines; only after a
/// full frame is read is the payload split on newlines.
///
/// Failures to append or to persist metrics are logged and swallowed; the
/// container keeps running and the lifecycle watcher stays authoritative.
pub(crate) async fn pump_logs<R>(
    job_id: Uuid,
    mut stream: R,
    log_store: Arc<dyn LogStore>,
    sink: Arc<MetricSink>,
    progress: Option<ProgressTracker>,
    append_timeout: Duration,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; 8];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("log pump of job {} cancelled", job_id);
                return;
            }
            read = stream.read_exact(&mut header) => {
                if let Err(err) = read {
                    if err.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!("log stream of job {} broke: {}", job_id, err);
                    }
                    return;
                }
            }
        }

        let stream_type = header[0];
        let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; payload_len];

        tokio::select! {
            _ = cancel.cancelled() => return,
            read = stream.read_exact(&mut payload) => {
                if let Err(err) = read {
                    if err.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!("log stream of job {} broke mid frame: {}", job_id, err);
                    }
                    return;
                }
            }
        }

        let source = match stream_type {
            STREAM_STDERR => LogSource::Stderr,
            _ => LogSource::Stdout,
        };

        let chunk = String::from_utf8_lossy(&payload);
        for line in chunk.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            process_line(job_id, source, line, &log_store, &sink, &progress, append_timeout).await;
        }
    }
}

async fn process_line(
    job_id: Uuid,
    source: LogSource,
    line: &str,
    log_store: &Arc<dyn LogStore>,
    sink: &Arc<MetricSink>,
    progress: &Option<ProgressTracker>,
    append_timeout: Duration,
) {
    let level = LogEntry::detect_level(source, line);

    let mut message = line.to_string();
    if let Some(sample) = parse_line(line) {
        // make metric lines easy to spot when eyeballing the raw log
        message = format!("[METRICS] {line}");

        if let Err(err) = sink.record(job_id, &sample).await {
            warn!("cannot persist metrics of job {}: {}", job_id, err);
        }

        if let (Some(tracker), Some(epoch)) = (progress, sample.epoch) {
            tracker.on_epoch(epoch).await;
        }
    }

    let entry = LogEntry::new(level, source, message);
    match tokio::time::timeout(append_timeout, log_store.append(job_id, entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("cannot append log entry of job {}: {}", job_id, err),
        Err(_) => warn!("log append of job {} timed out", job_id),
    }
}

/// Encodes one frame the way the runtime does; shared with the test suite.
pub fn encode_frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(stream_type);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
