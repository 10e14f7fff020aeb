pub mod job;
pub mod log;
pub mod metric;

pub use job::{Framework, Job, JobStatus, ResourceRequest};
pub use log::{LogEntry, LogLevel, LogSource};
pub use metric::{MetricKind, MetricRecord, TrainingSample};
