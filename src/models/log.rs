use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    #[serde(rename = "system")]
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

/// LogEntry: one newline-stripped line of the per-job log stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: LogSource, message: impl Into<String>) -> Self {
        LogEntry {
            level,
            source,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Lines written by the service itself (submission, retries, teardown).
    pub fn system(message: impl Into<String>) -> Self {
        LogEntry::new(LogLevel::System, LogSource::System, message)
    }

    /// Level detection for container output: stderr is always an error;
    /// otherwise the line content decides.
    pub fn detect_level(source: LogSource, message: &str) -> LogLevel {
        if source == LogSource::Stderr {
            return LogLevel::Error;
        }
        let lowered = message.to_lowercase();
        if lowered.contains("error") {
            LogLevel::Error
        } else if lowered.contains("warn") {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }
}
