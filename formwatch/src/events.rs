//! Update sink events and the run logger.
//!
//! The core reports every milestone through two channels: a push-style
//! [`UpdateSink`] (consumed by whatever front end hosts the run) and a
//! durable append-only log file that pairs each processed record with its
//! outcome.

use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle state reported with status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Stopping,
    Error,
}

/// Tagged events pushed to the hosting layer at each milestone.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    Log {
        line: String,
    },
    Status {
        message: String,
        status: RunStatus,
        current_line: usize,
        total_lines: usize,
    },
    ProgressInit {
        total_lines: usize,
    },
    ProgressUpdate {
        current_line: usize,
        total_lines: usize,
        line_content: String,
    },
    Error {
        message: String,
    },
    LogReset {
        message: String,
    },
}

/// Push function the core calls synchronously at each milestone.
pub trait UpdateSink: Send + Sync {
    fn notify(&self, event: UpdateEvent);
}

/// Sink that drops every event. Useful as a default and in tests.
pub struct NullSink;

impl UpdateSink for NullSink {
    fn notify(&self, _event: UpdateEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Leveled, timestamped logging fanned out to tracing, the update sink and
/// the durable log file.
pub struct RunLogger {
    sink: Arc<dyn UpdateSink>,
    log_path: PathBuf,
}

impl RunLogger {
    pub fn new(sink: Arc<dyn UpdateSink>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            log_path: log_path.into(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Directory screenshots and other run artifacts land in.
    pub fn artifact_dir(&self) -> PathBuf {
        self.log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn sink(&self) -> &Arc<dyn UpdateSink> {
        &self.sink
    }

    /// Create the log directory if needed.
    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn log(&self, level: LogLevel, line_num: Option<usize>, message: &str) {
        let prefix = line_num
            .map(|n| format!("Line {n}: "))
            .unwrap_or_default();
        let entry = format!(
            "{} [{}] {}{}\n",
            Utc::now().to_rfc3339(),
            level.as_str(),
            prefix,
            message
        );

        match level {
            LogLevel::Error => tracing::error!("{prefix}{message}"),
            LogLevel::Warn => tracing::warn!("{prefix}{message}"),
            LogLevel::Debug => tracing::debug!("{prefix}{message}"),
            _ => tracing::info!("{prefix}{message}"),
        }

        self.sink.notify(UpdateEvent::Log {
            line: entry.clone(),
        });
        self.append(&entry);
    }

    pub fn debug(&self, line_num: Option<usize>, message: &str) {
        self.log(LogLevel::Debug, line_num, message);
    }

    pub fn info(&self, line_num: Option<usize>, message: &str) {
        self.log(LogLevel::Info, line_num, message);
    }

    pub fn success(&self, line_num: Option<usize>, message: &str) {
        self.log(LogLevel::Success, line_num, message);
    }

    pub fn warn(&self, line_num: Option<usize>, message: &str) {
        self.log(LogLevel::Warn, line_num, message);
    }

    pub fn error(&self, line_num: Option<usize>, message: &str) {
        self.log(LogLevel::Error, line_num, message);
    }

    /// Append the durable outcome line for one record.
    pub fn outcome(&self, line_num: usize, input_line: &str, extracted: Option<&str>) {
        let entry = format!(
            "Input: {} | EmailData: {}",
            input_line,
            extracted.unwrap_or("NOT_FOUND")
        );
        let level = if extracted.is_some() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.log(level, Some(line_num), &entry);
    }

    /// Append the durable outcome line for a record that failed.
    pub fn outcome_error(&self, line_num: usize, input_line: &str, error: &str) {
        let entry = format!("Input: {input_line} | Error: {error}");
        self.log(LogLevel::Error, Some(line_num), &entry);
    }

    /// Truncate the durable log to empty. Used by reset only.
    pub fn truncate(&self) -> std::io::Result<()> {
        self.ensure_log_dir()?;
        std::fs::write(&self.log_path, "")
    }

    fn append(&self, entry: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = result {
            tracing::error!(path = %self.log_path.display(), "Failed to write to output log: {e}");
            self.sink.notify(UpdateEvent::Error {
                message: format!(
                    "Failed to write to output log {}: {e}",
                    self.log_path.display()
                ),
            });
        }
    }
}
