//! Run configuration and record parsing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::PipelineError;

pub const DEFAULT_INPUT_PATH: &str = "input.txt";
pub const DEFAULT_LOG_PATH: &str = "logs/output.log";

/// Immutable configuration for one run.
///
/// All selectors are optional: the pipeline is selector-driven, and an absent
/// selector simply skips that step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub target_url: String,
    #[serde(default)]
    pub button1_selector: Option<String>,
    #[serde(default)]
    pub button2_selector: Option<String>,
    #[serde(default)]
    pub input_field1_selector: Option<String>,
    #[serde(default)]
    pub input_field2_selector: Option<String>,
    #[serde(default)]
    pub submit_button_selector: Option<String>,
    pub email_config: EmailConfig,
    #[serde(default)]
    pub input_file_path: Option<PathBuf>,
    #[serde(default)]
    pub output_log_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn input_path(&self) -> PathBuf {
        self.input_file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT_PATH))
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH))
    }

    /// Run-level validation: a target address is mandatory, and the mailbox
    /// login must be complete before any record is processed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.target_url.trim().is_empty() {
            return Err(PipelineError::Config("target URL is missing".into()));
        }
        self.email_config.validate_login()
    }
}

/// Mailbox login plus the optional filter/extraction chain settings.
///
/// Login fields are mandatory for any mailbox operation; the filters and the
/// extraction pattern are independently optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub email: String,
    pub password: String,
    pub imap_host: String,
    pub imap_port: u16,
    #[serde(default = "default_tls")]
    pub imap_tls: bool,
    #[serde(default)]
    pub subject_filter: Option<String>,
    #[serde(default)]
    pub body_keyword_filter: Option<String>,
    #[serde(default)]
    pub extraction_regex: Option<String>,
}

fn default_tls() -> bool {
    true
}

impl EmailConfig {
    pub fn validate_login(&self) -> Result<(), PipelineError> {
        if self.email.trim().is_empty()
            || self.password.is_empty()
            || self.imap_host.trim().is_empty()
            || self.imap_port == 0
        {
            return Err(PipelineError::Config(
                "email login configuration is incomplete (email, password, host, port)".into(),
            ));
        }
        Ok(())
    }

    /// A non-empty, trimmed subject filter, if one is configured.
    pub fn subject_filter(&self) -> Option<&str> {
        non_empty(self.subject_filter.as_deref())
    }

    pub fn body_keyword_filter(&self) -> Option<&str> {
        non_empty(self.body_keyword_filter.as_deref())
    }

    pub fn extraction_regex(&self) -> Option<&str> {
        non_empty(self.extraction_regex.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// One unit of input work: a raw line split into two trimmed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub line: String,
    pub text1: String,
    pub text2: String,
}

impl Record {
    /// Split a line on `:` into its first two trimmed parts.
    ///
    /// Lines with fewer than two non-empty parts are invalid and return
    /// `None`; the caller skips them without invoking the pipeline (they
    /// still count toward progress totals).
    pub fn parse(line: &str) -> Option<Record> {
        let mut parts = line.split(':');
        let text1 = parts.next()?.trim();
        let text2 = parts.next()?.trim();
        if text1.is_empty() || text2.is_empty() {
            return None;
        }
        Some(Record {
            line: line.to_string(),
            text1: text1.to_string(),
            text2: text2.to_string(),
        })
    }
}
