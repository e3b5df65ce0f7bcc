//! Mailbox capability trait and message model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::EmailConfig;
use crate::errors::PipelineError;

pub mod imap;
pub mod watcher;

/// The login subset of [`EmailConfig`]; connecting never needs the filters.
#[derive(Debug, Clone)]
pub struct MailboxLogin {
    pub email: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl From<&EmailConfig> for MailboxLogin {
    fn from(cfg: &EmailConfig) -> Self {
        Self {
            email: cfg.email.clone(),
            password: cfg.password.clone(),
            host: cfg.imap_host.clone(),
            port: cfg.imap_port,
            tls: cfg.imap_tls,
        }
    }
}

/// One fetched message. Transient: lives only for the poll cycle that
/// fetched it.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub from: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

impl MailMessage {
    /// Message content for filtering and extraction: plain text preferred,
    /// rendered HTML as the fallback. `None` when both are empty.
    pub fn content(&self) -> Option<&str> {
        non_empty(self.body_text.as_deref()).or_else(|| non_empty(self.body_html.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Mailbox session owned exclusively by one watch call.
///
/// `search_recent_unseen` queries unseen messages bounded by a recency
/// window (a fallback for servers with unreliable unseen semantics) and
/// marks fetched messages seen.
#[async_trait]
pub trait MailTransport: Send {
    async fn connect(&mut self, login: &MailboxLogin) -> Result<(), PipelineError>;

    fn is_connected(&self) -> bool;

    /// Fetch unseen messages no older than `lookback`, sorted oldest-first
    /// by date. Callers rely on that ordering: the watch loop scans each
    /// batch back to front so the newest matching message wins.
    async fn search_recent_unseen(
        &mut self,
        lookback: Duration,
    ) -> Result<Vec<MailMessage>, PipelineError>;

    async fn disconnect(&mut self) -> Result<(), PipelineError>;
}
