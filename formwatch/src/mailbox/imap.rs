//! IMAP-backed mail transport.
//!
//! The `imap` crate is synchronous, so every session operation runs inside
//! `spawn_blocking` with the session moved in and back out, keeping the
//! async flow unblocked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use std::net::TcpStream;
use std::time::Duration;
use tokio::task;
use tracing::debug;

use crate::errors::PipelineError;
use crate::mailbox::{MailMessage, MailTransport, MailboxLogin};

const MAILBOX: &str = "INBOX";

enum ImapSession {
    Tls(imap::Session<native_tls::TlsStream<TcpStream>>),
    Plain(imap::Session<TcpStream>),
}

impl ImapSession {
    fn uid_search(&mut self, query: &str) -> imap::error::Result<std::collections::HashSet<u32>> {
        match self {
            ImapSession::Tls(s) => s.uid_search(query),
            ImapSession::Plain(s) => s.uid_search(query),
        }
    }

    fn fetch_raw(&mut self, uid_set: &str) -> imap::error::Result<Vec<Vec<u8>>> {
        // RFC822 fetches are non-PEEK, so the server marks these seen.
        let collect = |fetches: &imap::types::ZeroCopy<Vec<imap::types::Fetch>>| {
            fetches
                .iter()
                .filter_map(|f| f.body().map(|b| b.to_vec()))
                .collect::<Vec<_>>()
        };
        match self {
            ImapSession::Tls(s) => Ok(collect(&s.uid_fetch(uid_set, "RFC822")?)),
            ImapSession::Plain(s) => Ok(collect(&s.uid_fetch(uid_set, "RFC822")?)),
        }
    }

    fn logout(&mut self) -> imap::error::Result<()> {
        match self {
            ImapSession::Tls(s) => s.logout(),
            ImapSession::Plain(s) => s.logout(),
        }
    }
}

/// The bundled [`MailTransport`] implementation.
#[derive(Default)]
pub struct ImapTransport {
    session: Option<ImapSession>,
}

impl ImapTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(&mut self, login: &MailboxLogin) -> Result<(), PipelineError> {
        let login = login.clone();
        let session = task::spawn_blocking(move || connect_blocking(&login))
            .await
            .map_err(|e| PipelineError::Internal(format!("mailbox task failed: {e}")))??;
        self.session = Some(session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn search_recent_unseen(
        &mut self,
        lookback: Duration,
    ) -> Result<Vec<MailMessage>, PipelineError> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| PipelineError::Transport("mailbox session is not connected".into()))?;

        let (session, result) = task::spawn_blocking(move || {
            let result = search_blocking(&mut session, lookback);
            (session, result)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("mailbox task failed: {e}")))?;

        self.session = Some(session);
        result
    }

    async fn disconnect(&mut self) -> Result<(), PipelineError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        task::spawn_blocking(move || session.logout().map_err(map_imap_error))
            .await
            .map_err(|e| PipelineError::Internal(format!("mailbox task failed: {e}")))?
    }
}

fn connect_blocking(login: &MailboxLogin) -> Result<ImapSession, PipelineError> {
    let host = login.host.as_str();
    let mut session = if login.tls {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| PipelineError::Mailbox(format!("TLS setup failed: {e}")))?;
        let client = imap::connect((host, login.port), host, &tls).map_err(map_imap_error)?;
        ImapSession::Tls(
            client
                .login(&login.email, &login.password)
                .map_err(|(e, _)| map_imap_error(e))?,
        )
    } else {
        let stream = TcpStream::connect((host, login.port))
            .map_err(|e| PipelineError::Transport(format!("{host}:{}: {e}", login.port)))?;
        let client = imap::Client::new(stream);
        ImapSession::Plain(
            client
                .login(&login.email, &login.password)
                .map_err(|(e, _)| map_imap_error(e))?,
        )
    };
    match &mut session {
        ImapSession::Tls(s) => s.select(MAILBOX).map_err(map_imap_error)?,
        ImapSession::Plain(s) => s.select(MAILBOX).map_err(map_imap_error)?,
    };
    Ok(session)
}

fn search_blocking(
    session: &mut ImapSession,
    lookback: Duration,
) -> Result<Vec<MailMessage>, PipelineError> {
    // SINCE has day granularity; it is only a coarse prefilter backing up
    // the UNSEEN flag. The watcher applies the precise staleness guard.
    let since = (Utc::now() - chrono::Duration::from_std(lookback).unwrap_or_default())
        .format("%d-%b-%Y")
        .to_string();
    let query = format!("UNSEEN SINCE {since}");
    let uids = session.uid_search(&query).map_err(map_imap_error)?;
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let uid_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    debug!(count = uids.len(), "Fetching unseen messages");

    let raw_messages = session.fetch_raw(&uid_set).map_err(map_imap_error)?;
    let parser = MessageParser::default();
    let mut messages: Vec<MailMessage> = raw_messages
        .iter()
        .filter_map(|raw| parse_message(&parser, raw))
        .collect();
    // Oldest first; the watcher scans the batch newest-first.
    messages.sort_by_key(|m| m.date);
    Ok(messages)
}

fn parse_message(parser: &MessageParser, raw: &[u8]) -> Option<MailMessage> {
    let msg = parser.parse(raw)?;
    let date = msg
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);
    Some(MailMessage {
        from: msg
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .unwrap_or("")
            .to_string(),
        subject: msg.subject().unwrap_or("").to_string(),
        date,
        body_text: msg.body_text(0).map(|s| s.into_owned()),
        body_html: msg.body_html(0).map(|s| s.into_owned()),
    })
}

fn map_imap_error(e: imap::error::Error) -> PipelineError {
    match e {
        imap::error::Error::Io(io) => PipelineError::Transport(io.to_string()),
        imap::error::Error::ConnectionLost => {
            PipelineError::Transport("connection lost".into())
        }
        other => PipelineError::Mailbox(other.to_string()),
    }
}
