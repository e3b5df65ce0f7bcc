//! Bounded mailbox polling with an ordered filter/extraction chain.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::{Duration, Instant};

use crate::config::EmailConfig;
use crate::events::RunLogger;
use crate::mailbox::{MailMessage, MailTransport, MailboxLogin};

/// Time bounds for one watch call.
///
/// Defaults give a 60 s window polled every 7 s: a single record never
/// blocks the run for more than a minute, and the fixed cadence avoids
/// hammering the mailbox server. The IMAP `SINCE` lookback is a coarse
/// day-granularity prefilter; `staleness` relative to connect time is the
/// authoritative cutoff.
#[derive(Debug, Clone, Copy)]
pub struct WatchPolicy {
    pub window: Duration,
    pub poll_interval: Duration,
    pub lookback: Duration,
    pub staleness: Duration,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(7),
            lookback: Duration::from_secs(10 * 60),
            staleness: Duration::from_secs(15 * 60),
        }
    }
}

/// Poll the mailbox until a message passes the whole filter chain or the
/// window closes. Returns the extracted value, or `None`.
pub async fn watch(
    transport: &mut dyn MailTransport,
    config: &EmailConfig,
    policy: &WatchPolicy,
    logger: &RunLogger,
) -> Option<String> {
    logger.debug(None, "Starting to watch for mailbox response");

    if let Err(e) = config.validate_login() {
        logger.error(None, &e.to_string());
        return None;
    }
    let login = MailboxLogin::from(config);

    if let Err(e) = transport.connect(&login).await {
        logger.error(None, &format!("Failed to connect to mailbox: {e}"));
        return None;
    }
    logger.debug(
        None,
        &format!("Connected to mailbox {}:{}", login.host, login.port),
    );
    let connected_at = Utc::now();

    // Compiled once per watch; an invalid pattern can never match, so the
    // watch keeps polling and comes back empty.
    let pattern = match config.extraction_regex() {
        Some(src) => match Regex::new(src) {
            Ok(re) => Some(re),
            Err(e) => {
                logger.error(None, &format!("Invalid extraction regex \"{src}\": {e}"));
                None
            }
        },
        None => None,
    };

    let start = Instant::now();
    let mut extracted: Option<String> = None;

    while start.elapsed() < policy.window {
        logger.debug(
            None,
            &format!(
                "Checking mailbox, elapsed {}s of {}s",
                start.elapsed().as_secs(),
                policy.window.as_secs()
            ),
        );

        if !transport.is_connected() {
            if let Err(e) = transport.connect(&login).await {
                logger.warn(None, &format!("Mailbox reconnect failed: {e}"));
                tokio::time::sleep(policy.poll_interval).await;
                continue;
            }
        }

        match transport.search_recent_unseen(policy.lookback).await {
            Ok(batch) => {
                extracted = scan_batch(&batch, config, pattern.as_ref(), connected_at, policy, logger);
                if extracted.is_some() {
                    break;
                }
            }
            Err(e) => {
                if e.is_transport_drop() {
                    logger.warn(
                        None,
                        &format!("Mailbox session dropped, reconnecting on next poll: {e}"),
                    );
                    let _ = transport.disconnect().await;
                } else {
                    logger.error(None, &format!("Error searching mailbox: {e}"));
                }
            }
        }

        tokio::time::sleep(policy.poll_interval).await;
    }

    if let Err(e) = transport.disconnect().await {
        logger.warn(None, &format!("Error disconnecting mailbox: {e}"));
    }

    match &extracted {
        Some(value) => logger.info(None, &format!("Mailbox response extracted: {value}")),
        None => logger.debug(None, "No matching mailbox response within the watch window"),
    }
    extracted
}

/// Apply the filter chain to a batch, newest-first, returning the first
/// message that passes every stage and yields an extraction.
fn scan_batch(
    batch: &[MailMessage],
    config: &EmailConfig,
    pattern: Option<&Regex>,
    connected_at: DateTime<Utc>,
    policy: &WatchPolicy,
    logger: &RunLogger,
) -> Option<String> {
    if batch.is_empty() {
        logger.debug(None, "No new messages found");
        return None;
    }
    logger.debug(None, &format!("Found {} new message(s) to filter", batch.len()));

    for msg in batch.iter().rev() {
        if let Some(value) = apply_chain(msg, config, pattern, connected_at, policy, logger) {
            return Some(value);
        }
    }
    logger.debug(None, "No message matched all filters and the extraction pattern");
    None
}

fn apply_chain(
    msg: &MailMessage,
    config: &EmailConfig,
    pattern: Option<&Regex>,
    connected_at: DateTime<Utc>,
    policy: &WatchPolicy,
    logger: &RunLogger,
) -> Option<String> {
    let staleness =
        chrono::Duration::from_std(policy.staleness).unwrap_or(chrono::Duration::MAX);
    if connected_at.signed_duration_since(msg.date) > staleness {
        logger.debug(
            None,
            &format!("Skipping stale message \"{}\" from {}", msg.subject, msg.date),
        );
        return None;
    }

    if let Some(filter) = config.subject_filter() {
        if !contains_ci(&msg.subject, filter) {
            logger.debug(
                None,
                &format!(
                    "Subject \"{}\" does not match filter \"{filter}\", skipping",
                    msg.subject
                ),
            );
            return None;
        }
    }

    let Some(content) = msg.content() else {
        logger.debug(
            None,
            &format!("Message \"{}\" has no text or HTML body, skipping", msg.subject),
        );
        return None;
    };

    if let Some(keyword) = config.body_keyword_filter() {
        if !contains_ci(content, keyword) {
            logger.debug(
                None,
                &format!(
                    "Body of \"{}\" does not contain keyword \"{keyword}\", skipping",
                    msg.subject
                ),
            );
            return None;
        }
    }

    let Some(re) = pattern else {
        // Filters passed but extraction is mandatory to produce a result.
        logger.debug(None, "No extraction regex configured, nothing to extract");
        return None;
    };

    match re.captures(content) {
        Some(caps) => {
            let full = caps.get(0).map(|m| m.as_str()).unwrap_or("");
            let value = caps
                .get(1)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(full);
            logger.debug(
                None,
                &format!("Extraction match in \"{}\": {full}", msg.subject),
            );
            Some(value.to_string())
        }
        None => {
            logger.debug(
                None,
                &format!("Extraction regex did not match message \"{}\"", msg.subject),
            );
            None
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
