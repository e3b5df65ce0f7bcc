//! Per-record pipeline: isolated session, scripted actions, response watch.
//!
//! Each record moves through SessionOpen -> Acting -> AwaitingResponse ->
//! Resolved -> Closed. Failures are captured at the record boundary: they
//! produce an error outcome and a best-effort screenshot, and never abort
//! the run. Session teardown always happens, step by step, with each close
//! independently fault-tolerant.

use chrono::Utc;
use std::time::Duration;

use crate::actions::{click_element, type_into};
use crate::config::{Record, RunConfig};
use crate::delay::{pause, Pacing};
use crate::engine::{BrowserContext, BrowserEngine, Page};
use crate::errors::PipelineError;
use crate::events::RunLogger;
use crate::mailbox::watcher::{self, WatchPolicy};
use crate::mailbox::MailTransport;
use crate::runner::CancelToken;

pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const VIEWPORT_WIDTH: u32 = 1366;
pub const VIEWPORT_HEIGHT: u32 = 768;
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/99.0.4844.51 Safari/537.36";

/// Process one record end to end. Never returns an error: every failure is
/// captured here, logged with the record's input line and recorded as an
/// error outcome.
#[allow(clippy::too_many_arguments)]
pub async fn process_record(
    engine: &dyn BrowserEngine,
    transport: &mut dyn MailTransport,
    config: &RunConfig,
    record: &Record,
    line_num: usize,
    policy: &WatchPolicy,
    pacing: &Pacing,
    logger: &RunLogger,
    cancel: &CancelToken,
) {
    if cancel.is_cancelled() {
        logger.info(Some(line_num), "Processing stopped or stop requested");
        return;
    }

    logger.info(
        Some(line_num),
        &format!(
            "Processing line {line_num}: text1={}, text2={}",
            record.text1, record.text2
        ),
    );

    let mut session = RecordSession::default();
    let result = run_steps(
        engine,
        transport,
        config,
        record,
        line_num,
        policy,
        pacing,
        logger,
        &mut session,
    )
    .await;

    match result {
        Ok(extracted) => {
            match &extracted {
                Some(value) => logger.success(
                    Some(line_num),
                    &format!("Email response received and extracted: {value}"),
                ),
                None => logger.warn(
                    Some(line_num),
                    "No relevant email response received within timeout",
                ),
            }
            logger.outcome(line_num, &record.line, extracted.as_deref());
        }
        Err(e) => {
            logger.error(
                Some(line_num),
                &format!("Error processing line \"{}\": {e}", record.line),
            );
            logger.outcome_error(line_num, &record.line, &e.to_string());
            capture_failure_screenshot(&session, line_num, logger).await;
        }
    }

    session.close(logger, line_num).await;
}

/// Session resources owned by one record, released in [`RecordSession::close`]
/// regardless of which step failed.
#[derive(Default)]
struct RecordSession {
    context: Option<Box<dyn BrowserContext>>,
    page: Option<Box<dyn Page>>,
}

impl RecordSession {
    async fn close(&mut self, logger: &RunLogger, line_num: usize) {
        if let Some(page) = self.page.take() {
            if page.is_closed() {
                // Already gone; nothing to release.
            } else if let Err(e) = page.close().await {
                logger.warn(Some(line_num), &format!("Error closing page: {e}"));
            } else {
                logger.debug(Some(line_num), "Page closed");
            }
        }
        if let Some(context) = self.context.take() {
            if let Err(e) = context.close().await {
                logger.warn(Some(line_num), &format!("Error closing browser session: {e}"));
            } else {
                logger.debug(Some(line_num), "Isolated browser session closed");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_steps(
    engine: &dyn BrowserEngine,
    transport: &mut dyn MailTransport,
    config: &RunConfig,
    record: &Record,
    line_num: usize,
    policy: &WatchPolicy,
    pacing: &Pacing,
    logger: &RunLogger,
    session: &mut RecordSession,
) -> Result<Option<String>, PipelineError> {
    // SessionOpen: isolated cookies/storage, fixed viewport and user agent.
    session.context = Some(engine.new_context().await?);
    let context = session
        .context
        .as_deref()
        .ok_or_else(|| PipelineError::Internal("session context missing".into()))?;
    session.page = Some(context.new_page().await?);
    let page = session
        .page
        .as_deref()
        .ok_or_else(|| PipelineError::Internal("session page missing".into()))?;

    page.set_viewport(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).await?;
    page.set_user_agent(USER_AGENT).await?;
    logger.debug(Some(line_num), "Isolated browser session and page created");

    page.navigate(&config.target_url, NAVIGATION_TIMEOUT).await?;
    logger.info(Some(line_num), &format!("Navigated to {}", config.target_url));
    pause(pacing.inter_step).await;

    // Acting: each configured selector in fixed order, inter-step delay
    // after every executed step. Absent selectors are skipped.
    if let Some(selector) = &config.button1_selector {
        click_element(page, selector, pacing, logger, line_num).await;
        pause(pacing.inter_step).await;
    }

    if let Some(selector) = &config.button2_selector {
        click_element(page, selector, pacing, logger, line_num).await;
        pause(pacing.inter_step).await;
    }

    if let Some(selector) = &config.input_field1_selector {
        if !record.text1.is_empty() {
            type_into(page, selector, &record.text1, pacing, logger, line_num).await;
            pause(pacing.inter_step).await;
        }
    }

    if let Some(selector) = &config.input_field2_selector {
        if !record.text2.is_empty() {
            type_into(page, selector, &record.text2, pacing, logger, line_num).await;
            pause(pacing.inter_step).await;
        }
    }

    if let Some(selector) = &config.submit_button_selector {
        click_element(page, selector, pacing, logger, line_num).await;
        pause(pacing.inter_step).await;
    }

    // AwaitingResponse: may block up to the watch window.
    logger.info(
        Some(line_num),
        &format!(
            "Waiting for email response (up to {}s)",
            policy.window.as_secs()
        ),
    );
    Ok(watcher::watch(transport, &config.email_config, policy, logger).await)
}

async fn capture_failure_screenshot(
    session: &RecordSession,
    line_num: usize,
    logger: &RunLogger,
) {
    let Some(page) = session.page.as_deref() else {
        return;
    };
    if page.is_closed() {
        return;
    }
    let path = logger.artifact_dir().join(format!(
        "error_screenshot_line_{line_num}_{}.png",
        Utc::now().timestamp_millis()
    ));
    match page.screenshot(&path).await {
        Ok(()) => logger.debug(
            Some(line_num),
            &format!("Screenshot taken: {}", path.display()),
        ),
        Err(e) => logger.error(Some(line_num), &format!("Failed to take screenshot: {e}")),
    }
}
