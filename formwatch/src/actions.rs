//! Best-effort element interactions.
//!
//! Actions never raise: a missing or broken optional UI element degrades to
//! a logged warning and a `performed: false` outcome, and the pipeline
//! proceeds. A cosmetic element missing must not abort an otherwise viable
//! submission.

use std::time::Duration;

use crate::delay::{pause, Pacing};
use crate::engine::Page;
use crate::events::RunLogger;

/// How long an element gets to become visible before the action is skipped.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one interaction attempt.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub performed: bool,
    pub reason: Option<String>,
}

impl ActionOutcome {
    fn performed() -> Self {
        Self {
            performed: true,
            reason: None,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            performed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Scroll, hover, then click the element matching `selector`.
pub async fn click_element(
    page: &dyn Page,
    selector: &str,
    pacing: &Pacing,
    logger: &RunLogger,
    line_num: usize,
) -> ActionOutcome {
    logger.debug(Some(line_num), &format!("Attempting to click element: {selector}"));

    if let Err(e) = page.wait_visible(selector, VISIBILITY_TIMEOUT).await {
        logger.warn(
            Some(line_num),
            &format!("Element {selector} not found for clicking: {e}"),
        );
        return ActionOutcome::skipped(e.to_string());
    }

    if let Err(e) = page.scroll_into_view(selector).await {
        logger.warn(
            Some(line_num),
            &format!("Could not scroll {selector} into view: {e}"),
        );
        return ActionOutcome::skipped(e.to_string());
    }
    pause(pacing.post_scroll).await;

    if let Err(e) = page.hover(selector).await {
        logger.warn(Some(line_num), &format!("Could not hover {selector}: {e}"));
        return ActionOutcome::skipped(e.to_string());
    }
    logger.debug(Some(line_num), &format!("Hovered over element: {selector}"));
    pause(pacing.post_hover).await;

    if let Err(e) = page.click(selector).await {
        logger.warn(Some(line_num), &format!("Could not click {selector}: {e}"));
        return ActionOutcome::skipped(e.to_string());
    }
    logger.success(Some(line_num), &format!("Clicked element: {selector}"));
    ActionOutcome::performed()
}

/// Focus the element matching `selector` and type `text` character by
/// character with randomized inter-key delays.
pub async fn type_into(
    page: &dyn Page,
    selector: &str,
    text: &str,
    pacing: &Pacing,
    logger: &RunLogger,
    line_num: usize,
) -> ActionOutcome {
    logger.debug(
        Some(line_num),
        &format!("Attempting to type \"{text}\" into element: {selector}"),
    );

    if let Err(e) = page.wait_visible(selector, VISIBILITY_TIMEOUT).await {
        logger.warn(
            Some(line_num),
            &format!("Element {selector} not found for typing: {e}"),
        );
        return ActionOutcome::skipped(e.to_string());
    }

    if let Err(e) = page.scroll_into_view(selector).await {
        logger.warn(
            Some(line_num),
            &format!("Could not scroll {selector} into view: {e}"),
        );
        return ActionOutcome::skipped(e.to_string());
    }
    pause(pacing.post_scroll).await;

    // Click to focus before emitting characters.
    if let Err(e) = page.click(selector).await {
        logger.warn(Some(line_num), &format!("Could not focus {selector}: {e}"));
        return ActionOutcome::skipped(e.to_string());
    }
    pause(pacing.post_focus).await;

    for ch in text.chars() {
        if let Err(e) = page.type_char(ch).await {
            logger.warn(
                Some(line_num),
                &format!("Typing into {selector} failed: {e}"),
            );
            return ActionOutcome::skipped(e.to_string());
        }
        pause(pacing.keystroke).await;
    }

    logger.success(
        Some(line_num),
        &format!("Finished typing \"{text}\" into element: {selector}"),
    );
    ActionOutcome::performed()
}
