//! Browser automation capability traits.
//!
//! The pipeline talks to the browser through these traits only; the bundled
//! implementation drives headless Chromium over the DevTools protocol (see
//! [`cdp`]), and tests substitute scripted fakes.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PipelineError;

pub mod cdp;

/// Options for launching the shared engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub headless: bool,
    /// Explicit browser binary; otherwise resolved from `FORMWATCH_BROWSER`
    /// or a list of well-known names.
    pub browser_path: Option<std::path::PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            headless: true,
            browser_path: None,
        }
    }
}

/// The shared, long-lived automation engine. Initialized once per run and
/// torn down once at run end; isolated sessions are created per record.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Open an isolated session with independent cookies and storage.
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, PipelineError>;

    /// Tear the engine down. Safe to call more than once.
    async fn shutdown(&self) -> Result<(), PipelineError>;
}

/// An isolated browser session scoped to one record.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Page>, PipelineError>;

    async fn close(&self) -> Result<(), PipelineError>;
}

/// One page within a session. All element operations address elements by
/// CSS selector; per-element handles are deliberately not exposed.
#[async_trait]
pub trait Page: Send + Sync {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), PipelineError>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), PipelineError>;

    /// Navigate and wait for the document to finish loading, bounded by
    /// `timeout`. A timeout is fatal for the enclosing record.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PipelineError>;

    /// Wait until an element matching `selector` is present and visible.
    /// Returns `PipelineError::Timeout` when it never becomes visible.
    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), PipelineError>;

    async fn scroll_into_view(&self, selector: &str) -> Result<(), PipelineError>;

    async fn hover(&self, selector: &str) -> Result<(), PipelineError>;

    async fn click(&self, selector: &str) -> Result<(), PipelineError>;

    /// Emit one character into the focused element.
    async fn type_char(&self, ch: char) -> Result<(), PipelineError>;

    async fn screenshot(&self, path: &Path) -> Result<(), PipelineError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), PipelineError>;
}

/// Launch the default engine implementation.
pub async fn create_engine(
    options: &EngineOptions,
) -> Result<Arc<dyn BrowserEngine>, PipelineError> {
    let engine = cdp::CdpEngine::launch(options).await?;
    Ok(Arc::new(engine))
}
