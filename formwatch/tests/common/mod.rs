//! Shared test doubles: scripted browser engine, scripted mail transport
//! and an in-memory update sink.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use formwatch::errors::PipelineError;
use formwatch::{
    BrowserContext, BrowserEngine, EmailConfig, MailMessage, MailTransport, MailboxLogin, Page,
    RunStatus, UpdateEvent, UpdateSink, WatchPolicy,
};

pub type Ops = Arc<Mutex<Vec<String>>>;

/// Knobs for the scripted engine.
#[derive(Default)]
pub struct MockBehavior {
    /// Selectors that never become visible (wait times out).
    pub invisible: HashSet<String>,
    pub fail_navigation: bool,
    pub fail_screenshot: bool,
    pub fail_page_close: bool,
    pub fail_context_close: bool,
}

pub struct MockEngine {
    behavior: Arc<MockBehavior>,
    pub ops: Ops,
    pub contexts_created: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Arc::new(behavior),
            ops: Arc::new(Mutex::new(Vec::new())),
            contexts_created: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserEngine for MockEngine {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, PipelineError> {
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push("new_context".into());
        Ok(Box::new(MockContext {
            behavior: self.behavior.clone(),
            ops: self.ops.clone(),
        }))
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockContext {
    behavior: Arc<MockBehavior>,
    ops: Ops,
}

#[async_trait]
impl BrowserContext for MockContext {
    async fn new_page(&self) -> Result<Box<dyn Page>, PipelineError> {
        self.ops.lock().unwrap().push("new_page".into());
        Ok(Box::new(MockPage {
            behavior: self.behavior.clone(),
            ops: self.ops.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if self.behavior.fail_context_close {
            return Err(PipelineError::Engine("context already disposed".into()));
        }
        self.ops.lock().unwrap().push("context_close".into());
        Ok(())
    }
}

struct MockPage {
    behavior: Arc<MockBehavior>,
    ops: Ops,
    closed: AtomicBool,
}

impl MockPage {
    fn push(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Page for MockPage {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), PipelineError> {
        self.push(format!("viewport:{width}x{height}"));
        Ok(())
    }

    async fn set_user_agent(&self, _user_agent: &str) -> Result<(), PipelineError> {
        self.push("user_agent".into());
        Ok(())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), PipelineError> {
        if self.behavior.fail_navigation {
            return Err(PipelineError::Navigation(format!(
                "{url}: net::ERR_CONNECTION_REFUSED"
            )));
        }
        self.push(format!("navigate:{url}"));
        Ok(())
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), PipelineError> {
        if self.behavior.invisible.contains(selector) {
            return Err(PipelineError::Timeout(format!(
                "element {selector} not visible after {timeout:?}"
            )));
        }
        self.push(format!("wait:{selector}"));
        Ok(())
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), PipelineError> {
        self.push(format!("scroll:{selector}"));
        Ok(())
    }

    async fn hover(&self, selector: &str) -> Result<(), PipelineError> {
        self.push(format!("hover:{selector}"));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), PipelineError> {
        self.push(format!("click:{selector}"));
        Ok(())
    }

    async fn type_char(&self, ch: char) -> Result<(), PipelineError> {
        self.push(format!("char:{ch}"));
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), PipelineError> {
        if self.behavior.fail_screenshot {
            return Err(PipelineError::Engine("capture returned no data".into()));
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, b"png")?;
        self.push("screenshot".into());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PipelineError> {
        if self.behavior.fail_page_close {
            return Err(PipelineError::Engine("target is already detached".into()));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.push("page_close".into());
        Ok(())
    }
}

pub type BatchQueue = Arc<Mutex<VecDeque<Result<Vec<MailMessage>, PipelineError>>>>;

/// Scripted mail transport: each search pops the next queued batch; an
/// exhausted queue reads as an empty mailbox.
pub struct MockTransport {
    pub queue: BatchQueue,
    pub connected: bool,
    pub fail_connect: bool,
    pub connects: Arc<AtomicUsize>,
    pub searches: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(Mutex::new(VecDeque::new())))
    }

    pub fn with_queue(queue: BatchQueue) -> Self {
        Self {
            queue,
            connected: false,
            fail_connect: false,
            connects: Arc::new(AtomicUsize::new(0)),
            searches: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn queue_batch(&self, batch: Vec<MailMessage>) {
        self.queue.lock().unwrap().push_back(Ok(batch));
    }

    pub fn queue_error(&self, error: PipelineError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn connect(&mut self, _login: &MailboxLogin) -> Result<(), PipelineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(PipelineError::Mailbox("authentication failed".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn search_recent_unseen(
        &mut self,
        _lookback: Duration,
    ) -> Result<Vec<MailMessage>, PipelineError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        match self.queue.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn disconnect(&mut self) -> Result<(), PipelineError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }
}

/// Sink that records every event for later assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<UpdateEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UpdateEvent::Log { line } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<(String, RunStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UpdateEvent::Status {
                    message, status, ..
                } => Some((message, status)),
                _ => None,
            })
            .collect()
    }

    pub fn progress_updates(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UpdateEvent::ProgressUpdate { current_line, .. } => Some(current_line),
                _ => None,
            })
            .collect()
    }
}

impl UpdateSink for MemorySink {
    fn notify(&self, event: UpdateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn message(subject: &str, body: &str, age: Duration) -> MailMessage {
    MailMessage {
        from: "noreply@example.com".into(),
        subject: subject.into(),
        date: Utc::now() - chrono::Duration::from_std(age).unwrap(),
        body_text: Some(body.into()),
        body_html: None,
    }
}

pub fn email_config(
    subject_filter: Option<&str>,
    body_keyword: Option<&str>,
    extraction_regex: Option<&str>,
) -> EmailConfig {
    EmailConfig {
        email: "bot@example.com".into(),
        password: "hunter2".into(),
        imap_host: "imap.example.com".into(),
        imap_port: 993,
        imap_tls: true,
        subject_filter: subject_filter.map(str::to_string),
        body_keyword_filter: body_keyword.map(str::to_string),
        extraction_regex: extraction_regex.map(str::to_string),
    }
}

/// Compressed time bounds so watch loops finish in milliseconds.
pub fn fast_policy() -> WatchPolicy {
    WatchPolicy {
        window: Duration::from_millis(350),
        poll_interval: Duration::from_millis(100),
        ..WatchPolicy::default()
    }
}
