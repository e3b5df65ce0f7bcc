//! Run orchestration: sequential record processing, cooperative stop,
//! status reporting and reset.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Record, RunConfig, DEFAULT_LOG_PATH};
use crate::delay::{pause, Pacing};
use crate::engine::{create_engine, BrowserEngine, EngineOptions};
use crate::errors::PipelineError;
use crate::events::{RunLogger, RunStatus, UpdateEvent, UpdateSink};
use crate::mailbox::imap::ImapTransport;
use crate::mailbox::watcher::WatchPolicy;
use crate::mailbox::MailTransport;
use crate::pipeline::process_record;

/// Grace period a reset grants an in-flight record before the engine is
/// force-closed.
const RESET_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag, checked before each record and at the
/// per-record entry point. Never preempts in-flight I/O.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of the run state for status queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub current_line: usize,
    pub total_lines: usize,
    pub configured: bool,
}

#[derive(Default)]
struct RunState {
    running: bool,
    stop_requested: bool,
    current_line: usize,
    total_lines: usize,
    config: Option<RunConfig>,
}

pub type EngineFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn BrowserEngine>, PipelineError>> + Send>>;
pub type EngineFactory = Arc<dyn Fn(EngineOptions) -> EngineFuture + Send + Sync>;
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn MailTransport> + Send + Sync>;

/// Owns run-wide state and processes records strictly sequentially.
///
/// Records are never processed concurrently: the mailbox's unseen-marking is
/// global state that cannot be safely interleaved across watches. One
/// `Runner` admits one active run at a time.
pub struct Runner {
    sink: Arc<dyn UpdateSink>,
    state: Mutex<RunState>,
    cancel: CancelToken,
    engine: tokio::sync::Mutex<Option<Arc<dyn BrowserEngine>>>,
    engine_factory: EngineFactory,
    transport_factory: TransportFactory,
    engine_options: EngineOptions,
    pacing: Pacing,
    policy: WatchPolicy,
}

impl Runner {
    pub fn new(sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(RunState::default()),
            cancel: CancelToken::default(),
            engine: tokio::sync::Mutex::new(None),
            engine_factory: Arc::new(|options| {
                Box::pin(async move { create_engine(&options).await })
            }),
            transport_factory: Arc::new(|| Box::new(ImapTransport::new()) as Box<dyn MailTransport>),
            engine_options: EngineOptions::default(),
            pacing: Pacing::default(),
            policy: WatchPolicy::default(),
        }
    }

    /// Substitute the engine implementation. Used by tests and embedders.
    pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
        self.engine_factory = factory;
        self
    }

    /// Substitute the mail transport implementation.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_watch_policy(mut self, policy: WatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.state.lock().expect("run state poisoned");
        StatusSnapshot {
            running: state.running,
            current_line: state.current_line,
            total_lines: state.total_lines,
            configured: state.config.is_some(),
        }
    }

    /// Run the whole record file under `config`.
    ///
    /// A no-op (with a status event) when a run is already active.
    /// Configuration errors halt before any record is processed.
    pub async fn start(&self, config: RunConfig) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock().expect("run state poisoned");
            if state.running {
                let (current, total) = (state.current_line, state.total_lines);
                drop(state);
                tracing::warn!("Run is already in progress");
                self.notify_status("Run is already in progress", RunStatus::Running, current, total);
                return Ok(());
            }
            state.running = true;
            state.stop_requested = false;
            state.current_line = 0;
            state.total_lines = 0;
            state.config = Some(config.clone());
        }
        self.cancel.clear();

        let logger = RunLogger::new(self.sink.clone(), config.log_path());
        if let Err(e) = logger.ensure_log_dir() {
            let message = format!(
                "Error creating log directory for {}: {e}",
                config.log_path().display()
            );
            tracing::error!("{message}");
            self.finish_with_error(&message);
            return Err(e.into());
        }

        logger.info(None, "Starting run");
        self.notify_status("Run starting", RunStatus::Running, 0, 0);

        if let Err(e) = config.validate() {
            logger.error(None, &e.to_string());
            self.finish_with_error(&e.to_string());
            return Err(e);
        }

        let input_path = config.input_path();
        let lines: Vec<String> = match tokio::fs::read_to_string(&input_path).await {
            Ok(content) => content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                let message = format!("Error reading input file {}: {e}", input_path.display());
                logger.error(None, &message);
                self.finish_with_error(&message);
                return Err(e.into());
            }
        };

        let total = lines.len();
        {
            self.state.lock().expect("run state poisoned").total_lines = total;
        }
        self.sink
            .notify(UpdateEvent::ProgressInit { total_lines: total });
        logger.info(
            None,
            &format!("Loaded {total} lines from {}", input_path.display()),
        );

        let engine = match (self.engine_factory)(self.engine_options.clone()).await {
            Ok(engine) => engine,
            Err(e) => {
                let message = format!("Error initializing browser engine: {e}");
                logger.error(None, &message);
                self.finish_with_error(&message);
                return Err(e);
            }
        };
        *self.engine.lock().await = Some(engine.clone());
        logger.info(None, "Browser engine initialized");

        for (index, line) in lines.iter().enumerate() {
            if self.cancel.is_cancelled() {
                logger.info(None, "Stop was requested, terminating processing");
                break;
            }
            let line_num = index + 1;
            {
                self.state.lock().expect("run state poisoned").current_line = line_num;
            }
            self.sink.notify(UpdateEvent::ProgressUpdate {
                current_line: line_num,
                total_lines: total,
                line_content: line.clone(),
            });

            // Invalid lines are skipped without touching the pipeline but
            // still count toward progress.
            match Record::parse(line) {
                Some(record) => {
                    let mut transport = (self.transport_factory)();
                    process_record(
                        engine.as_ref(),
                        transport.as_mut(),
                        &config,
                        &record,
                        line_num,
                        &self.policy,
                        &self.pacing,
                        &logger,
                        &self.cancel,
                    )
                    .await;
                }
                None => {
                    logger.warn(Some(line_num), &format!("Skipping invalid line: {line}"));
                }
            }

            pause(self.pacing.inter_record).await;
        }

        logger.info(None, "All lines processed");
        self.shutdown_engine(Some(&logger)).await;

        let (current, total) = {
            let mut state = self.state.lock().expect("run state poisoned");
            state.running = false;
            state.stop_requested = false;
            (state.current_line, state.total_lines)
        };
        self.cancel.clear();
        logger.info(None, "Run finished");
        self.notify_status("Run finished processing", RunStatus::Idle, current, total);
        Ok(())
    }

    /// Request a cooperative stop. The in-flight record, including its watch
    /// window, runs to completion.
    pub fn stop(&self) {
        let (running, current, total) = {
            let mut state = self.state.lock().expect("run state poisoned");
            if state.running {
                state.stop_requested = true;
            }
            (state.running, state.current_line, state.total_lines)
        };
        if !running {
            tracing::warn!("No run in progress");
            self.notify_status("No run in progress", RunStatus::Idle, current, total);
            return;
        }
        self.cancel.cancel();
        tracing::info!("Stop requested; run will stop after the current record");
        self.notify_status(
            "Stopping after the current record",
            RunStatus::Stopping,
            current,
            total,
        );
    }

    /// Stop (if needed), force-close the shared engine after a grace period,
    /// zero all counters and truncate the durable log. Idempotent.
    pub async fn reset(&self) {
        tracing::info!("Resetting run state");
        let (was_running, log_path) = {
            let state = self.state.lock().expect("run state poisoned");
            (
                state.running,
                state
                    .config
                    .as_ref()
                    .map(|c| c.log_path())
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            )
        };
        if was_running {
            self.stop();
            tokio::time::sleep(RESET_GRACE).await;
        }

        self.shutdown_engine(None).await;

        {
            let mut state = self.state.lock().expect("run state poisoned");
            *state = RunState::default();
        }
        self.cancel.clear();

        let logger = RunLogger::new(self.sink.clone(), &log_path);
        match logger.truncate() {
            Ok(()) => tracing::info!(path = %log_path.display(), "Output log cleared"),
            Err(e) => tracing::warn!(path = %log_path.display(), "Error clearing output log: {e}"),
        }

        self.notify_status("Run state reset", RunStatus::Idle, 0, 0);
        self.sink.notify(UpdateEvent::LogReset {
            message: "Logs and run state reset".into(),
        });
    }

    async fn shutdown_engine(&self, logger: Option<&RunLogger>) {
        if let Some(engine) = self.engine.lock().await.take() {
            match engine.shutdown().await {
                Ok(()) => {
                    if let Some(logger) = logger {
                        logger.info(None, "Browser engine closed");
                    }
                }
                Err(e) => {
                    if let Some(logger) = logger {
                        logger.error(None, &format!("Error closing browser engine: {e}"));
                    } else {
                        tracing::error!("Error closing browser engine: {e}");
                    }
                }
            }
        }
    }

    fn finish_with_error(&self, message: &str) {
        {
            let mut state = self.state.lock().expect("run state poisoned");
            state.running = false;
            state.stop_requested = false;
        }
        self.sink.notify(UpdateEvent::Error {
            message: message.to_string(),
        });
        self.notify_status(message, RunStatus::Error, 0, 0);
    }

    fn notify_status(&self, message: &str, status: RunStatus, current: usize, total: usize) {
        self.sink.notify(UpdateEvent::Status {
            message: message.to_string(),
            status,
            current_line: current,
            total_lines: total,
        });
    }
}
