//! Record-driven web form automation with mailbox response correlation.
//!
//! For each input record the pipeline drives a scripted sequence of UI
//! interactions against a target page inside an isolated browser session,
//! submits, then polls a mailbox for the confirming message, extracts a
//! value from it through a filter chain and appends the outcome to a
//! durable log. Browser and mailbox transports sit behind capability
//! traits; the bundled implementations speak the Chrome DevTools protocol
//! and IMAP.

pub mod actions;
pub mod config;
pub mod delay;
pub mod engine;
pub mod errors;
pub mod events;
pub mod mailbox;
pub mod pipeline;
pub mod runner;

pub use config::{EmailConfig, Record, RunConfig};
pub use engine::{BrowserContext, BrowserEngine, EngineOptions, Page};
pub use errors::PipelineError;
pub use events::{NullSink, RunLogger, RunStatus, UpdateEvent, UpdateSink};
pub use mailbox::watcher::WatchPolicy;
pub use mailbox::{MailMessage, MailTransport, MailboxLogin};
pub use runner::{CancelToken, Runner, StatusSnapshot};
