use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Browser engine error: {0}")]
    Engine(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Mailbox transport dropped: {0}")]
    Transport(String),

    #[error("Invalid extraction pattern: {0}")]
    InvalidPattern(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True when the error text points at a dropped mailbox session or a
    /// socket-level failure, i.e. a reconnect on the next poll may help.
    pub fn is_transport_drop(&self) -> bool {
        match self {
            PipelineError::Transport(_) => true,
            PipelineError::Mailbox(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("session ended")
                    || msg.contains("connection closed")
                    || msg.contains("socket")
            }
            _ => false,
        }
    }
}
