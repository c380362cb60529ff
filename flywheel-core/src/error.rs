use serde_json::Value;
use thiserror::Error;

/// Errors about the queue itself - caller input, postgres/network errors,
/// lifecycle misuse.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("could not serialize jsonb field: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// True for connection-class failures worth retrying. Everything else
    /// (constraint violations, decode errors, caller mistakes) surfaces
    /// immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .map(|code| code.starts_with("08") || code == "57P03")
                    .unwrap_or(false),
                _ => false,
            },
            _ => false,
        }
    }
}

/// A failure reported by (or on behalf of) a user handler. Captured on the
/// attempt row as `error_message` / `error_details` and fed into the
/// retry-or-fail decision.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details: Some(details),
        }
    }

    /// The error the timeout wrapper reports when the deadline wins the race.
    pub(crate) fn timed_out() -> Self {
        Self::new("Execution timed out")
    }

    /// Recover a message from a panic payload so a panicking handler is
    /// recorded like any other handler failure.
    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            Some((*s).to_owned())
        } else {
            panic.downcast_ref::<String>().cloned()
        };
        match message {
            Some(message) => Self::new(format!("handler panicked: {message}")),
            None => Self::new("handler panicked"),
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}
