//! Error types for Stockpile.

use std::io;

use crate::pipeline::state::RunStage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure raised by an external collaborator call.
///
/// The first three variants are transient and retried by
/// [`RetryPolicy`](crate::retry::RetryPolicy); everything else is fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("worker failed: {0}")]
    Internal(String),
}

impl CollaboratorError {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Network(_) | Self::Unavailable(_)
        )
    }

    /// Short label for the failure class, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Network(_) => "network",
            Self::Unavailable(_) => "unavailable",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission",
            Self::Internal(_) => "internal",
        }
    }

    /// Map a free-form failure message (HTTP status text, CLI stderr) onto
    /// the taxonomy. Unrecognized messages are treated as validation
    /// failures so they are never retried blindly.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["rate limit", "too many requests", "429", "resource_exhausted"]) {
            Self::RateLimited(message)
        } else if has(&["network", "connection", "timed out", "timeout", "dns", "reset by peer"]) {
            Self::Network(message)
        } else if has(&["unavailable", "try again", "try later", "quota", "503", "502", "overloaded"]) {
            Self::Unavailable(message)
        } else if has(&["not found", "404", "no such file", "does not exist"]) {
            Self::NotFound(message)
        } else if has(&["permission", "forbidden", "403", "401", "unauthorized", "private video"]) {
            Self::Permission(message)
        } else {
            Self::Validation(message)
        }
    }

    /// Map an HTTP status code onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = format!("HTTP {status}: {body}");
        match status {
            429 => Self::RateLimited(message),
            408 => Self::Network(message),
            401 | 403 => Self::Permission(message),
            404 => Self::NotFound(message),
            500..=599 => Self::Unavailable(message),
            _ => Self::Validation(message),
        }
    }
}

impl From<io::Error> for CollaboratorError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind;

        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::PermissionDenied => Self::Permission(message),
            ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::Unsupported => {
                Self::Validation(message)
            }
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Self::Network(message),
            _ => Self::Unavailable(message),
        }
    }
}

/// Pipeline-related errors.
///
/// Any of these reaching the orchestrator's top level fails the run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transcription failed: {0}")]
    Transcribe(CollaboratorError),

    #[error("Phrase extraction failed: {0}")]
    ExtractPhrases(CollaboratorError),

    #[error("Project layout failed: {0}")]
    Layout(CollaboratorError),

    #[error("Folder creation failed for phrase '{phrase}': {source}")]
    PhraseFolder {
        phrase: String,
        source: CollaboratorError,
    },

    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition { from: RunStage, to: RunStage },
}

/// Errors handing detections to the task scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task scheduler is not running; dropped detection for {0}")]
    Closed(String),

    #[error("Already processing {0}")]
    Duplicate(String),
}

/// File watcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Input folder does not exist: {0}")]
    MissingInput(String),

    #[error("Failed to start filesystem observer: {0}")]
    Observer(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Job history persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open job store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
