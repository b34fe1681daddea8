//! Error kinds shared across the orchestration engine.
//!
//! Every stage of the pipeline, the store, the lock manager, and the genre
//! normalizer report failures through [`AbForgeError`]. The dispatcher is the
//! single place that converts an `AbForgeError` into a terminal task status
//! and an `error` string (see `dispatcher::run_task`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbForgeError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("HTTP request failed: {0}")]
    HttpTransient(#[from] reqwest::Error),

    #[error("HTTP retries exhausted after {attempts} attempts: {last_error}")]
    HttpExhausted { attempts: u32, last_error: String },

    #[error("failed to parse metadata: {0}")]
    ParseError(String),

    #[error("filesystem error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("timed out acquiring lock on {path}")]
    LockTimeout { path: String },

    #[error("tag embedding failed for {file}: {reason}")]
    TagError { file: String, reason: String },

    #[error("genre classification failed: {0}")]
    Llm(String),

    #[error("task skipped by user")]
    SkippedByUser,

    #[error("job was cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AbForgeError>;

impl AbForgeError {
    /// Stable short name used as `tasks.error`'s classification prefix, and
    /// by the dispatcher to decide whether a failure is retriable.
    pub fn kind(&self) -> &'static str {
        match self {
            AbForgeError::ConfigurationInvalid(_) => "ConfigurationInvalid",
            AbForgeError::SourceNotFound(_) => "SourceNotFound",
            AbForgeError::UnsupportedUrl(_) => "UnsupportedURL",
            AbForgeError::HttpTransient(_) => "HTTPTransient",
            AbForgeError::HttpExhausted { .. } => "HTTPExhausted",
            AbForgeError::ParseError(_) => "ParseError",
            AbForgeError::FileSystem(_) => "FileSystemError",
            AbForgeError::LockTimeout { .. } => "LockTimeout",
            AbForgeError::TagError { .. } => "TagError",
            AbForgeError::Llm(_) => "LLMError",
            AbForgeError::SkippedByUser => "SkippedByUser",
            AbForgeError::Cancelled => "Cancelled",
            AbForgeError::Database(_) => "Database",
            AbForgeError::Serialization(_) => "Serialization",
            AbForgeError::Internal(_) => "Internal",
        }
    }

    /// Whether the worker loop should consume a retry and re-attempt the
    /// task, as opposed to terminating it directly.
    ///
    /// `LockTimeout` is retriable per spec.md §7. `HTTPExhausted` consumes a
    /// retry rather than terminating directly, per the Open Question
    /// resolution in SPEC_FULL.md §9.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AbForgeError::HttpTransient(_)
                | AbForgeError::HttpExhausted { .. }
                | AbForgeError::LockTimeout { .. }
        )
    }
}
