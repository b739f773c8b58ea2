use thiserror::Error;

use crate::classify::LineKind;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Run timed out after {seconds}s; no traces were persisted")]
    Timeout { seconds: u64 },

    #[error("Persisting traces timed out after {seconds}s; traces written before then are kept")]
    PersistTimeout { seconds: u64 },
}

/// Failure of a remote collaborator: the log source or the fusion config document.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config source returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Log source error for {log_group}: {message}")]
    LogSource { log_group: String, message: String },

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

/// A single malformed line. Skipped by the engine, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("report line is missing the {field} field")]
    MissingField { field: &'static str },

    #[error("report field {field} has a non-numeric value {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("trace info line carries no request id")]
    MissingRequestId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    Parse(ParseError),
    /// A line that needs a trace context arrived before any was established.
    Unattributed(LineKind),
}

/// Per-line record of something the engine skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub function: String,
    pub stream: String,
    pub kind: DiagnosticKind,
    pub line: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DiagnosticKind::Parse(e) => write!(f, "{}/{}: {}", self.function, self.stream, e),
            DiagnosticKind::Unattributed(kind) => write!(
                f,
                "{}/{}: {:?} line without trace context",
                self.function, self.stream, kind
            ),
        }
    }
}

/// Why the sink refused one record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("trace {trace_id} already stored")]
    Duplicate { trace_id: String },

    #[error("trace {trace_id} rejected: {message}")]
    Rejected { trace_id: String, message: String },
}

impl PersistenceError {
    pub fn trace_id(&self) -> &str {
        match self {
            Self::Duplicate { trace_id } | Self::Rejected { trace_id, .. } => trace_id,
        }
    }
}
