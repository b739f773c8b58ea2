//! Log source abstraction
//!
//! The engine only needs two primitives from the log store: list the most
//! recently active streams of a log group, and fetch one page of events from
//! a stream given a forward token.

use async_trait::async_trait;

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<LogEvent>,
    pub next_forward_token: Option<String>,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Stream names ordered by last event time, newest first.
    async fn list_streams(&self, log_group: &str, limit: i32) -> Result<Vec<String>, FetchError>;

    async fn get_events(
        &self,
        log_group: &str,
        stream: &str,
        token: Option<&str>,
    ) -> Result<EventPage, FetchError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}
