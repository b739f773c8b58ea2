//! Cursor paginator
//!
//! Drives `LogSource::get_events` until the source hands back the same forward
//! token it was given, which is how the end of a stream is signalled. Pages are
//! fetched strictly one after another since each request needs the previous
//! response's token.

use futures::stream::{self, Stream};

use crate::error::FetchError;
use crate::log_source::{LogEvent, LogSource};

/// Forward token to send next, plus the one sent before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub token: Option<String>,
    pub previous: Option<String>,
}

impl StreamCursor {
    pub fn start() -> Self {
        Self::default()
    }

    /// Cursor for the next request, or `None` once the stream is exhausted.
    pub fn advance(self, returned: Option<String>) -> Option<StreamCursor> {
        match returned {
            None => None,
            Some(token) if self.token.as_deref() == Some(token.as_str()) => None,
            Some(token) => Some(StreamCursor {
                token: Some(token),
                previous: self.token,
            }),
        }
    }
}

/// Lazy, finite sequence of event batches for one stream. Empty batches are
/// yielded as they come. Calling `pages` again restarts from the head.
pub fn pages<'a, S>(
    source: &'a S,
    log_group: &'a str,
    stream_name: &'a str,
) -> impl Stream<Item = Result<Vec<LogEvent>, FetchError>> + 'a
where
    S: LogSource + ?Sized,
{
    stream::try_unfold(Some(StreamCursor::start()), move |cursor| async move {
        let Some(cursor) = cursor else {
            return Ok(None);
        };
        let page = source
            .get_events(log_group, stream_name, cursor.token.as_deref())
            .await?;
        let next = cursor.advance(page.next_forward_token);
        Ok(Some((page.events, next)))
    })
}
