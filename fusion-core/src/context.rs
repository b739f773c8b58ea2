use crate::classify::LogLine;

/// The sticky trace identifier of one log stream.
///
/// Only trace-info lines that name a trace move it. Report and error lines
/// read it. A fresh context is used for every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    current: Option<String>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Context in effect after `line` has been seen.
    pub fn advance(self, line: &LogLine<'_>) -> Self {
        match line {
            LogLine::TraceInfo(info) => match &info.trace_id {
                Some(trace_id) => Self {
                    current: Some(trace_id.clone()),
                },
                None => self,
            },
            _ => self,
        }
    }
}
