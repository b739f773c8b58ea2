//! Line classifier
//!
//! Maps one raw log line to a tagged variant. Checks run in a fixed order:
//! completion report, then error/timeout, then trace info. JSON parsing is only
//! attempted for lines that reached the trace-info check, so report and error
//! lines can never be masked by a parse failure.

use serde_json::{Map, Value};

const REPORT_MARKER: &str = "REPORT";
const ERROR_MARKER: &str = "ERROR";
const TIMEOUT_MARKER: &str = "Task timed out after";
const INFO_MARKER: &str = "INFO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    CompletionReport,
    ErrorOrTimeout,
    TraceInfo,
    Unparseable,
}

/// Application-level line announcing trace membership and/or timing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceInfo {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogLine<'a> {
    CompletionReport(&'a str),
    ErrorOrTimeout(&'a str),
    TraceInfo(TraceInfo),
    Unparseable,
}

impl LogLine<'_> {
    pub fn kind(&self) -> LineKind {
        match self {
            Self::CompletionReport(_) => LineKind::CompletionReport,
            Self::ErrorOrTimeout(_) => LineKind::ErrorOrTimeout,
            Self::TraceInfo(_) => LineKind::TraceInfo,
            Self::Unparseable => LineKind::Unparseable,
        }
    }
}

pub fn classify(line: &str) -> LogLine<'_> {
    if line.starts_with(REPORT_MARKER) {
        return LogLine::CompletionReport(line);
    }
    if line.contains(ERROR_MARKER) || line.contains(TIMEOUT_MARKER) {
        return LogLine::ErrorOrTimeout(line);
    }
    match parse_trace_info(line) {
        Some(info) => LogLine::TraceInfo(info),
        None => LogLine::Unparseable,
    }
}

fn parse_trace_info(line: &str) -> Option<TraceInfo> {
    let (prefix, _) = line.split_once(INFO_MARKER)?;
    let (_, payload) = line.rsplit_once(INFO_MARKER)?;
    let payload: Map<String, Value> = serde_json::from_str(payload.trim()).ok()?;

    let info = TraceInfo {
        request_id: request_id_from_prefix(prefix),
        trace_id: payload.get("traceId").and_then(trace_id_value),
        start_time: payload.get("starttime").and_then(millis_value),
        end_time: payload.get("endtime").and_then(millis_value),
    };

    if info.trace_id.is_none() && info.start_time.is_none() && info.end_time.is_none() {
        return None;
    }
    Some(info)
}

/// Platform prefix is `timestamp \t requestId \t`.
fn request_id_from_prefix(prefix: &str) -> Option<String> {
    prefix
        .split('\t')
        .nth(1)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn trace_id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn millis_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}
