//! Completion report parser
//!
//! A report line is tab separated with fixed field positions:
//! `REPORT RequestId: <id>`, `Duration: <ms> ms`, `Billed Duration: <ms> ms`,
//! `Memory Size: <mb> MB`, `Max Memory Used: <mb> MB`, and on cold starts
//! `Init Duration: <ms> ms`.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ParseError;

static REQUEST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^REPORT RequestId:\s*(.+?)\s*$").expect("valid regex"));
static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Duration:\s*(\S+)\s*ms").expect("valid regex"));
static BILLED_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Billed Duration:\s*(\S+)\s*ms").expect("valid regex"));
static MEMORY_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Memory Size:\s*(\S+)\s*MB").expect("valid regex"));
static MEMORY_USED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Max Memory Used:\s*(\S+)\s*MB").expect("valid regex"));
static INIT_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Init Duration:\s*(\S+)\s*ms").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportMetrics {
    pub request_id: String,
    pub duration: f64,
    pub billed_duration: f64,
    pub memory_size: f64,
    pub memory_used: f64,
    /// `None` means a warm start.
    pub cold_start_duration: Option<f64>,
    /// Set when an `Init Duration` field was present but unreadable. The
    /// report still counts; the cold start is treated as absent.
    pub init_duration_error: Option<ParseError>,
}

pub fn parse_report(line: &str) -> Result<ReportMetrics, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let fields: Vec<&str> = line.split('\t').collect();

    let request_id = fields
        .first()
        .and_then(|f| REQUEST_ID.captures(f))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(ParseError::MissingField { field: "RequestId" })?;

    // Later platform versions may append fields; Init Duration is looked up among them.
    let (cold_start_duration, init_duration_error) = match fields
        .iter()
        .skip(5)
        .find(|f| INIT_DURATION.is_match(f))
        .map(|f| number(&INIT_DURATION, f, "Init Duration"))
    {
        Some(Ok(ms)) => (Some(ms), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    Ok(ReportMetrics {
        request_id,
        duration: number(&DURATION, field(&fields, 1, "Duration")?, "Duration")?,
        billed_duration: number(
            &BILLED_DURATION,
            field(&fields, 2, "Billed Duration")?,
            "Billed Duration",
        )?,
        memory_size: number(&MEMORY_SIZE, field(&fields, 3, "Memory Size")?, "Memory Size")?,
        memory_used: number(
            &MEMORY_USED,
            field(&fields, 4, "Max Memory Used")?,
            "Max Memory Used",
        )?,
        cold_start_duration,
        init_duration_error,
    })
}

fn field<'a>(fields: &[&'a str], index: usize, name: &'static str) -> Result<&'a str, ParseError> {
    fields
        .get(index)
        .copied()
        .ok_or(ParseError::MissingField { field: name })
}

fn number(pattern: &Regex, text: &str, name: &'static str) -> Result<f64, ParseError> {
    let raw = pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .ok_or(ParseError::MissingField { field: name })?
        .as_str();
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidNumber {
            field: name,
            value: raw.to_string(),
        }),
    }
}
