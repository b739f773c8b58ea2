use serde::{Deserialize, Serialize};

use crate::report::ReportMetrics;

/// One execution of one participating function, assembled from several log lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub request_id: String,
    /// Epoch millis.
    #[serde(rename = "starttime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Epoch millis.
    #[serde(rename = "endtime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<f64>,
    /// Absent for warm starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold_start_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

impl InvocationRecord {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// Min of start times, max of end times; a missing side never erases a present one.
    pub fn merge_timing(&mut self, start_time: Option<i64>, end_time: Option<i64>) {
        self.start_time = pick(self.start_time, start_time, i64::min);
        self.end_time = pick(self.end_time, end_time, i64::max);
    }

    /// Completion reports are authoritative for the metric fields.
    pub fn apply_report(&mut self, report: &ReportMetrics, function_name: &str) {
        self.duration = Some(report.duration);
        self.billed_duration = Some(report.billed_duration);
        self.memory_size = Some(report.memory_size);
        self.memory_used = Some(report.memory_used);
        self.cold_start_duration = report.cold_start_duration;
        self.function_name = Some(function_name.to_string());
    }

    pub fn has_report(&self) -> bool {
        self.duration.is_some()
    }

    /// Folds another partial view of the same invocation into this one.
    pub fn absorb(&mut self, other: InvocationRecord) {
        self.merge_timing(other.start_time, other.end_time);
        if !self.has_report() && other.has_report() {
            self.duration = other.duration;
            self.billed_duration = other.billed_duration;
            self.memory_size = other.memory_size;
            self.memory_used = other.memory_used;
            self.cold_start_duration = other.cold_start_duration;
        }
        if self.function_name.is_none() {
            self.function_name = other.function_name;
        }
    }
}

fn pick(old: Option<i64>, new: Option<i64>, keep: fn(i64, i64) -> i64) -> Option<i64> {
    match (old, new) {
        (Some(a), Some(b)) => Some(keep(a, b)),
        (a, b) => a.or(b),
    }
}
