use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::invocation::InvocationRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceError {
    pub message: String,
}

/// A trace still collecting facts. Mutated by every line attributed to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenTrace {
    pub trace_id: String,
    pub invocations: HashMap<String, InvocationRecord>,
    pub error: Option<TraceError>,
}

impl OpenTrace {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            ..Default::default()
        }
    }

    pub fn invocation_mut(&mut self, request_id: &str) -> &mut InvocationRecord {
        self.invocations
            .entry(request_id.to_string())
            .or_insert_with(|| InvocationRecord::new(request_id))
    }

    /// Merges another partial view of this trace. `other`'s error wins when present.
    pub fn absorb(&mut self, other: OpenTrace) {
        for (request_id, invocation) in other.invocations {
            match self.invocations.get_mut(&request_id) {
                Some(existing) => existing.absorb(invocation),
                None => {
                    self.invocations.insert(request_id, invocation);
                }
            }
        }
        if other.error.is_some() {
            self.error = other.error;
        }
    }
}

/// A finalized trace, immutable once built by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub trace_id: String,
    #[serde(rename = "starttime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "endtime")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds; set only when both ends are known.
    pub runtime: Option<i64>,
    pub invocation_information: HashMap<String, InvocationRecord>,
    pub error: Option<TraceError>,
    pub total_memory_used: f64,
    pub total_memory_allocated: f64,
    pub total_billed_duration: f64,
    pub total_duration: f64,
    pub total_cold_start_time: f64,
    pub lambdas_count: usize,
}

impl TraceRecord {
    /// Reopens a stored record so it can be merged with a re-ingested window.
    pub fn reopen(self) -> OpenTrace {
        OpenTrace {
            trace_id: self.trace_id,
            invocations: self.invocation_information,
            error: self.error,
        }
    }
}
