//! Aggregator
//!
//! Turns each `OpenTrace` into an immutable `TraceRecord` once every stream of
//! every function has been drained. Runs over whole traces only: a trace is
//! either fully summarized or not emitted at all.

use chrono::{DateTime, Utc};

use crate::config::PartialTracePolicy;
use crate::models::{InvocationRecord, OpenTrace, TraceRecord};

#[derive(Debug, Clone, Default)]
pub struct AggregateOutcome {
    pub records: Vec<TraceRecord>,
    /// Traces dropped by `PartialTracePolicy::Discard`.
    pub discarded: usize,
    /// Kept traces whose earliest start is after their latest end. Both
    /// timestamps are stored as observed and `runtime` is unset.
    pub inverted: Vec<String>,
}

pub fn aggregate(trace: OpenTrace, lambdas_count: usize) -> TraceRecord {
    let mut invocations: Vec<&InvocationRecord> = trace.invocations.values().collect();
    invocations.sort_by(|a, b| a.request_id.cmp(&b.request_id));

    let start = invocations.iter().filter_map(|i| i.start_time).min();
    let end = invocations.iter().filter_map(|i| i.end_time).max();

    let runtime = match (start, end) {
        (Some(s), Some(e)) if e >= s => Some(e - s),
        (Some(s), Some(e)) => {
            tracing::warn!(trace_id = %trace.trace_id, start = s, end = e, "Trace ends before it starts, leaving runtime unset");
            None
        }
        _ => None,
    };

    let total_memory_used = sum(&invocations, |i| i.memory_used);
    let total_memory_allocated = sum(&invocations, |i| i.memory_size);
    let total_billed_duration = sum(&invocations, |i| i.billed_duration);
    let total_duration = sum(&invocations, |i| i.duration);
    let total_cold_start_time = sum(&invocations, |i| i.cold_start_duration);

    TraceRecord {
        trace_id: trace.trace_id,
        start_time: start.and_then(to_timestamp),
        end_time: end.and_then(to_timestamp),
        runtime,
        invocation_information: trace.invocations,
        error: trace.error,
        total_memory_used,
        total_memory_allocated,
        total_billed_duration,
        total_duration,
        total_cold_start_time,
        lambdas_count,
    }
}

pub fn aggregate_all(
    traces: Vec<OpenTrace>,
    lambdas_count: usize,
    policy: PartialTracePolicy,
) -> AggregateOutcome {
    let mut outcome = AggregateOutcome::default();
    for trace in traces {
        if policy == PartialTracePolicy::Discard && trace.invocations.len() < lambdas_count {
            tracing::debug!(
                trace_id = %trace.trace_id,
                invocations = trace.invocations.len(),
                lambdas_count,
                "Discarding partial trace"
            );
            outcome.discarded += 1;
            continue;
        }
        let record = aggregate(trace, lambdas_count);
        if let (Some(start), Some(end)) = (record.start_time, record.end_time) {
            if end < start {
                outcome.inverted.push(record.trace_id.clone());
            }
        }
        outcome.records.push(record);
    }
    outcome
}

/// Absent values count as zero. Rounded to two decimals.
fn sum(invocations: &[&InvocationRecord], field: impl Fn(&InvocationRecord) -> Option<f64>) -> f64 {
    let total: f64 = invocations.iter().filter_map(|i| field(*i)).sum();
    (total * 100.0).round() / 100.0
}

fn to_timestamp(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportMetrics;

    fn invocation(request_id: &str, start: Option<i64>, end: Option<i64>) -> InvocationRecord {
        let mut inv = InvocationRecord::new(request_id);
        inv.merge_timing(start, end);
        inv
    }

    fn with_report(mut inv: InvocationRecord, duration: f64, cold: Option<f64>) -> InvocationRecord {
        let metrics = ReportMetrics {
            request_id: inv.request_id.clone(),
            duration,
            billed_duration: duration.ceil(),
            memory_size: 512.0,
            memory_used: 300.0,
            cold_start_duration: cold,
            ..Default::default()
        };
        inv.apply_report(&metrics, "fn");
        inv
    }

    fn trace(invocations: Vec<InvocationRecord>) -> OpenTrace {
        let mut t = OpenTrace::new("t1");
        for inv in invocations {
            t.invocations.insert(inv.request_id.clone(), inv);
        }
        t
    }

    #[test]
    fn test_single_invocation_example() {
        let inv = invocation("r1", Some(1000), Some(1500));
        let mut inv = with_report(inv, 120.0, None);
        inv.billed_duration = Some(130.0);

        let record = aggregate(trace(vec![inv]), 3);

        assert_eq!(record.runtime, Some(500));
        assert_eq!(record.total_duration, 120.0);
        assert_eq!(record.total_billed_duration, 130.0);
        assert_eq!(record.total_memory_allocated, 512.0);
        assert_eq!(record.total_memory_used, 300.0);
        assert_eq!(record.total_cold_start_time, 0.0);
        assert_eq!(record.lambdas_count, 3);
        assert_eq!(record.start_time.unwrap().timestamp_millis(), 1000);
        assert_eq!(record.end_time.unwrap().timestamp_millis(), 1500);
    }

    #[test]
    fn test_span_covers_earliest_start_and_latest_end() {
        let record = aggregate(
            trace(vec![
                invocation("a", Some(2000), Some(2500)),
                invocation("b", Some(1800), None),
                invocation("c", None, Some(3100)),
            ]),
            3,
        );

        assert_eq!(record.start_time.unwrap().timestamp_millis(), 1800);
        assert_eq!(record.end_time.unwrap().timestamp_millis(), 3100);
        assert_eq!(record.runtime, Some(1300));
    }

    #[test]
    fn test_runtime_unset_without_both_ends() {
        let record = aggregate(trace(vec![invocation("a", Some(2000), None)]), 1);
        assert!(record.end_time.is_none());
        assert!(record.runtime.is_none());

        let record = aggregate(trace(vec![]), 1);
        assert!(record.start_time.is_none());
        assert!(record.runtime.is_none());
    }

    #[test]
    fn test_inverted_span_is_flagged_and_has_no_runtime() {
        let inverted = trace(vec![
            invocation("a", None, Some(1000)),
            invocation("b", Some(2000), None),
        ]);
        let mut ordered = OpenTrace::new("t2");
        ordered.invocations.insert("c".to_string(), invocation("c", Some(1), Some(5)));

        let outcome = aggregate_all(vec![inverted, ordered], 2, PartialTracePolicy::Keep);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.inverted, vec!["t1".to_string()]);
        let record = &outcome.records[0];
        assert!(record.runtime.is_none());
        assert_eq!(record.start_time.unwrap().timestamp_millis(), 2000);
        assert_eq!(record.end_time.unwrap().timestamp_millis(), 1000);
    }

    #[test]
    fn test_sums_round_to_two_decimals_and_count_cold_starts() {
        let record = aggregate(
            trace(vec![
                with_report(invocation("a", None, None), 10.256, Some(100.111)),
                with_report(invocation("b", None, None), 5.5, None),
                invocation("c", Some(1), Some(2)),
            ]),
            3,
        );

        assert_eq!(record.total_duration, 15.76);
        assert_eq!(record.total_cold_start_time, 100.11);
        assert_eq!(record.total_memory_allocated, 1024.0);
    }

    #[test]
    fn test_discard_policy_drops_partial_traces() {
        let full = trace(vec![invocation("a", Some(1), Some(2)), invocation("b", Some(1), Some(3))]);
        let mut partial = OpenTrace::new("t2");
        partial.invocations.insert("a".to_string(), invocation("a", Some(1), Some(2)));

        let kept = aggregate_all(vec![full.clone(), partial.clone()], 2, PartialTracePolicy::Keep);
        assert_eq!(kept.records.len(), 2);
        assert_eq!(kept.discarded, 0);

        let filtered = aggregate_all(vec![full, partial], 2, PartialTracePolicy::Discard);
        assert_eq!(filtered.records.len(), 1);
        assert_eq!(filtered.records[0].trace_id, "t1");
        assert_eq!(filtered.discarded, 1);
    }
}
