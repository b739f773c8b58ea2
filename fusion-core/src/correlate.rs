//! Trace correlator
//!
//! A `TraceSet` owns the `traceId -> OpenTrace` map built from the streams of
//! one unit of work (normally one function). Units never share a set; their
//! sets are folded together with [`TraceSet::merge`] once all units finish.
//!
//! Merge rules:
//! - timing: earliest start, latest end, present beats missing
//! - report fields: overwrite on a new report; across sets the present side wins
//! - error: last observed wins
//!
//! Reports whose request id is not yet known are buffered with the context that
//! was active when they were read, and applied as soon as a trace-info line for
//! that request id shows up. [`TraceSet::settle`] resolves whatever is left.

use std::collections::HashMap;

use crate::classify::{classify, LineKind, LogLine, TraceInfo};
use crate::context::TraceContext;
use crate::error::{Diagnostic, DiagnosticKind, ParseError};
use crate::models::{OpenTrace, TraceError};
use crate::report::{parse_report, ReportMetrics};

/// Which function and stream a line was read from.
#[derive(Debug, Clone, Copy)]
pub struct StreamOrigin<'a> {
    pub function: &'a str,
    pub stream: &'a str,
}

#[derive(Debug, Clone)]
struct PendingReport {
    metrics: ReportMetrics,
    function: String,
    stream: String,
    context: Option<String>,
    line: String,
}

#[derive(Debug, Clone, Default)]
pub struct TraceSet {
    traces: HashMap<String, OpenTrace>,
    pending: HashMap<String, PendingReport>,
    diagnostics: Vec<Diagnostic>,
}

impl TraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn get(&self, trace_id: &str) -> Option<&OpenTrace> {
        self.traces.get(trace_id)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn pending_reports(&self) -> usize {
        self.pending.len()
    }

    /// Folds one line into the set and returns the context for the next line.
    pub fn ingest(&mut self, ctx: TraceContext, origin: StreamOrigin<'_>, line: &str) -> TraceContext {
        let parsed = classify(line);
        match &parsed {
            LogLine::CompletionReport(raw) => self.on_report(&ctx, origin, raw),
            LogLine::ErrorOrTimeout(raw) => self.on_error(&ctx, origin, raw),
            LogLine::TraceInfo(info) => self.on_trace_info(&ctx, origin, info, line),
            LogLine::Unparseable => {}
        }
        ctx.advance(&parsed)
    }

    /// Folds a batch of lines in order, threading the context through.
    pub fn ingest_lines<'l, I>(&mut self, ctx: TraceContext, origin: StreamOrigin<'_>, lines: I) -> TraceContext
    where
        I: IntoIterator<Item = &'l str>,
    {
        lines
            .into_iter()
            .fold(ctx, |ctx, line| self.ingest(ctx, origin, line))
    }

    fn on_report(&mut self, ctx: &TraceContext, origin: StreamOrigin<'_>, line: &str) {
        let metrics = match parse_report(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(function = origin.function, stream = origin.stream, error = %e, "Skipping malformed report line");
                self.record(origin, DiagnosticKind::Parse(e), line);
                return;
            }
        };
        if let Some(e) = metrics.init_duration_error.clone() {
            tracing::debug!(function = origin.function, stream = origin.stream, error = %e, "Ignoring unreadable init duration");
            self.record(origin, DiagnosticKind::Parse(e), line);
        }

        let mut matched = false;
        for trace in self.traces.values_mut() {
            if let Some(invocation) = trace.invocations.get_mut(&metrics.request_id) {
                invocation.apply_report(&metrics, origin.function);
                matched = true;
            }
        }

        if !matched {
            self.pending.insert(
                metrics.request_id.clone(),
                PendingReport {
                    metrics,
                    function: origin.function.to_string(),
                    stream: origin.stream.to_string(),
                    context: ctx.current().map(str::to_string),
                    line: line.to_string(),
                },
            );
        }
    }

    fn on_trace_info(&mut self, ctx: &TraceContext, origin: StreamOrigin<'_>, info: &TraceInfo, line: &str) {
        let trace_id = match info.trace_id.as_deref().or(ctx.current()) {
            Some(id) => id.to_string(),
            None => {
                self.record(origin, DiagnosticKind::Unattributed(LineKind::TraceInfo), line);
                return;
            }
        };

        let trace = self
            .traces
            .entry(trace_id.clone())
            .or_insert_with(|| OpenTrace::new(trace_id));

        let request_id = match &info.request_id {
            Some(id) => id,
            None => {
                self.record(origin, DiagnosticKind::Parse(ParseError::MissingRequestId), line);
                return;
            }
        };

        let invocation = trace.invocation_mut(request_id);
        invocation.merge_timing(info.start_time, info.end_time);
        if let Some(pending) = self.pending.remove(request_id) {
            invocation.apply_report(&pending.metrics, &pending.function);
        }
    }

    fn on_error(&mut self, ctx: &TraceContext, origin: StreamOrigin<'_>, line: &str) {
        let trace_id = match ctx.current() {
            Some(id) => id,
            None => {
                tracing::warn!(function = origin.function, stream = origin.stream, line, "No trace id belonging to current error");
                self.record(origin, DiagnosticKind::Unattributed(LineKind::ErrorOrTimeout), line);
                return;
            }
        };

        tracing::warn!(function = origin.function, trace_id, line, "Application has thrown error");
        self.traces
            .entry(trace_id.to_string())
            .or_insert_with(|| OpenTrace::new(trace_id))
            .error = Some(TraceError {
            message: line.to_string(),
        });
    }

    /// Resolves buffered reports: attach them under the context seen with them,
    /// or record them as unattributed when there was none.
    pub fn settle(&mut self) {
        let mut pending: Vec<(String, PendingReport)> = self.pending.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        for (request_id, report) in pending {
            match report.context {
                Some(trace_id) => {
                    self.traces
                        .entry(trace_id.clone())
                        .or_insert_with(|| OpenTrace::new(trace_id))
                        .invocation_mut(&request_id)
                        .apply_report(&report.metrics, &report.function);
                }
                None => self.diagnostics.push(Diagnostic {
                    function: report.function,
                    stream: report.stream,
                    kind: DiagnosticKind::Unattributed(LineKind::CompletionReport),
                    line: report.line,
                }),
            }
        }
    }

    /// Folds `other` into `self` by trace id.
    pub fn merge(mut self, other: TraceSet) -> TraceSet {
        for (trace_id, trace) in other.traces {
            match self.traces.get_mut(&trace_id) {
                Some(existing) => existing.absorb(trace),
                None => {
                    self.traces.insert(trace_id, trace);
                }
            }
        }
        self.pending.extend(other.pending);
        self.diagnostics.extend(other.diagnostics);
        self
    }

    /// Settles and hands out the traces and diagnostics.
    pub fn into_parts(mut self) -> (Vec<OpenTrace>, Vec<Diagnostic>) {
        self.settle();
        let mut traces: Vec<OpenTrace> = self.traces.into_values().collect();
        traces.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));
        (traces, self.diagnostics)
    }

    fn record(&mut self, origin: StreamOrigin<'_>, kind: DiagnosticKind, line: &str) {
        self.diagnostics.push(Diagnostic {
            function: origin.function.to_string(),
            stream: origin.stream.to_string(),
            kind,
            line: line.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: StreamOrigin<'static> = StreamOrigin {
        function: "checkout",
        stream: "2024/03/01/[$LATEST]abc",
    };

    fn info(request_id: &str, json: &str) -> String {
        format!("2024-03-01T10:00:00.000Z\t{request_id}\tINFO\t{json}")
    }

    fn report(request_id: &str) -> String {
        format!(
            "REPORT RequestId: {request_id}\tDuration: 120 ms\tBilled Duration: 130 ms\tMemory Size: 512 MB\tMax Memory Used: 300 MB\t"
        )
    }

    fn ingest_all(set: &mut TraceSet, lines: &[String]) {
        set.ingest_lines(TraceContext::new(), ORIGIN, lines.iter().map(String::as_str));
    }

    #[test]
    fn test_timing_and_report_land_on_same_invocation() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                info("r1", r#"{"traceId":"t1","starttime":1000}"#),
                info("r1", r#"{"traceId":"t1","endtime":1500}"#),
                report("r1"),
            ],
        );

        let inv = &set.get("t1").unwrap().invocations["r1"];
        assert_eq!(inv.start_time, Some(1000));
        assert_eq!(inv.end_time, Some(1500));
        assert_eq!(inv.duration, Some(120.0));
        assert_eq!(inv.memory_size, Some(512.0));
        assert_eq!(inv.function_name.as_deref(), Some("checkout"));
        assert_eq!(set.pending_reports(), 0);
    }

    #[test]
    fn test_report_before_context_is_reconciled_by_request_id() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                report("r2"),
                info("r2", r#"{"traceId":"t2","starttime":2000,"endtime":2600}"#),
            ],
        );
        set.settle();

        let inv = &set.get("t2").unwrap().invocations["r2"];
        assert_eq!(inv.start_time, Some(2000));
        assert_eq!(inv.billed_duration, Some(130.0));
        assert!(set.diagnostics().is_empty());
    }

    #[test]
    fn test_unreconciled_report_attaches_to_its_context_on_settle() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[info("r1", r#"{"traceId":"t1","starttime":1}"#), report("r9")],
        );
        assert_eq!(set.pending_reports(), 1);

        set.settle();
        let inv = &set.get("t1").unwrap().invocations["r9"];
        assert_eq!(inv.duration, Some(120.0));
        assert_eq!(inv.start_time, None);
    }

    #[test]
    fn test_unreconciled_report_without_context_is_diagnosed() {
        let mut set = TraceSet::new();
        ingest_all(&mut set, &[report("r7")]);
        let (traces, diagnostics) = set.into_parts();

        assert!(traces.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].kind,
            DiagnosticKind::Unattributed(LineKind::CompletionReport)
        );
    }

    #[test]
    fn test_error_attaches_to_sticky_context_last_wins() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                info("r1", r#"{"traceId":"t1","starttime":1}"#),
                "2024-03-01T10:00:01.000Z\tr1\tERROR\tfirst".to_string(),
                "2024-03-01T10:00:02.000Z r1 Task timed out after 3.00 seconds".to_string(),
            ],
        );

        let error = set.get("t1").unwrap().error.as_ref().unwrap();
        assert!(error.message.contains("Task timed out"));
    }

    #[test]
    fn test_error_without_context_is_not_guessed() {
        let mut set = TraceSet::new();
        ingest_all(&mut set, &["ts\tr1\tERROR\tboom".to_string()]);

        assert!(set.is_empty());
        assert_eq!(
            set.diagnostics()[0].kind,
            DiagnosticKind::Unattributed(LineKind::ErrorOrTimeout)
        );
    }

    #[test]
    fn test_malformed_report_is_skipped_with_diagnostic() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                info("r1", r#"{"traceId":"t1","starttime":1}"#),
                "REPORT RequestId: r1\tDuration: 1 ms".to_string(),
                info("r1", r#"{"traceId":"t1","endtime":9}"#),
            ],
        );

        assert_eq!(set.get("t1").unwrap().invocations["r1"].end_time, Some(9));
        assert!(matches!(
            set.diagnostics()[0].kind,
            DiagnosticKind::Parse(ParseError::MissingField { .. })
        ));
    }

    #[test]
    fn test_trace_info_without_trace_id_uses_context() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                info("r1", r#"{"traceId":"t1","starttime":100}"#),
                info("r1", r#"{"endtime":250}"#),
            ],
        );
        assert_eq!(set.get("t1").unwrap().invocations["r1"].end_time, Some(250));
    }

    #[test]
    fn test_each_stream_starts_without_context() {
        let mut set = TraceSet::new();
        let first = StreamOrigin { function: "a", stream: "s1" };
        let second = StreamOrigin { function: "a", stream: "s2" };

        set.ingest_lines(TraceContext::new(), first, [info("r1", r#"{"traceId":"t1"}"#).as_str()]);
        set.ingest_lines(TraceContext::new(), second, ["ts\tr5\tERROR\tboom"]);

        assert!(set.get("t1").unwrap().error.is_none());
        assert_eq!(set.diagnostics().len(), 1);
    }

    #[test]
    fn test_reingesting_same_window_is_idempotent() {
        let lines = [
            info("r1", r#"{"traceId":"t1","starttime":1000}"#),
            info("r1", r#"{"traceId":"t1","endtime":1500}"#),
            report("r1"),
        ];

        let mut once = TraceSet::new();
        ingest_all(&mut once, &lines);
        let mut twice = TraceSet::new();
        ingest_all(&mut twice, &lines);
        ingest_all(&mut twice, &lines);

        assert_eq!(once.get("t1"), twice.get("t1"));
    }

    #[test]
    fn test_merge_applies_min_max_and_is_order_independent() {
        let mut a = TraceSet::new();
        a.ingest_lines(
            TraceContext::new(),
            StreamOrigin { function: "a", stream: "s" },
            [info("ra", r#"{"traceId":"t1","starttime":1000,"endtime":1200}"#).as_str()],
        );
        let mut b = TraceSet::new();
        b.ingest_lines(
            TraceContext::new(),
            StreamOrigin { function: "b", stream: "s" },
            [info("rb", r#"{"traceId":"t1","starttime":1100,"endtime":1900}"#).as_str()],
        );

        let ab = a.clone().merge(b.clone());
        let ba = b.merge(a);

        assert_eq!(ab.get("t1"), ba.get("t1"));
        assert_eq!(ab.get("t1").unwrap().invocations.len(), 2);
    }

    fn sized_report(request_id: &str, duration: &str, init: Option<&str>) -> String {
        let cold = init.map(|ms| format!("Init Duration: {ms} ms")).unwrap_or_default();
        format!(
            "REPORT RequestId: {request_id}\tDuration: {duration} ms\tBilled Duration: 100 ms\tMemory Size: 256 MB\tMax Memory Used: 80 MB\t{cold}"
        )
    }

    fn totals(set: TraceSet) -> (f64, f64, f64, f64, f64, Option<i64>) {
        let (traces, _) = set.into_parts();
        let record = crate::aggregate::aggregate(traces.into_iter().next().unwrap(), 2);
        (
            record.total_duration,
            record.total_billed_duration,
            record.total_memory_allocated,
            record.total_memory_used,
            record.total_cold_start_time,
            record.runtime,
        )
    }

    #[test]
    fn test_sums_do_not_depend_on_set_or_line_order() {
        let a_lines = [
            info("ra", r#"{"traceId":"t1","starttime":1000,"endtime":1200}"#),
            sized_report("ra", "10.25", Some("300.5")),
        ];
        let b_lines = [
            sized_report("rb", "7.5", None),
            info("rb", r#"{"traceId":"t1","starttime":1100,"endtime":1900}"#),
        ];

        let set = |function: &'static str, lines: &[String]| {
            let mut s = TraceSet::new();
            s.ingest_lines(
                TraceContext::new(),
                StreamOrigin { function, stream: "s" },
                lines.iter().map(String::as_str),
            );
            s
        };

        let ab = totals(set("a", &a_lines).merge(set("b", &b_lines)));
        let ba = totals(set("b", &b_lines).merge(set("a", &a_lines)));
        assert_eq!(ab, ba);
        assert_eq!(ab, (17.75, 200.0, 512.0, 160.0, 300.5, Some(900)));

        // Same lines split across two pages of one stream, report seen first.
        let mut paged = TraceSet::new();
        let origin = StreamOrigin { function: "a", stream: "s" };
        let ctx = paged.ingest_lines(TraceContext::new(), origin, [b_lines[0].as_str(), a_lines[0].as_str()]);
        paged.ingest_lines(ctx, origin, [a_lines[1].as_str(), b_lines[1].as_str()]);
        assert_eq!(totals(paged), ab);
    }

    #[test]
    fn test_unreadable_init_duration_keeps_report_and_is_diagnosed() {
        let mut set = TraceSet::new();
        ingest_all(
            &mut set,
            &[
                info("r1", r#"{"traceId":"t1","starttime":1}"#),
                sized_report("r1", "42", Some("n/a")),
            ],
        );

        let inv = &set.get("t1").unwrap().invocations["r1"];
        assert_eq!(inv.duration, Some(42.0));
        assert_eq!(inv.cold_start_duration, None);
        assert!(matches!(
            set.diagnostics()[0].kind,
            DiagnosticKind::Parse(ParseError::InvalidNumber { field: "Init Duration", .. })
        ));
    }
}
