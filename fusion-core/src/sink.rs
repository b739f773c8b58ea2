//! Trace sink abstraction
//!
//! Finalized traces are keyed by `trace_id`. Scheduled runs insert and skip
//! traces that already exist; triggered re-runs merge into what is stored.
//! Records are written independently so one rejection never fails the batch.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::aggregate::aggregate;
use crate::error::{FusionError, PersistenceError};
use crate::models::TraceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    InsertSkipDuplicates,
    UpsertMerge,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistReport {
    pub accepted: usize,
    pub rejected: Vec<PersistenceError>,
}

impl PersistReport {
    pub fn record(&mut self, outcome: Result<(), PersistenceError>) {
        match outcome {
            Ok(()) => self.accepted += 1,
            Err(e) => self.rejected.push(e),
        }
    }
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Create storage and the unique `trace_id` constraint if missing.
    async fn ensure_schema(&self) -> Result<(), FusionError>;

    async fn persist(&self, records: &[TraceRecord], mode: WriteMode) -> Result<PersistReport, FusionError>;

    /// Sink name for logging.
    fn name(&self) -> &str;
}

/// Merge a re-ingested trace into its stored version and recompute aggregates.
pub fn merge_records(stored: TraceRecord, incoming: TraceRecord) -> TraceRecord {
    let lambdas_count = incoming.lambdas_count;
    let mut open = stored.reopen();
    open.absorb(incoming.reopen());
    aggregate(open, lambdas_count)
}

/// Keeps traces in process memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    traces: Mutex<HashMap<String, TraceRecord>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, trace_id: &str) -> Option<TraceRecord> {
        self.traces.lock().await.get(trace_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.traces.lock().await.len()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn ensure_schema(&self) -> Result<(), FusionError> {
        Ok(())
    }

    async fn persist(&self, records: &[TraceRecord], mode: WriteMode) -> Result<PersistReport, FusionError> {
        let mut traces = self.traces.lock().await;
        let mut report = PersistReport::default();

        for record in records {
            let outcome = match (mode, traces.remove(&record.trace_id)) {
                (WriteMode::InsertSkipDuplicates, Some(existing)) => {
                    traces.insert(existing.trace_id.clone(), existing);
                    Err(PersistenceError::Duplicate {
                        trace_id: record.trace_id.clone(),
                    })
                }
                (WriteMode::UpsertMerge, Some(existing)) => {
                    traces.insert(record.trace_id.clone(), merge_records(existing, record.clone()));
                    Ok(())
                }
                (_, None) => {
                    traces.insert(record.trace_id.clone(), record.clone());
                    Ok(())
                }
            };
            report.record(outcome);
        }

        Ok(report)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvocationRecord, OpenTrace};

    fn record(trace_id: &str, invocations: &[(&str, i64, i64)]) -> TraceRecord {
        let mut open = OpenTrace::new(trace_id);
        for (request_id, start, end) in invocations {
            let mut inv = InvocationRecord::new(*request_id);
            inv.merge_timing(Some(*start), Some(*end));
            inv.duration = Some(10.0);
            open.invocations.insert(request_id.to_string(), inv);
        }
        aggregate(open, 2)
    }

    #[tokio::test]
    async fn test_insert_mode_skips_existing_trace() {
        let sink = MemoryTraceSink::new();
        let first = record("t1", &[("r1", 1000, 1500)]);
        sink.persist(&[first.clone()], WriteMode::InsertSkipDuplicates).await.unwrap();

        let again = record("t1", &[("r1", 900, 1600)]);
        let report = sink
            .persist(&[again, record("t2", &[("r2", 1, 2)])], WriteMode::InsertSkipDuplicates)
            .await
            .unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(
            report.rejected,
            vec![PersistenceError::Duplicate { trace_id: "t1".to_string() }]
        );
        assert_eq!(sink.get("t1").await.unwrap(), first);
        assert_eq!(sink.len().await, 2);
    }

    #[tokio::test]
    async fn test_upsert_mode_merges_with_min_max() {
        let sink = MemoryTraceSink::new();
        sink.persist(&[record("t1", &[("r1", 1000, 1500)])], WriteMode::UpsertMerge)
            .await
            .unwrap();
        let report = sink
            .persist(
                &[record("t1", &[("r1", 1100, 1700), ("r2", 1200, 1300)])],
                WriteMode::UpsertMerge,
            )
            .await
            .unwrap();

        assert_eq!(report.accepted, 1);
        let merged = sink.get("t1").await.unwrap();
        assert_eq!(merged.runtime, Some(700));
        assert_eq!(merged.invocation_information["r1"].start_time, Some(1000));
        assert_eq!(merged.invocation_information["r1"].end_time, Some(1700));
        assert_eq!(merged.total_duration, 20.0);
    }

    #[tokio::test]
    async fn test_upsert_same_window_twice_is_stable() {
        let sink = MemoryTraceSink::new();
        let r = record("t1", &[("r1", 1000, 1500), ("r2", 1100, 1400)]);
        sink.persist(&[r.clone()], WriteMode::UpsertMerge).await.unwrap();
        sink.persist(&[r.clone()], WriteMode::UpsertMerge).await.unwrap();

        assert_eq!(sink.get("t1").await.unwrap(), r);
    }
}
