//! Harvest runs
//!
//! A run reads the fusion config, drains every participating function's log
//! streams into per-function trace sets, folds them, aggregates the result and
//! hands it to the sink. Everything up to persistence is bounded by
//! `run.timeout_seconds`; a run that times out writes nothing. Persistence has
//! its own bound, `run.persist_timeout_seconds`. Each trace is written whole or
//! not at all, so a persist timeout leaves only complete traces behind.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::TryStreamExt;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use fusion_core::config::{FusionConfigSource, LogsConfig};
use fusion_core::{
    aggregate_all, pages, Diagnostic, FetchError, FusionConfig, FusionConfigClient, FusionError,
    LogSource, PersistenceError, StreamOrigin, TraceContext, TraceRecord, TraceSet, TraceSink,
    WriteMode,
};

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Periodic collection. Traces already stored are left alone.
    Scheduled,
    /// Re-run fired by a config change. Reads the previous config snapshot
    /// and merges into stored traces.
    Triggered,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Scheduled => "scheduled",
            RunMode::Triggered => "triggered",
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        match self {
            RunMode::Scheduled => WriteMode::InsertSkipDuplicates,
            RunMode::Triggered => WriteMode::UpsertMerge,
        }
    }

    fn config_url<'a>(&self, source: &'a FusionConfigSource) -> &'a str {
        match (self, source.previous_url.as_deref()) {
            (RunMode::Triggered, Some(previous)) => previous,
            (RunMode::Triggered, None) => {
                tracing::warn!("No previous_url configured, triggered run falls back to the current config");
                &source.url
            }
            (RunMode::Scheduled, _) => &source.url,
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunMode::Scheduled),
            "triggered" => Ok(RunMode::Triggered),
            other => Err(format!("unknown run mode '{}', expected scheduled or triggered", other)),
        }
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct RunContext {
    pub config: FusionConfig,
    pub config_client: FusionConfigClient,
    pub source: Arc<dyn LogSource>,
    pub sink: Arc<dyn TraceSink>,
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub functions: usize,
    pub functions_failed: usize,
    pub traces: usize,
    pub discarded: usize,
    /// Traces stored with an end before their start.
    pub inverted: Vec<String>,
    pub accepted: usize,
    pub rejected: Vec<PersistenceError>,
    pub diagnostics: Vec<Diagnostic>,
}

pub async fn execute_run(ctx: &RunContext, mode: RunMode) -> Result<RunReport, FusionError> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("fusion_run", %run_id, mode = mode.as_str());

    async move {
        let seconds = ctx.config.run.timeout_seconds;
        let harvest = tokio::time::timeout(Duration::from_secs(seconds), collect(ctx, mode))
            .await
            .map_err(|_| {
                tracing::error!(seconds, "Run timed out before persistence, nothing written");
                FusionError::Timeout { seconds }
            })??;

        let persist_seconds = ctx.config.run.persist_timeout_seconds;
        let persisted = tokio::time::timeout(
            Duration::from_secs(persist_seconds),
            ctx.sink.persist(&harvest.records, mode.write_mode()),
        )
        .await
        .map_err(|_| {
            tracing::error!(seconds = persist_seconds, sink = ctx.sink.name(), "Persisting traces timed out");
            FusionError::PersistTimeout {
                seconds: persist_seconds,
            }
        })??;

        let report = RunReport {
            run_id,
            mode,
            functions: harvest.functions,
            functions_failed: harvest.functions_failed,
            traces: harvest.records.len(),
            discarded: harvest.discarded,
            inverted: harvest.inverted,
            accepted: persisted.accepted,
            rejected: persisted.rejected,
            diagnostics: harvest.diagnostics,
        };

        tracing::info!(
            sink = ctx.sink.name(),
            functions = report.functions,
            functions_failed = report.functions_failed,
            traces = report.traces,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            diagnostics = report.diagnostics.len(),
            "Run complete"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Called from main.rs to run on a fixed interval until shutdown.
pub async fn run_harvest_loop(
    ctx: RunContext,
    mode: RunMode,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_minutes * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!("Harvest loop started (interval: {}min)", interval_minutes);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = execute_run(&ctx, mode).await {
                    tracing::error!("Harvest run failed: {}", e);
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Harvest loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

struct Harvest {
    records: Vec<TraceRecord>,
    discarded: usize,
    inverted: Vec<String>,
    functions: usize,
    functions_failed: usize,
    diagnostics: Vec<Diagnostic>,
}

async fn collect(ctx: &RunContext, mode: RunMode) -> Result<Harvest, FusionError> {
    let url = mode.config_url(&ctx.config.fusion_config);
    let entries = ctx.config_client.fetch_entries(url).await?;
    let lambdas_count = entries.len();

    let units = entries
        .iter()
        .map(|e| drain_function(ctx.source.as_ref(), &ctx.config.logs, &e.entry));
    let results = join_all(units).await;

    let mut functions_failed = 0;
    let mut merged = TraceSet::new();
    for (entry, result) in entries.iter().zip(results) {
        match result {
            Ok(set) => merged = merged.merge(set),
            Err(e) => {
                functions_failed += 1;
                tracing::error!(function = %entry.entry, error = %e, "Failed to drain function logs");
            }
        }
    }

    let (traces, diagnostics) = merged.into_parts();
    for diagnostic in &diagnostics {
        tracing::debug!(%diagnostic, "Skipped line");
    }

    let outcome = aggregate_all(traces, lambdas_count, ctx.config.run.partial_traces);
    if !outcome.inverted.is_empty() {
        tracing::warn!(traces = ?outcome.inverted, "Traces end before they start, runtime left unset");
    }

    Ok(Harvest {
        records: outcome.records,
        discarded: outcome.discarded,
        inverted: outcome.inverted,
        functions: lambdas_count,
        functions_failed,
        diagnostics,
    })
}

/// Drains every recent stream of one function. Each stream starts with a fresh
/// context; streams are read one after another.
async fn drain_function(
    source: &dyn LogSource,
    logs: &LogsConfig,
    function: &str,
) -> Result<TraceSet, FetchError> {
    let log_group = logs.log_group_name(function);
    let streams = source.list_streams(&log_group, logs.stream_limit).await?;
    tracing::debug!(function, log_group = %log_group, streams = streams.len(), source = source.name(), "Draining function");

    let mut set = TraceSet::new();
    for stream in &streams {
        let origin = StreamOrigin {
            function,
            stream: stream.as_str(),
        };
        let stats = drain_stream(source, &log_group, origin, &mut set).await?;
        tracing::debug!(
            function,
            stream = %stream,
            pages = stats.pages,
            events = stats.events,
            "Stream drained"
        );
    }
    Ok(set)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct StreamStats {
    pages: usize,
    events: usize,
}

async fn drain_stream(
    source: &dyn LogSource,
    log_group: &str,
    origin: StreamOrigin<'_>,
    set: &mut TraceSet,
) -> Result<StreamStats, FetchError> {
    let mut stats = StreamStats::default();
    let mut ctx = TraceContext::new();
    let mut batches = pin!(pages(source, log_group, origin.stream));
    while let Some(batch) = batches.try_next().await? {
        stats.pages += 1;
        stats.events += batch.len();
        ctx = set.ingest_lines(ctx, origin, batch.iter().map(|e| e.message.as_str()));
    }
    Ok(stats)
}
