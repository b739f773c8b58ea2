pub mod aggregate;
pub mod classify;
pub mod config;
pub mod context;
pub mod correlate;
pub mod db;
pub mod error;
pub mod fusion_config;
pub mod log_source;
pub mod models;
pub mod paginate;
pub mod report;
pub mod sink;

pub use aggregate::{aggregate, aggregate_all, AggregateOutcome};
pub use classify::{classify, LineKind, LogLine, TraceInfo};
pub use config::{FusionConfig, PartialTracePolicy};
pub use context::TraceContext;
pub use correlate::{StreamOrigin, TraceSet};
pub use error::{Diagnostic, DiagnosticKind, FetchError, FusionError, ParseError, PersistenceError};
pub use fusion_config::{FusionConfigClient, FusionEntry};
pub use log_source::{EventPage, LogEvent, LogSource};
pub use models::{InvocationRecord, OpenTrace, TraceError, TraceRecord};
pub use paginate::{pages, StreamCursor};
pub use report::{parse_report, ReportMetrics};
pub use sink::{merge_records, MemoryTraceSink, PersistReport, TraceSink, WriteMode};
