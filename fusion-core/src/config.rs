use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub fusion_config: FusionConfigSource,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Where the list of participating functions is published.
#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfigSource {
    pub url: String,
    /// Older snapshot, read by storage-triggered re-runs.
    #[serde(default)]
    pub previous_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogsConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub log_group_prefix: String,
    pub log_group_suffix: String,
    pub stream_limit: i32,
    pub start_from_head: bool,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            log_group_prefix: "/aws/lambda/".to_string(),
            log_group_suffix: "-stg".to_string(),
            stream_limit: 5,
            start_from_head: true,
        }
    }
}

impl LogsConfig {
    pub fn log_group_name(&self, entry: &str) -> String {
        format!("{}{}{}", self.log_group_prefix, entry, self.log_group_suffix)
    }
}

/// What to do with traces that saw fewer invocations than the fan-out size.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartialTracePolicy {
    #[default]
    Keep,
    Discard,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Bounds fetching, draining and aggregation.
    pub timeout_seconds: u64,
    /// Separate bound on writing to the sink.
    pub persist_timeout_seconds: u64,
    pub partial_traces: PartialTracePolicy,
    pub interval_minutes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            persist_timeout_seconds: 120,
            partial_traces: PartialTracePolicy::Keep,
            interval_minutes: 15,
        }
    }
}

impl FusionConfig {
    /// Loads `path` and layers `FUSION__SECTION__KEY` environment overrides on top.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("FUSION").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
