//! CloudWatch Logs backed `LogSource`
//!
//! Lists the most recently written streams of a function's log group and reads
//! them page by page. Pagination termination is left to `fusion_core::paginate`.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::types::OrderBy;
use aws_sdk_cloudwatchlogs::Client;

use fusion_core::config::LogsConfig;
use fusion_core::{EventPage, FetchError, LogEvent, LogSource};

#[derive(Debug, Clone)]
pub struct CloudWatchLogSource {
    client: Client,
    start_from_head: bool,
}

impl CloudWatchLogSource {
    pub async fn new(config: &LogsConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_sdk_cloudwatchlogs::config::Region::new(region.clone()));
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_cloudwatchlogs::config::Builder::from(&sdk_config);

        // LocalStack and other emulators
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        tracing::debug!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            start_from_head = config.start_from_head,
            "CloudWatch log source initialized"
        );

        Self {
            client: Client::from_conf(builder.build()),
            start_from_head: config.start_from_head,
        }
    }
}

fn source_error(log_group: &str, err: impl std::error::Error) -> FetchError {
    FetchError::LogSource {
        log_group: log_group.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl LogSource for CloudWatchLogSource {
    async fn list_streams(&self, log_group: &str, limit: i32) -> Result<Vec<String>, FetchError> {
        let output = self
            .client
            .describe_log_streams()
            .log_group_name(log_group)
            .order_by(OrderBy::LastEventTime)
            .descending(true)
            .limit(limit)
            .send()
            .await
            .map_err(|e| source_error(log_group, e))?;

        Ok(output
            .log_streams()
            .iter()
            .filter_map(|s| s.log_stream_name().map(str::to_string))
            .collect())
    }

    async fn get_events(
        &self,
        log_group: &str,
        stream: &str,
        token: Option<&str>,
    ) -> Result<EventPage, FetchError> {
        let output = self
            .client
            .get_log_events()
            .log_group_name(log_group)
            .log_stream_name(stream)
            .start_from_head(self.start_from_head)
            .set_next_token(token.map(str::to_string))
            .send()
            .await
            .map_err(|e| source_error(log_group, e))?;

        let events = output
            .events()
            .iter()
            .filter_map(|e| e.message().map(LogEvent::new))
            .collect();

        Ok(EventPage {
            events,
            next_forward_token: output.next_forward_token().map(str::to_string),
        })
    }

    fn name(&self) -> &str {
        "cloudwatch"
    }
}
