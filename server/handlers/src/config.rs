use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fp_relay::aggregate::{COUNT, EVENT_TIME, LOCATION_WITH_DATE};
use fp_relay::{EventKind, FeedFormat, RelayConfig, TransformPolicy};
use chrono::FixedOffset;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HandlerKind {
    /// Change-stream inserts republished onto a broker topic
    StreamToBroker,
    /// Broker messages written into the feature group named in each message
    BrokerToStore,
    /// Yesterday's per-location totals written into a daily feature group
    BatchAggregate,
    /// Custom-resource requests that create or delete broker topics
    TopicProvision,
    /// Custom-resource requests that create or delete feature groups
    FeatureGroupProvision,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::StreamToBroker => "stream_to_broker",
            HandlerKind::BrokerToStore => "broker_to_store",
            HandlerKind::BatchAggregate => "batch_aggregate",
            HandlerKind::TopicProvision => "topic_provision",
            HandlerKind::FeatureGroupProvision => "feature_group_provision",
        }
    }

    /// Wire format of invocation payloads, for the handlers that relay a feed.
    pub fn feed_format(&self) -> Option<FeedFormat> {
        match self {
            HandlerKind::StreamToBroker => Some(FeedFormat::ChangeStream),
            HandlerKind::BrokerToStore => Some(FeedFormat::Broker),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Emit each record as a structured log line
    Log,
    /// Append each record as a JSON line to --sink-path
    Jsonl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Create,
    Update,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "fp-handlers", about = "Feature pipeline relay handler")]
pub struct Config {
    /// Which relay this process runs
    #[arg(long, env = "FP_HANDLER", value_enum)]
    pub handler: HandlerKind,

    #[arg(long, env = "FP_SINK", value_enum, default_value_t = SinkKind::Log)]
    pub sink: SinkKind,

    /// Output file for the jsonl sink
    #[arg(long, env = "FP_SINK_PATH")]
    pub sink_path: Option<PathBuf>,

    /// Fixed delivery targets (topic or feature group names), comma separated
    #[arg(long, env = "FP_TARGETS", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Read the delivery target from this payload field instead of --targets
    #[arg(long, env = "FP_TARGET_FIELD")]
    pub target_field: Option<String>,

    #[arg(long, env = "FP_REQUIRED_FIELDS", value_delimiter = ',')]
    pub required_fields: Vec<String>,

    /// Fields normalized to the canonical timestamp format (handler default if unset)
    #[arg(long, env = "FP_TIMESTAMP_FIELDS", value_delimiter = ',')]
    pub timestamp_fields: Vec<String>,

    /// Event kinds that produce records (handler default if unset)
    #[arg(long, env = "FP_ACCEPT_KINDS", value_enum, value_delimiter = ',')]
    pub accept_kinds: Vec<KindArg>,

    #[arg(long, env = "FP_DELIVERY_TIMEOUT_MS", default_value_t = 60_000)]
    pub delivery_timeout_ms: u64,

    /// Records delivered at once (1 = sequential)
    #[arg(long, env = "FP_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    /// Per-invocation deadline; unset means no deadline
    #[arg(long, env = "FP_DEADLINE_MS")]
    pub deadline_ms: Option<u64>,

    /// Stop starting new records this long before the deadline
    #[arg(long, env = "FP_DEADLINE_MARGIN_MS", default_value_t = 500)]
    pub deadline_margin_ms: u64,

    /// Prometheus scrape address, e.g. 0.0.0.0:9102 (disabled if unset)
    #[arg(long, env = "FP_METRICS_LISTEN")]
    pub metrics_listen: Option<String>,

    /// Offset from UTC, in minutes, that defines the aggregated calendar day
    #[arg(long, env = "FP_AGGREGATE_UTC_OFFSET_MINUTES", default_value_t = 0, allow_hyphen_values = true)]
    pub aggregate_utc_offset_minutes: i32,

    #[arg(long, env = "FP_SOURCE_TABLE", default_value = "sms_events")]
    pub source_table: String,

    /// Saved query result (JSON array of row objects) served to the aggregate job
    #[arg(long, env = "FP_QUERY_ROWS_PATH")]
    pub query_rows_path: Option<PathBuf>,

    /// Feature group status poll interval after a create request
    #[arg(long, env = "FP_PROVISION_POLL_MS", default_value_t = 5_000)]
    pub provision_poll_ms: u64,

    /// Give up waiting for a feature group to leave `Creating` after this long
    #[arg(long, env = "FP_PROVISION_MAX_WAIT_MS", default_value_t = 600_000)]
    pub provision_max_wait_ms: u64,
}

impl Config {
    pub fn policy(&self) -> TransformPolicy {
        let mut policy = match (&self.target_field, self.handler) {
            (Some(field), _) => TransformPolicy::from_field(field.clone()),
            (None, HandlerKind::BrokerToStore) if self.targets.is_empty() => {
                TransformPolicy::from_field("feature_group_name")
            }
            (None, _) => TransformPolicy::fixed(self.targets.clone()),
        };

        policy.required_fields = if self.required_fields.is_empty() {
            match self.handler {
                HandlerKind::BatchAggregate => {
                    vec![LOCATION_WITH_DATE.to_string(), EVENT_TIME.to_string(), COUNT.to_string()]
                }
                _ => Vec::new(),
            }
        } else {
            self.required_fields.clone()
        };
        policy.timestamp_fields = if self.timestamp_fields.is_empty() {
            match self.handler {
                HandlerKind::BrokerToStore | HandlerKind::BatchAggregate => vec![EVENT_TIME.to_string()],
                _ => Vec::new(),
            }
        } else {
            self.timestamp_fields.clone()
        };
        policy.accepted_kinds = if self.accept_kinds.is_empty() {
            match self.handler {
                HandlerKind::BrokerToStore => vec![EventKind::Create, EventKind::Update],
                _ => vec![EventKind::Create],
            }
        } else {
            self.accept_kinds
                .iter()
                .map(|k| match k {
                    KindArg::Create => EventKind::Create,
                    KindArg::Update => EventKind::Update,
                })
                .collect()
        };
        policy
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            concurrency: self.concurrency,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            deadline_margin: Duration::from_millis(self.deadline_margin_ms),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn provision_polling(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.provision_poll_ms),
            Duration::from_millis(self.provision_max_wait_ms),
        )
    }

    pub fn aggregate_offset(&self) -> Result<FixedOffset> {
        self.aggregate_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("utc offset out of range: {} minutes", self.aggregate_utc_offset_minutes))
    }
}
