use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fp_relay::provision::{handle_topic_request, FeatureGroupProvisioner, ProvisionResponse, TopicAdmin};
use fp_relay::{AggregateJob, BatchReport, FeedFormat, Relay, RelayError};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{error, info};

/// What one invocation payload is and who handles it.
pub enum Source {
    /// The payload is a feed-native batch.
    Feed(Relay, FeedFormat),
    /// The payload is a trigger; records come from the daily query.
    Aggregate(Relay, AggregateJob),
    /// The payload is a custom-resource request for a topic.
    Topics(Arc<dyn TopicAdmin>),
    /// The payload is a custom-resource request for a feature group.
    FeatureGroups(FeatureGroupProvisioner),
}

/// The reply written back for one invocation.
#[derive(Debug)]
pub enum Reply {
    Report(BatchReport),
    Provisioned(ProvisionResponse),
    Rejected(RelayError),
}

impl Reply {
    pub fn to_json(&self) -> Value {
        match self {
            Reply::Report(report) => report.to_json(),
            Reply::Provisioned(resp) => serde_json::to_value(resp).unwrap_or_else(|e| json!({ "error": e.to_string() })),
            Reply::Rejected(e) => json!({ "error": e.to_string() }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvocationStats {
    pub reported: usize,
    pub rejected: usize,
}

pub struct Handler {
    source: Source,
    deadline: Option<Duration>,
}

impl Handler {
    pub fn new(source: Source, deadline: Option<Duration>) -> Self {
        Self { source, deadline }
    }

    /// Handles one invocation payload. The deadline clock starts here.
    pub async fn invoke(&self, payload: &str) -> Reply {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        match &self.source {
            Source::Feed(relay, format) => match relay.relay_raw(*format, payload.as_bytes(), deadline).await {
                Ok(report) => Reply::Report(report),
                Err(e) => Reply::Rejected(e),
            },
            Source::Aggregate(relay, job) => match job.collect(trigger_time(payload)).await {
                Ok(envelopes) => Reply::Report(relay.relay_batch(envelopes, deadline).await),
                Err(e) => {
                    error!(error = %e, "aggregate query rejected");
                    Reply::Rejected(e)
                }
            },
            Source::Topics(admin) => match request(payload) {
                Ok(req) => Reply::Provisioned(handle_topic_request(admin.as_ref(), &req).await),
                Err(e) => Reply::Rejected(e),
            },
            Source::FeatureGroups(provisioner) => match request(payload) {
                Ok(req) => Reply::Provisioned(provisioner.handle(&req).await),
                Err(e) => Reply::Rejected(e),
            },
        }
    }

    /// Reads one invocation per input line and writes one JSON reply line per
    /// invocation: the batch report, the provisioning response, or
    /// `{"error": ..}` for a rejected invocation.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> Result<InvocationStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut stats = InvocationStats::default();

        while let Some(line) = lines.next_line().await.context("read invocation")? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.invoke(&line).await;
            match reply {
                Reply::Rejected(_) => stats.rejected += 1,
                _ => stats.reported += 1,
            }

            let mut text = reply.to_json().to_string();
            text.push('\n');
            output.write_all(text.as_bytes()).await.context("write reply")?;
            output.flush().await.context("flush reply")?;
        }

        info!(reported = stats.reported, rejected = stats.rejected, "input closed");
        Ok(stats)
    }
}

fn request(payload: &str) -> Result<Value, RelayError> {
    serde_json::from_str(payload).map_err(|e| RelayError::BatchEnvelope(format!("request is not json: {e}")))
}

/// Scheduler payloads may carry the trigger time as `{"time": "<rfc3339>"}`;
/// anything else runs the job for the current time.
fn trigger_time(payload: &str) -> DateTime<Utc> {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| v.get("time").and_then(Value::as_str).map(str::to_string))
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admins::{LogFeatureGroupAdmin, LogTopicAdmin};
    use crate::config::Config;
    use chrono::{FixedOffset, TimeZone};
    use clap::Parser;
    use fp_relay::provision::{FeatureGroupAdmin, ProvisionStatus};
    use fp_relay::{OutboundRecord, QueryEngine, QueryRow, RelayConfig, Sink, TransformPolicy};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        puts: Mutex<Vec<OutboundRecord>>,
    }

    #[async_trait::async_trait]
    impl Sink for MemorySink {
        async fn put(&self, _target: &str, record: &OutboundRecord) -> Result<()> {
            self.puts.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn change_batch(ids: &[&str]) -> String {
        let records: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                json!({
                    "eventID": format!("e{i}"),
                    "eventName": "INSERT",
                    "dynamodb": {
                        "SequenceNumber": format!("{}", 100 + i),
                        "NewImage": { "msg_id": { "S": id } }
                    }
                })
            })
            .collect();
        json!({ "Records": records }).to_string()
    }

    fn replies(out: Vec<u8>) -> Vec<Value> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn feed_handler(sink: Arc<MemorySink>) -> Handler {
        let relay = Relay::new(TransformPolicy::fixed(vec!["coupons".into()]), sink, RelayConfig::default()).unwrap();
        Handler::new(Source::Feed(relay, FeedFormat::ChangeStream), None)
    }

    #[tokio::test]
    async fn test_serve_writes_one_reply_per_invocation() {
        let sink = Arc::new(MemorySink::default());
        let handler = feed_handler(sink.clone());

        let input = format!("{}\n\nnot json\n{}\n", change_batch(&["m1", "m2"]), change_batch(&["m3"]));
        let mut out = Vec::new();
        let stats = handler.serve(input.as_bytes(), &mut out).await.unwrap();

        assert_eq!(stats, InvocationStats { reported: 2, rejected: 1 });
        let replies = replies(out);
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["records"].as_array().unwrap().len(), 2);
        assert_eq!(replies[0]["records"][0]["recordPosition"], "100");
        assert!(replies[1]["error"].is_string());
        assert_eq!(replies[2]["records"][0]["status"], "delivered");
        assert_eq!(sink.puts.lock().unwrap().len(), 3);
    }

    /// One complete row and one whose `eventtime` came back null.
    struct DailyRowsEngine;

    #[async_trait::async_trait]
    impl QueryEngine for DailyRowsEngine {
        async fn run(&self, _sql: &str) -> Result<Vec<QueryRow>> {
            let mut full = QueryRow::new();
            full.insert("countycode".into(), "loc0001".into());
            full.insert("aggr_date".into(), "20240901".into());
            full.insert("sum_count".into(), "12".into());
            full.insert("eventtime".into(), "2024-09-01 10:00:00.000".into());

            let mut no_time = full.clone();
            no_time.insert("countycode".into(), "loc0002".into());
            no_time.remove("eventtime");
            Ok(vec![full, no_time])
        }
    }

    #[tokio::test]
    async fn test_aggregate_invocation_relays_query_rows() {
        let cfg = Config::try_parse_from(["fp-handlers", "--handler", "batch-aggregate", "--targets", "daily"]).unwrap();
        let sink = Arc::new(MemorySink::default());
        let relay = Relay::new(cfg.policy(), sink.clone(), cfg.relay_config()).unwrap();
        let job = AggregateJob::new(Arc::new(DailyRowsEngine), "sms_events", FixedOffset::east_opt(0).unwrap());
        let handler = Handler::new(Source::Aggregate(relay, job), None);

        let Reply::Report(report) = handler.invoke(r#"{"time":"2024-09-02T01:00:00Z"}"#).await else {
            panic!("expected a batch report");
        };
        assert_eq!(report.counts().delivered, 1);
        assert_eq!(report.counts().failed, 1);
        let line = &report.lines()[1];
        assert_eq!(line.status, "failed");
        assert!(line.detail.as_deref().unwrap().contains("event_time"));

        let puts = sink.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].fields.get("location_with_date").map(String::as_str), Some("loc0001#20240901"));
        assert_eq!(puts[0].fields.get("event_time").map(String::as_str), Some("2024-09-01T10:00:00.000Z"));
    }

    fn topic_request(kind: &str) -> String {
        json!({
            "RequestType": kind,
            "ResourceProperties": {
                "topicConfig": {"topic": "coupons", "numPartitions": "3", "replicationFactor": 2}
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_topic_requests_get_one_response_each() {
        let handler = Handler::new(Source::Topics(Arc::new(LogTopicAdmin)), None);
        let input = format!("{}\n{}\nnot json\n{}\n", topic_request("Create"), topic_request("Replace"), topic_request("Delete"));

        let mut out = Vec::new();
        let stats = handler.serve(input.as_bytes(), &mut out).await.unwrap();
        assert_eq!(stats, InvocationStats { reported: 3, rejected: 1 });

        let replies = replies(out);
        assert_eq!(replies[0]["status"], "SUCCESS");
        assert_eq!(replies[0]["data"]["topicConfig"]["topic"], "coupons");
        assert_eq!(replies[1]["status"], "FAILED");
        assert!(replies[1]["reason"].as_str().unwrap().contains("unknown request type - Replace"));
        assert!(replies[2]["error"].is_string());
        assert_eq!(replies[3]["status"], "SUCCESS");
    }

    fn fg_request(kind: &str) -> String {
        json!({
            "RequestType": kind,
            "ResourceProperties": {
                "fgConfig": {
                    "featureGroupName": "location-daily",
                    "creationRoleArn": "arn:role",
                    "offlineStoreBucketName": "offline",
                    "featureAttributes": ["location_with_date", "event_time", "count"],
                    "featureDataTypes": {"count": "int64"},
                    "recordIdentifier": "location_with_date",
                    "eventTime": "event_time"
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_feature_group_lifecycle() {
        let admin = Arc::new(LogFeatureGroupAdmin::default());
        let provisioner =
            FeatureGroupProvisioner::new(admin.clone()).with_polling(Duration::from_millis(1), Duration::from_secs(1));
        let handler = Handler::new(Source::FeatureGroups(provisioner), None);

        for kind in ["Create", "Update"] {
            let Reply::Provisioned(resp) = handler.invoke(&fg_request(kind)).await else {
                panic!("expected a provisioning response");
            };
            assert_eq!(resp.status, ProvisionStatus::Success);
        }
        assert!(admin.exists("location-daily").await.unwrap());

        let reply = handler.invoke(&fg_request("Delete")).await.to_json();
        assert_eq!(reply["status"], "SUCCESS");
        assert!(!admin.exists("location-daily").await.unwrap());
    }

    #[test]
    fn test_trigger_time() {
        assert_eq!(
            trigger_time(r#"{"time":"2024-09-02T01:00:00+09:00"}"#),
            Utc.with_ymd_and_hms(2024, 9, 1, 16, 0, 0).unwrap()
        );
        let before = Utc::now();
        assert!(trigger_time("{}") >= before);
    }
}
