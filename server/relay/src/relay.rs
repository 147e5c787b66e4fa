use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::RelayConfig,
    decode::{decode, parse_batch, FeedFormat, RawEnvelope},
    deliver::Deliverer,
    errors::{RecordError, RelayError, RelayResult},
    ids::BatchId,
    metrics::{NoopMetrics, RelayMetrics},
    model::{BatchReport, DeliveryOutcome, OutboundRecord, ReportEntry},
    sink::Sink,
    transform::{transform, TargetSelector, TransformPolicy, Transformed},
};

/// Drives decode → transform → deliver over one batch at a time.
///
/// Cloning is cheap; clones share the sink client and configuration.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    policy: TransformPolicy,
    deliverer: Deliverer,
    cfg: RelayConfig,
    metrics: Arc<dyn RelayMetrics>,
}

enum Prepared {
    Done(DeliveryOutcome),
    Deliver(Vec<OutboundRecord>),
}

/// A finished delivery task, tagged with the record it belongs to.
struct Finished {
    index: usize,
    target: String,
    result: Result<DeliveryOutcome, JoinError>,
}

impl Finished {
    /// A delivery task that panicked or was cancelled still yields an outcome.
    fn outcome(self) -> DeliveryOutcome {
        match self.result {
            Ok(outcome) => outcome,
            Err(e) => DeliveryOutcome::Failed(RecordError::Delivery {
                target: self.target,
                cause: format!("delivery task aborted: {e}"),
            }),
        }
    }
}

impl Relay {
    pub fn new(policy: TransformPolicy, sink: Arc<dyn Sink>, cfg: RelayConfig) -> RelayResult<Self> {
        Self::with_metrics(policy, sink, cfg, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        policy: TransformPolicy,
        sink: Arc<dyn Sink>,
        cfg: RelayConfig,
        metrics: Arc<dyn RelayMetrics>,
    ) -> RelayResult<Self> {
        cfg.validate()?;
        match &policy.targets {
            TargetSelector::Fixed(t) if t.is_empty() => {
                return Err(RelayError::InvalidConfig("no targets configured"));
            }
            TargetSelector::FromField(f) if f.is_empty() => {
                return Err(RelayError::InvalidConfig("target field name is empty"));
            }
            _ => {}
        }

        let deliverer = Deliverer::new(sink, cfg.delivery_timeout, metrics.clone());
        Ok(Self {
            inner: Arc::new(Inner { policy, deliverer, cfg, metrics }),
        })
    }

    /// Enumerates a feed-native batch and relays it. Only an unreadable batch
    /// envelope is returned as an error.
    pub async fn relay_raw(
        &self,
        format: FeedFormat,
        bytes: &[u8],
        deadline: Option<Instant>,
    ) -> RelayResult<BatchReport> {
        let envelopes = match parse_batch(format, bytes) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                self.inner.metrics.inc_batch_rejected();
                error!(error = %e, "batch rejected");
                return Err(e);
            }
        };
        Ok(self.relay_batch(envelopes, deadline).await)
    }

    pub async fn relay_batch(&self, envelopes: Vec<RawEnvelope>, deadline: Option<Instant>) -> BatchReport {
        let batch_id = BatchId::new();
        let total = envelopes.len();
        let width = self.inner.cfg.concurrency;
        self.inner.metrics.inc_batches();
        info!(batch_id = %batch_id, records = total, concurrency = width, "batch received");

        let cutoff = deadline.map(|d| d.checked_sub(self.inner.cfg.deadline_margin).unwrap_or(d));
        let mut positions = Vec::with_capacity(total);
        let mut slots: Vec<Option<DeliveryOutcome>> = vec![None; total];
        let mut inflight: JoinSet<Finished> = JoinSet::new();
        let mut deadline_hit = false;

        for (index, env) in envelopes.into_iter().enumerate() {
            positions.push(env.position.clone());

            // a full pool frees the first slot to finish, not the oldest
            if !deadline_hit && inflight.len() >= width {
                if let Some(joined) = inflight.join_next().await {
                    settle(&mut slots, joined);
                }
            }

            if !deadline_hit && cutoff.is_some_and(|c| Instant::now() >= c) {
                deadline_hit = true;
                warn!(batch_id = %batch_id, remaining = total - index, "deadline reached, not starting remaining records");
            }
            if deadline_hit {
                slots[index] = Some(DeliveryOutcome::Failed(RecordError::DeadlineExceeded));
                continue;
            }

            match self.prepare(&env) {
                Prepared::Done(outcome) => slots[index] = Some(outcome),
                Prepared::Deliver(records) => {
                    let target = records.first().map(|r| r.target.clone()).unwrap_or_default();
                    let deliverer = self.inner.deliverer.clone();
                    let handle = tokio::spawn(async move { deliverer.deliver_all(&records).await });
                    inflight.spawn(async move {
                        Finished { index, target, result: handle.await }
                    });
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            settle(&mut slots, joined);
        }

        let entries: Vec<ReportEntry> = slots
            .into_iter()
            .zip(positions)
            .enumerate()
            .map(|(index, (slot, position))| ReportEntry {
                index,
                position,
                outcome: slot.unwrap_or_else(|| {
                    DeliveryOutcome::Failed(RecordError::Delivery {
                        target: String::new(),
                        cause: "delivery task lost".to_string(),
                    })
                }),
            })
            .collect();

        let report = BatchReport::new(batch_id, entries);
        self.observe(&report);
        report
    }

    fn prepare(&self, env: &RawEnvelope) -> Prepared {
        let event = match decode(env) {
            Ok(event) => event,
            Err(e) => return Prepared::Done(DeliveryOutcome::Failed(e.into())),
        };
        match transform(&self.inner.policy, &event) {
            Ok(Transformed::Records(records)) => Prepared::Deliver(records),
            Ok(Transformed::Skipped(reason)) => Prepared::Done(DeliveryOutcome::Skipped(reason.to_string())),
            Err(e) => Prepared::Done(DeliveryOutcome::Failed(e.into())),
        }
    }

    fn observe(&self, report: &BatchReport) {
        let metrics = &self.inner.metrics;
        for entry in report.entries() {
            match &entry.outcome {
                DeliveryOutcome::Delivered => metrics.inc_delivered(),
                DeliveryOutcome::Skipped(reason) => {
                    metrics.inc_skipped();
                    debug!(batch_id = %report.batch_id, position = %entry.position, reason = %reason, "record skipped");
                }
                DeliveryOutcome::Failed(e) => {
                    metrics.inc_failed(e.stage());
                    warn!(batch_id = %report.batch_id, position = %entry.position, stage = e.stage(), error = %e, "record failed");
                }
            }
        }

        let c = report.counts();
        info!(
            batch_id = %report.batch_id,
            delivered = c.delivered,
            skipped = c.skipped,
            failed = c.failed,
            "batch reported"
        );
    }
}

fn settle(slots: &mut [Option<DeliveryOutcome>], joined: Result<Finished, JoinError>) {
    match joined {
        Ok(done) => {
            let index = done.index;
            slots[index] = Some(done.outcome());
        }
        // the wrapper only awaits the delivery handle; this is runtime shutdown
        Err(e) => error!(error = %e, "delivery wrapper task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{QueryRow, RawBody};
    use crate::ids::FeedPosition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct PanickySink {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Sink for PanickySink {
        async fn put(&self, _target: &str, record: &OutboundRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if record.fields.get("boom").is_some() {
                panic!("sink client bug");
            }
            Ok(())
        }
    }

    fn row(pairs: &[(&str, &str)]) -> RawEnvelope {
        let row: QueryRow = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RawEnvelope { position: FeedPosition::new(format!("{pairs:?}")), body: RawBody::Row(row) }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let sink: Arc<dyn Sink> = Arc::new(PanickySink { calls: AtomicUsize::new(0) });
        let cfg = RelayConfig { concurrency: 0, ..RelayConfig::default() };
        assert!(Relay::new(TransformPolicy::fixed(vec!["t".into()]), sink.clone(), cfg).is_err());
        assert!(Relay::new(TransformPolicy::fixed(vec![]), sink, RelayConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_panicking_sink_is_contained_to_its_record() {
        let sink = Arc::new(PanickySink { calls: AtomicUsize::new(0) });
        let relay = Relay::new(TransformPolicy::fixed(vec!["t".into()]), sink.clone(), RelayConfig::default()).unwrap();

        let report = relay
            .relay_batch(vec![row(&[("a", "1")]), row(&[("boom", "1")]), row(&[("c", "3")])], None)
            .await;

        let outcomes: Vec<_> = report.outcomes().cloned().collect();
        assert_eq!(outcomes[0], DeliveryOutcome::Delivered);
        assert!(matches!(&outcomes[1], DeliveryOutcome::Failed(RecordError::Delivery { target, .. }) if target == "t"));
        assert_eq!(outcomes[2], DeliveryOutcome::Delivered);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_relay_raw_rejects_unreadable_envelope() {
        let sink: Arc<dyn Sink> = Arc::new(PanickySink { calls: AtomicUsize::new(0) });
        let relay = Relay::new(TransformPolicy::fixed(vec!["t".into()]), sink, RelayConfig::default()).unwrap();
        let err = relay.relay_raw(FeedFormat::ChangeStream, b"[]", None).await.unwrap_err();
        assert!(matches!(err, RelayError::BatchEnvelope(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_already_passed_starts_nothing() {
        let sink = Arc::new(PanickySink { calls: AtomicUsize::new(0) });
        let relay = Relay::new(TransformPolicy::fixed(vec!["t".into()]), sink.clone(), RelayConfig::default()).unwrap();

        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        let report = relay.relay_batch(vec![row(&[("a", "1")]), row(&[("b", "2")])], Some(deadline)).await;

        assert_eq!(report.len(), 2);
        assert!(report
            .outcomes()
            .all(|o| *o == DeliveryOutcome::Failed(RecordError::DeadlineExceeded)));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
