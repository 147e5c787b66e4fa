use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::{
    errors::RecordError,
    metrics::RelayMetrics,
    model::{DeliveryOutcome, OutboundRecord},
    sink::Sink,
};

/// Writes records to the sink and turns every failure into an outcome.
///
/// There is no retry loop here; whatever retrying exists lives in the sink
/// client's transport.
#[derive(Clone)]
pub struct Deliverer {
    sink: Arc<dyn Sink>,
    timeout: Duration,
    metrics: Arc<dyn RelayMetrics>,
}

impl Deliverer {
    pub fn new(sink: Arc<dyn Sink>, timeout: Duration, metrics: Arc<dyn RelayMetrics>) -> Self {
        Self { sink, timeout, metrics }
    }

    pub async fn deliver(&self, record: &OutboundRecord) -> DeliveryOutcome {
        let started = Instant::now();
        let res = timeout(self.timeout, self.sink.put(&record.target, record)).await;
        self.metrics.delivery_seconds(started.elapsed().as_secs_f64());

        match res {
            Ok(Ok(())) => {
                debug!(target_id = %record.target, "record delivered");
                DeliveryOutcome::Delivered
            }
            Ok(Err(e)) => DeliveryOutcome::Failed(RecordError::Delivery {
                target: record.target.clone(),
                cause: format!("{e:#}"),
            }),
            Err(_) => DeliveryOutcome::Failed(RecordError::Delivery {
                target: record.target.clone(),
                cause: format!("timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    /// Delivers the records of one event in order, stopping at the first failure.
    pub async fn deliver_all(&self, records: &[OutboundRecord]) -> DeliveryOutcome {
        for record in records {
            let outcome = self.deliver(record).await;
            if !outcome.is_delivered() {
                return outcome;
            }
        }
        DeliveryOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct ScriptedSink {
        fail_target: Option<&'static str>,
        stall: Option<Duration>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Sink for ScriptedSink {
        async fn put(&self, target: &str, _record: &OutboundRecord) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(target.to_string());
            if let Some(d) = self.stall {
                tokio::time::sleep(d).await;
            }
            if self.fail_target == Some(target) {
                anyhow::bail!("throttled");
            }
            Ok(())
        }
    }

    fn deliverer(sink: Arc<ScriptedSink>, t: Duration) -> Deliverer {
        Deliverer::new(sink, t, Arc::new(NoopMetrics))
    }

    fn rec(target: &str) -> OutboundRecord {
        OutboundRecord { target: target.into(), fields: BTreeMap::new() }
    }

    #[tokio::test]
    async fn test_sink_error_becomes_failed() {
        let sink = Arc::new(ScriptedSink { fail_target: Some("b"), stall: None, seen: Mutex::new(vec![]) });
        let d = deliverer(sink.clone(), Duration::from_secs(1));

        assert_eq!(d.deliver(&rec("a")).await, DeliveryOutcome::Delivered);
        match d.deliver(&rec("b")).await {
            DeliveryOutcome::Failed(RecordError::Delivery { target, cause }) => {
                assert_eq!(target, "b");
                assert!(cause.contains("throttled"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_times_out() {
        let sink = Arc::new(ScriptedSink {
            fail_target: None,
            stall: Some(Duration::from_secs(120)),
            seen: Mutex::new(vec![]),
        });
        let d = deliverer(sink, Duration::from_secs(60));
        match d.deliver(&rec("a")).await {
            DeliveryOutcome::Failed(RecordError::Delivery { cause, .. }) => {
                assert!(cause.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deliver_all_stops_at_first_failure() {
        let sink = Arc::new(ScriptedSink { fail_target: Some("b"), stall: None, seen: Mutex::new(vec![]) });
        let d = deliverer(sink.clone(), Duration::from_secs(1));

        let outcome = d.deliver_all(&[rec("a"), rec("b"), rec("c")]).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
        assert_eq!(*sink.seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
