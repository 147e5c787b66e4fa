use std::sync::Arc;

use fp_metrics::RelayMetricsImpl;
use fp_relay::RelayMetrics;

use crate::config::HandlerKind;

pub fn relay_metrics(handler: HandlerKind) -> Arc<dyn RelayMetrics> {
    Arc::new(HandlerRelayMetrics {
        handler: handler.as_str(),
        inner: RelayMetricsImpl::new("fp"),
    })
}

struct HandlerRelayMetrics {
    handler: &'static str,
    inner: RelayMetricsImpl,
}

impl RelayMetrics for HandlerRelayMetrics {
    fn inc_batches(&self) {
        self.inner.batch(self.handler);
    }
    fn inc_batch_rejected(&self) {
        self.inner.batch_rejected(self.handler);
    }
    fn inc_delivered(&self) {
        self.inner.record(self.handler, "delivered");
    }
    fn inc_skipped(&self) {
        self.inner.record(self.handler, "skipped");
    }
    fn inc_failed(&self, stage: &'static str) {
        self.inner.record(self.handler, "failed");
        self.inner.failure(self.handler, stage);
    }
    fn delivery_seconds(&self, seconds: f64) {
        self.inner.delivery_seconds(self.handler, seconds);
    }
}
