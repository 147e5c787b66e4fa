use metrics::{counter, histogram};

use crate::labels;

pub struct RelayMetricsImpl {
    ns: &'static str,
}

impl RelayMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn batch(&self, handler: &'static str) {
        counter!(format!("{}_relay_batches_total", self.ns), "handler" => handler).increment(1);
    }

    #[inline]
    pub fn batch_rejected(&self, handler: &'static str) {
        counter!(format!("{}_relay_batches_rejected_total", self.ns), "handler" => handler).increment(1);
    }

    #[inline]
    pub fn record(&self, handler: &'static str, status: &'static str) {
        counter!(
            format!("{}_relay_records_total", self.ns),
            "handler" => handler,
            "status" => labels::status(status).into_inner()
        )
        .increment(1);
    }

    #[inline]
    pub fn failure(&self, handler: &'static str, stage: &'static str) {
        counter!(
            format!("{}_relay_failures_total", self.ns),
            "handler" => handler,
            "stage" => labels::stage(stage).into_inner()
        )
        .increment(1);
    }

    #[inline]
    pub fn delivery_seconds(&self, handler: &'static str, seconds: f64) {
        histogram!(format!("{}_relay_delivery_seconds", self.ns), "handler" => handler).record(seconds);
    }
}
