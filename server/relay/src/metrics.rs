/// Hooks the relay calls while it works. The process wires these to its
/// metrics exporter.
pub trait RelayMetrics: Send + Sync {
    fn inc_batches(&self);
    fn inc_batch_rejected(&self);
    fn inc_delivered(&self);
    fn inc_skipped(&self);
    fn inc_failed(&self, stage: &'static str);
    fn delivery_seconds(&self, seconds: f64);
}

/// No-op metrics default.
pub struct NoopMetrics;
impl RelayMetrics for NoopMetrics {
    fn inc_batches(&self) {}
    fn inc_batch_rejected(&self) {}
    fn inc_delivered(&self) {}
    fn inc_skipped(&self) {}
    fn inc_failed(&self, _stage: &'static str) {}
    fn delivery_seconds(&self, _seconds: f64) {}
}
