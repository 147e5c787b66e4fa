#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Bind address for the Prometheus scrape endpoint, e.g. 0.0.0.0:9102
    pub listen: String,

    /// Metric name prefix, e.g. "fp"
    pub namespace: &'static str,
}
