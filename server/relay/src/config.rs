use std::time::Duration;

use crate::errors::{RelayError, RelayResult};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Records delivered at once. 1 means strictly sequential.
    pub concurrency: usize,
    /// Upper bound on a single sink write.
    pub delivery_timeout: Duration,
    /// No new record starts once the deadline is closer than this.
    pub deadline_margin: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            deadline_margin: Duration::ZERO,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.concurrency == 0 {
            return Err(RelayError::InvalidConfig("concurrency must be at least 1"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(RelayError::InvalidConfig("delivery timeout must be non-zero"));
        }
        Ok(())
    }
}
