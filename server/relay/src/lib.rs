pub mod aggregate;
pub mod config;
pub mod decode;
pub mod deliver;
pub mod errors;
pub mod ids;
pub mod metrics;
pub mod model;
pub mod provision;
pub mod relay;
pub mod sink;
pub mod timestamp;
pub mod transform;

pub use aggregate::{AggregateJob, QueryEngine};
pub use config::RelayConfig;
pub use decode::{FeedFormat, QueryRow, RawEnvelope};
pub use errors::{DecodeError, RecordError, RelayError, RelayResult, TransformError};
pub use ids::{BatchId, FeedPosition};
pub use metrics::{NoopMetrics, RelayMetrics};
pub use model::{BatchReport, DeliveryOutcome, EventKind, FieldValue, InboundEvent, OutboundRecord};
pub use relay::Relay;
pub use sink::{LazySink, Sink, SinkBuilder};
pub use transform::{TargetSelector, TransformPolicy};
