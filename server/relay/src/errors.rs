use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Invocation-level errors. These are the only errors a batch invocation
/// surfaces to its caller.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("batch envelope: {0}")]
    BatchEnvelope(String),

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error("query failed: {0:#}")]
    Query(anyhow::Error),

    #[error("aggregate window: {0}")]
    Window(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing discriminator")]
    MissingDiscriminator,

    #[error("truncated payload: missing {0}")]
    Truncated(&'static str),

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("field {0} has the wrong type")]
    IllTyped(String),

    #[error("field {field} is not a timestamp: {value:?}")]
    InvalidTimestamp { field: String, value: String },
}

/// Why a single record failed. Never escapes a batch; it ends up inside the
/// record's `DeliveryOutcome::Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("transform: {0}")]
    Transform(#[from] TransformError),

    #[error("delivery to {target}: {cause}")]
    Delivery { target: String, cause: String },

    #[error("deadline-exceeded")]
    DeadlineExceeded,
}

impl RecordError {
    pub fn stage(&self) -> &'static str {
        match self {
            RecordError::Decode(_) => "decode",
            RecordError::Transform(_) => "transform",
            RecordError::Delivery { .. } => "deliver",
            RecordError::DeadlineExceeded => "deadline",
        }
    }
}
