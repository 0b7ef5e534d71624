use sava_core::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SavaError>;

#[derive(Debug, Clone, Error)]
pub enum SavaError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An exactly-once acknowledge or deadline-modification was rejected
    /// with a non-retryable status; the lease is finished for this consumer.
    #[error("acknowledgement permanently failed: {0}")]
    AckFailed(TransportError),

    #[error("subscriber is closed")]
    Closed,

    #[error("unable to perform operation: {0}")]
    Unrecoverable(String),
}
