use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::FeedEvent;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures reported by the pull transport for feed and lease operations.
///
/// The taxonomy mirrors the status codes a gRPC-backed transport reports;
/// what matters to the engine is only the permanent/transient split.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid ack id: {0}")]
    InvalidAckId(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Permanent failures settle the affected lease for good; transient ones
    /// are left to the backend's natural redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::PermissionDenied(_)
                | TransportError::FailedPrecondition(_)
                | TransportError::InvalidAckId(_)
        )
    }
}

/// The pull transport the subscriber engine drives.
///
/// Implementations own the wire protocol; the engine only requires a feed of
/// [`FeedEvent`]s, batched lease calls, and flow-control hooks. Whether a
/// lease call is treated as fire-and-forget or awaited for its response is
/// the caller's choice.
#[async_trait]
pub trait PullTransport: Send + Sync + std::fmt::Debug {
    /// Open the delivery feed. Deliveries and subscription property updates
    /// arrive on the returned channel until the transport is destroyed.
    async fn feed(&self) -> TransportResult<mpsc::Receiver<FeedEvent>>;

    /// Acknowledge a batch of leases.
    async fn acknowledge(&self, ack_ids: Vec<String>) -> TransportResult<()>;

    /// Move the redelivery deadline for a batch of leases `deadline_seconds`
    /// out from now. Zero makes the messages immediately eligible for
    /// redelivery.
    async fn modify_ack_deadline(
        &self,
        deadline_seconds: u32,
        ack_ids: Vec<String>,
    ) -> TransportResult<()>;

    /// Stop the feed from producing new deliveries.
    async fn pause(&self);

    /// Resume a paused feed.
    async fn resume(&self);

    /// Tear the feed down; no further events are produced.
    async fn destroy(&self);
}
