use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single unit of work handed over by the transport feed.
///
/// The `ack_id` is the lease handle: every acknowledge or deadline-modification
/// call refers to the delivery through it. `message_id` is the server-assigned
/// identity, used for logging and deduplication only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDelivery {
    // opaque lease handle, required for ack/modify calls
    pub ack_id: String,
    // server-assigned message identity
    pub message_id: String,
    // set when the subscription delivers related messages in order
    pub ordering_key: Option<String>,
    // The actual payload of the message
    pub payload: Vec<u8>,
    // User-defined properties/attributes
    pub attributes: HashMap<String, String>,
    // Timestamp for when the message was published
    pub publish_time: u64,
    // number of prior delivery attempts for this message
    pub delivery_attempt: u32,
}

impl RawDelivery {
    /// Payload length in bytes, used for flow-control accounting.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Subscription-level properties the backend may update mid-stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionProperties {
    pub exactly_once_delivery: bool,
    pub message_ordering: bool,
}

/// Events produced by the transport feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A new delivery to be leased and dispatched.
    Delivery(RawDelivery),
    /// Updated subscription properties.
    Properties(SubscriptionProperties),
}
