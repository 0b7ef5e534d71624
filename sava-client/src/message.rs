use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::{Result, SavaError};
use crate::subscriber::SubscriberCore;
use sava_core::message::RawDelivery;

/// Outcome of a response-aware settle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResponse {
    /// The batched request covering this message completed successfully.
    Success,
    /// The message was already settled; nothing was submitted.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettleKind {
    Ack,
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Received,
    Dispatched,
    Settled,
}

#[derive(Debug)]
struct MessageLifecycle {
    state: MessageState,
    // set when an exactly-once ack/modify permanently failed for this lease
    terminal_error: Option<SavaError>,
}

#[derive(Debug)]
struct MessageInner {
    ack_id: String,
    message_id: String,
    ordering_key: Option<String>,
    payload: Vec<u8>,
    attributes: HashMap<String, String>,
    publish_time: u64,
    delivery_attempt: u32,
    byte_size: usize,
    received_at: Instant,
    lifecycle: Mutex<MessageLifecycle>,
    core: Weak<SubscriberCore>,
}

/// One leased message, handed to the consumer by the subscriber.
///
/// Exactly one of `ack`/`nack` takes effect; any settle call after the first
/// is a no-op (the `_with_response` variants answer [`AckResponse::Invalid`]).
/// Cloning is cheap and all clones refer to the same lease.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub(crate) fn new(raw: RawDelivery, core: Weak<SubscriberCore>) -> Self {
        let byte_size = raw.size();
        Message {
            inner: Arc::new(MessageInner {
                ack_id: raw.ack_id,
                message_id: raw.message_id,
                ordering_key: raw.ordering_key,
                payload: raw.payload,
                attributes: raw.attributes,
                publish_time: raw.publish_time,
                delivery_attempt: raw.delivery_attempt,
                byte_size,
                received_at: Instant::now(),
                lifecycle: Mutex::new(MessageLifecycle {
                    state: MessageState::Received,
                    terminal_error: None,
                }),
                core,
            }),
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.inner.ack_id
    }

    pub fn id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn ordering_key(&self) -> Option<&str> {
        self.inner.ordering_key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.inner.attributes
    }

    pub fn publish_time(&self) -> u64 {
        self.inner.publish_time
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.inner.delivery_attempt
    }

    /// Payload length in bytes, as counted against the flow-control limits.
    pub fn byte_size(&self) -> usize {
        self.inner.byte_size
    }

    /// Time elapsed since the transport handed this message over.
    pub fn age(&self) -> Duration {
        self.inner.received_at.elapsed()
    }

    pub(crate) fn received_at(&self) -> Instant {
        self.inner.received_at
    }

    /// Acknowledge the message. Fire-and-forget: the batched request is
    /// queued and completes in the background.
    pub async fn ack(&self) {
        let _ = self.settle(SettleKind::Ack, false).await;
    }

    /// Acknowledge the message and wait for the batched request to complete.
    pub async fn ack_with_response(&self) -> Result<AckResponse> {
        self.settle(SettleKind::Ack, true).await
    }

    /// Request immediate redelivery. Fire-and-forget.
    pub async fn nack(&self) {
        let _ = self.settle(SettleKind::Nack, false).await;
    }

    /// Request immediate redelivery and wait for the batched request to
    /// complete.
    pub async fn nack_with_response(&self) -> Result<AckResponse> {
        self.settle(SettleKind::Nack, true).await
    }

    async fn settle(&self, kind: SettleKind, await_response: bool) -> Result<AckResponse> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if let Some(err) = &lifecycle.terminal_error {
                return Err(err.clone());
            }
            if lifecycle.state == MessageState::Settled {
                return Ok(AckResponse::Invalid);
            }
            lifecycle.state = MessageState::Settled;
        }
        match self.inner.core.upgrade() {
            Some(core) => core.settle(self.clone(), kind, await_response).await,
            // Subscriber is gone; the lease lapses and the backend redelivers.
            None => Ok(AckResponse::Invalid),
        }
    }

    /// Push this message's redelivery deadline `seconds` out. Allowed in any
    /// pre-settled state; a no-op afterwards.
    pub(crate) async fn modify_ack_deadline(&self, seconds: u32) -> Result<()> {
        if self.is_settled().await {
            return Ok(());
        }
        match self.inner.core.upgrade() {
            Some(core) => core.extend_deadline(self, seconds).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn is_settled(&self) -> bool {
        self.inner.lifecycle.lock().await.state == MessageState::Settled
    }

    /// Entered once the subscriber hands the message to the consumer.
    pub(crate) async fn mark_dispatched(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state == MessageState::Received {
            lifecycle.state = MessageState::Dispatched;
        }
    }

    /// Latch a permanent failure and settle the message so no further
    /// requests are submitted for this lease. Later settle attempts surface
    /// the error.
    pub(crate) async fn fail_terminally(&self, error: SavaError) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.terminal_error.is_none() {
            lifecycle.terminal_error = Some(error);
        }
        lifecycle.state = MessageState::Settled;
    }
}
