//! Shared test support: an in-memory transport with an injectable feed and
//! full recording of the lease calls the engine issues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sava_core::message::{FeedEvent, RawDelivery, SubscriptionProperties};
use sava_core::transport::{PullTransport, TransportError, TransportResult};
use tokio::sync::mpsc;

/// One recorded lease call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCall {
    Ack(Vec<String>),
    ModAck(u32, Vec<String>),
}

#[derive(Debug, Default)]
pub struct MockTransport {
    feed_tx: Mutex<Option<mpsc::Sender<FeedEvent>>>,
    calls: Mutex<Vec<LeaseCall>>,
    ack_failure: Mutex<Option<TransportError>>,
    modack_failure: Mutex<Option<TransportError>>,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    destroys: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Inject a delivery into the open feed.
    pub async fn deliver(&self, ack_id: &str, payload: &[u8]) {
        self.push(FeedEvent::Delivery(RawDelivery {
            ack_id: ack_id.to_string(),
            message_id: format!("m-{ack_id}"),
            ordering_key: None,
            payload: payload.to_vec(),
            attributes: HashMap::new(),
            publish_time: 1_700_000_000,
            delivery_attempt: 0,
        }))
        .await;
    }

    /// Inject a subscription-properties update into the open feed.
    pub async fn update_properties(&self, exactly_once_delivery: bool) {
        self.push(FeedEvent::Properties(SubscriptionProperties {
            exactly_once_delivery,
            message_ordering: false,
        }))
        .await;
    }

    pub async fn push(&self, event: FeedEvent) {
        let tx = self
            .feed_tx
            .lock()
            .unwrap()
            .clone()
            .expect("feed not opened");
        tx.send(event).await.expect("feed receiver dropped");
    }

    pub fn fail_acks_with(&self, error: TransportError) {
        *self.ack_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_modacks_with(&self, error: TransportError) {
        *self.modack_failure.lock().unwrap() = Some(error);
    }

    pub fn clear_failures(&self) {
        *self.ack_failure.lock().unwrap() = None;
        *self.modack_failure.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<LeaseCall> {
        self.calls.lock().unwrap().clone()
    }

    /// All ack ids acknowledged so far, across batches.
    pub fn acked_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LeaseCall::Ack(ids) => Some(ids),
                LeaseCall::ModAck(_, _) => None,
            })
            .flatten()
            .collect()
    }

    /// All ack ids whose deadline was modified to `deadline` so far.
    pub fn modacked_ids(&self, deadline: u32) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LeaseCall::ModAck(d, ids) if d == deadline => Some(ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PullTransport for MockTransport {
    async fn feed(&self) -> TransportResult<mpsc::Receiver<FeedEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.feed_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) -> TransportResult<()> {
        self.calls.lock().unwrap().push(LeaseCall::Ack(ack_ids));
        match self.ack_failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn modify_ack_deadline(
        &self,
        deadline_seconds: u32,
        ack_ids: Vec<String>,
    ) -> TransportResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(LeaseCall::ModAck(deadline_seconds, ack_ids));
        match self.modack_failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Let every spawned task and armed timer make progress under paused time.
pub async fn settle_tasks() {
    for _ in 0..4 {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    }
}
