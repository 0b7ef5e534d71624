use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::batch_queue::{BatchQueue, BatchingOptions, QueueKind};
use crate::errors::{Result, SavaError};
use crate::histogram::{
    DeadlineTracker, EXACTLY_ONCE_MIN_DEADLINE_SECS, MAX_ACK_DEADLINE_SECS, MIN_ACK_DEADLINE_SECS,
};
use crate::lease_manager::{LeaseManager, LeaseOptions};
use crate::message::{AckResponse, Message, SettleKind};
use sava_core::message::{FeedEvent, RawDelivery, SubscriptionProperties};
use sava_core::transport::PullTransport;

/// Buffer size for the message channel between the feed task and the consumer.
const RECEIVE_CHANNEL_BUFFER: usize = 100;
/// Portion of the close timeout reserved for the final nack-and-flush phase.
const FINAL_NACK_RESERVE: Duration = Duration::from_secs(1);

/// What `close` does with messages still being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Wait (bounded by the close timeout) for in-flight messages to settle
    /// before nacking whatever remains.
    WaitForProcessing,
    /// Nack everything in the inventory right away.
    NackImmediately,
}

/// Configuration options for subscribers.
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Most messages leased at once.
    pub max_messages: usize,
    /// Most leased payload bytes held at once.
    pub max_bytes: usize,
    /// When the inventory is full, keep dispatching anyway instead of
    /// parking new messages on the pending queue.
    pub allow_excess_messages: bool,
    /// Lower bound for the adaptive ack deadline.
    pub min_ack_deadline: Duration,
    /// Upper bound for the adaptive ack deadline.
    pub max_ack_deadline: Duration,
    /// Longest a lease is extended before the message is released to
    /// redelivery.
    pub max_extension_time: Duration,
    /// Limits for the ack and deadline-modification batch queues.
    pub batching: BatchingOptions,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        SubscriberOptions {
            max_messages: 1_000,
            max_bytes: 100 * 1024 * 1024,
            allow_excess_messages: true,
            min_ack_deadline: Duration::from_secs(u64::from(MIN_ACK_DEADLINE_SECS)),
            max_ack_deadline: Duration::from_secs(u64::from(MAX_ACK_DEADLINE_SECS)),
            max_extension_time: Duration::from_secs(3_600),
            batching: BatchingOptions::default(),
        }
    }
}

/// Subscriber drives the flow-controlled consumption of one subscription:
/// it leases deliveries from the transport feed, keeps their deadlines
/// extended while the consumer works, batches settlement calls, and applies
/// backpressure when the inventory fills up.
#[derive(Debug)]
pub struct Subscriber {
    transport: Arc<dyn PullTransport>,
    options: SubscriberOptions,
    core: Option<Arc<SubscriberCore>>,
    token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    closed_tx: watch::Sender<bool>,
    closed: bool,
}

impl Subscriber {
    pub(crate) fn new(transport: Arc<dyn PullTransport>, options: SubscriberOptions) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Subscriber {
            transport,
            options,
            core: None,
            token: CancellationToken::new(),
            task_handles: Vec::new(),
            closed_tx,
            closed: false,
        }
    }

    /// Open the delivery feed and start dispatching messages.
    ///
    /// Returns the receiving half of the message channel; each [`Message`]
    /// must eventually be settled with `ack` or `nack`, or it is released to
    /// redelivery once its extension window lapses.
    pub async fn open(&mut self) -> Result<mpsc::Receiver<Message>> {
        if self.closed {
            return Err(SavaError::Closed);
        }
        if self.core.is_some() {
            return Err(SavaError::Unrecoverable(
                "subscriber is already open".to_string(),
            ));
        }

        let feed = self.transport.feed().await?;
        let (dispatch_tx, dispatch_rx) = mpsc::channel(RECEIVE_CHANNEL_BUFFER);
        let core = SubscriberCore::new(
            Arc::clone(&self.transport),
            self.options.clone(),
            dispatch_tx,
        );

        self.task_handles.push(tokio::spawn(run_feed(
            Arc::clone(&core),
            feed,
            self.token.child_token(),
        )));
        self.task_handles.push(tokio::spawn(run_flow_control(
            Arc::clone(&core),
            self.token.child_token(),
        )));

        self.core = Some(core);
        Ok(dispatch_rx)
    }

    /// Shut the subscriber down within `timeout` total wall-clock time.
    ///
    /// With [`CloseBehavior::WaitForProcessing`] the call first waits for
    /// in-flight messages to settle (keeping a reserve of the timeout for
    /// the final phase), then nacks and flushes whatever remains. A second
    /// call is a no-op.
    pub async fn close(&mut self, behavior: CloseBehavior, timeout: Duration) -> Result<()> {
        self.closed = true;
        let result = match &self.core {
            Some(core) => core.close(behavior, timeout).await,
            None => Ok(()),
        };
        self.token.cancel();
        for handle in self.task_handles.drain(..) {
            handle.abort();
        }
        self.closed_tx.send_replace(true);
        result
    }

    /// Observe the close notification; flips to `true` once `close` has run.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Current adaptive ack deadline.
    pub fn ack_deadline(&self) -> Duration {
        match &self.core {
            Some(core) => Duration::from_secs(core.deadlines.deadline_secs() as u64),
            None => self.options.min_ack_deadline,
        }
    }

    /// Number of currently leased messages.
    pub async fn inventory_size(&self) -> usize {
        match &self.core {
            Some(core) => core.lease.size().await,
            None => 0,
        }
    }

    /// Payload bytes currently counted against the flow-control limits.
    pub async fn inventory_bytes(&self) -> usize {
        match &self.core {
            Some(core) => core.lease.bytes().await,
            None => 0,
        }
    }
}

/// SubscriberBuilder is a builder for creating a new Subscriber instance.
#[derive(Debug, Default)]
pub struct SubscriberBuilder {
    transport: Option<Arc<dyn PullTransport>>,
    options: SubscriberOptions,
}

impl SubscriberBuilder {
    pub fn new() -> Self {
        SubscriberBuilder::default()
    }

    /// Sets the transport the subscriber pulls from. Required.
    pub fn with_transport(mut self, transport: Arc<dyn PullTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the default flow-control, deadline and batching options.
    pub fn with_options(mut self, options: SubscriberOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates the configuration and creates the `Subscriber`.
    pub fn build(self) -> Result<Subscriber> {
        let transport = self.transport.ok_or_else(|| {
            SavaError::Unrecoverable("transport is required to build a Subscriber".to_string())
        })?;
        if self.options.min_ack_deadline > self.options.max_ack_deadline {
            return Err(SavaError::Unrecoverable(
                "min_ack_deadline must not exceed max_ack_deadline".to_string(),
            ));
        }
        if self.options.max_messages == 0 || self.options.max_bytes == 0 {
            return Err(SavaError::Unrecoverable(
                "flow-control limits must be non-zero".to_string(),
            ));
        }
        Ok(Subscriber::new(transport, self.options))
    }
}

/// Shared engine state behind the public `Subscriber` handle. Messages hold
/// a weak reference back to it, so settling keeps working for as long as the
/// subscriber is alive without keeping it alive.
#[derive(Debug)]
pub(crate) struct SubscriberCore {
    transport: Arc<dyn PullTransport>,
    lease: LeaseManager,
    acks: BatchQueue,
    modacks: BatchQueue,
    deadlines: Arc<DeadlineTracker>,
    min_deadline_secs: u32,
    exactly_once: AtomicBool,
    closed: AtomicBool,
}

impl SubscriberCore {
    fn new(
        transport: Arc<dyn PullTransport>,
        options: SubscriberOptions,
        dispatch_tx: mpsc::Sender<Message>,
    ) -> Arc<Self> {
        let min_deadline_secs = options.min_ack_deadline.as_secs() as u32;
        let max_deadline_secs = options.max_ack_deadline.as_secs() as u32;
        let deadlines = Arc::new(DeadlineTracker::new(min_deadline_secs, max_deadline_secs));
        let lease = LeaseManager::new(
            LeaseOptions {
                max_messages: options.max_messages,
                max_bytes: options.max_bytes,
                allow_excess_messages: options.allow_excess_messages,
                max_extension_time: options.max_extension_time,
            },
            Arc::clone(&deadlines),
            dispatch_tx,
        );
        let acks = BatchQueue::new(
            QueueKind::Ack,
            Arc::clone(&transport),
            options.batching.clone(),
        );
        let modacks = BatchQueue::new(
            QueueKind::ModAck,
            Arc::clone(&transport),
            options.batching,
        );
        Arc::new(SubscriberCore {
            transport,
            lease,
            acks,
            modacks,
            deadlines,
            min_deadline_secs,
            exactly_once: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle one raw delivery from the feed.
    pub(crate) async fn on_delivery(self: &Arc<Self>, raw: RawDelivery) {
        if self.closed.load(Ordering::Acquire) {
            // never admitted; release the lease right away
            trace!(ack_id = %raw.ack_id, "delivery arrived after close, requesting redelivery");
            let transport = Arc::clone(&self.transport);
            let ack_id = raw.ack_id;
            tokio::spawn(async move {
                let _ = transport.modify_ack_deadline(0, vec![ack_id]).await;
            });
            return;
        }

        let message = Message::new(raw, Arc::downgrade(self));
        let deadline = self.deadlines.deadline_secs();
        if self.exactly_once.load(Ordering::Acquire) {
            // the lease only counts once the backend confirms it
            match self.extend_deadline(&message, deadline).await {
                Ok(()) => self.lease.add(message).await,
                Err(error) => {
                    debug!(
                        error = %error,
                        message_id = message.id(),
                        "discarding delivery whose receipt confirmation failed"
                    );
                }
            }
        } else {
            let _ = self.extend_deadline(&message, deadline).await;
            self.lease.add(message).await;
        }
    }

    /// Apply a subscription-properties update from the feed.
    pub(crate) async fn update_properties(&self, properties: SubscriptionProperties) {
        let previous = self
            .exactly_once
            .swap(properties.exactly_once_delivery, Ordering::AcqRel);
        if previous != properties.exactly_once_delivery {
            let min = if properties.exactly_once_delivery {
                self.min_deadline_secs.max(EXACTLY_ONCE_MIN_DEADLINE_SECS)
            } else {
                self.min_deadline_secs
            };
            self.deadlines.set_min_deadline(min).await;
            debug!(
                exactly_once_delivery = properties.exactly_once_delivery,
                "subscription properties updated"
            );
        }
    }

    /// Settle one message: record its latency, queue the batched request,
    /// and release the lease once the batch carrying it completes.
    pub(crate) async fn settle(
        self: &Arc<Self>,
        message: Message,
        kind: SettleKind,
        await_response: bool,
    ) -> Result<AckResponse> {
        if kind == SettleKind::Ack {
            let elapsed = message.received_at().elapsed();
            self.deadlines
                .record_ack_latency(elapsed.as_secs_f64().ceil() as u32)
                .await;
        }
        let queue = match kind {
            SettleKind::Ack => &self.acks,
            SettleKind::Nack => &self.modacks,
        };
        // a nack is a deadline modification to zero
        let completion = queue.add(message.ack_id().to_string(), 0).await?;

        if await_response {
            let outcome = completion.await;
            self.finish_settle(&message, outcome).await
        } else {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = completion.await;
                let _ = core.finish_settle(&message, outcome).await;
            });
            Ok(AckResponse::Success)
        }
    }

    async fn finish_settle(
        &self,
        message: &Message,
        outcome: std::result::Result<
            sava_core::transport::TransportResult<()>,
            tokio::sync::oneshot::error::RecvError,
        >,
    ) -> Result<AckResponse> {
        self.lease.remove(message).await;
        match outcome {
            Ok(Ok(())) => Ok(AckResponse::Success),
            Ok(Err(error)) => {
                if self.exactly_once.load(Ordering::Acquire) {
                    if error.is_permanent() {
                        let err = SavaError::AckFailed(error);
                        message.fail_terminally(err.clone()).await;
                        Err(err)
                    } else {
                        Err(SavaError::Transport(error))
                    }
                } else {
                    // a lost settle call just means the backend redelivers
                    debug!(
                        error = %error,
                        ack_id = message.ack_id(),
                        "settle request failed, leaving redelivery to the backend"
                    );
                    Ok(AckResponse::Success)
                }
            }
            Err(_) => Err(SavaError::Closed),
        }
    }

    /// Queue a deadline modification for one message. Under exactly-once
    /// delivery the batched response is awaited and a permanent rejection
    /// finishes the lease: the message is settled with the error and evicted.
    pub(crate) async fn extend_deadline(
        self: &Arc<Self>,
        message: &Message,
        seconds: u32,
    ) -> Result<()> {
        let started = Instant::now();
        let completion = self
            .modacks
            .add(message.ack_id().to_string(), seconds)
            .await?;

        if self.exactly_once.load(Ordering::Acquire) {
            let outcome = completion.await;
            self.deadlines
                .record_modack_latency(started.elapsed().as_secs() as u32)
                .await;
            match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => {
                    if error.is_permanent() {
                        let err = SavaError::AckFailed(error);
                        message.fail_terminally(err.clone()).await;
                        self.lease.remove(message).await;
                        Err(err)
                    } else {
                        Err(SavaError::Transport(error))
                    }
                }
                Err(_) => Err(SavaError::Closed),
            }
        } else {
            let core = Arc::clone(self);
            let message = message.clone();
            tokio::spawn(async move {
                let outcome = completion.await;
                core.deadlines
                    .record_modack_latency(started.elapsed().as_secs() as u32)
                    .await;
                if let Ok(Err(error)) = outcome {
                    debug!(
                        error = %error,
                        ack_id = message.ack_id(),
                        "deadline extension failed"
                    );
                }
            });
            Ok(())
        }
    }

    async fn close(self: &Arc<Self>, behavior: CloseBehavior, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        debug!(?behavior, timeout_ms = timeout.as_millis() as u64, "closing subscriber");

        if timeout.is_zero() {
            // no time budget at all: release every lease and move on
            let drained = self.lease.clear().await;
            join_all(drained.iter().map(|message| message.nack())).await;
            self.acks.flush("close").await;
            self.modacks.flush("close").await;
        } else {
            if behavior == CloseBehavior::WaitForProcessing {
                let wait_budget = timeout.saturating_sub(FINAL_NACK_RESERVE.min(timeout));
                if !wait_budget.is_zero() && !self.lease.is_empty().await {
                    let mut size = self.lease.watch_size();
                    let _ = tokio::time::timeout(wait_budget, async {
                        while *size.borrow_and_update() != 0 {
                            if size.changed().await.is_err() {
                                break;
                            }
                        }
                    })
                    .await;
                }
            }

            let drained = self.lease.clear().await;
            if !drained.is_empty() {
                debug!(count = drained.len(), "nacking unsettled messages");
                join_all(drained.iter().map(|message| message.nack())).await;
            }
            self.acks.flush("close").await;
            self.modacks.flush("close").await;

            let remaining = timeout.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                let _ = tokio::time::timeout(remaining, async {
                    join_all(vec![self.acks.on_flush(), self.modacks.on_flush()]).await;
                    join_all(vec![self.acks.on_drain(), self.modacks.on_drain()]).await;
                })
                .await;
            }
        }

        self.acks.close().await;
        self.modacks.close().await;
        self.transport.destroy().await;
        Ok(())
    }
}

/// Consume the transport feed until cancelled or the feed ends.
async fn run_feed(
    core: Arc<SubscriberCore>,
    mut feed: mpsc::Receiver<FeedEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = feed.recv() => match event {
                Some(FeedEvent::Delivery(raw)) => core.on_delivery(raw).await,
                Some(FeedEvent::Properties(properties)) => {
                    core.update_properties(properties).await;
                }
                None => {
                    if !core.closed.load(Ordering::Acquire) {
                        error!("delivery feed ended unexpectedly");
                    }
                    break;
                }
            }
        }
    }
}

/// Mirror inventory capacity onto the transport: pause the feed while full,
/// resume once a lease frees up.
async fn run_flow_control(core: Arc<SubscriberCore>, token: CancellationToken) {
    let mut full = core.lease.watch_full();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = full.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_full = *full.borrow_and_update();
                if is_full {
                    trace!("inventory full, pausing delivery feed");
                    core.transport.pause().await;
                } else {
                    trace!("inventory freed capacity, resuming delivery feed");
                    core.transport.resume().await;
                }
            }
        }
    }
}
