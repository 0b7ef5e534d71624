use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::{rng, Rng};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::histogram::DeadlineTracker;
use crate::message::Message;

/// Flow-control limits for the leased-message inventory.
#[derive(Debug, Clone)]
pub(crate) struct LeaseOptions {
    pub(crate) max_messages: usize,
    pub(crate) max_bytes: usize,
    pub(crate) allow_excess_messages: bool,
    pub(crate) max_extension_time: Duration,
}

#[derive(Debug)]
struct LeaseState {
    // currently leased messages, keyed by ack id
    active: HashMap<String, Message>,
    bytes: usize,
    // held back from dispatch while the inventory is full
    pending: VecDeque<Message>,
    sweep: Option<CancellationToken>,
}

impl LeaseState {
    fn is_full(&self, options: &LeaseOptions) -> bool {
        self.active.len() >= options.max_messages || self.bytes >= options.max_bytes
    }
}

#[derive(Debug)]
struct LeaseShared {
    options: LeaseOptions,
    deadlines: Arc<DeadlineTracker>,
    dispatch_tx: mpsc::Sender<Message>,
    state: Mutex<LeaseState>,
    full: watch::Sender<bool>,
    size: watch::Sender<usize>,
}

/// Owns the bounded inventory of currently leased messages.
///
/// Enforces the message-count and byte caps, holds excess messages back from
/// dispatch when configured to, and runs the periodic deadline-extension
/// sweep while any message is leased. Capacity transitions are published over
/// watch channels: `full` flips on the full/free boundary, `size` reaches
/// zero when the inventory empties.
#[derive(Debug, Clone)]
pub(crate) struct LeaseManager {
    shared: Arc<LeaseShared>,
}

impl LeaseManager {
    pub(crate) fn new(
        options: LeaseOptions,
        deadlines: Arc<DeadlineTracker>,
        dispatch_tx: mpsc::Sender<Message>,
    ) -> Self {
        let (full, _) = watch::channel(false);
        let (size, _) = watch::channel(0);
        LeaseManager {
            shared: Arc::new(LeaseShared {
                options,
                deadlines,
                dispatch_tx,
                state: Mutex::new(LeaseState {
                    active: HashMap::new(),
                    bytes: 0,
                    pending: VecDeque::new(),
                    sweep: None,
                }),
                full,
                size,
            }),
        }
    }

    /// Lease a message. It always enters the inventory; whether it is
    /// dispatched now or parked on the pending queue depends on capacity and
    /// the excess-message policy. Starts the extension sweep on the first
    /// lease.
    pub(crate) async fn add(&self, message: Message) {
        let (dispatch, was_full, now_full, size) = {
            let mut state = self.shared.state.lock().await;
            let was_full = state.is_full(&self.shared.options);
            if let Some(prev) = state.active.insert(message.ack_id().to_string(), message.clone())
            {
                state.bytes = state.bytes.saturating_sub(prev.byte_size());
            }
            state.bytes += message.byte_size();
            let dispatch = self.shared.options.allow_excess_messages || !was_full;
            if !dispatch {
                state.pending.push_back(message.clone());
            }
            if state.sweep.is_none() {
                let token = CancellationToken::new();
                state.sweep = Some(token.clone());
                self.spawn_sweep(token);
            }
            let now_full = state.is_full(&self.shared.options);
            (dispatch, was_full, now_full, state.active.len())
        };
        self.shared.size.send_replace(size);
        if now_full != was_full {
            self.shared.full.send_replace(now_full);
        }
        if dispatch {
            self.dispatch(message).await;
        }
    }

    /// Release a lease. Crossing the full boundary signals capacity back to
    /// the feed instead of promoting a pending message; otherwise the oldest
    /// pending message (if any) is dispatched in its place.
    pub(crate) async fn remove(&self, message: &Message) {
        let (promoted, was_full, now_full, size) = {
            let mut state = self.shared.state.lock().await;
            let was_full = state.is_full(&self.shared.options);
            let Some(prev) = state.active.remove(message.ack_id()) else {
                return;
            };
            state.bytes = state.bytes.saturating_sub(prev.byte_size());
            let now_full = state.is_full(&self.shared.options);
            let pending_pos = state
                .pending
                .iter()
                .position(|m| m.ack_id() == message.ack_id());
            // crossing the full boundary releases backpressure instead of
            // promoting; otherwise a parked message takes the freed slot
            let promoted = if was_full && !now_full {
                if let Some(pos) = pending_pos {
                    state.pending.remove(pos);
                }
                None
            } else if let Some(pos) = pending_pos {
                state.pending.remove(pos);
                None
            } else {
                state.pending.pop_front()
            };
            if state.active.is_empty() {
                if let Some(token) = state.sweep.take() {
                    token.cancel();
                }
            }
            (promoted, was_full, now_full, state.active.len())
        };
        self.shared.size.send_replace(size);
        if now_full != was_full {
            self.shared.full.send_replace(now_full);
        }
        if let Some(next) = promoted {
            self.dispatch(next).await;
        }
    }

    /// Drop every lease and stop the sweep. Returns the messages that were
    /// in the inventory so the caller can settle them (dispatched or not,
    /// they have an outstanding lease the backend is still honoring).
    pub(crate) async fn clear(&self) -> Vec<Message> {
        let (drained, was_full) = {
            let mut state = self.shared.state.lock().await;
            let was_full = state.is_full(&self.shared.options);
            let drained: Vec<Message> = state.active.drain().map(|(_, m)| m).collect();
            state.pending.clear();
            state.bytes = 0;
            if let Some(token) = state.sweep.take() {
                token.cancel();
            }
            (drained, was_full)
        };
        self.shared.size.send_replace(0);
        if was_full {
            self.shared.full.send_replace(false);
        }
        drained
    }

    pub(crate) async fn is_full(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.is_full(&self.shared.options)
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.active.is_empty()
    }

    pub(crate) async fn size(&self) -> usize {
        self.shared.state.lock().await.active.len()
    }

    pub(crate) async fn bytes(&self) -> usize {
        self.shared.state.lock().await.bytes
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Full/free transitions, for feed backpressure.
    pub(crate) fn watch_full(&self) -> watch::Receiver<bool> {
        self.shared.full.subscribe()
    }

    /// Inventory size; zero means empty.
    pub(crate) fn watch_size(&self) -> watch::Receiver<usize> {
        self.shared.size.subscribe()
    }

    async fn dispatch(&self, message: Message) {
        message.mark_dispatched().await;
        trace!(ack_id = message.ack_id(), "dispatching message to consumer");
        if self.shared.dispatch_tx.send(message).await.is_err() {
            warn!("consumer receiver dropped, message stays leased until expiry");
        }
    }

    fn spawn_sweep(&self, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = manager.sweep_delay().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                manager.extend_deadlines().await;
            }
        });
    }

    /// Jittered pause before the next extension pass: spread out within 90%
    /// of the current deadline, pulled in by the observed modify-call
    /// latency so extensions land before leases lapse.
    async fn sweep_delay(&self) -> Duration {
        let deadline = self.shared.deadlines.deadline_secs() as f64;
        let buffer = self.shared.deadlines.modack_latency_buffer_secs().await as f64;
        let jittered = 0.9 * deadline * rng().random::<f64>();
        Duration::from_secs_f64((jittered - buffer).max(0.0))
    }

    /// One pass over the current inventory snapshot: extend every lease that
    /// is still within its extension window, release the rest. Messages
    /// added mid-pass are picked up on the next one.
    async fn extend_deadlines(&self) {
        let deadline = self.shared.deadlines.deadline_secs();
        let snapshot: Vec<Message> = {
            let state = self.shared.state.lock().await;
            state.active.values().cloned().collect()
        };
        trace!(count = snapshot.len(), deadline, "extending message deadlines");
        for message in snapshot {
            if message.age() < self.shared.options.max_extension_time {
                tokio::spawn(async move {
                    let _ = message.modify_ack_deadline(deadline).await;
                });
            } else {
                warn!(
                    ack_id = message.ack_id(),
                    age_secs = message.age().as_secs(),
                    "message exceeded the maximum lease extension time, releasing"
                );
                self.remove(&message).await;
            }
        }
    }
}
