use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::errors::{Result, SavaError};
use sava_core::transport::{PullTransport, TransportResult};

/// Limits for one batched request queue.
#[derive(Debug, Clone)]
pub struct BatchingOptions {
    /// Queued requests that trigger an immediate flush.
    pub max_batch_size: usize,
    /// Longest a queued request waits before a flush fires anyway.
    pub max_batch_delay: Duration,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        BatchingOptions {
            max_batch_size: 3_000,
            max_batch_delay: Duration::from_millis(100),
        }
    }
}

/// Which lease RPC this queue batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Ack,
    ModAck,
}

impl QueueKind {
    fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Ack => "ack",
            QueueKind::ModAck => "modack",
        }
    }
}

/// Snapshot of queue progress, published over a watch channel so callers can
/// await flush and drain milestones without polling.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QueueStats {
    /// Requests ever added.
    pub(crate) submitted: u64,
    /// Requests resolved, successfully or not.
    pub(crate) completed: u64,
    /// Requests queued but not yet sent.
    pub(crate) pending: usize,
    /// Requests sent, awaiting transport completion.
    pub(crate) in_flight: usize,
}

#[derive(Debug)]
struct PendingEntry {
    ack_id: String,
    done: oneshot::Sender<TransportResult<()>>,
}

#[derive(Debug)]
struct QueueState {
    // requests grouped by target deadline; acks all live under key 0
    groups: HashMap<u32, Vec<PendingEntry>>,
    num_pending: usize,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

#[derive(Debug)]
struct QueueShared {
    kind: QueueKind,
    transport: Arc<dyn PullTransport>,
    options: BatchingOptions,
    state: Mutex<QueueState>,
    stats: watch::Sender<QueueStats>,
}

/// Accumulates per-message lease requests and flushes them to the transport
/// as one batched call per group, either when the queued count crosses the
/// configured threshold or after a bounded delay.
#[derive(Debug, Clone)]
pub(crate) struct BatchQueue {
    shared: Arc<QueueShared>,
}

impl BatchQueue {
    pub(crate) fn new(
        kind: QueueKind,
        transport: Arc<dyn PullTransport>,
        options: BatchingOptions,
    ) -> Self {
        let (stats, _) = watch::channel(QueueStats::default());
        BatchQueue {
            shared: Arc::new(QueueShared {
                kind,
                transport,
                options,
                state: Mutex::new(QueueState {
                    groups: HashMap::new(),
                    num_pending: 0,
                    timer: None,
                    closed: false,
                }),
                stats,
            }),
        }
    }

    /// Queue one request under `deadline` (acks ignore it) and return the
    /// completion channel for the batched call that will carry it.
    pub(crate) async fn add(
        &self,
        ack_id: String,
        deadline: u32,
    ) -> Result<oneshot::Receiver<TransportResult<()>>> {
        let (rx, flush_now) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(SavaError::Closed);
            }
            let (done, rx) = oneshot::channel();
            let key = match self.shared.kind {
                QueueKind::Ack => 0,
                QueueKind::ModAck => deadline,
            };
            state.groups.entry(key).or_default().push(PendingEntry { ack_id, done });
            state.num_pending += 1;
            self.shared.stats.send_modify(|stats| {
                stats.submitted += 1;
                stats.pending += 1;
            });

            let flush_now = state.num_pending >= self.shared.options.max_batch_size;
            if !flush_now && state.timer.is_none() {
                state.timer = Some(self.schedule_flush());
            }
            (rx, flush_now)
        };
        if flush_now {
            self.flush("size threshold").await;
        }
        Ok(rx)
    }

    fn schedule_flush(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let delay = self.shared.options.max_batch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = queue.shared.state.lock().await;
                state.timer = None;
            }
            queue.flush("max delay").await;
        })
    }

    /// Move every pending group into flight and issue one batched call each.
    pub(crate) async fn flush(&self, reason: &str) {
        let groups = {
            let mut state = self.shared.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.groups.is_empty() {
                return;
            }
            let moved = state.num_pending;
            state.num_pending = 0;
            self.shared.stats.send_modify(|stats| {
                stats.pending -= moved;
                stats.in_flight += moved;
            });
            std::mem::take(&mut state.groups)
        };
        trace!(kind = self.shared.kind.as_str(), reason, "flushing batch queue");
        for (deadline, entries) in groups {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.send_batch(deadline, entries).await;
            });
        }
    }

    async fn send_batch(&self, deadline: u32, entries: Vec<PendingEntry>) {
        let ack_ids: Vec<String> = entries.iter().map(|e| e.ack_id.clone()).collect();
        let count = entries.len();
        let result = match self.shared.kind {
            QueueKind::Ack => self.shared.transport.acknowledge(ack_ids).await,
            QueueKind::ModAck => {
                self.shared
                    .transport
                    .modify_ack_deadline(deadline, ack_ids)
                    .await
            }
        };
        if let Err(error) = &result {
            warn!(
                kind = self.shared.kind.as_str(),
                count,
                error = %error,
                "batched request failed"
            );
        }
        for entry in entries {
            let _ = entry.done.send(result.clone());
        }
        self.shared.stats.send_modify(|stats| {
            stats.in_flight -= count;
            stats.completed += count as u64;
        });
    }

    /// Resolves once every request pending or in flight at call time has
    /// completed. Requests added afterwards do not hold this back.
    pub(crate) async fn on_flush(&self) {
        let target = self.shared.stats.borrow().submitted;
        let mut stats = self.shared.stats.subscribe();
        while stats.borrow_and_update().completed < target {
            if stats.changed().await.is_err() {
                break;
            }
        }
    }

    /// Resolves once nothing is pending or in flight.
    pub(crate) async fn on_drain(&self) {
        let mut stats = self.shared.stats.subscribe();
        loop {
            {
                let snapshot = stats.borrow_and_update();
                if snapshot.pending == 0 && snapshot.in_flight == 0 {
                    return;
                }
            }
            if stats.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting new requests and cancel any armed flush timer.
    /// Requests already in flight run to completion.
    pub(crate) async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn stats(&self) -> QueueStats {
        *self.shared.stats.borrow()
    }
}
