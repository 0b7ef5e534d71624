use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

/// Default lower bound of the ack-deadline domain, in seconds.
pub(crate) const MIN_ACK_DEADLINE_SECS: u32 = 10;
/// Default upper bound of the ack-deadline domain, in seconds.
pub(crate) const MAX_ACK_DEADLINE_SECS: u32 = 600;
/// Floor applied to the ack deadline while exactly-once delivery is enabled.
pub(crate) const EXACTLY_ONCE_MIN_DEADLINE_SECS: u32 = 60;

/// Bounded histogram over whole seconds.
///
/// Observations outside the domain are clamped, not rejected. Percentile
/// queries walk the bucket array, which is fine for a domain this small.
#[derive(Debug)]
pub(crate) struct Histogram {
    min: u32,
    max: u32,
    buckets: Vec<u32>,
    total: u64,
}

impl Histogram {
    pub(crate) fn new(min: u32, max: u32) -> Self {
        let span = max.saturating_sub(min) as usize + 1;
        Histogram {
            min,
            max,
            buckets: vec![0; span],
            total: 0,
        }
    }

    /// Record one observation, clamped into the domain.
    pub(crate) fn add(&mut self, seconds: u32) {
        let value = seconds.clamp(self.min, self.max);
        self.buckets[(value - self.min) as usize] += 1;
        self.total += 1;
    }

    /// Smallest bucket value whose cumulative count reaches `percent`% of all
    /// observations. With no observations this answers the domain minimum.
    pub(crate) fn percentile(&self, percent: u32) -> u32 {
        if self.total == 0 {
            return self.min;
        }
        let percent = percent.min(100);
        let rank = ((self.total as f64) * (percent as f64 / 100.0)).ceil() as u64;
        let mut seen = 0u64;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += *count as u64;
            if seen >= rank {
                return self.min + idx as u32;
            }
        }
        self.max
    }

    pub(crate) fn len(&self) -> u64 {
        self.total
    }
}

/// Adaptive ack-deadline state shared between the subscriber and the lease
/// sweep.
///
/// Two trackers, one concern each: `ack_latencies` sizes the deadline itself
/// from how long the consumer takes to settle messages; `modack_latencies`
/// measures the enqueue-to-completion time of deadline-modification calls so
/// the sweep can fire comfortably before leases lapse.
#[derive(Debug)]
pub(crate) struct DeadlineTracker {
    ack_latencies: Mutex<Histogram>,
    modack_latencies: Mutex<Histogram>,
    deadline_secs: AtomicU32,
    min_deadline_secs: AtomicU32,
    max_deadline_secs: u32,
}

impl DeadlineTracker {
    pub(crate) fn new(min_deadline_secs: u32, max_deadline_secs: u32) -> Self {
        DeadlineTracker {
            ack_latencies: Mutex::new(Histogram::new(min_deadline_secs, max_deadline_secs)),
            modack_latencies: Mutex::new(Histogram::new(0, MAX_ACK_DEADLINE_SECS)),
            deadline_secs: AtomicU32::new(min_deadline_secs),
            min_deadline_secs: AtomicU32::new(min_deadline_secs),
            max_deadline_secs,
        }
    }

    /// Current effective ack deadline, in seconds.
    pub(crate) fn deadline_secs(&self) -> u32 {
        self.deadline_secs.load(Ordering::Acquire)
    }

    /// Record how long a message took from receipt to ack and recompute the
    /// effective deadline from the 99th percentile.
    pub(crate) async fn record_ack_latency(&self, seconds: u32) {
        let p99 = {
            let mut latencies = self.ack_latencies.lock().await;
            latencies.add(seconds);
            latencies.percentile(99)
        };
        self.store_deadline(p99);
    }

    /// Record the observed enqueue-to-completion time of one
    /// deadline-modification call.
    pub(crate) async fn record_modack_latency(&self, seconds: u32) {
        self.modack_latencies.lock().await.add(seconds);
    }

    /// Safety buffer subtracted from the next sweep interval: the p99 of
    /// observed modify-call latency plus a one second pad.
    pub(crate) async fn modack_latency_buffer_secs(&self) -> u32 {
        self.modack_latencies.lock().await.percentile(99) + 1
    }

    /// Raise or restore the deadline floor (exactly-once delivery uses a
    /// higher one) and re-clamp the effective deadline.
    pub(crate) async fn set_min_deadline(&self, seconds: u32) {
        self.min_deadline_secs.store(seconds, Ordering::Release);
        let p99 = self.ack_latencies.lock().await.percentile(99);
        self.store_deadline(p99);
    }

    fn store_deadline(&self, p99: u32) {
        let min = self.min_deadline_secs.load(Ordering::Acquire);
        let deadline = p99.clamp(min, self.max_deadline_secs.max(min));
        self.deadline_secs.store(deadline, Ordering::Release);
    }
}
