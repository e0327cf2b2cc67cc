//! Delivery and link counters for one session.
//!
//! Counters are plain atomics behind an `Arc` shared by the session actor and the connection
//! supervisor; [`Metrics::snapshot`] gives a consistent-enough copy for status output.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    sent: AtomicU64,
    retries: AtomicU64,
    acked: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    ack_latency_sum_ms: AtomicU64,
    ack_latency_count: AtomicU64,
    reconnects: AtomicU64,
    frames_in: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// First transmission of a message.
    pub fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_acked(&self, latency: Duration) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.ack_latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.ack_latency_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_frames_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }
    /// Inbound frame that failed to decode.
    pub fn inc_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.ack_latency_count.load(Ordering::Relaxed);
        let sum = self.ack_latency_sum_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub retries: u64,
    pub acked: u64,
    pub expired: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub reconnects: u64,
    pub frames_in: u64,
    pub frames_dropped: u64,
}
