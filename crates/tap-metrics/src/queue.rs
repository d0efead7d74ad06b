//! Admission queue accounting
//!
//! `QueueState` counts requests that have arrived but not yet been admitted,
//! remembers the largest depth seen, and accumulates completions so the
//! sampler can derive a processing rate. When built with gauges, the depth
//! gauges are written while the state lock is held, so they always reflect
//! the latest state change.

use parking_lot::Mutex;
use prometheus::Gauge;
use serde::Serialize;
use std::time::Instant;

/// Depth after an arrival was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub current_size: usize,
    pub max_size_seen: usize,
}

/// Point-in-time view reported by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub current_size: usize,
    pub max_size_seen: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct Inner {
    current_size: usize,
    max_size_seen: usize,
    processed_count_window: u64,
    window_start: Instant,
    total_enqueued: u64,
    total_processed: u64,
    total_rejected: u64,
}

/// Gauges mirroring the current and peak depth
#[derive(Debug, Clone)]
pub struct QueueGauges {
    pub size: Gauge,
    pub peak: Gauge,
}

#[derive(Debug)]
pub struct QueueState {
    inner: Mutex<Inner>,
    gauges: Option<QueueGauges>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Queue state that publishes its depth to `gauges`
    pub fn with_gauges(gauges: QueueGauges) -> Self {
        Self::build(Some(gauges))
    }

    fn build(gauges: Option<QueueGauges>) -> Self {
        Self {
            gauges,
            inner: Mutex::new(Inner {
                current_size: 0,
                max_size_seen: 0,
                processed_count_window: 0,
                window_start: Instant::now(),
                total_enqueued: 0,
                total_processed: 0,
                total_rejected: 0,
            }),
        }
    }

    /// Record an arrival. With a `limit`, an arrival that would push the
    /// queue past it is counted as rejected and `None` is returned.
    pub fn enqueue(&self, limit: Option<usize>) -> Option<QueueDepth> {
        let mut inner = self.inner.lock();

        if let Some(limit) = limit {
            if inner.current_size >= limit {
                inner.total_rejected += 1;
                return None;
            }
        }

        inner.current_size += 1;
        inner.total_enqueued += 1;
        if inner.current_size > inner.max_size_seen {
            inner.max_size_seen = inner.current_size;
        }
        if let Some(gauges) = &self.gauges {
            gauges.size.set(inner.current_size as f64);
            gauges.peak.set(inner.max_size_seen as f64);
        }

        Some(QueueDepth {
            current_size: inner.current_size,
            max_size_seen: inner.max_size_seen,
        })
    }

    /// Record that a waiting request left the queue, whether admitted or
    /// abandoned. Returns the new depth.
    pub fn dequeue(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.current_size = inner.current_size.saturating_sub(1);
        if let Some(gauges) = &self.gauges {
            gauges.size.set(inner.current_size as f64);
        }
        inner.current_size
    }

    /// Record a finished request for the processing-rate window
    pub fn mark_processed(&self) {
        let mut inner = self.inner.lock();
        inner.processed_count_window += 1;
        inner.total_processed += 1;
    }

    /// Completions per second since the last call, resetting the window
    pub fn take_processing_rate(&self) -> f64 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.window_start).as_secs_f64();
        let rate = if elapsed > 0.0 {
            inner.processed_count_window as f64 / elapsed
        } else {
            0.0
        };

        inner.processed_count_window = 0;
        inner.window_start = now;
        rate
    }

    pub fn current_size(&self) -> usize {
        self.inner.lock().current_size
    }

    pub fn max_size_seen(&self) -> usize {
        self.inner.lock().max_size_seen
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock();
        QueueSnapshot {
            current_size: inner.current_size,
            max_size_seen: inner.max_size_seen,
            total_enqueued: inner.total_enqueued,
            total_processed: inner.total_processed,
            total_rejected: inner.total_rejected,
        }
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}
