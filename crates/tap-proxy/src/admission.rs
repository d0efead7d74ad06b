//! Admission control
//!
//! At most N requests execute against the backend at once. Arrivals beyond
//! that wait in an unbounded FIFO queue (optionally capped by
//! `max_queue_size`). Every counter and gauge touched on the way in is
//! restored by a drop guard, so cancellation and error paths stay balanced.

use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tap_core::InFlightRequest;
use tap_metrics::MetricsRegistry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    registry: MetricsRegistry,
    max_concurrency: usize,
    max_queue_size: Option<usize>,
}

impl AdmissionController {
    pub fn new(registry: MetricsRegistry, max_concurrency: usize, max_queue_size: Option<usize>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            registry,
            max_concurrency,
            max_queue_size,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Requests currently holding a slot
    pub fn in_execution(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    /// Wait for an execution slot.
    ///
    /// The arrival is counted in the queue before waiting. Once the slot is
    /// granted the queue is decremented, the wait is observed and the
    /// active-requests gauge is incremented. If the returned future is
    /// dropped while waiting, the queue entry is removed again.
    pub async fn admit(&self, request: &mut InFlightRequest) -> Result<AdmissionPermit> {
        let model = request.model.clone();

        let depth = self.registry.enqueue(self.max_queue_size).ok_or_else(|| {
            ProxyError::QueueFull {
                limit: self.max_queue_size.unwrap_or_default(),
            }
        })?;
        debug!(
            request_id = %request.id,
            model = %model,
            queue_size = depth.current_size,
            "Request queued"
        );

        let queued = QueuedGuard {
            registry: &self.registry,
        };

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Proxy("Admission controller closed".to_string()))?;

        drop(queued);
        request.mark_dequeued();
        let wait = request.queue_wait().unwrap_or_default();

        self.registry.record_queue_wait(&model, wait);
        self.registry.inc_active(&model);
        debug!(request_id = %request.id, model = %model, ?wait, "Request admitted");

        Ok(AdmissionPermit {
            _permit: permit,
            registry: self.registry.clone(),
            model,
            queue_wait: wait,
        })
    }
}

/// Removes a waiting request from the queue, whether it was admitted or
/// abandoned.
struct QueuedGuard<'a> {
    registry: &'a MetricsRegistry,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.registry.dequeue();
    }
}

/// An execution slot. Dropping it frees the slot, decrements the
/// active-requests gauge and counts the request as processed.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    registry: MetricsRegistry,
    model: String,
    queue_wait: Duration,
}

impl AdmissionPermit {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.registry.dec_active(&self.model);
        self.registry.mark_processed();
    }
}
