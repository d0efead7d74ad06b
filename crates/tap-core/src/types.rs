//! Per-request bookkeeping shared between the proxy and metrics crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Label value used when a request body names no model
pub const UNKNOWN_MODEL: &str = "unknown";

/// Which backend a request was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Routing {
    Primary,
    Secondary,
}

impl Routing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Routing::Primary => "primary",
            Routing::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record for a single proxied request.
///
/// Owned by the task handling the request and never shared. The timestamps
/// are filled in as the request moves through admission, forwarding and
/// completion.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    /// Unique request identifier, also used in log lines
    pub id: String,
    /// Model named in the request body, or [`UNKNOWN_MODEL`]
    pub model: String,
    /// Path plus query as received
    pub path: String,
    /// HTTP method as received
    pub method: String,
    /// Wall clock arrival time, for logging
    pub received_at: DateTime<Utc>,
    /// Arrival at the admission controller
    pub enqueue_time: Instant,
    /// Admission into execution
    pub dequeue_time: Option<Instant>,
    /// Completion (success or failure)
    pub end_time: Option<Instant>,
}

impl InFlightRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, model: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: model
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
            path: path.into(),
            method: method.into(),
            received_at: Utc::now(),
            enqueue_time: Instant::now(),
            dequeue_time: None,
            end_time: None,
        }
    }

    /// Record admission into execution
    pub fn mark_dequeued(&mut self) {
        self.dequeue_time = Some(Instant::now());
    }

    /// Record completion. Only the first call has an effect.
    pub fn mark_finished(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
    }

    /// Time spent waiting for admission
    pub fn queue_wait(&self) -> Option<Duration> {
        self.dequeue_time.map(|d| d.duration_since(self.enqueue_time))
    }

    /// Time from arrival to completion, or to now if still running
    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .duration_since(self.enqueue_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_fallback() {
        let req = InFlightRequest::new("POST", "/api/generate", None);
        assert_eq!(req.model, UNKNOWN_MODEL);

        let req = InFlightRequest::new("POST", "/api/generate", Some(String::new()));
        assert_eq!(req.model, UNKNOWN_MODEL);

        let req = InFlightRequest::new("POST", "/api/generate", Some("llama3".into()));
        assert_eq!(req.model, "llama3");
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut req = InFlightRequest::new("GET", "/api/tags", None);
        assert!(req.queue_wait().is_none());

        req.mark_dequeued();
        assert!(req.queue_wait().is_some());

        req.mark_finished();
        let first = req.end_time;
        req.mark_finished();
        assert_eq!(req.end_time, first);
        assert!(req.elapsed() >= req.queue_wait().unwrap_or_default());
    }

    #[test]
    fn test_routing_labels() {
        assert_eq!(Routing::Primary.as_str(), "primary");
        assert_eq!(Routing::Secondary.to_string(), "secondary");
    }
}
