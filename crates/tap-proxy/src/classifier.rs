//! Maps request paths onto per-endpoint latency histograms

use tap_metrics::LatencyBucket;

/// Pick the latency histogram for a request path. The query string is
/// ignored and matching is by suffix so prefixed mounts still classify.
/// Paths with no dedicated histogram return `None` and are only recorded in
/// the generic request-duration histogram.
pub fn classify(path: &str) -> Option<LatencyBucket> {
    let path = endpoint_label(path);
    let path = path.trim_end_matches('/');

    if path.ends_with("/api/generate") || path.ends_with("/v1/completions") {
        Some(LatencyBucket::Generate)
    } else if path.ends_with("/api/chat") || path.ends_with("/v1/chat/completions") {
        Some(LatencyBucket::Chat)
    } else if path.ends_with("/api/tags") || path.ends_with("/v1/models") {
        Some(LatencyBucket::ListModels)
    } else if path.ends_with("/api/show") {
        Some(LatencyBucket::ShowModel)
    } else {
        None
    }
}

/// Value of the `endpoint` label: the path without its query string
pub fn endpoint_label(path_and_query: &str) -> &str {
    match path_and_query.split_once('?') {
        Some((path, _)) => path,
        None => path_and_query,
    }
}
