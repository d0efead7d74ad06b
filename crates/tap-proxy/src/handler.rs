//! Per-request forwarding
//!
//! Request flow: read the inbound body, wait for admission, forward upstream,
//! then either buffer the response (single-shot) or relay it chunk by chunk
//! (streamed). Metrics are extracted from the response without changing the
//! bytes the client receives.

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::classifier::{classify, endpoint_label};
use crate::observer::{ResponseObserver, StreamObserver, StreamSummary};
use crate::proxy::{build_outbound, response_headers, Backend, OutboundBody, UpstreamClient};
use crate::{ProxyError, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tap_core::{Config, InFlightRequest};
use tap_metrics::MetricsRegistry;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Chunks buffered between the upstream reader and the client connection
const CLIENT_BUFFER: usize = 32;

/// Chunks buffered for metric extraction. When full, chunks are skipped for
/// extraction only; forwarding never waits on the observer.
const OBSERVER_BUFFER: usize = 256;

/// Shared state for the proxy listener
#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<ProxyStateInner>,
}

struct ProxyStateInner {
    config: Config,
    client: UpstreamClient,
    admission: AdmissionController,
    observer: ResponseObserver,
    registry: MetricsRegistry,
    primary: Backend,
    secondary: Option<Backend>,
}

impl ProxyState {
    pub fn new(config: Config, registry: MetricsRegistry) -> Self {
        let client = UpstreamClient::new(config.proxy.request_timeout());
        let admission = AdmissionController::new(
            registry.clone(),
            config.proxy.max_concurrency,
            config.proxy.max_queue_size,
        );
        let primary = Backend::primary(&config);
        let secondary = Backend::secondary(&config);

        Self {
            inner: Arc::new(ProxyStateInner {
                client,
                admission,
                observer: ResponseObserver::new(registry.clone()),
                registry,
                primary,
                secondary,
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.inner.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn primary(&self) -> &Backend {
        &self.inner.primary
    }

    pub fn secondary(&self) -> Option<&Backend> {
        self.inner.secondary.as_ref()
    }

    /// Pick the backend named by the control header, defaulting to the
    /// primary
    pub fn select_backend(&self, headers: &HeaderMap) -> &Backend {
        let requested = headers
            .get(self.inner.config.proxy.backend_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim);

        match (requested, &self.inner.secondary) {
            (Some(name), Some(secondary)) if name.eq_ignore_ascii_case(&secondary.name) => secondary,
            _ => &self.inner.primary,
        }
    }

    /// Forward one request and produce the client response
    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let body = match read_body(body, self.inner.config.proxy.max_request_size).await {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path_and_query, "Rejecting request: {}", e);
                return e.into_response();
            }
        };
        let inbound = InboundBody::parse(&parts.headers, body);

        let mut request = InFlightRequest::new(parts.method.as_str(), path_and_query, inbound.model());
        let backend = self.select_backend(&parts.headers).clone();
        debug!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            model = %request.model,
            backend = %backend.routing,
            "Request received"
        );

        let permit = match self.inner.admission.admit(&mut request).await {
            Ok(permit) => permit,
            Err(e) => return self.fail(&mut request, e),
        };

        let deadline = self.inner.client.deadline();
        let stream_requested = inbound.stream_requested();
        let outbound = match build_outbound(
            &backend,
            parts.method.clone(),
            &request.path,
            &parts.headers,
            inbound.into_outbound(),
            &self.inner.config.proxy.backend_header,
        ) {
            Ok(outbound) => outbound,
            Err(e) => return self.fail(&mut request, e),
        };

        let upstream = match self.inner.client.send(outbound, deadline).await {
            Ok(response) => response,
            Err(e) => return self.fail(&mut request, e),
        };

        let status = upstream.status();
        self.inner.registry.record_backend_request(backend.routing, status.as_u16());

        if stream_requested || is_streaming_content_type(upstream.headers()) {
            self.relay_stream(request, permit, upstream, deadline)
        } else {
            self.respond_buffered(request, permit, upstream, deadline).await
        }
    }

    async fn respond_buffered(
        &self,
        mut request: InFlightRequest,
        permit: AdmissionPermit,
        upstream: axum::http::Response<hyper::body::Incoming>,
        deadline: Instant,
    ) -> Response {
        let (parts, body) = upstream.into_parts();

        let bytes = match timeout_at(deadline, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                return self.fail(&mut request, ProxyError::UpstreamUnreachable(e.to_string()));
            }
            Err(_) => {
                return self.fail(&mut request, ProxyError::UpstreamTimeout(self.inner.client.timeout()));
            }
        };

        self.inner.observer.observe_body(&request.model, &bytes);
        request.mark_finished();
        self.record_completion(&request, parts.status, false);
        drop(permit);

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = parts.status;
        *response.headers_mut() = response_headers(&parts.headers);
        response
    }

    /// Start relaying a streamed body and return the client response at once.
    ///
    /// The relay task writes each upstream chunk to the client first and then
    /// offers a copy to the observer task without waiting. When upstream
    /// ends, fails or times out (or the client goes away), the observer is
    /// drained, completion is recorded and the slot released before the
    /// client stream is closed.
    fn relay_stream(
        &self,
        mut request: InFlightRequest,
        permit: AdmissionPermit,
        upstream: axum::http::Response<hyper::body::Incoming>,
        deadline: Instant,
    ) -> Response {
        let (parts, mut body) = upstream.into_parts();
        let status = parts.status;

        let (client_tx, client_rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(CLIENT_BUFFER);
        let (observer_tx, mut observer_rx) = mpsc::channel::<ObservedChunk>(OBSERVER_BUFFER);

        let mut stream_observer = StreamObserver::new(
            self.inner.observer.clone(),
            request.model.clone(),
            request.enqueue_time,
        );
        let observer_task = tokio::spawn(async move {
            while let Some(chunk) = observer_rx.recv().await {
                if let Some(ended_on_newline) = chunk.gap_before {
                    stream_observer.mark_gap(ended_on_newline);
                }
                stream_observer.push(&chunk.bytes, chunk.arrival);
            }
            stream_observer.finish()
        });

        let state = self.clone();
        tokio::spawn(async move {
            let mut gap: Option<bool> = None;
            let mut forwarded = 0usize;

            loop {
                let frame = match timeout_at(deadline, body.frame()).await {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        state.record_stream_failure(&request, ProxyError::UpstreamUnreachable(e.to_string()));
                        break;
                    }
                    Err(_) => {
                        state.record_stream_failure(
                            &request,
                            ProxyError::UpstreamTimeout(state.inner.client.timeout()),
                        );
                        break;
                    }
                };

                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }

                let arrival = std::time::Instant::now();
                forwarded += data.len();
                if client_tx.send(Ok(data.clone())).await.is_err() {
                    debug!(request_id = %request.id, "Client disconnected mid-stream");
                    break;
                }

                match observer_tx.try_send(ObservedChunk {
                    bytes: data,
                    arrival,
                    gap_before: gap,
                }) {
                    Ok(()) => gap = None,
                    Err(TrySendError::Full(chunk)) => gap = Some(chunk.bytes.ends_with(b"\n")),
                    Err(TrySendError::Closed(_)) => {}
                }
            }

            drop(observer_tx);
            let summary: StreamSummary = observer_task.await.unwrap_or_default();
            debug!(
                request_id = %request.id,
                bytes = forwarded,
                ttft = ?summary.time_to_first_token,
                parse_failures = summary.parse_failures,
                "Stream finished"
            );

            request.mark_finished();
            state.record_completion(&request, status, true);
            drop(permit);
            drop(client_tx);
        });

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(client_rx)));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers(&parts.headers);
        response
    }

    fn record_completion(&self, request: &InFlightRequest, status: StatusCode, streaming: bool) {
        let duration = request.elapsed();
        let registry = &self.inner.registry;

        registry.record_request(
            &request.method,
            endpoint_label(&request.path),
            &request.model,
            status.as_u16(),
            duration,
        );
        if let Some(bucket) = classify(&request.path) {
            registry.record_endpoint_latency(bucket, &request.model, streaming, duration);
        }

        info!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            model = %request.model,
            status = status.as_u16(),
            streaming,
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );
    }

    fn record_stream_failure(&self, request: &InFlightRequest, error: ProxyError) {
        warn!(request_id = %request.id, model = %request.model, "Stream aborted: {}", error);
        self.inner.registry.record_error(&request.model, error.error_type());
    }

    /// Record a failure that happens before any response bytes are sent and
    /// turn it into the client-visible error
    fn fail(&self, request: &mut InFlightRequest, error: ProxyError) -> Response {
        request.mark_finished();
        self.inner.registry.record_error(&request.model, error.error_type());
        warn!(
            request_id = %request.id,
            model = %request.model,
            path = %request.path,
            error_type = error.error_type(),
            "Request failed: {}",
            error
        );
        error.into_response()
    }
}

/// Fallback handler forwarding every request upstream
pub async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    state.handle(request).await
}

/// A chunk handed to the observer task
struct ObservedChunk {
    bytes: Bytes,
    arrival: std::time::Instant,
    /// Set when earlier chunks were dropped because the observer fell
    /// behind; records whether the last dropped chunk ended with a newline
    gap_before: Option<bool>,
}

/// Inbound body with its best-effort JSON interpretation
struct InboundBody {
    raw: Bytes,
    json: Option<Value>,
    is_json_content: bool,
}

impl InboundBody {
    fn parse(headers: &HeaderMap, raw: Bytes) -> Self {
        let is_json_content = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        let json = if raw.is_empty() {
            None
        } else {
            serde_json::from_slice(&raw).ok()
        };

        Self {
            raw,
            json,
            is_json_content,
        }
    }

    fn model(&self) -> Option<String> {
        self.json
            .as_ref()?
            .get("model")?
            .as_str()
            .map(str::to_string)
    }

    fn stream_requested(&self) -> bool {
        self.json
            .as_ref()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            == Some(true)
    }

    fn into_outbound(self) -> OutboundBody {
        match (self.is_json_content, self.json) {
            (true, Some(value)) => OutboundBody::Json(value),
            _ => OutboundBody::Raw(self.raw),
        }
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let inner = e.into_inner();
        if inner.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
            ProxyError::PayloadTooLarge { limit }
        } else {
            ProxyError::RequestBody(inner.to_string())
        }
    })
}

fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase())
        .is_some_and(|ct| ct.starts_with("application/x-ndjson") || ct.starts_with("text/event-stream"))
}
