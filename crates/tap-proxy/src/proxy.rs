//! Outbound requests to the inference backend

use crate::{ProxyError, Result};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, Response, Uri};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;
use tap_core::{Config, Routing};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// A destination the proxy can forward to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub routing: Routing,
    pub name: String,
    /// `host:port`
    pub authority: String,
}

impl Backend {
    pub fn primary(config: &Config) -> Self {
        Self {
            routing: Routing::Primary,
            name: config.upstream.name.clone(),
            authority: config.upstream.authority(),
        }
    }

    /// The secondary backend, when enabled
    pub fn secondary(config: &Config) -> Option<Self> {
        config.secondary.enabled.then(|| Self {
            routing: Routing::Secondary,
            name: config.secondary.name.clone(),
            authority: config.secondary.authority(),
        })
    }

    /// `name@host:port`, as reported by `/health`
    pub fn describe(&self) -> String {
        format!("{}@{}", self.name, self.authority)
    }
}

/// Body of an outbound request
#[derive(Debug, Clone)]
pub enum OutboundBody {
    /// Inbound body was JSON and parsed; re-serialised with a JSON content type
    Json(Value),
    /// Inbound body forwarded as received
    Raw(Bytes),
}

/// Headers that describe the inbound connection or are recomputed for the
/// outbound request
const STRIPPED_REQUEST_HEADERS: &[HeaderName] = &[
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Headers not copied from the upstream response back to the client
const STRIPPED_RESPONSE_HEADERS: &[HeaderName] = &[
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Build the request sent upstream. Method and path-plus-query are copied
/// verbatim; hop-by-hop headers and the backend selection header are
/// dropped, everything else is forwarded.
pub fn build_outbound(
    backend: &Backend,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: OutboundBody,
    control_header: &str,
) -> Result<Request<Full<Bytes>>> {
    let uri = format!("http://{}{}", backend.authority, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::Proxy(format!("Invalid target URI: {}", e)))?;

    let is_json = matches!(body, OutboundBody::Json(_));
    let mut builder = Request::builder().method(method).uri(uri);

    for (name, value) in headers {
        if STRIPPED_REQUEST_HEADERS.contains(name) {
            continue;
        }
        if name.as_str().eq_ignore_ascii_case(control_header) {
            continue;
        }
        if is_json && *name == header::CONTENT_TYPE {
            continue;
        }
        builder = builder.header(name, value);
    }

    let bytes = match body {
        OutboundBody::Json(value) => {
            builder = builder.header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Bytes::from(
                serde_json::to_vec(&value)
                    .map_err(|e| ProxyError::Proxy(format!("Failed to encode request body: {}", e)))?,
            )
        }
        OutboundBody::Raw(bytes) => bytes,
    };

    Ok(builder.body(Full::new(bytes))?)
}

/// Copy upstream response headers for the client, minus framing headers
/// that the server recomputes
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !STRIPPED_RESPONSE_HEADERS.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// HTTP client for the inference backend. Every call is bounded by a total
/// deadline covering connect, headers and body.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            client,
            timeout: request_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deadline for a call starting now
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Send a request and wait for the response head
    pub async fn send(&self, request: Request<Full<Bytes>>, deadline: Instant) -> Result<Response<Incoming>> {
        debug!(method = %request.method(), uri = %request.uri(), "Forwarding upstream");

        timeout_at(deadline, self.client.request(request))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(self.timeout))?
            .map_err(|e| ProxyError::UpstreamUnreachable(describe_client_error(&e)))
    }
}

fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    use std::error::Error as _;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message = format!("{}: {}", message, cause);
        source = cause.source();
    }
    message
}
