//! End-to-end tests against a mock inference server

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tap_core::{Config, ConfigBuilder};
use tap_proxy::logging::init_test_logging;
use tap_proxy::MonitoringProxy;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;

/// Streamed records, with one record split across two chunks and one line
/// that is not JSON
const STREAM_CHUNKS: &[&str] = &[
    "{\"model\":\"m1\",\"response\":\"Hel\",\"done\":false}\n",
    "not json at all\n{\"model\":\"m1\",\"resp",
    "onse\":\"lo\",\"done\":false}\n",
    "{\"model\":\"m1\",\"response\":\"\",\"done\":true,\"prompt_eval_count\":10,\"prompt_eval_duration\":500000000,\"eval_count\":20,\"eval_duration\":1000000000}\n",
];

#[derive(Clone)]
struct MockUpstream {
    name: &'static str,
}

async fn generate(State(mock): State<MockUpstream>, request: Request) -> Response {
    let saw_control_header = request.headers().contains_key("x-ollama-tap-backend");
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let model = value["model"].as_str().unwrap_or_default().to_string();

    if model == "slow" {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    if model == "endless" {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(8);
        tokio::spawn(async move {
            // Runs well past any test but stops once the proxy hangs up
            for _ in 0..500 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let chunk = Bytes::from_static(b"{\"model\":\"endless\",\"response\":\"x\",\"done\":false}\n");
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        return (
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response();
    }

    if value["stream"].as_bool() == Some(true) {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(8);
        tokio::spawn(async move {
            for chunk in STREAM_CHUNKS {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if tx.send(Ok(Bytes::from_static(chunk.as_bytes()))).await.is_err() {
                    return;
                }
            }
        });

        return (
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response();
    }

    (
        [("x-mock-backend", mock.name)],
        Json(json!({
            "model": model,
            "response": "Hello",
            "done": true,
            "saw_control_header": saw_control_header,
            "prompt_eval_count": 12,
            "prompt_eval_duration": 400_000_000u64,
            "eval_count": 100,
            "eval_duration": 2_000_000_000u64,
            "total_duration": 2_500_000_000u64,
            "load_duration": 100_000_000u64,
        })),
    )
        .into_response()
}

async fn tags() -> Json<Value> {
    Json(json!({"models": [{"name": "m1"}]}))
}

async fn spawn_upstream(name: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/api/generate", post(generate))
        .route("/api/tags", get(tags))
        .with_state(MockUpstream { name });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config_for(upstream: SocketAddr) -> ConfigBuilder {
    ConfigBuilder::new()
        .upstream("127.0.0.1", upstream.port())
        .proxy_port(free_port())
        .metrics_port(None)
        .sampler_enabled(false)
}

async fn start_proxy(config: Config) -> (MonitoringProxy, String) {
    init_test_logging();
    let proxy = MonitoringProxy::new(config).unwrap();
    let addrs = proxy.start().await.unwrap();
    (proxy, format!("http://{}", addrs.proxy))
}

/// Wait until no request holds a slot or waits in the queue
async fn wait_until_idle(proxy: &MonitoringProxy, model: &str) {
    for _ in 0..200 {
        let idle = proxy.state().admission().in_execution() == 0
            && proxy.registry().queue_snapshot().current_size == 0
            && proxy.registry().active_requests(model) == 0.0;
        if idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("proxy still busy with {}", model);
}

#[tokio::test]
async fn test_single_shot_generate_records_metrics() {
    let upstream = spawn_upstream("primary").await;
    let (proxy, base) = start_proxy(config_for(upstream).build()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "m1", "prompt": "hi", "stream": false}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["response"], "Hello");
    assert_eq!(body["eval_count"], 100);

    let metrics = proxy.registry().metrics();
    let tps = metrics
        .generation
        .tokens_per_second
        .with_label_values(&["m1", "eval"]);
    assert_eq!(tps.get_sample_count(), 1);
    assert!((tps.get_sample_sum() - 50.0).abs() < 1e-9);

    let prompt_tps = metrics
        .generation
        .tokens_per_second
        .with_label_values(&["m1", "prompt_eval"]);
    assert!((prompt_tps.get_sample_sum() - 30.0).abs() < 1e-9);

    assert_eq!(
        metrics.generation.generated_tokens_total.with_label_values(&["m1"]).get(),
        100.0
    );
    assert_eq!(
        metrics.generation.prompt_tokens_total.with_label_values(&["m1"]).get(),
        12.0
    );
    assert_eq!(
        metrics
            .requests
            .requests_total
            .with_label_values(&["POST", "/api/generate", "m1", "200"])
            .get(),
        1.0
    );
    assert_eq!(
        metrics
            .endpoints
            .generate_duration_seconds
            .with_label_values(&["m1", "false"])
            .get_sample_count(),
        1
    );
    assert_eq!(
        metrics
            .requests
            .backend_requests_total
            .with_label_values(&["primary", "200"])
            .get(),
        1.0
    );
    assert_eq!(proxy.registry().active_requests("m1"), 0.0);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_streamed_generate_is_relayed_verbatim() {
    let upstream = spawn_upstream("primary").await;
    let (proxy, base) = start_proxy(config_for(upstream).build()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "m1", "prompt": "hi", "stream": true}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");

    let body = response.bytes().await.unwrap();
    assert_eq!(body, Bytes::from(STREAM_CHUNKS.concat()));

    // Completion is recorded before the client sees the end of the stream
    let metrics = proxy.registry().metrics();
    assert_eq!(
        metrics
            .generation
            .time_to_first_token_seconds
            .with_label_values(&["m1"])
            .get_sample_count(),
        1
    );
    let tps = metrics
        .generation
        .tokens_per_second
        .with_label_values(&["m1", "eval"]);
    assert_eq!(tps.get_sample_count(), 1);
    assert!((tps.get_sample_sum() - 20.0).abs() < 1e-9);
    assert_eq!(
        metrics
            .endpoints
            .generate_duration_seconds
            .with_label_values(&["m1", "true"])
            .get_sample_count(),
        1
    );
    assert_eq!(proxy.registry().active_requests("m1"), 0.0);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let closed: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let (proxy, base) = start_proxy(config_for(closed).build()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "m1", "prompt": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        proxy
            .registry()
            .metrics()
            .requests
            .errors_total
            .with_label_values(&["m1", "UpstreamUnreachable"])
            .get(),
        1.0
    );

    // Failed calls never reached a backend and produced no completion
    let exposition = proxy.registry().encode_text().unwrap();
    assert!(!exposition.contains("backend_requests_total{"));
    assert!(!exposition.contains("ollama_proxy_requests_total{"));
    assert_eq!(
        proxy
            .registry()
            .metrics()
            .requests
            .requests_total
            .with_label_values(&["POST", "/api/generate", "m1", "502"])
            .get(),
        0.0
    );

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_upstream_is_gateway_timeout() {
    let upstream = spawn_upstream("primary").await;
    let config = config_for(upstream)
        .request_timeout(Duration::from_secs(1))
        .build();
    let (proxy, base) = start_proxy(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "slow", "prompt": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        proxy
            .registry()
            .metrics()
            .requests
            .errors_total
            .with_label_values(&["slow", "UpstreamTimeout"])
            .get(),
        1.0
    );
    assert_eq!(proxy.registry().active_requests("slow"), 0.0);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gauges_balance_after_concurrent_load() {
    let upstream = spawn_upstream("primary").await;
    let config = config_for(upstream).max_concurrency(2).build();
    let (proxy, base) = start_proxy(config).await;
    let client = reqwest::Client::new();

    let mut handles = Vec::new();
    for i in 0..12 {
        let client = client.clone();
        let url = format!("{}/api/generate", base);
        handles.push(tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({"model": format!("m{}", i % 3), "prompt": "hi", "stream": i % 2 == 0}))
                .send()
                .await
                .unwrap()
                .bytes()
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let registry = proxy.registry();
    for model in ["m0", "m1", "m2"] {
        assert_eq!(registry.active_requests(model), 0.0);
    }
    let queue = registry.queue_snapshot();
    assert_eq!(queue.current_size, 0);
    assert_eq!(queue.total_processed, 12);
    assert_eq!(proxy.state().admission().in_execution(), 0);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_and_health_on_proxy_listener() {
    let upstream = spawn_upstream("primary").await;
    let (proxy, base) = start_proxy(config_for(upstream).build()).await;
    let client = reqwest::Client::new();

    let tags: Value = client
        .get(format!("{}/api/tags", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tags["models"][0]["name"], "m1");

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["upstream"], format!("ollama@127.0.0.1:{}", upstream.port()));
    assert!(health["queue"].is_object());

    let exposition = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(exposition.contains("ollama_proxy_list_models_duration_seconds_count 1"));
    assert!(exposition.contains("ollama_proxy_requests_total"));

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backend_header_routes_to_secondary() {
    let primary = spawn_upstream("primary").await;
    let secondary = spawn_upstream("secondary").await;
    let config = config_for(primary)
        .secondary("127.0.0.1", secondary.port())
        .build();
    let (proxy, base) = start_proxy(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .header("x-ollama-tap-backend", "secondary")
        .json(&json!({"model": "m1", "prompt": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-mock-backend"], "secondary");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["saw_control_header"], false);

    assert_eq!(
        proxy
            .registry()
            .metrics()
            .requests
            .backend_requests_total
            .with_label_values(&["secondary", "200"])
            .get(),
        1.0
    );

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let upstream = spawn_upstream("primary").await;
    let config = config_for(upstream).max_request_size(64).build();
    let (proxy, base) = start_proxy(config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "m1", "prompt": "x".repeat(256)}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(proxy.registry().queue_snapshot().total_enqueued, 0);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_leaving_mid_stream_releases_slot() {
    let upstream = spawn_upstream("primary").await;
    let config = config_for(upstream).max_concurrency(1).build();
    let (proxy, base) = start_proxy(config).await;

    let mut response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "endless", "prompt": "hi", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let first = response.chunk().await.unwrap();
    assert!(first.is_some());
    assert_eq!(proxy.state().admission().in_execution(), 1);
    drop(response);

    wait_until_idle(&proxy, "endless").await;
    assert_eq!(proxy.registry().metrics().queue.queue_size.get(), 0.0);
    assert_eq!(proxy.registry().queue_snapshot().total_processed, 1);

    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_timeout_during_buffered_call_releases_slot() {
    let upstream = spawn_upstream("primary").await;
    let config = config_for(upstream).max_concurrency(1).build();
    let (proxy, base) = start_proxy(config).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let result = client
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "slow", "prompt": "hi"}))
        .send()
        .await;
    assert!(result.unwrap_err().is_timeout());

    wait_until_idle(&proxy, "slow").await;
    assert_eq!(proxy.registry().metrics().queue.queue_size.get(), 0.0);

    // The freed slot admits the next request
    let response = reqwest::Client::new()
        .post(format!("{}/api/generate", base))
        .json(&json!({"model": "m1", "prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_until_idle(&proxy, "m1").await;

    proxy.shutdown().await.unwrap();
}
