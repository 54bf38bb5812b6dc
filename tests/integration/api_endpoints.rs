//! HTTP and WebSocket surface of the observer API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apiwatch::{
    actors::messages::{LiveMessage, MonitorEvent},
    api::{ApiState, build_router, spawn_api_server},
    config::{ApiConfig, LiveConfig},
    monitor::{CheckError, CheckResult},
    registry::InMemoryRegistry,
    stats::StatsCache,
    storage::MemoryBackend,
};
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::helpers::*;

struct TestApi {
    pipeline: Pipeline,
    events: broadcast::Receiver<MonitorEvent>,
    state: ApiState,
}

impl TestApi {
    /// Monitor 1 is up, monitor 2 fails its probes
    fn start() -> Self {
        let registry = Arc::new(InMemoryRegistry::new([
            test_monitor(1, "https://up.example.com"),
            test_monitor(2, "https://down.example.com"),
        ]));
        let backend = Arc::new(MemoryBackend::new());
        let prober = Arc::new(UpDownProber);
        let (pipeline, events) = Pipeline::with_registry(&registry, backend.clone(), prober, 1);

        let stats = Arc::new(StatsCache::new(backend.clone(), registry.clone()));
        let state = ApiState {
            scheduler: pipeline.scheduler.clone(),
            detector: pipeline.detector.clone(),
            broadcaster: pipeline.broadcaster.clone(),
            storage: pipeline.storage.clone(),
            backend,
            registry,
            stats,
            live: LiveConfig::default(),
        };

        Self {
            pipeline,
            events,
            state,
        }
    }

    fn router(&self, auth_token: Option<&str>) -> Router {
        let config = ApiConfig {
            auth_token: auth_token.map(str::to_string),
            ..ApiConfig::default()
        };
        build_router(&config, self.state.clone())
    }

    /// Wait until both monitors were probed once and everything is stored
    async fn settle(&mut self) {
        let mut seen = 0;
        while seen < 2 {
            next_check(&mut self.events).await;
            seen += 1;
        }
        self.pipeline.storage.flush().await.unwrap();
    }
}

struct UpDownProber;

#[async_trait::async_trait]
impl apiwatch::actors::prober::Probe for UpDownProber {
    async fn probe(&self, config: &apiwatch::monitor::MonitorConfig) -> CheckResult {
        if config.id == 2 {
            CheckResult::down(config.id, CheckError::ConnectionRefused, "connection refused")
        } else {
            CheckResult::up(config.id, config.expected_status, 12)
        }
    }
}

async fn call(router: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(router, request).await
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_endpoint() {
    let api = TestApi::start();

    let (status, body) = call(api.router(None), Method::GET, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["observers"], 0);

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_monitor_listing_reflects_incident_state() {
    let mut api = TestApi::start();
    api.settle().await;

    let (status, body) = call(api.router(None), Method::GET, "/api/v1/monitors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let monitors = body["monitors"].as_array().unwrap();
    assert_eq!(monitors[0]["monitor_id"], 1);
    assert_eq!(monitors[0]["phase"], "healthy");
    assert_eq!(monitors[1]["monitor_id"], 2);
    assert_eq!(monitors[1]["phase"], "incident_open");
    assert_eq!(monitors[1]["open_incident"]["cause"], "connection-refused");

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_checks_and_incidents_endpoints() {
    let mut api = TestApi::start();
    api.settle().await;

    let (status, body) = call(api.router(None), Method::GET, "/api/v1/monitors/2/checks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monitor_id"], 2);
    assert_eq!(body["count"], 1);
    assert_eq!(body["checks"][0]["success"], false);

    let (status, body) =
        call(api.router(None), Method::GET, "/api/v1/monitors/2/incidents?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["incidents"][0]["resolved_at"], Value::Null);
    assert_eq!(body["incidents"][0]["duration_secs"], Value::Null);

    let (status, body) =
        call(api.router(None), Method::GET, "/api/v1/monitors/1/checks?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("limit"));

    let (status, _) = call(api.router(None), Method::GET, "/api/v1/monitors/99/checks").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_stats_endpoints() {
    let mut api = TestApi::start();
    api.settle().await;

    let (status, body) = call(api.router(None), Method::GET, "/api/v1/monitors/1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hours"], 24);
    assert_eq!(body["total_checks"], 1);
    assert_eq!(body["uptime_percentage"], 100.0);

    let (status, _) =
        call(api.router(None), Method::GET, "/api/v1/monitors/1/stats?hours=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(api.router(None), Method::GET, "/api/v1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_monitors"], 2);
    assert_eq!(body["monitors_up"], 1);
    assert_eq!(body["monitors_down"], 1);
    assert_eq!(body["ongoing_incidents"], 1);
    assert_eq!(body["overall_uptime"], 50.0);
    assert!(body["storage"]["checks_written"].as_u64().unwrap() >= 2);

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_manual_resolution() {
    let mut api = TestApi::start();
    api.settle().await;

    let (status, body) =
        call(api.router(None), Method::POST, "/api/v1/monitors/2/resolve").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monitor_id"], 2);
    assert!(body["resolved_at"].is_string());

    match next_event(&mut api.events, |e| {
        matches!(e, MonitorEvent::IncidentResolved { .. })
    })
    .await
    {
        MonitorEvent::IncidentResolved { manual, .. } => assert!(manual),
        other => panic!("unexpected event {other:?}"),
    }

    // nothing left to resolve
    let (status, _) = call(api.router(None), Method::POST, "/api/v1/monitors/2/resolve").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_auth_token_required() {
    let api = TestApi::start();
    let router = api.router(Some("s3cret"));

    let (status, _) = call(router.clone(), Method::GET, "/api/v1/health").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/v1/health")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Invalid token");

    let request = Request::builder()
        .uri("/api/v1/health")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(router, Method::GET, "/api/v1/health?token=s3cret").await;
    assert_eq!(status, StatusCode::OK);

    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_query_token_with_reserved_characters() {
    let api = TestApi::start();
    let router = api.router(Some("a+b/c&d="));

    let (status, _) =
        call(router.clone(), Method::GET, "/api/v1/health?token=a%2Bb%2Fc%26d%3D").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(router, Method::GET, "/api/v1/health?token=a+b/c").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    api.pipeline.shutdown().await;
}

async fn serve(api: &TestApi) -> (SocketAddr, CancellationToken) {
    serve_state(api.state.clone()).await
}

async fn serve_state(state: ApiState) -> (SocketAddr, CancellationToken) {
    let shutdown = CancellationToken::new();
    let config = ApiConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ApiConfig::default()
    };
    let addr = spawn_api_server(config, state, shutdown.clone())
        .await
        .unwrap();
    (addr, shutdown)
}

fn parse(message: Message) -> LiveMessage {
    match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_live_events() {
    let api = TestApi::start();
    let (addr, shutdown) = serve(&api).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
        .await
        .unwrap();

    let greeting = parse(socket.next().await.unwrap().unwrap());
    assert_eq!(greeting.kind, "connected");

    socket.send(Message::Text("ping".into())).await.unwrap();

    let result = CheckResult::down(1, CheckError::Timeout, "Request timeout after 2s");
    api.pipeline.detector.submit(result.clone()).await.unwrap();

    let mut saw_pong = false;
    let mut saw_result = false;
    while !(saw_pong && saw_result) {
        let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("no live message")
            .unwrap()
            .unwrap();
        if !frame.is_text() {
            continue;
        }
        let message = parse(frame);
        match message.kind.as_str() {
            "pong" => saw_pong = true,
            "check_result" if message.payload["check_id"] == result.check_id.to_string() => {
                assert_eq!(message.monitor_id, Some(1));
                assert_eq!(message.payload["error"], "timeout");
                saw_result = true;
            }
            _ => {}
        }
    }

    socket.close(None).await.unwrap();
    shutdown.cancel();
    api.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_silent_observer_is_evicted_by_heartbeat() {
    let api = TestApi::start();
    let mut state = api.state.clone();
    state.live.heartbeat_interval_secs = 1;
    state.live.heartbeat_timeout_secs = 2;
    let (addr, shutdown) = serve_state(state).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
        .await
        .unwrap();
    let greeting = parse(socket.next().await.unwrap().unwrap());
    assert_eq!(greeting.kind, "connected");
    assert_eq!(api.pipeline.broadcaster.connection_count().await.unwrap(), 1);

    // half-open client: nothing is read, so server pings go unanswered
    let mut evicted = false;
    for _ in 0..100 {
        if api.pipeline.broadcaster.connection_count().await.unwrap() == 0 {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(evicted, "silent observer should be evicted");

    // the buffered pings end in a close frame or a dropped connection
    let mut closed = false;
    while let Ok(frame) = tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
        match frame {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                closed = true;
                break;
            }
            Some(Ok(_)) => {}
        }
    }
    assert!(closed, "server should close the socket");

    shutdown.cancel();
    api.pipeline.shutdown().await;
}
