//! End-to-end tests driving the balancer through real TCP connections:
//! backend selection, sticky sessions, upstream failure accounting, and the
//! management surface.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use revproxy_lb::backend::{Algorithm, Registry};
use revproxy_lb::metrics::MetricsCollector;
use revproxy_lb::proxy::Forwarder;
use revproxy_lb::server::ManagementListener;
use revproxy_lb::session::SessionTable;
use revproxy_lb::state::Balancer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawn a minimal origin server that replies to every request with a fixed
/// status and body, tagging the body with `tag` so tests can tell backends
/// apart.
async fn start_origin(status: u16, tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = tag;
                let response = format!(
                    "HTTP/1.1 {status} OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

/// Minimal client response shape for assertions.
struct ClientResponse {
    status: StatusCode,
    headers: hyper::HeaderMap,
    body: String,
}

async fn send_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    cookie: Option<&str>,
    body: &str,
) -> ClientResponse {
    let stream = TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::builder().method(method).uri(path).header("host", addr.to_string());
    if let Some(cookie) = cookie {
        builder = builder.header("cookie", format!("lb_session_id={cookie}"));
    }

    let request = if body.is_empty() {
        builder.body(Full::new(Bytes::new()).map_err(|_| unreachable!()).boxed()).unwrap()
    } else {
        builder.body(Full::new(Bytes::from(body.to_string())).map_err(|_| unreachable!()).boxed()).unwrap()
    };

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    ClientResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

fn session_id_from(response: &ClientResponse) -> String {
    let cookie = response.headers.get("set-cookie").unwrap().to_str().unwrap();
    cookie
        .split(';')
        .next()
        .unwrap()
        .strip_prefix("lb_session_id=")
        .unwrap()
        .to_string()
}

struct Harness {
    address: SocketAddr,
    registry: Arc<Registry>,
    // Kept alive so the listener's shutdown receiver doesn't fire early.
    _shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

async fn start_harness(algorithm: Algorithm) -> Harness {
    let registry = Arc::new(Registry::new());
    let sessions = Arc::new(SessionTable::new(Duration::from_secs(3600)));
    let metrics = MetricsCollector::new();
    let balancer = Balancer::new(Arc::clone(&registry), Arc::clone(&sessions), algorithm, metrics.clone());
    let forwarder = Forwarder::new(
        Arc::clone(&registry),
        Arc::clone(balancer.selector()),
        Arc::clone(&sessions),
        metrics,
    );

    let listener = ManagementListener::bind("127.0.0.1:0".parse().unwrap(), balancer, forwarder)
        .await
        .unwrap();
    let address = listener.local_addr();
    let (tx, rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        listener.run(rx).await;
    });

    Harness {
        address,
        registry,
        _shutdown_tx: tx,
    }
}

#[tokio::test]
async fn round_robin_distributes_across_backends() {
    let a = start_origin(200, "origin-a").await;
    let b = start_origin(200, "origin-b").await;
    let c = start_origin(200, "origin-c").await;

    let harness = start_harness(Algorithm::RoundRobin).await;
    harness.registry.register(a.ip().to_string(), a.port());
    harness.registry.register(b.ip().to_string(), b.port());
    harness.registry.register(c.ip().to_string(), c.port());

    let mut bodies = Vec::new();
    for _ in 0..6 {
        let resp = send_request(harness.address, "GET", "/anything", None, "").await;
        assert_eq!(resp.status, StatusCode::OK);
        bodies.push(resp.body);
    }

    assert_eq!(bodies, vec!["origin-a", "origin-b", "origin-c", "origin-a", "origin-b", "origin-c"]);
}

#[tokio::test]
async fn sticky_session_survives_across_requests() {
    let a = start_origin(200, "origin-a").await;
    let b = start_origin(200, "origin-b").await;

    let harness = start_harness(Algorithm::RoundRobin).await;
    harness.registry.register(a.ip().to_string(), a.port());
    harness.registry.register(b.ip().to_string(), b.port());

    let first = send_request(harness.address, "GET", "/", None, "").await;
    let session_id = session_id_from(&first);
    let first_body = first.body.clone();

    for _ in 0..4 {
        let resp = send_request(harness.address, "GET", "/", Some(&session_id), "").await;
        assert_eq!(resp.body, first_body, "sticky session should keep hitting the same backend");
    }
}

#[tokio::test]
async fn sticky_session_rebinds_when_backend_dies() {
    let a = start_origin(200, "origin-a").await;
    let b = start_origin(200, "origin-b").await;

    let harness = start_harness(Algorithm::RoundRobin).await;
    harness.registry.register(a.ip().to_string(), a.port());
    harness.registry.register(b.ip().to_string(), b.port());

    let first = send_request(harness.address, "GET", "/", None, "").await;
    let session_id = session_id_from(&first);

    let bound_key = format!("{}:{}", a.ip(), a.port());
    let other_key = format!("{}:{}", b.ip(), b.port());
    let (dead, _alive) = if first.body == "origin-a" {
        (bound_key, other_key)
    } else {
        (other_key, bound_key)
    };
    harness.registry.lookup(&dead).unwrap().set_healthy(false);

    let second = send_request(harness.address, "GET", "/", Some(&session_id), "").await;
    assert_ne!(second.body, first.body);
}

#[tokio::test]
async fn upstream_connection_failure_returns_502_and_increments_error_counter() {
    let harness = start_harness(Algorithm::RoundRobin).await;
    // Nothing listens on this port, so the forward attempt fails to connect.
    let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    harness.registry.register(dead_addr.ip().to_string(), dead_addr.port());

    let resp = send_request(harness.address, "GET", "/", None, "").await;
    assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
    assert!(resp.body.starts_with("Backend error:"));

    let backend = harness.registry.lookup(&format!("{}:{}", dead_addr.ip(), dead_addr.port())).unwrap();
    assert_eq!(backend.total_errors(), 1);
    assert_eq!(backend.total_requests(), 1);
    assert_eq!(backend.active_connections(), 0);
}

#[tokio::test]
async fn no_healthy_backend_returns_503() {
    let harness = start_harness(Algorithm::RoundRobin).await;
    let resp = send_request(harness.address, "GET", "/", None, "").await;
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.body, "No healthy servers available");
}

#[tokio::test]
async fn add_server_endpoint_adds_to_rotation() {
    let a = start_origin(200, "origin-a").await;
    let b = start_origin(200, "origin-b").await;

    let harness = start_harness(Algorithm::RoundRobin).await;
    harness.registry.register(a.ip().to_string(), a.port());

    let add_body = format!(r#"{{"host": "{}", "port": {}}}"#, b.ip(), b.port());
    let resp = send_request(harness.address, "POST", "/lb/add-server", None, &add_body).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(harness.registry.total_count(), 2);

    let first = send_request(harness.address, "GET", "/", None, "").await;
    let second = send_request(harness.address, "GET", "/", None, "").await;
    assert_ne!(first.body, second.body);
}

#[tokio::test]
async fn add_server_missing_fields_returns_400() {
    let harness = start_harness(Algorithm::RoundRobin).await;
    let resp = send_request(harness.address, "POST", "/lb/add-server", None, r#"{"host": "x"}"#).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn remove_last_backend_is_ignored() {
    let a = start_origin(200, "origin-a").await;

    let harness = start_harness(Algorithm::RoundRobin).await;
    harness.registry.register(a.ip().to_string(), a.port());

    let remove_body = format!(r#"{{"host": "{}", "port": {}}}"#, a.ip(), a.port());
    let resp = send_request(harness.address, "POST", "/lb/remove-server", None, &remove_body).await;
    // Removal is silently ignored; the endpoint still reports success.
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(harness.registry.total_count(), 1);
}

#[tokio::test]
async fn stats_endpoint_reports_pool_state() {
    let a = start_origin(200, "origin-a").await;
    let harness = start_harness(Algorithm::LeastConnections).await;
    harness.registry.register(a.ip().to_string(), a.port());

    let resp = send_request(harness.address, "GET", "/lb/stats", None, "").await;
    assert_eq!(resp.status, StatusCode::OK);

    let value: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(value["algorithm"], "least_connections");
    assert_eq!(value["total_servers"], 1);
    assert_eq!(value["healthy_servers"], 1);
}

#[tokio::test]
async fn unknown_static_and_dashboard_routes_return_404() {
    let harness = start_harness(Algorithm::RoundRobin).await;

    let dashboard = send_request(harness.address, "GET", "/dashboard", None, "").await;
    assert_eq!(dashboard.status, StatusCode::NOT_FOUND);

    let asset = send_request(harness.address, "GET", "/static/app.js", None, "").await;
    assert_eq!(asset.status, StatusCode::NOT_FOUND);
}

