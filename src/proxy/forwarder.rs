//! The per-request forwarding pipeline: select a backend, proxy the request,
//! stream the response back, and keep counters consistent on every exit path.

use crate::backend::{Backend, Registry, SelectError, Selector};
use crate::metrics::MetricsCollector;
use crate::session::{generate_session_id, SessionTable};
use crate::util::generate_short_request_id;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

const SESSION_COOKIE_NAME: &str = "lb_session_id";

/// Headers that must not be forwarded across the proxy boundary.
const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "upgrade"];

/// Errors raised while forwarding a single request to a backend.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("backend connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("backend request failed: {0}")]
    Upstream(#[from] hyper::Error),
}

/// RAII guard decrementing a backend's active-connection counter and its
/// metrics gauge exactly once, even if the request future is dropped
/// mid-flight (client disconnect, task cancellation).
struct ActiveGuard {
    backend: Arc<Backend>,
    metrics: MetricsCollector,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.backend.decr_active();
        self.metrics.connection_closed(self.backend.key());
    }
}

/// The shared forwarding pipeline, invoked once per inbound request.
#[derive(Clone)]
pub struct Forwarder {
    registry: Arc<Registry>,
    selector: Arc<Selector>,
    sessions: Arc<SessionTable>,
    metrics: MetricsCollector,
}

impl Forwarder {
    pub fn new(
        registry: Arc<Registry>,
        selector: Arc<Selector>,
        sessions: Arc<SessionTable>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            selector,
            sessions,
            metrics,
        }
    }

    /// Forward one client request and return the response to send back.
    /// Never fails: every error path is converted into an HTTP response.
    #[instrument(skip_all, fields(
        request_id = %generate_short_request_id(),
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    ))]
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let session_id = read_session_cookie(req.headers())
            .unwrap_or_else(|| {
                let user_agent = req
                    .headers()
                    .get(hyper::header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                generate_session_id(client_addr, user_agent)
            });

        let backend = match self.selector.select(&self.registry, &self.sessions, Some(&session_id)) {
            Ok(backend) => backend,
            Err(SelectError::NoHealthyBackend) => {
                warn!("no healthy backends for request");
                return Ok(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "No healthy servers available",
                ));
            }
        };

        backend.incr_active();
        backend.incr_requests();
        self.metrics.connection_opened(backend.key());
        let guard = ActiveGuard {
            backend: Arc::clone(&backend),
            metrics: self.metrics.clone(),
        };

        let start = Instant::now();
        let method = req.method().to_string();
        let result = proxy_to_backend(req, &backend).await;
        let elapsed = start.elapsed();

        drop(guard);

        match result {
            Ok(response) => {
                backend.record_response_time(elapsed.as_secs_f64());
                let status = response.status();
                self.metrics.record_request(backend.key(), &method, status.as_u16(), elapsed);
                info!(backend = %backend.key(), status = %status, elapsed_ms = elapsed.as_millis(), "request forwarded");
                Ok(with_session_cookie(response, &session_id, self.sessions.ttl()))
            }
            Err(e) => {
                backend.incr_errors();
                self.metrics.record_request(backend.key(), &method, 502, elapsed);
                error!(backend = %backend.key(), error = %e, "upstream request failed");
                Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Backend error: {e}"),
                ))
            }
        }
    }
}

/// Issue the upstream HTTP/1.1 request and hand back the backend's response
/// with its body boxed for uniform streaming back to the client.
async fn proxy_to_backend(
    mut req: Request<Incoming>,
    backend: &Backend,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwarderError> {
    strip_hop_by_hop(req.headers_mut());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = path_and_query.parse().unwrap_or_else(|_| "/".parse().unwrap());

    let stream = TcpStream::connect((backend.host(), backend.port())).await?;
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "backend connection closed");
        }
    });

    let response = sender.send_request(req).await?;
    let (parts, body) = response.into_parts();
    let boxed = body.map_err(|e| e).boxed();
    Ok(Response::from_parts(parts, boxed))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn read_session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(hyper::header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE_NAME).then(|| value.to_string())
    })
}

fn with_session_cookie(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    session_id: &str,
    ttl: Duration,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let cookie = format!("{SESSION_COOKIE_NAME}={session_id}; Max-Age={}; Path=/", ttl.as_secs());
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("set-cookie"), value);
    }
    response
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never: Infallible| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(body)
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::COOKIE,
            HeaderValue::from_static("foo=bar; lb_session_id=abc123; baz=qux"),
        );
        assert_eq!(read_session_cookie(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_cookie_header_yields_none() {
        let headers = HeaderMap::new();
        assert_eq!(read_session_cookie(&headers), None);
    }

    #[test]
    fn strip_hop_by_hop_removes_connection_and_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(hyper::header::HOST, HeaderValue::from_static("example.com"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key(hyper::header::CONNECTION));
        assert!(!headers.contains_key(hyper::header::UPGRADE));
        assert!(headers.contains_key(hyper::header::HOST));
    }

    #[test]
    fn session_cookie_is_set_with_configured_ttl() {
        let body = Full::new(Bytes::new()).map_err(|never: Infallible| match never {}).boxed();
        let response = Response::new(body);
        let response = with_session_cookie(response, "abc123", Duration::from_secs(3600));
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("lb_session_id=abc123"));
        assert!(cookie.contains("Max-Age=3600"));
    }
}
