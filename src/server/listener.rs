//! The balancer's single HTTP listener: management routes first, then the
//! forwarding catch-all.

use crate::proxy::Forwarder;
use crate::server::stats::build_stats;
use crate::state::Balancer;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Binds the management-and-forwarding listener and serves connections until
/// shutdown.
pub struct ManagementListener {
    address: SocketAddr,
    listener: TcpListener,
    balancer: Balancer,
    forwarder: Forwarder,
}

impl ManagementListener {
    pub async fn bind(address: SocketAddr, balancer: Balancer, forwarder: Forwarder) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        info!(address = %address, "management listener bound");
        Ok(Self {
            address,
            listener,
            balancer,
            forwarder,
        })
    }

    /// The address actually bound, useful when `address` was port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(address = %self.address, "management listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            self.handle_connection(stream, client_addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("management listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let balancer = self.balancer.clone();
        let forwarder = self.forwarder.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let balancer = balancer.clone();
                let forwarder = forwarder.clone();
                async move { dispatch(req, client_addr, &balancer, &forwarder).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, client = %client_addr, "connection error");
            }
        });
    }
}

async fn dispatch(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    balancer: &Balancer,
    forwarder: &Forwarder,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/") | (&Method::GET, "/dashboard") => Ok(not_found("dashboard not available\n")),
        (&Method::GET, p) if p.starts_with("/static/") => Ok(not_found("not found\n")),
        (&Method::GET, "/lb/stats") => Ok(json_response(StatusCode::OK, &build_stats(balancer))),
        (&Method::POST, "/lb/add-server") => Ok(handle_add_server(req, balancer).await),
        (&Method::POST, "/lb/remove-server") => Ok(handle_remove_server(req, balancer).await),
        _ => forwarder.forward(req, client_addr).await,
    }
}

#[derive(Debug, Deserialize)]
struct ServerRequest {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn handle_add_server(req: Request<Incoming>, balancer: &Balancer) -> Response<BoxBody<Bytes, hyper::Error>> {
    match parse_server_request(req).await {
        Ok((host, port)) => {
            balancer.registry().register(host.clone(), port);
            info!(backend = %format!("{host}:{port}"), "backend added via management surface");
            json_response(
                StatusCode::OK,
                &MessageResponse {
                    message: format!("Server {host}:{port} added"),
                },
            )
        }
        Err(e) => bad_request(&e),
    }
}

async fn handle_remove_server(req: Request<Incoming>, balancer: &Balancer) -> Response<BoxBody<Bytes, hyper::Error>> {
    match parse_server_request(req).await {
        Ok((host, port)) => {
            if let Err(e) = balancer.registry().deregister(&host, port) {
                warn!(backend = %format!("{host}:{port}"), error = %e, "remove-server rejected");
            }
            json_response(
                StatusCode::OK,
                &MessageResponse {
                    message: format!("Server {host}:{port} removed"),
                },
            )
        }
        Err(e) => bad_request(&e),
    }
}

/// Parse `{"host": ..., "port": ...}`, failing if either field is missing or
/// the body is not valid JSON.
async fn parse_server_request(req: Request<Incoming>) -> Result<(String, u16), String> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();

    let parsed: ServerRequest = serde_json::from_slice(&bytes).unwrap_or(ServerRequest {
        host: None,
        port: None,
    });

    match (parsed.host, parsed.port) {
        (Some(host), Some(port)) if !host.is_empty() => Ok((host, port)),
        _ => Err("Host and port required".to_string()),
    }
}

fn bad_request(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let boxed = Full::new(Bytes::from(payload))
        .map_err(|never: Infallible| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(boxed)
        .expect("static response is well-formed")
}

fn not_found(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let boxed = Full::new(Bytes::from(message.to_string()))
        .map_err(|never: Infallible| match never {})
        .boxed();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-type", "text/plain")
        .body(boxed)
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_sets_400_and_json_error_body() {
        let response = bad_request("Host and port required");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn json_response_sets_content_type() {
        let response = json_response(StatusCode::OK, &MessageResponse {
            message: "ok".to_string(),
        });
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
