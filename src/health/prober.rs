//! Active health checker.
//!
//! Periodically probes every registered backend's `/health` endpoint and
//! flips its liveness flag based on the result.

use crate::backend::{Backend, Registry};
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

/// Serializes probe rounds so `run` never overlaps two rounds; the id is
/// only used in tracing spans to correlate a round's probes in logs.
static ROUND_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Probes every registered backend on a fixed cadence.
pub struct HealthProber {
    registry: Arc<Registry>,
    probe_interval: Duration,
    probe_timeout: Duration,
    metrics: MetricsCollector,
}

impl HealthProber {
    pub fn new(
        registry: Arc<Registry>,
        probe_interval: Duration,
        probe_timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            probe_interval,
            probe_timeout,
            metrics,
        }
    }

    /// Run the prober until shutdown is signaled. One round's probes (run
    /// concurrently) always complete before the next round's sleep begins.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_round().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("health prober shutting down");
                    break;
                }
            }
        }
    }

    async fn run_round(&self) {
        let round = ROUND_COUNTER.fetch_add(1, Ordering::Relaxed);
        let backends = self.registry.all();
        debug!(round, count = backends.len(), "health probe round starting");

        let probes = backends
            .into_iter()
            .map(|backend| probe_one(backend, self.probe_timeout, &self.metrics));
        futures::future::join_all(probes).await;

        debug!(round, "health probe round complete");
    }
}

/// Probe a single backend and update its liveness, response-time ring,
/// last-probe timestamp, and health gauge.
async fn probe_one(backend: Arc<Backend>, probe_timeout: Duration, metrics: &MetricsCollector) {
    let start = Instant::now();
    let result = timeout(probe_timeout, probe_once(&backend)).await;
    let elapsed = start.elapsed();

    let healthy = matches!(result, Ok(Ok(true)));
    if let Err(_) | Ok(Err(_)) = &result {
        if let Ok(Err(e)) = &result {
            warn!(backend = %backend.key(), error = %e, "health probe failed");
        } else {
            warn!(backend = %backend.key(), "health probe timed out");
        }
    }

    backend.set_healthy(healthy);
    backend.record_response_time(elapsed.as_secs_f64());
    backend.set_last_health_check(SystemTime::now());
    metrics.set_backend_health(backend.key(), healthy);
}

/// Connect to the backend and issue `GET /health`, returning whether the
/// response status was exactly 200.
async fn probe_once(backend: &Backend) -> Result<bool, std::io::Error> {
    let addr = format!("{}:{}", backend.host(), backend.port());
    let stream = TcpStream::connect(&addr).await?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(std::io::Error::other)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "health probe connection closed");
        }
    });

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("host", addr)
        .body(Empty::<Bytes>::new())
        .map_err(std::io::Error::other)?;

    let response = sender
        .send_request(request)
        .await
        .map_err(std::io::Error::other)?;

    Ok(response.status() == StatusCode::OK)
}
