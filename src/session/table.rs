//! Session table: maps opaque session identifiers to a bound backend key.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

/// Disambiguates session identifiers minted within the same nanosecond.
static MINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A sticky-session binding: which backend a session is pinned to, and when
/// that binding was made.
///
/// Creation time is tracked as an explicit field rather than recovered from
/// the identifier string; the identifier is an opaque hex digest and carries
/// no extractable timestamp.
#[derive(Debug, Clone)]
pub struct Session {
    backend_key: String,
    created_at: Instant,
}

impl Session {
    pub fn backend_key(&self) -> &str {
        &self.backend_key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Mint a fresh 32-character lowercase hex session identifier derived from
/// the client's remote address, User-Agent header, and the current time.
pub fn generate_session_id(remote: SocketAddr, user_agent: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let nonce = MINT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let material = format!(
        "{remote}:{user_agent}:{}.{}:{nonce}",
        now.as_secs(),
        now.subsec_nanos()
    );
    format!("{:x}", md5::compute(material.as_bytes()))
}

/// Concurrent session-id to backend-key table with TTL-based eviction.
pub struct SessionTable {
    entries: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.entries.get(session_id).map(|entry| entry.clone())
    }

    pub fn put(&self, session_id: &str, backend_key: &str) {
        self.entries.insert(
            session_id.to_string(),
            Session {
                backend_key: backend_key.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    pub fn delete(&self, session_id: &str) {
        self.entries.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry whose binding is older than the configured TTL.
    fn sweep(&self) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, session| session.created_at.elapsed() < ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "swept expired sessions");
        }
    }

    /// Long-running cleanup task: sweeps expired sessions on a fixed cadence
    /// until shutdown is signaled.
    pub async fn run_cleaner(self: std::sync::Arc<Self>, cadence: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(cadence_secs = cadence.as_secs(), "session cleaner starting");
        let mut ticker = interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first sweep
        // happens a full cadence after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => {
                    info!("session cleaner shutting down");
                    break;
                }
            }
        }
    }
}
