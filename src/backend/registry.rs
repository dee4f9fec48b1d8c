//! Backend registry.
//!
//! The authoritative map from backend identity to its statistics record.
//! All selection, forwarding, and probing code reads and writes through it.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum number of response-time samples kept per backend.
const RESPONSE_TIME_CAPACITY: usize = 100;

/// Errors raised by [`Registry`] mutators.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Removal was rejected because it would leave the pool empty.
    #[error("cannot remove the last backend in the pool")]
    LastBackend,

    /// Lookup found no backend with the given key.
    #[error("no backend registered for '{0}'")]
    NotFound(String),
}

/// A single upstream origin server and its live statistics.
#[derive(Debug)]
pub struct Backend {
    host: String,
    port: u16,
    key: String,
    healthy: AtomicBool,
    active_connections: AtomicU32,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    response_times: Mutex<VecDeque<f64>>,
    last_health_check: Mutex<Option<SystemTime>>,
}

impl Backend {
    fn new(host: String, port: u16) -> Self {
        let key = format!("{host}:{port}");
        Self {
            host,
            port,
            key,
            healthy: AtomicBool::new(true),
            active_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(RESPONSE_TIME_CAPACITY)),
            last_health_check: Mutex::new(None),
        }
    }

    /// The canonical `"host:port"` key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set liveness, logging on a state transition.
    pub fn set_healthy(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        if previous != healthy {
            if healthy {
                info!(backend = %self.key, "backend marked healthy");
            } else {
                warn!(backend = %self.key, "backend marked unhealthy");
            }
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_active(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decr_active(&self) {
        // Never allow the counter to wrap below zero even under a
        // mis-paired increment/decrement.
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    None
                } else {
                    Some(current - 1)
                }
            });
    }

    pub(crate) fn incr_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_errors(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Append a response-time sample (seconds), evicting the oldest on overflow.
    pub fn record_response_time(&self, seconds: f64) {
        let mut samples = self.response_times.lock();
        if samples.len() >= RESPONSE_TIME_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(seconds);
    }

    pub fn avg_response_time(&self) -> f64 {
        let samples = self.response_times.lock();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.total_errors() as f64 / total as f64
        }
    }

    pub fn set_last_health_check(&self, at: SystemTime) {
        *self.last_health_check.lock() = Some(at);
    }

    pub fn last_health_check(&self) -> Option<SystemTime> {
        *self.last_health_check.lock()
    }
}

/// A point-in-time, owned view of the live backends, in registration order.
///
/// Values, not references: iterating a snapshot never blocks a concurrent
/// registration or deregistration.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    live: Vec<Arc<Backend>>,
}

impl BackendSnapshot {
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.live.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.live.iter()
    }
}

/// The authoritative backend pool.
///
/// Registration order is tracked separately from the `DashMap` because maps
/// make no iteration-order guarantee and round-robin fairness depends on a
/// stable order.
pub struct Registry {
    backends: dashmap::DashMap<String, Arc<Backend>>,
    order: RwLock<Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            backends: dashmap::DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend. Idempotent: a no-op if the key already exists.
    pub fn register(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        let key = format!("{host}:{port}");

        if self.backends.contains_key(&key) {
            debug!(backend = %key, "register: already present, ignoring");
            return;
        }

        let mut order = self.order.write();
        // Re-check under the write lock in case of a racing registration.
        if self.backends.contains_key(&key) {
            return;
        }
        self.backends
            .insert(key.clone(), Arc::new(Backend::new(host, port)));
        order.push(key.clone());
        info!(backend = %key, "backend registered");
    }

    /// Remove a backend. Unknown keys are a no-op success. Rejects removal
    /// that would leave the pool empty.
    pub fn deregister(&self, host: &str, port: u16) -> Result<(), BackendError> {
        let key = format!("{host}:{port}");

        let mut order = self.order.write();
        if !self.backends.contains_key(&key) {
            return Ok(());
        }
        if order.len() <= 1 {
            warn!(backend = %key, "refusing to remove the last backend");
            return Err(BackendError::LastBackend);
        }

        self.backends.remove(&key);
        order.retain(|k| k != &key);
        info!(backend = %key, "backend deregistered");
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<Backend>, BackendError> {
        self.backends
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    /// All registered backends (live and dead), in registration order.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        let order = self.order.read();
        order
            .iter()
            .filter_map(|key| self.backends.get(key).map(|e| Arc::clone(e.value())))
            .collect()
    }

    /// A stable snapshot of the currently-live backends, in registration order.
    pub fn snapshot(&self) -> BackendSnapshot {
        let live = self
            .all()
            .into_iter()
            .filter(|backend| backend.is_healthy())
            .collect();
        BackendSnapshot { live }
    }

    pub fn total_count(&self) -> usize {
        self.order.read().len()
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
