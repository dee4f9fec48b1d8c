//! Pure backend-selection logic, with session affinity layered on top.

use crate::backend::{Backend, Registry};
use crate::session::SessionTable;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The load-balancing algorithm used when no session affinity applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
}

/// Error raised when no live backend can be chosen.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no healthy backends available")]
    NoHealthyBackend,
}

/// Chooses a backend given an algorithm, a registry snapshot, and session
/// affinity. A pure function of its inputs aside from the round-robin
/// cursor, which is the one piece of state selection must carry across calls.
pub struct Selector {
    algorithm: Algorithm,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Select a backend for a request, honoring session affinity.
    ///
    /// If `session_id` is bound to a live backend, that backend is returned
    /// directly. A binding whose target is missing or dead is deleted and
    /// the algorithm runs fresh; a freshly-chosen backend is then recorded
    /// against `session_id` for subsequent requests.
    pub fn select(
        &self,
        registry: &Registry,
        sessions: &SessionTable,
        session_id: Option<&str>,
    ) -> Result<Arc<Backend>, SelectError> {
        if let Some(session_id) = session_id {
            if let Some(session) = sessions.get(session_id) {
                match registry.lookup(session.backend_key()) {
                    Ok(backend) if backend.is_healthy() => return Ok(backend),
                    _ => sessions.delete(session_id),
                }
            }
        }

        let snapshot = registry.snapshot();
        if snapshot.is_empty() {
            return Err(SelectError::NoHealthyBackend);
        }

        let chosen = match self.algorithm {
            Algorithm::RoundRobin => self.select_round_robin(&snapshot),
            Algorithm::LeastConnections => Self::select_least_connections(&snapshot),
        };

        if let Some(session_id) = session_id {
            sessions.put(session_id, chosen.key());
        }

        Ok(chosen)
    }

    fn select_round_robin(&self, snapshot: &crate::backend::BackendSnapshot) -> Arc<Backend> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        Arc::clone(snapshot.get(idx).expect("idx is within snapshot bounds"))
    }

    fn select_least_connections(snapshot: &crate::backend::BackendSnapshot) -> Arc<Backend> {
        let mut best: Option<&Arc<Backend>> = None;
        let mut best_conns = u32::MAX;
        for backend in snapshot.iter() {
            let conns = backend.active_connections();
            if conns < best_conns {
                best_conns = conns;
                best = Some(backend);
            }
        }
        Arc::clone(best.expect("snapshot is non-empty"))
    }
}
