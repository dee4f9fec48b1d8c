//! Shared balancer state: the handle threaded through every request and
//! background task.

use crate::backend::{Algorithm, Registry, Selector};
use crate::metrics::MetricsCollector;
use crate::session::SessionTable;
use std::sync::Arc;

/// Everything a request handler or background task needs: the backend pool,
/// the session table, the selection algorithm, and ambient collaborators.
///
/// The pool is mutated in place through the management surface, so there is
/// no reloadable configuration snapshot to hold here.
#[derive(Clone)]
pub struct Balancer {
    registry: Arc<Registry>,
    sessions: Arc<SessionTable>,
    selector: Arc<Selector>,
    metrics: MetricsCollector,
}

impl Balancer {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionTable>,
        algorithm: Algorithm,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            sessions,
            selector: Arc::new(Selector::new(algorithm)),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}
