//! `/lb/stats` response shape.

use crate::backend::Algorithm;
use crate::state::Balancer;
use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub algorithm: Algorithm,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub active_sessions: usize,
    pub servers: HashMap<String, ServerStats>,
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub host: String,
    pub port: u16,
    pub is_healthy: bool,
    pub active_connections: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: String,
    pub avg_response_time: String,
    pub last_health_check: Option<String>,
}

/// Build the current stats snapshot from the balancer's live state.
pub fn build_stats(balancer: &Balancer) -> StatsResponse {
    let registry = balancer.registry();
    let servers = registry
        .all()
        .into_iter()
        .map(|backend| {
            let stats = ServerStats {
                host: backend.host().to_string(),
                port: backend.port(),
                is_healthy: backend.is_healthy(),
                active_connections: backend.active_connections(),
                total_requests: backend.total_requests(),
                total_errors: backend.total_errors(),
                error_rate: format!("{:.2}%", backend.error_rate() * 100.0),
                avg_response_time: format!("{:.3}s", backend.avg_response_time()),
                last_health_check: backend.last_health_check().map(format_rfc3339),
            };
            (backend.key().to_string(), stats)
        })
        .collect();

    StatsResponse {
        algorithm: balancer.selector().algorithm(),
        total_servers: registry.total_count(),
        healthy_servers: registry.healthy_count(),
        active_sessions: balancer.sessions().len(),
        servers,
    }
}

fn format_rfc3339(at: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(at).to_rfc3339()
}
