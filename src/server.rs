//! Health and metrics HTTP listeners
//!
//! Two small axum routers: the health listener answers `/healthz` and
//! `/readyz`, the metrics listener encodes the default Prometheus registry
//! at `/metrics`. Non-leaders serve both and report `is_leader=0`; a healthy
//! follower whose election loop is running counts as ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::info;

use crate::leader::ElectionHeartbeat;
use crate::{Error, Result};

/// Shared process health state feeding the health endpoints
pub struct HealthState {
    healthy: AtomicBool,
    synced: AtomicBool,
    leader: AtomicBool,
    first_tick_done: AtomicBool,
    heartbeat: ElectionHeartbeat,
    lease_duration_secs: u64,
}

impl HealthState {
    /// Create the state shared between the runtime and the listeners
    pub fn new(lease_duration_secs: u64, heartbeat: ElectionHeartbeat) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            synced: AtomicBool::new(false),
            leader: AtomicBool::new(false),
            first_tick_done: AtomicBool::new(false),
            heartbeat,
            lease_duration_secs,
        }
    }

    /// Whether the process considers itself live
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Mark the pool watcher as having delivered its initial state
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Record a leadership transition
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
        if !leader {
            // A new leadership term starts from scratch.
            self.first_tick_done.store(false, Ordering::SeqCst);
            self.synced.store(false, Ordering::SeqCst);
        }
    }

    /// Whether this replica currently leads
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Record that a reconcile tick completed this term
    pub fn set_first_tick_done(&self) {
        self.first_tick_done.store(true, Ordering::SeqCst);
    }

    /// Readiness verdict with a reason for the probe body
    ///
    /// Every healthy replica whose election loop heartbeats is ready;
    /// followers run the same lease loop as the leader, so they count as
    /// serving replicas during rollouts. The leader additionally needs its
    /// pool watcher synced and one completed tick before it may report
    /// ready.
    pub fn readiness(&self) -> std::result::Result<(), &'static str> {
        if !self.is_healthy() {
            return Err("unhealthy");
        }
        let stall_window = 2 * self.lease_duration_secs.max(5) as i64;
        if !self.heartbeat.fresh_within(stall_window) {
            return Err("election-loop-stalled");
        }
        if self.leader.load(Ordering::SeqCst) {
            if !self.synced.load(Ordering::SeqCst) {
                return Err("not-synced");
            }
            if !self.first_tick_done.load(Ordering::SeqCst) {
                return Err("awaiting-first-tick");
            }
        }
        Ok(())
    }
}

async fn healthz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    match state.readiness() {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
    }
}

async fn metrics_handler() -> std::result::Result<(StatusCode, String), StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let body = String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok((StatusCode::OK, body))
}

/// Router serving `/healthz` and `/readyz`
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Router serving `/metrics`
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve the health endpoints until the process exits
pub async fn run_health_server(port: u16, state: Arc<HealthState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::internal("server", format!("binding health listener: {e}")))?;
    info!(port, "health server listening");
    axum::serve(listener, health_router(state))
        .await
        .map_err(|e| Error::internal("server", format!("health server: {e}")))
}

/// Serve the metrics endpoint until the process exits
pub async fn run_metrics_server(port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::internal("server", format!("binding metrics listener: {e}")))?;
    info!(port, "metrics server listening");
    axum::serve(listener, metrics_router())
        .await
        .map_err(|e| Error::internal("server", format!("metrics server: {e}")))
}
