//! Prometheus metrics
//!
//! Node-level operational signals, exposed on `GET /metrics` for
//! scraping. Per-user traffic accounting lives in the stats registry
//! (the panel reads it through the controller), not here.

use std::net::SocketAddr;

use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Dispatcher ===

    /// Connections entering dispatch
    pub static ref DISPATCH_TOTAL: IntCounter = IntCounter::new(
        "nodium_dispatch_total",
        "Connections entering dispatch"
    ).unwrap();

    /// Connections denied by a detect rule
    pub static ref DISPATCH_RULE_REJECTS: IntCounter = IntCounter::new(
        "nodium_dispatch_rule_rejects_total",
        "Connections denied by a detect rule"
    ).unwrap();

    /// Connections torn down by the device cap
    pub static ref DISPATCH_DEVICE_REJECTS: IntCounter = IntCounter::new(
        "nodium_dispatch_device_rejects_total",
        "Connections torn down by the per-user device cap"
    ).unwrap();

    /// Connections dropped for want of an outbound handler
    pub static ref DISPATCH_NO_HANDLER: IntCounter = IntCounter::new(
        "nodium_dispatch_no_handler_total",
        "Connections dropped because no outbound handler exists"
    ).unwrap();

    /// Successful sniff classifications per protocol
    pub static ref SNIFF_RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodium_sniff_results_total", "Successful sniff classifications"),
        &["protocol"]
    ).unwrap();

    // === Controller ===

    /// Failed reconciliation ticks per periodic task
    pub static ref CONTROLLER_TICK_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("nodium_controller_tick_failures_total", "Failed reconciliation ticks"),
        &["task"]
    ).unwrap();

    /// Reports submitted to the panel per kind
    pub static ref CONTROLLER_REPORTS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodium_controller_reports_total", "Reports submitted to the panel"),
        &["kind"]
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call more
/// than once; duplicate registrations are ignored.
pub fn init_metrics() {
    REGISTRY.register(Box::new(DISPATCH_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DISPATCH_RULE_REJECTS.clone())).ok();
    REGISTRY.register(Box::new(DISPATCH_DEVICE_REJECTS.clone())).ok();
    REGISTRY.register(Box::new(DISPATCH_NO_HANDLER.clone())).ok();
    REGISTRY.register(Box::new(SNIFF_RESULTS.clone())).ok();
    REGISTRY.register(Box::new(CONTROLLER_TICK_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(CONTROLLER_REPORTS.clone())).ok();
}

/// Render every registered metric in the Prometheus text format.
fn render_metrics() -> std::result::Result<Vec<u8>, prometheus::Error> {
    let mut body = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut body)?;
    Ok(body)
}

/// A scrape that fails to encode answers 500 instead of taking the
/// handler down; the cause lands in the log.
async fn get_metrics() -> Response {
    match render_metrics() {
        Ok(body) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!("failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `GET /metrics` until the shutdown token fires. Bind and serve
/// failures propagate to the caller.
pub async fn serve_metrics(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    init_metrics();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics listening on http://{}/metrics", addr);

    let routes = Router::new().route("/metrics", get(get_metrics));
    axum::serve(listener, routes)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("metrics server stopped");
    Ok(())
}
