//! HTTP endpoints for kinlink-relay.
//!
//! Serves the device WebSocket, health checks, metrics, and the pairing API.

mod api;
pub mod health;
mod metrics;
mod ws;

use crate::error::Result;
use crate::server::LinkRelay;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

pub use api::ApiError;
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<LinkRelay>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/devices", post(api::register_device))
        .route("/api/pairing/codes", post(api::issue_code))
        .route("/api/pairing/redeem", post(api::redeem_code))
        .route("/api/pairings/:device_id", get(api::list_pairings))
        .route(
            "/api/pairings/:guardian_id/:elder_id",
            delete(api::remove_pairing),
        )
        .layer(Extension(relay))
}

/// Serve the relay on `listener` until [`LinkRelay::shutdown`] is called.
pub async fn serve(listener: TcpListener, relay: Arc<LinkRelay>) -> Result<()> {
    let mut shutdown = relay.shutdown_signal();
    let app = build_router(relay);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;
    Ok(())
}
