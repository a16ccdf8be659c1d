//! Prometheus metrics endpoint.

use crate::server::LinkRelay;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns 404 when `http.metrics_enabled` is off.
pub async fn metrics_handler(Extension(relay): Extension<Arc<LinkRelay>>) -> Response {
    if !relay.config().http.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let m = relay.metrics();

    // Gauges
    let connections = relay.total_connections();

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let rejections = m.handshake_rejections.load(Ordering::Relaxed);
    let frames = m.frames_received.load(Ordering::Relaxed);
    let malformed = m.malformed_frames.load(Ordering::Relaxed);
    let forwarded = m.messages_forwarded.load(Ordering::Relaxed);
    let dropped = m.messages_dropped.load(Ordering::Relaxed);
    let routing_errors = m.routing_errors.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    // Storage stats (best effort)
    let devices = relay.storage().total_devices().await.unwrap_or(0);
    let pairings = relay.storage().total_pairings().await.unwrap_or(0);
    let codes = relay.storage().active_codes().await.unwrap_or(0);

    let body = format!(
        r#"# HELP kinlink_relay_connections_active Number of registered connections
# TYPE kinlink_relay_connections_active gauge
kinlink_relay_connections_active {connections}

# HELP kinlink_relay_info Server information
# TYPE kinlink_relay_info gauge
kinlink_relay_info{{version="{version}"}} 1

# HELP kinlink_relay_connections_total Total connections accepted
# TYPE kinlink_relay_connections_total counter
kinlink_relay_connections_total {conns_total}

# HELP kinlink_relay_handshake_rejections_total Connection attempts refused at handshake
# TYPE kinlink_relay_handshake_rejections_total counter
kinlink_relay_handshake_rejections_total {rejections}

# HELP kinlink_relay_frames_received_total Data frames read from devices
# TYPE kinlink_relay_frames_received_total counter
kinlink_relay_frames_received_total {frames}

# HELP kinlink_relay_malformed_frames_total Frames that were not a JSON object
# TYPE kinlink_relay_malformed_frames_total counter
kinlink_relay_malformed_frames_total {malformed}

# HELP kinlink_relay_messages_forwarded_total Envelopes delivered to a recipient
# TYPE kinlink_relay_messages_forwarded_total counter
kinlink_relay_messages_forwarded_total {forwarded}

# HELP kinlink_relay_messages_dropped_total Envelopes lost to a recipient closing mid-send
# TYPE kinlink_relay_messages_dropped_total counter
kinlink_relay_messages_dropped_total {dropped}

# HELP kinlink_relay_routing_errors_total Envelopes bounced back with an error
# TYPE kinlink_relay_routing_errors_total counter
kinlink_relay_routing_errors_total {routing_errors}

# HELP kinlink_relay_rate_limit_hits_total Total rate limit rejections
# TYPE kinlink_relay_rate_limit_hits_total counter
kinlink_relay_rate_limit_hits_total {rate_limits}

# HELP kinlink_relay_devices Registered devices
# TYPE kinlink_relay_devices gauge
kinlink_relay_devices {devices}

# HELP kinlink_relay_pairings Guardian/elder pairings
# TYPE kinlink_relay_pairings gauge
kinlink_relay_pairings {pairings}

# HELP kinlink_relay_pairing_codes_active Pairing codes that can still be redeemed
# TYPE kinlink_relay_pairing_codes_active gauge
kinlink_relay_pairing_codes_active {codes}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
