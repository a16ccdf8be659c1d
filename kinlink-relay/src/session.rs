//! Per-connection session management.
//!
//! A Session turns a raw connection into a registered, addressable device
//! and feeds its frames to the router one at a time. It is written against
//! [`InboundFrame`] streams and [`ConnectionHandle`]s rather than a socket
//! type; `http::ws` adapts WebSockets onto it.

use crate::connection::{
    unix_millis, ConnectionHandle, InboundFrame, OutboundFrame, CLOSE_GOING_AWAY,
};
use crate::error::{HandshakeRejection, RouteError};
use crate::router::{reply_error, Peer};
use crate::server::LinkRelay;
use futures_util::{Stream, StreamExt};
use kinlink_types::{DeviceId, Envelope, Role, ServerMessage};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Identity claims from the connection's query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeParams {
    /// Claimed device identifier.
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    /// Claimed role (`guardian` or `elder`).
    #[serde(rename = "type")]
    pub role: Option<String>,
}

impl HandshakeParams {
    /// Build params from raw values.
    pub fn new(device_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            role: Some(role.into()),
        }
    }

    /// Check both claims are present and the role is known.
    pub fn validate(&self) -> Result<(DeviceId, Role), HandshakeRejection> {
        let present = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let (Some(device_id), Some(role)) = (present(&self.device_id), present(&self.role)) else {
            return Err(HandshakeRejection::MissingIdentity);
        };

        let role: Role = role.parse().map_err(|_| HandshakeRejection::InvalidRole)?;
        let device_id = DeviceId::new(device_id).map_err(|_| HandshakeRejection::MissingIdentity)?;
        Ok((device_id, role))
    }
}

/// A registered connection.
pub struct Session {
    relay: Arc<LinkRelay>,
    peer: Peer,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("peer", &self.peer).finish()
    }
}

impl Session {
    /// Validate a connection attempt and register it.
    ///
    /// On success the returned receiver already holds the `CONNECTION_ACK`
    /// frame; the caller's writer must drain it onto the socket. On failure
    /// nothing was registered.
    pub fn accept(
        relay: Arc<LinkRelay>,
        params: &HandshakeParams,
    ) -> Result<(Self, UnboundedReceiver<OutboundFrame>), HandshakeRejection> {
        let admitted = Self::admit(&relay, params)
            .and_then(|(device_id, role)| Self::register(&relay, device_id, role));

        match admitted {
            Ok((peer, outbound)) => Ok((Self { relay, peer }, outbound)),
            Err(rejection) => {
                relay
                    .metrics()
                    .handshake_rejections
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Rejected connection (deviceId={:?}, type={:?}): {}",
                    params.device_id,
                    params.role,
                    rejection
                );
                Err(rejection)
            }
        }
    }

    fn admit(
        relay: &LinkRelay,
        params: &HandshakeParams,
    ) -> Result<(DeviceId, Role), HandshakeRejection> {
        let (device_id, role) = params.validate()?;

        if relay.rate_limits().check_connection(device_id.as_str()).is_err() {
            relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            return Err(HandshakeRejection::RateLimited);
        }

        Ok((device_id, role))
    }

    fn register(
        relay: &LinkRelay,
        device_id: DeviceId,
        role: Role,
    ) -> Result<(Peer, UnboundedReceiver<OutboundFrame>), HandshakeRejection> {
        let (handle, outbound) = ConnectionHandle::channel();

        // Queued before registration so it is always the first frame out.
        let ack = ServerMessage::ack(device_id.clone(), unix_millis());
        if let Err(e) = handle.send_message(&ack) {
            tracing::debug!("Could not queue ack for {}: {}", device_id, e);
        }

        let max = relay.config().limits.max_connections;
        let previous = relay
            .registry()
            .try_register(device_id.clone(), role, handle.clone(), max)
            .map_err(|_| HandshakeRejection::AtCapacity)?;

        if let Some(previous) = previous {
            tracing::warn!(
                "Device {} reconnected; {} replaced by {} and left open",
                device_id,
                previous.handle.id(),
                handle.id()
            );
        }
        relay.metrics().connections_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Device {} connected as {} ({})", device_id, role, handle.id());

        let peer = Peer {
            device_id,
            role,
            handle,
        };
        Ok((peer, outbound))
    }

    /// The device this session serves.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Process inbound frames until the peer closes, the stream ends, or
    /// the relay shuts down, then unregister.
    pub async fn run<S, E>(self, inbound: S)
    where
        S: Stream<Item = Result<InboundFrame, E>>,
        E: Display,
    {
        futures_util::pin_mut!(inbound);
        let mut shutdown = self.relay.shutdown_signal();
        let max_errors = self.relay.config().limits.max_transport_errors.max(1);
        let mut consecutive_errors = 0u32;

        if *shutdown.borrow_and_update() {
            self.close_going_away();
            self.close();
            return;
        }

        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(frame)) => {
                        consecutive_errors = 0;
                        if !self.handle_frame(frame).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        consecutive_errors += 1;
                        tracing::warn!("Transport error on {}: {}", self.peer.device_id, e);
                        if consecutive_errors >= max_errors {
                            tracing::warn!(
                                "Giving up on {} after {} transport errors",
                                self.peer.device_id,
                                consecutive_errors
                            );
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.close_going_away();
                    break;
                }
            }
        }

        self.close();
    }

    fn close_going_away(&self) {
        if let Err(e) = self.peer.handle.close(CLOSE_GOING_AWAY, "Server shutting down") {
            tracing::debug!("Could not send close to {}: {}", self.peer.device_id, e);
        }
    }

    /// Returns false when the peer asked to close.
    async fn handle_frame(&self, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::Text(text) => {
                self.relay.metrics().frames_received.fetch_add(1, Ordering::Relaxed);
                self.handle_text(&text).await;
            }
            InboundFrame::Binary(bytes) => {
                self.relay.metrics().frames_received.fetch_add(1, Ordering::Relaxed);
                match String::from_utf8(bytes) {
                    Ok(text) => self.handle_text(&text).await,
                    Err(_) => self.reject_malformed("binary frame is not UTF-8"),
                }
            }
            InboundFrame::Ping => {}
            InboundFrame::Close => return false,
        }
        true
    }

    async fn handle_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.relay.router().route(&self.peer, envelope).await,
            Err(e) => self.reject_malformed(e),
        }
    }

    fn reject_malformed(&self, reason: impl Display) {
        self.relay.metrics().malformed_frames.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Malformed frame from {}: {}", self.peer.device_id, reason);
        reply_error(&self.peer, &RouteError::InvalidFormat, None);
    }

    /// Unregister this connection. Consumes the session so it runs once.
    fn close(self) {
        let removed = self
            .relay
            .registry()
            .unregister_connection(&self.peer.device_id, self.peer.handle.id());
        if removed {
            tracing::info!("Device {} disconnected ({})", self.peer.device_id, self.peer.handle.id());
        } else {
            tracing::info!(
                "Device {} disconnected ({}, already superseded)",
                self.peer.device_id,
                self.peer.handle.id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStorage;
    use futures_util::stream;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    type FrameTx = mpsc::UnboundedSender<Result<InboundFrame, String>>;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    async fn relay_with(config: Config) -> Arc<LinkRelay> {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.register_device(&id("g1"), Role::Guardian).await.unwrap();
        storage.register_device(&id("e1"), Role::Elder).await.unwrap();
        let code = storage
            .issue_code(&id("e1"), Duration::from_secs(60))
            .await
            .unwrap()
            .code;
        storage.redeem_code(&id("g1"), &code).await.unwrap();
        Arc::new(LinkRelay::new(config, storage))
    }

    async fn paired_relay() -> Arc<LinkRelay> {
        relay_with(Config::default()).await
    }

    /// Accept and run a session fed by a channel.
    fn start(
        relay: &Arc<LinkRelay>,
        device: &str,
        role: &str,
    ) -> (FrameTx, UnboundedReceiver<OutboundFrame>, JoinHandle<()>) {
        let (session, outbound) =
            Session::accept(relay.clone(), &HandshakeParams::new(device, role)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let task = tokio::spawn(session.run(inbound));
        (tx, outbound, task)
    }

    async fn next_json(rx: &mut UnboundedReceiver<OutboundFrame>) -> Value {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(OutboundFrame::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    fn text(value: Value) -> Result<InboundFrame, String> {
        Ok(InboundFrame::Text(value.to_string()))
    }

    #[test]
    fn validate_requires_both_claims() {
        let cases = [
            HandshakeParams::default(),
            HandshakeParams {
                device_id: Some("e1".into()),
                role: None,
            },
            HandshakeParams {
                device_id: None,
                role: Some("elder".into()),
            },
            HandshakeParams::new("", "elder"),
            HandshakeParams::new("e1", ""),
        ];
        for params in cases {
            assert_eq!(params.validate(), Err(HandshakeRejection::MissingIdentity));
        }
    }

    #[test]
    fn validate_rejects_unknown_role() {
        assert_eq!(
            HandshakeParams::new("e1", "admin").validate(),
            Err(HandshakeRejection::InvalidRole)
        );
        assert_eq!(
            HandshakeParams::new("e1", "elder").validate(),
            Ok((id("e1"), Role::Elder))
        );
    }

    #[test]
    fn params_deserialize_from_query_names() {
        let params: HandshakeParams =
            serde_json::from_value(json!({"deviceId": "g1", "type": "guardian"})).unwrap();
        assert_eq!(params.validate(), Ok((id("g1"), Role::Guardian)));
    }

    #[tokio::test]
    async fn rejected_handshake_never_registers() {
        let relay = paired_relay().await;

        let err = Session::accept(relay.clone(), &HandshakeParams::new("e1", "nurse")).unwrap_err();
        assert_eq!(err, HandshakeRejection::InvalidRole);
        assert_eq!(relay.total_connections(), 0);
        assert_eq!(relay.metrics().handshake_rejections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn accept_registers_and_acks_first() {
        let relay = paired_relay().await;
        let before = unix_millis();
        let (session, mut outbound) =
            Session::accept(relay.clone(), &HandshakeParams::new("e1", "elder")).unwrap();

        assert_eq!(session.peer().role, Role::Elder);
        let record = relay.registry().lookup(&id("e1")).unwrap();
        assert_eq!(record.handle.id(), session.peer().handle.id());

        let ack = next_json(&mut outbound).await;
        assert_eq!(ack["type"], "CONNECTION_ACK");
        assert_eq!(ack["deviceId"], "e1");
        assert!(ack["timestamp"].as_u64().unwrap() >= before);
    }

    #[tokio::test]
    async fn paired_devices_exchange_messages() {
        let relay = paired_relay().await;
        let (e_tx, mut e_out, _e_task) = start(&relay, "e1", "elder");
        let (g_tx, mut g_out, _g_task) = start(&relay, "g1", "guardian");
        next_json(&mut e_out).await;
        next_json(&mut g_out).await;

        g_tx.send(text(json!({"type": "CHECK_IN", "to": "e1", "payload": "hi"})))
            .unwrap();
        let got = next_json(&mut e_out).await;
        assert_eq!(got["from"], "g1");
        assert_eq!(got["payload"], "hi");

        e_tx.send(text(json!({"type": "REPLY", "to": "g1", "payload": "fine"})))
            .unwrap();
        let got = next_json(&mut g_out).await;
        assert_eq!(got["from"], "e1");
        assert_eq!(got["payload"], "fine");
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let relay = paired_relay().await;
        let (_e_tx, mut e_out, _e_task) = start(&relay, "e1", "elder");
        let (g_tx, mut g_out, _g_task) = start(&relay, "g1", "guardian");
        next_json(&mut e_out).await;
        next_json(&mut g_out).await;

        g_tx.send(Ok(InboundFrame::Text("{not json".into()))).unwrap();
        let reply = next_json(&mut g_out).await;
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["error"], "Invalid message format");
        assert!(reply.get("requestId").is_none());

        g_tx.send(Ok(InboundFrame::Binary(vec![0xff, 0xfe]))).unwrap();
        assert_eq!(next_json(&mut g_out).await["error"], "Invalid message format");

        g_tx.send(Ok(InboundFrame::Binary(
            json!({"type": "PING", "to": "e1"}).to_string().into_bytes(),
        )))
        .unwrap();
        assert_eq!(next_json(&mut e_out).await["type"], "PING");
        assert_eq!(relay.metrics().malformed_frames.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn close_frame_unregisters() {
        let relay = paired_relay().await;
        let (tx, _out, task) = start(&relay, "e1", "elder");
        assert_eq!(relay.total_connections(), 1);

        tx.send(Ok(InboundFrame::Close)).unwrap();
        // A second close signal from the transport is ignored.
        let _ = tx.send(Ok(InboundFrame::Close));
        task.await.unwrap();

        assert_eq!(relay.total_connections(), 0);
    }

    #[tokio::test]
    async fn stream_end_unregisters() {
        let relay = paired_relay().await;
        let (tx, _out, task) = start(&relay, "e1", "elder");

        drop(tx);
        task.await.unwrap();

        assert!(relay.registry().lookup(&id("e1")).is_none());
    }

    #[tokio::test]
    async fn transport_error_does_not_close() {
        let relay = paired_relay().await;
        let (_e_tx, mut e_out, _e_task) = start(&relay, "e1", "elder");
        let (g_tx, mut g_out, g_task) = start(&relay, "g1", "guardian");
        next_json(&mut e_out).await;
        next_json(&mut g_out).await;

        g_tx.send(Err("connection reset".into())).unwrap();
        g_tx.send(text(json!({"type": "PING", "to": "e1"}))).unwrap();

        assert_eq!(next_json(&mut e_out).await["type"], "PING");
        assert!(!g_task.is_finished());
        assert!(relay.registry().lookup(&id("g1")).is_some());
    }

    #[tokio::test]
    async fn repeated_transport_errors_end_the_session() {
        let mut config = Config::default();
        config.limits.max_transport_errors = 3;
        let relay = relay_with(config).await;
        let (tx, _out, task) = start(&relay, "g1", "guardian");

        // A good frame in between resets the run.
        tx.send(Err("broken pipe".into())).unwrap();
        tx.send(Err("broken pipe".into())).unwrap();
        tx.send(Ok(InboundFrame::Ping)).unwrap();
        tx.send(Err("broken pipe".into())).unwrap();
        tx.send(Err("broken pipe".into())).unwrap();
        tokio::task::yield_now().await;
        assert!(relay.registry().lookup(&id("g1")).is_some());

        tx.send(Err("broken pipe".into())).unwrap();
        task.await.unwrap();

        assert_eq!(relay.total_connections(), 0);
    }

    #[tokio::test]
    async fn superseded_session_does_not_evict_replacement() {
        let relay = paired_relay().await;
        let (old_tx, _old_out, old_task) = start(&relay, "e1", "elder");
        let (_new_tx, mut new_out, _new_task) = start(&relay, "e1", "elder");
        next_json(&mut new_out).await;

        old_tx.send(Ok(InboundFrame::Close)).unwrap();
        old_task.await.unwrap();

        assert_eq!(relay.total_connections(), 1);

        let (g_tx, mut g_out, _g_task) = start(&relay, "g1", "guardian");
        next_json(&mut g_out).await;
        g_tx.send(text(json!({"type": "PING", "to": "e1"}))).unwrap();
        assert_eq!(next_json(&mut new_out).await["type"], "PING");
    }

    #[tokio::test]
    async fn shutdown_closes_and_unregisters() {
        let relay = paired_relay().await;
        let (_tx, mut out, task) = start(&relay, "e1", "elder");
        next_json(&mut out).await;

        relay.shutdown();
        task.await.unwrap();

        assert_eq!(relay.total_connections(), 0);
        assert!(matches!(
            out.recv().await,
            Some(OutboundFrame::Close { code: CLOSE_GOING_AWAY, .. })
        ));
    }

    #[tokio::test]
    async fn connection_attempts_are_rate_limited() {
        let mut config = Config::default();
        config.limits.connections_per_minute = 1;
        let relay = relay_with(config).await;

        let _first = Session::accept(relay.clone(), &HandshakeParams::new("e1", "elder")).unwrap();
        let err = Session::accept(relay.clone(), &HandshakeParams::new("e1", "elder")).unwrap_err();

        assert_eq!(err, HandshakeRejection::RateLimited);
        assert_eq!(relay.metrics().rate_limit_hits.load(Ordering::Relaxed), 1);
        // Other devices have their own budget.
        assert!(Session::accept(relay.clone(), &HandshakeParams::new("g1", "guardian")).is_ok());
    }

    #[tokio::test]
    async fn capacity_limit_spares_reconnects() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let relay = relay_with(config).await;

        let _first = Session::accept(relay.clone(), &HandshakeParams::new("e1", "elder")).unwrap();
        let err = Session::accept(relay.clone(), &HandshakeParams::new("g1", "guardian")).unwrap_err();
        assert_eq!(err, HandshakeRejection::AtCapacity);

        assert!(Session::accept(relay.clone(), &HandshakeParams::new("e1", "elder")).is_ok());
        assert_eq!(relay.total_connections(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_handshakes_respect_capacity() {
        const ATTEMPTS: usize = 16;
        let mut config = Config::default();
        config.limits.max_connections = 1;

        for _ in 0..20 {
            let relay = relay_with(config.clone()).await;
            let barrier = Arc::new(std::sync::Barrier::new(ATTEMPTS));

            let threads: Vec<_> = (0..ATTEMPTS)
                .map(|i| {
                    let relay = relay.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        Session::accept(relay, &HandshakeParams::new(format!("d{}", i), "elder"))
                            .map(|(session, outbound)| (session.peer().handle.id(), outbound))
                    })
                })
                .collect();

            let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
            let admitted = results.iter().filter(|r| r.is_ok()).count();
            let refused = results
                .iter()
                .filter(|r| matches!(r, Err(HandshakeRejection::AtCapacity)))
                .count();

            assert_eq!(admitted, 1);
            assert_eq!(refused, ATTEMPTS - 1);
            assert_eq!(relay.total_connections(), 1);
        }
    }
}
