//! WebSocket transport for device sessions.

use crate::connection::{InboundFrame, OutboundFrame};
use crate::server::LinkRelay;
use crate::session::{HandshakeParams, Session};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::Response;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// How long the writer gets to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws?deviceId=..&type=..`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    Extension(relay): Extension<Arc<LinkRelay>>,
) -> Response {
    let max_size = relay.config().limits.max_frame_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, relay, params))
}

async fn handle_socket(socket: WebSocket, relay: Arc<LinkRelay>, params: HandshakeParams) {
    let (mut sink, stream) = socket.split();

    let (session, outbound) = match Session::accept(relay, &params) {
        Ok(accepted) => accepted,
        Err(rejection) => {
            let frame = CloseFrame {
                code: rejection.close_code(),
                reason: rejection.to_string().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let mut writer = tokio::spawn(write_outbound(sink, outbound));

    session
        .run(stream.map(|message| message.map(inbound_frame)))
        .await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

/// Drain a connection's outbound queue onto the socket.
///
/// Ends when every handle is dropped, after a close frame, or when the
/// socket stops accepting writes. Either way the receiver is dropped, so
/// later sends on the handle fail.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

fn inbound_frame(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Text(text),
        Message::Binary(bytes) => InboundFrame::Binary(bytes),
        Message::Ping(_) | Message::Pong(_) => InboundFrame::Ping,
        Message::Close(_) => InboundFrame::Close,
    }
}
