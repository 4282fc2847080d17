//! Inbound WebSocket handling.
//!
//! # Responsibilities
//! - Complete the upgrade handshake with the client
//! - Assign the connection id and hand the client leg to the coordinator
//! - Translate client socket traffic into client-leg events
//! - Write frames and closes requested by the pairing back to the client
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Upstream
//! ```
//!
//! # Design Decisions
//! - One reader loop per client delivers events in socket order
//! - Writes go through a bounded queue to a dedicated writer task; frames
//!   that find it full are dropped
//! - Once the pairing closes the client, the client has
//!   `relay.close_timeout_ms` to answer before the socket is dropped
//! - Ping/pong is answered by the socket layer and never relayed
//! - A client that vanishes without a close frame is reported as 1006

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::http::server::AppState;
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::event::{CloseInfo, FaultInfo, Frame, LegEvent, OpenInfo, CLOSE_NO_STATUS};
use crate::relay::handle::{leg_channel, ClientHandle, LegCommand, LegReceiver, LegSender};

/// The client leg as seen by a pairing.
#[derive(Debug)]
pub struct ClientSocketHandle {
    id: ConnectionId,
    writer: LegSender,
}

impl ClientHandle for ClientSocketHandle {
    fn send(&self, frame: Frame) {
        match self.writer.send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                metrics::record_dropped("upstream_to_client", "backpressure");
                tracing::warn!(
                    connection_id = %self.id,
                    bytes = frame.size_in_bytes(),
                    "Client write queue full, dropping frame"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "Client writer gone, dropping frame");
            }
        }
    }

    fn close(&self, code: u16, reason: &str) {
        self.writer.close(code, reason);
    }
}

/// Upgrade any request path into a relayed WebSocket session.
pub async fn upgrade_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let id = ConnectionId::new();
    let open = OpenInfo {
        uri: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    };

    tracing::debug!(connection_id = %id, peer = %peer, uri = %open.uri, "Upgrading client connection");

    ws.on_failed_upgrade(move |e| {
        tracing::warn!(connection_id = %id, error = %e, "Client upgrade failed");
    })
    .on_upgrade(move |socket| client_session(state, id, peer, open, socket))
}

async fn client_session(
    state: AppState,
    id: ConnectionId,
    peer: SocketAddr,
    open: OpenInfo,
    socket: WebSocket,
) {
    let _guard = state.tracker.track(id);
    let (sink, mut source) = socket.split();
    let close_timeout = Duration::from_millis(state.relay.close_timeout_ms);

    let (writer_tx, writer_rx) = leg_channel(state.relay.write_queue_limit);
    let close_requested = writer_tx.close_signal();
    let mut writer = tokio::spawn(write_client(id, sink, writer_rx));
    let client = ClientSocketHandle {
        id,
        writer: writer_tx,
    };

    let pairing = match state.coordinator.on_new_connection(id, client) {
        Ok(pairing) => pairing,
        Err(e) => {
            tracing::warn!(connection_id = %id, peer = %peer, error = %e, "Client refused");
            if tokio::time::timeout(close_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
            return;
        }
    };

    pairing.on_client_event(LegEvent::Opened(open));

    let mut close_seen = false;
    let mut close_deadline: Option<Instant> = None;
    loop {
        let next = match close_deadline {
            None => tokio::select! {
                message = source.next() => message,
                _ = close_requested.notified() => {
                    close_deadline = Some(Instant::now() + close_timeout);
                    continue;
                }
            },
            Some(deadline) => match tokio::time::timeout_at(deadline, source.next()).await {
                Ok(message) => message,
                Err(_) => {
                    tracing::warn!(
                        connection_id = %id,
                        peer = %peer,
                        timeout = ?close_timeout,
                        "Client did not complete the close handshake, dropping connection"
                    );
                    break;
                }
            },
        };
        let Some(message) = next else {
            break;
        };

        match message {
            Ok(Message::Text(text)) => {
                pairing.on_client_event(LegEvent::Data(Frame::text(text.as_str())));
            }
            Ok(Message::Binary(bytes)) => {
                pairing.on_client_event(LegEvent::Data(Frame::binary(bytes)));
            }
            Ok(Message::Close(frame)) => {
                close_seen = true;
                pairing.on_client_event(LegEvent::Closed(close_info(frame)));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                pairing.on_client_event(LegEvent::Faulted(FaultInfo::new(e.to_string())));
                break;
            }
        }
    }

    if !close_seen {
        pairing.on_client_event(LegEvent::Closed(CloseInfo::abnormal()));
    }

    state.coordinator.release(id);
    drop(pairing);
    if tokio::time::timeout(close_timeout, &mut writer).await.is_err() {
        tracing::debug!(connection_id = %id, "Client writer stalled, aborting");
        writer.abort();
    }
    tracing::debug!(connection_id = %id, peer = %peer, "Client session finished");
}

async fn write_client(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: LegReceiver,
) {
    let mut closing = false;

    while let Some(command) = queue.recv().await {
        let message = match command {
            LegCommand::Send(_) if closing => continue,
            LegCommand::Send(frame) => match frame_to_message(frame) {
                Some(message) => message,
                None => {
                    tracing::warn!(connection_id = %id, "Dropping text frame with invalid UTF-8");
                    continue;
                }
            },
            LegCommand::Close { .. } if closing => continue,
            LegCommand::Close { code, reason } => {
                closing = true;
                close_message(CloseInfo::new(code, reason))
            }
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!(connection_id = %id, error = %e, "Client write failed");
            break;
        }
    }
}

fn close_info(frame: Option<CloseFrame>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo::new(frame.code, frame.reason.as_str()),
        None => CloseInfo::new(CLOSE_NO_STATUS, ""),
    }
}

fn frame_to_message(frame: Frame) -> Option<Message> {
    if frame.is_binary {
        return Some(Message::Binary(frame.bytes));
    }
    String::from_utf8(frame.bytes.to_vec())
        .ok()
        .map(|text| Message::Text(text.into()))
}

fn close_message(close: CloseInfo) -> Message {
    if !close.is_sendable() {
        return Message::Close(None);
    }
    Message::Close(Some(CloseFrame {
        code: close.code,
        reason: close.reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frames_translate_both_ways() {
        let info = close_info(Some(CloseFrame {
            code: 4002,
            reason: "kicked".into(),
        }));
        assert_eq!(info, CloseInfo::new(4002, "kicked"));
        assert_eq!(close_info(None), CloseInfo::new(CLOSE_NO_STATUS, ""));

        match close_message(CloseInfo::new(4002, "kicked")) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 4002);
                assert_eq!(frame.reason.as_str(), "kicked");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(close_message(CloseInfo::abnormal()), Message::Close(None)));
    }

    #[test]
    fn text_and_binary_frames_keep_their_kind() {
        match frame_to_message(Frame::text("hello")) {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected {:?}", other),
        }
        match frame_to_message(Frame::binary(vec![7u8, 8])) {
            Some(Message::Binary(bytes)) => assert_eq!(&bytes[..], &[7u8, 8]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_handle_drops_frames_beyond_the_write_queue() {
        let (writer, mut queue) = leg_channel(1);
        let handle = ClientSocketHandle {
            id: ConnectionId::new(),
            writer,
        };

        handle.send(Frame::text("a"));
        handle.send(Frame::text("b"));
        handle.close(1000, "done");

        assert_eq!(queue.recv().await, Some(LegCommand::Send(Frame::text("a"))));
        assert_eq!(
            queue.recv().await,
            Some(LegCommand::Close {
                code: 1000,
                reason: "done".into()
            })
        );
    }
}
