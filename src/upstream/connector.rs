//! Outbound WebSocket legs over tokio-tungstenite.
//!
//! Each started handle owns one task that connects (with timeout and
//! backoff), reports `Opened`, then multiplexes upstream reads with the
//! pairing's queued sends and closes until the socket ends. Once a close is
//! requested the upstream has `close_timeout` to finish the handshake before
//! the socket is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{RelayConfig, UpstreamConfig};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::relay::event::{
    CloseInfo, FaultInfo, Frame, LegEvent, OpenInfo, CLOSE_GOING_AWAY, CLOSE_NO_STATUS,
};
use crate::relay::handle::{
    leg_channel, Connector, EventSink, LegCommand, LegReceiver, LegSender, OutboundHandle,
};
use crate::resilience::backoff::calculate_backoff;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

impl UpstreamError {
    /// Status of a rejected upgrade response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            UpstreamError::WebSocket(tungstenite::Error::Http(response)) => {
                Some(response.status().as_u16())
            }
            _ => None,
        }
    }
}

/// Connect and teardown limits for outbound legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub connect_timeout: Duration,
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Wait for the upstream's close reply before dropping the socket.
    pub close_timeout: Duration,
    /// Frames queued for the upstream socket before new ones are dropped.
    pub write_queue_limit: usize,
}

impl ConnectPolicy {
    pub fn from_config(upstream: &UpstreamConfig, relay: &RelayConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(upstream.connect_timeout_secs),
            retries: upstream.connect_retries,
            base_delay_ms: upstream.retry_base_delay_ms,
            max_delay_ms: upstream.retry_max_delay_ms,
            close_timeout: Duration::from_millis(relay.close_timeout_ms),
            write_queue_limit: relay.write_queue_limit,
        }
    }
}

/// Creates tokio-tungstenite backed outbound handles.
#[derive(Debug, Clone)]
pub struct WsConnector {
    policy: ConnectPolicy,
}

impl WsConnector {
    pub fn new(policy: ConnectPolicy) -> Self {
        Self { policy }
    }
}

impl Connector for WsConnector {
    type Handle = UpstreamHandle;

    fn outbound(&self, id: ConnectionId, events: EventSink) -> UpstreamHandle {
        UpstreamHandle {
            id,
            policy: self.policy.clone(),
            url: None,
            events: Some(events),
            writer: None,
        }
    }
}

/// The outbound leg of one pairing.
///
/// Dropping the handle closes the upstream connection with 1001.
pub struct UpstreamHandle {
    id: ConnectionId,
    policy: ConnectPolicy,
    url: Option<String>,
    /// Moved into the connection task on start.
    events: Option<EventSink>,
    writer: Option<LegSender>,
}

impl OutboundHandle for UpstreamHandle {
    fn set_url(&mut self, url: String) {
        self.url = Some(url);
    }

    fn start(&mut self) {
        if self.writer.is_some() {
            tracing::warn!(connection_id = %self.id, "Upstream already started");
            return;
        }
        let Some(url) = self.url.clone() else {
            tracing::warn!(connection_id = %self.id, "Upstream started without a URL");
            return;
        };
        let Some(events) = self.events.take() else {
            return;
        };

        let (writer, queue) = leg_channel(self.policy.write_queue_limit);
        let close_signal = writer.close_signal();
        self.writer = Some(writer);
        tokio::spawn(run_upstream(
            self.id,
            url,
            self.policy.clone(),
            events,
            queue,
            close_signal,
        ));
    }

    fn send(&mut self, frame: Frame) {
        let Some(writer) = &self.writer else {
            tracing::debug!(connection_id = %self.id, "Upstream not started, dropping frame");
            return;
        };
        match writer.send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                metrics::record_dropped("client_to_upstream", "backpressure");
                tracing::warn!(
                    connection_id = %self.id,
                    bytes = frame.size_in_bytes(),
                    limit = self.policy.write_queue_limit,
                    "Upstream write queue full, dropping frame"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "Upstream task gone, dropping frame");
            }
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if let Some(writer) = &self.writer {
            writer.close(code, reason);
        }
    }
}

enum ConnectOutcome {
    Ready(Box<UpstreamStream>, OpenInfo),
    Cancelled(CloseInfo),
    Failed(FaultInfo),
}

async fn run_upstream(
    id: ConnectionId,
    url: String,
    policy: ConnectPolicy,
    events: EventSink,
    mut queue: LegReceiver,
    close_signal: Arc<Notify>,
) {
    let started = Instant::now();

    let stream = match connect(id, &url, &policy, &mut queue).await {
        ConnectOutcome::Ready(stream, open) => {
            metrics::record_upstream_connect(started.elapsed(), true);
            let _ = events.send(LegEvent::Opened(open));
            stream
        }
        ConnectOutcome::Cancelled(close) => {
            tracing::debug!(connection_id = %id, "Upstream connect abandoned");
            let _ = events.send(LegEvent::Closed(close));
            return;
        }
        ConnectOutcome::Failed(fault) => {
            metrics::record_upstream_connect(started.elapsed(), false);
            let _ = events.send(LegEvent::Faulted(fault));
            return;
        }
    };

    let mut progress = RelayProgress::default();
    let close_deadline = async {
        close_signal.notified().await;
        tokio::time::sleep(policy.close_timeout).await;
    };

    tokio::select! {
        _ = relay_frames(id, *stream, &events, queue, &mut progress) => {}
        _ = close_deadline => {
            tracing::warn!(
                connection_id = %id,
                timeout = ?policy.close_timeout,
                "Upstream did not complete the close handshake, dropping connection"
            );
        }
    }

    if !progress.terminal_reported {
        let close = progress.requested_close.unwrap_or_else(CloseInfo::abnormal);
        let _ = events.send(LegEvent::Closed(close));
    }
    tracing::debug!(connection_id = %id, "Upstream connection task finished");
}

/// Connect with timeout and backoff, giving up early if the pairing closes.
async fn connect(
    id: ConnectionId,
    url: &str,
    policy: &ConnectPolicy,
    queue: &mut LegReceiver,
) -> ConnectOutcome {
    let mut attempt: u32 = 0;
    let mut waited = Duration::ZERO;

    loop {
        let attempt_result = match until_closed(
            id,
            tokio::time::timeout(policy.connect_timeout, connect_async(url)),
            queue,
        )
        .await
        {
            Ok(result) => result,
            Err(close) => return ConnectOutcome::Cancelled(close),
        };

        let error = match attempt_result {
            Ok(Ok((stream, response))) => {
                let open = OpenInfo {
                    uri: request_uri(url),
                    headers: response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.as_str().to_string(),
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            )
                        })
                        .collect(),
                };
                return ConnectOutcome::Ready(Box::new(stream), open);
            }
            Ok(Err(e)) => UpstreamError::from(e),
            Err(_) => UpstreamError::Timeout(policy.connect_timeout),
        };

        if attempt >= policy.retries {
            return ConnectOutcome::Failed(FaultInfo {
                reason: error.to_string(),
                retry_count: attempt,
                wait_millis: waited.as_millis() as u64,
                http_status: error.http_status(),
                close: None,
            });
        }

        attempt += 1;
        waited = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
        tracing::info!(
            connection_id = %id,
            url = %url,
            attempt,
            delay = ?waited,
            error = %error,
            "Upstream connect failed, retrying"
        );

        if let Err(close) = until_closed(id, tokio::time::sleep(waited), queue).await {
            return ConnectOutcome::Cancelled(close);
        }
    }
}

/// Drive `fut` to completion unless the pairing asks to close first.
///
/// The pairing queues client frames itself until `Opened`, so a send that
/// arrives here is a stray and is dropped.
async fn until_closed<F: Future>(
    id: ConnectionId,
    fut: F,
    queue: &mut LegReceiver,
) -> Result<F::Output, CloseInfo> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Ok(output),
            command = queue.recv() => match command {
                Some(LegCommand::Send(_)) => {
                    tracing::debug!(connection_id = %id, "Dropping frame sent before upstream opened");
                }
                Some(LegCommand::Close { code, reason }) => return Err(CloseInfo::new(code, reason)),
                None => return Err(CloseInfo::new(CLOSE_GOING_AWAY, "pairing released")),
            }
        }
    }
}

/// What the relay loop has told the pairing so far.
#[derive(Debug, Default)]
struct RelayProgress {
    requested_close: Option<CloseInfo>,
    terminal_reported: bool,
}

async fn relay_frames(
    id: ConnectionId,
    stream: UpstreamStream,
    events: &EventSink,
    mut queue: LegReceiver,
    progress: &mut RelayProgress,
) {
    let (mut sink, mut source) = stream.split();
    let mut queue_open = true;

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(message)) => {
                    if let Some(event) = message_to_event(message) {
                        progress.terminal_reported |= matches!(event, LegEvent::Closed(_));
                        let _ = events.send(event);
                    }
                }
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) | None => break,
                Some(Err(e)) => {
                    if !progress.terminal_reported {
                        let _ = events.send(LegEvent::Faulted(FaultInfo::new(e.to_string())));
                        progress.terminal_reported = true;
                    }
                    break;
                }
            },
            command = queue.recv(), if queue_open => match command {
                Some(LegCommand::Send(frame)) => {
                    if progress.requested_close.is_some() {
                        continue;
                    }
                    let Some(message) = frame_to_message(id, frame) else {
                        continue;
                    };
                    if let Err(e) = sink.send(message).await {
                        if !progress.terminal_reported {
                            let _ = events.send(LegEvent::Faulted(FaultInfo::new(e.to_string())));
                            progress.terminal_reported = true;
                        }
                        break;
                    }
                }
                Some(LegCommand::Close { code, reason }) => {
                    let close = CloseInfo::new(code, reason);
                    if progress.requested_close.is_none() {
                        let _ = sink.send(close_message(&close)).await;
                        progress.requested_close = Some(close);
                    }
                }
                None => {
                    queue_open = false;
                    if progress.requested_close.is_none() {
                        let close = CloseInfo::new(CLOSE_GOING_AWAY, "pairing released");
                        let _ = sink.send(close_message(&close)).await;
                        progress.requested_close = Some(close);
                    }
                }
            }
        }
    }
}

/// Path and query of the outbound request, as written.
fn request_uri(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.path_and_query().map(|pq| pq.as_str().to_string()))
        .filter(|pq| !pq.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

fn message_to_event(message: Message) -> Option<LegEvent> {
    match message {
        Message::Text(text) => Some(LegEvent::Data(Frame::text(text.as_str()))),
        Message::Binary(bytes) => Some(LegEvent::Data(Frame::binary(bytes))),
        Message::Close(Some(frame)) => Some(LegEvent::Closed(CloseInfo::new(
            u16::from(frame.code),
            frame.reason.as_str(),
        ))),
        Message::Close(None) => Some(LegEvent::Closed(CloseInfo::new(CLOSE_NO_STATUS, ""))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

fn frame_to_message(id: ConnectionId, frame: Frame) -> Option<Message> {
    if frame.is_binary {
        return Some(Message::Binary(frame.bytes));
    }
    match String::from_utf8(frame.bytes.to_vec()) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(_) => {
            tracing::warn!(connection_id = %id, "Dropping text frame with invalid UTF-8");
            None
        }
    }
}

fn close_message(close: &CloseInfo) -> Message {
    if !close.is_sendable() {
        return Message::Close(None);
    }
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(close.code),
        reason: close.reason.clone().into(),
    }))
}
