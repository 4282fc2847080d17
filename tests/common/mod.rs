//! Shared utilities for integration testing: mock upstreams and a proxy launcher.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, MaybeTlsStream, WebSocketStream};

use ws_relay_proxy::config::ProxyConfig;
use ws_relay_proxy::http::ProxyServer;
use ws_relay_proxy::lifecycle::Shutdown;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Text that makes the echo upstream close with 4000 "bye".
#[allow(dead_code)]
pub const CLOSE_TRIGGER: &str = "close-me";

/// What an echo upstream observed.
pub struct MockUpstream {
    pub addr: SocketAddr,
    /// Request target (path and query) of every accepted handshake.
    pub paths: mpsc::UnboundedReceiver<String>,
    /// Close frame (code, reason) received from the proxy, per connection.
    pub closes: mpsc::UnboundedReceiver<Option<(u16, String)>>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

/// Start a WebSocket upstream that echoes text and binary frames.
pub async fn start_echo_upstream() -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (paths_tx, paths) = mpsc::unbounded_channel();
    let (closes_tx, closes) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let paths_tx = paths_tx.clone();
            let closes_tx = closes_tx.clone();
            tokio::spawn(async move {
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    let _ = paths_tx.send(request.uri().to_string());
                    Ok(response)
                };
                let Ok(mut ws) = accept_hdr_async(socket, callback).await else {
                    return;
                };

                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) if text.as_str() == CLOSE_TRIGGER => {
                            let _ = ws
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(4000),
                                    reason: "bye".into(),
                                })))
                                .await;
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(frame) => {
                            let _ = closes_tx.send(
                                frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string())),
                            );
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    MockUpstream { addr, paths, closes }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Run a proxy on an ephemeral port in front of `upstream_url`.
pub async fn start_proxy(
    upstream_url: &str,
    configure: impl FnOnce(&mut ProxyConfig),
) -> (SocketAddr, Shutdown) {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.url = upstream_url.to_string();
    config.upstream.connect_timeout_secs = 2;
    config.relay.shutdown_grace_secs = 1;
    configure(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, receiver).await;
    });

    (addr, shutdown)
}

pub async fn connect(proxy: SocketAddr, path: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", proxy, path))
        .await
        .expect("proxy unreachable");
    ws
}

/// Next text, binary or close message, skipping control frames.
pub async fn next_message(ws: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("read failed");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

/// Wait for the client to be closed and return the close code it received.
#[allow(dead_code)]
pub async fn expect_close(ws: &mut Client) -> (u16, String) {
    match next_message(ws).await {
        Message::Close(Some(frame)) => (u16::from(frame.code), frame.reason.as_str().to_string()),
        other => panic!("expected close frame, got {:?}", other),
    }
}
