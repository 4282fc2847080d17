//! Client-facing HTTP/WebSocket subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, TLS termination, graceful shutdown)
//!     → websocket.rs (upgrade, client reader loop, client writer task)
//!     → relay::RelayCoordinator (pairing with a fresh upstream connection)
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, ProxyCoordinator, ProxyServer};
pub use websocket::ClientSocketHandle;
