//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, fatal on failure)
//!     → tls.rs (optional TLS handshake via axum-server)
//!     → connection.rs (connection id, session tracking)
//!     → Hand off to the WebSocket upgrade handler
//! ```
//!
//! # Design Decisions
//! - Connection ids are assigned at accept time and never reused
//! - Each session is tracked so shutdown can wait for close handshakes
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;
