//! Outbound (upstream) WebSocket transport.
//!
//! # Data Flow
//! ```text
//! ConnectionPairing
//!     → UpstreamHandle::start (spawn connection task)
//!     → connect_async with timeout + backoff (resilience::backoff)
//!     → Opened / Data / Closed / Faulted events → EventSink → pairing
//!
//! pairing send/close → LegCommand channel → connection task → upstream socket
//! ```
//!
//! # Design Decisions
//! - Connect retries stay inside the transport; the relay sees one fault at most
//! - A close requested while still connecting abandons the attempt
//! - `ws://` and `wss://` both supported (rustls with webpki roots)

pub mod connector;

pub use connector::{ConnectPolicy, UpstreamError, UpstreamHandle, WsConnector};
