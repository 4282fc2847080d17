//! Relay core: one client connection paired with one upstream connection.
//!
//! # Data Flow
//! ```text
//! Listener (http::websocket)
//!     → coordinator.rs (limit check, build pairing, register upstream dispatch)
//!     → pairing.rs (translate each leg's events into actions on the other leg)
//!
//! Client leg events ──on_client_event──▶ ConnectionPairing ──send/close──▶ OutboundHandle
//! Upstream events  ──on_server_event──▶ ConnectionPairing ──send/close──▶ ClientHandle
//! ```
//!
//! # Design Decisions
//! - The transport is reached only through the traits in handle.rs
//! - Events are one sum type per leg with a single dispatch entry point
//! - No retries and no timeouts live here; both belong to the transport

use thiserror::Error;

pub mod coordinator;
pub mod event;
pub mod handle;
pub mod pairing;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::RelayCoordinator;
pub use event::{CloseInfo, FaultInfo, Frame, LegEvent, OpenInfo};
pub use handle::{
    leg_channel, ClientHandle, Connector, EventSink, LegCommand, LegReceiver, LegSender,
    OutboundHandle,
};
pub use pairing::{ConnectionPairing, PairingPhase};
pub use target::UpstreamTarget;

/// Errors raised while setting up a pairing.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Every connection slot is taken.
    #[error("connection limit of {limit} reached")]
    AtCapacity { limit: usize },

    /// The proxy has begun shutting down.
    #[error("proxy shutting down")]
    ShuttingDown,

    /// The upstream base or the joined request URL does not parse.
    #[error("invalid upstream url '{url}': {source}")]
    InvalidTarget {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
