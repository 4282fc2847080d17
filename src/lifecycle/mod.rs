//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting → pairings closed with 1001
//!             → sessions drained for relay.shutdown_grace_secs → exit 0
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
