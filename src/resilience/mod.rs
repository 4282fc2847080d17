//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream connect attempt fails:
//!     → backoff.rs (exponential delay with jitter before the next attempt)
//!     → after the configured retries, a single fault reaches the pairing
//! ```
//!
//! # Design Decisions
//! - Every connect attempt has a deadline (upstream.connect_timeout_secs)
//! - Retries apply only to establishing the upstream leg, never to frames

pub mod backoff;
