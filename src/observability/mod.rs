//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Relay core and transports produce:
//!     → logging.rs (structured log events, connection_id on every record)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection id flows through every diagnostic record of a pairing
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;
