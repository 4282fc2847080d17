//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the WebSocket relay proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// The single upstream every client is paired with.
    pub upstream: UpstreamConfig,

    /// Per-pairing relay behaviour.
    pub relay: RelayConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8008").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent pairings. Clients beyond this are closed with 1011.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8008".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream target and outbound connect policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream base URL including scheme, e.g. "ws://127.0.0.1:8009".
    pub url: String,

    /// Port applied when `url` carries none.
    pub port: Option<u16>,

    /// Timeout for a single connect attempt in seconds.
    pub connect_timeout_secs: u64,

    /// Additional connect attempts after the first one fails.
    pub connect_retries: u32,

    /// Base delay for exponential backoff between attempts.
    pub retry_base_delay_ms: u64,

    /// Maximum backoff delay.
    pub retry_max_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8009".to_string(),
            port: None,
            connect_timeout_secs: 5,
            connect_retries: 0,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2000,
        }
    }
}

/// Relay behaviour for each pairing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Client frames held while the upstream leg is still connecting.
    pub pending_frame_limit: usize,

    /// Frames waiting to be written to one socket. Beyond this, frames are dropped.
    pub write_queue_limit: usize,

    /// How long a leg waits for the peer to answer a close before dropping the socket.
    pub close_timeout_ms: u64,

    /// How long shutdown waits for sessions to finish their close handshakes.
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pending_frame_limit: 64,
            write_queue_limit: 256,
            close_timeout_ms: 2000,
            shutdown_grace_secs: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human readable or JSON lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [upstream]
            url = "wss://echo.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.url, "wss://echo.example.com");
        assert_eq!(config.upstream.connect_timeout_secs, 5);
        assert_eq!(config.listener, ListenerConfig::default());
        assert_eq!(config.relay.pending_frame_limit, 64);
        assert_eq!(config.relay.write_queue_limit, 256);
        assert_eq!(config.relay.close_timeout_ms, 2000);
    }

    #[test]
    fn parses_tls_and_json_logging() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:443"
            tls = { cert_path = "cert.pem", key_path = "key.pem" }

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        let tls = config.listener.tls.unwrap();
        assert_eq!(tls.cert_path, "cert.pem");
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}
