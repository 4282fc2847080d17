//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check the upstream URL is a usable WebSocket base
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::new("listener.tls.cert_path", "must not be empty"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::new("listener.tls.key_path", "must not be empty"));
        }
    }

    validate_upstream_url(&config.upstream.url, &mut errors);
    if config.upstream.port == Some(0) {
        errors.push(ValidationError::new("upstream.port", "must not be 0"));
    }
    if config.upstream.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("upstream.connect_timeout_secs", "must be greater than 0"));
    }
    if config.upstream.retry_base_delay_ms > config.upstream.retry_max_delay_ms {
        errors.push(ValidationError::new(
            "upstream.retry_base_delay_ms",
            "must not exceed upstream.retry_max_delay_ms",
        ));
    }

    if config.relay.write_queue_limit == 0 {
        errors.push(ValidationError::new("relay.write_queue_limit", "must be greater than 0"));
    }
    if config.relay.close_timeout_ms == 0 {
        errors.push(ValidationError::new("relay.close_timeout_ms", "must be greater than 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_upstream_url(raw: &str, errors: &mut Vec<ValidationError>) {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            errors.push(ValidationError::new("upstream.url", format!("'{}': {}", raw, e)));
            return;
        }
    };

    if !matches!(url.scheme(), "ws" | "wss") {
        errors.push(ValidationError::new(
            "upstream.url",
            format!("scheme must be ws or wss, got '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        errors.push(ValidationError::new("upstream.url", "missing host"));
    }
    // The client request URI (path and query) is appended verbatim.
    if url.query().is_some() || url.fragment().is_some() {
        errors.push(ValidationError::new("upstream.url", "must not carry a query or fragment"));
    }
}
