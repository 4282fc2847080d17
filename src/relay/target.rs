//! The fixed upstream a pairing connects to.

use url::Url;

use crate::config::UpstreamConfig;
use crate::relay::RelayError;

/// Upstream base address. The client's request URI is appended to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    base: Url,
}

impl UpstreamTarget {
    /// Parse `host` (with scheme) and apply `port` when the URL has none.
    pub fn new(host: &str, port: Option<u16>) -> Result<Self, RelayError> {
        let invalid = |source| RelayError::InvalidTarget {
            url: host.to_string(),
            source,
        };
        let mut base = Url::parse(host).map_err(invalid)?;

        if base.port().is_none() {
            if let Some(port) = port {
                base.set_port(Some(port))
                    .map_err(|_| invalid(url::ParseError::InvalidPort))?;
            }
        }

        Ok(Self { base })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, RelayError> {
        Self::new(&config.url, config.port)
    }

    pub fn port(&self) -> Option<u16> {
        self.base.port_or_known_default()
    }

    /// Build the outbound URL for a client request URI by concatenation.
    ///
    /// The joined string is checked to parse but returned as written, so
    /// dot segments and escapes in the client URI reach the upstream unchanged.
    pub fn resolve(&self, uri: &str) -> Result<String, RelayError> {
        let base = self.base.as_str().trim_end_matches('/');
        let joined = if uri.starts_with('/') {
            format!("{}{}", base, uri)
        } else {
            format!("{}/{}", base, uri)
        };

        match Url::parse(&joined) {
            Ok(_) => Ok(joined),
            Err(source) => Err(RelayError::InvalidTarget { url: joined, source }),
        }
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base.as_str().trim_end_matches('/'))
    }
}
