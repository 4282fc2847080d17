//! Events delivered by either leg of a pairing.

use bytes::Bytes;

/// Close code sent when a leg fails without surfacing its own code.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close code used when the proxy itself is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code reported when a peer vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// One application message, relayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Bytes,
    /// Binary frames stay binary; text frames stay text.
    pub is_binary: bool,
}

impl Frame {
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            is_binary: true,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            bytes: Bytes::from(text.into()),
            is_binary: false,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Request line and headers seen when a leg opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenInfo {
    /// Path and query of the request, e.g. "/chat?room=1".
    pub uri: String,
    /// Header pairs in arrival order. Repeated names are kept.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The peer disappeared without completing a close handshake.
    pub fn abnormal() -> Self {
        Self::new(CLOSE_ABNORMAL, "abnormal closure")
    }

    /// Whether this code may be put on the wire in a close frame.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting only.
    pub fn is_sendable(&self) -> bool {
        matches!(self.code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// A transport fault on one leg.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInfo {
    pub reason: String,
    /// Connect attempts that had already failed before this fault.
    pub retry_count: u32,
    /// Backoff waited before the last attempt.
    pub wait_millis: u64,
    /// HTTP status of a rejected upgrade, when there was one.
    pub http_status: Option<u16>,
    /// Close code and reason surfaced alongside the fault, if any.
    pub close: Option<CloseInfo>,
}

impl FaultInfo {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }
}

/// The finite event set of one leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEvent {
    Opened(OpenInfo),
    Data(Frame),
    Closed(CloseInfo),
    Faulted(FaultInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_are_not_sendable() {
        assert!(!CloseInfo::abnormal().is_sendable());
        assert!(!CloseInfo::new(CLOSE_NO_STATUS, "").is_sendable());
        assert!(!CloseInfo::new(1015, "tls").is_sendable());
        assert!(CloseInfo::new(1000, "bye").is_sendable());
        assert!(CloseInfo::new(CLOSE_INTERNAL_ERROR, "").is_sendable());
        assert!(CloseInfo::new(4000, "app").is_sendable());
    }

    #[test]
    fn size_counts_encoded_bytes() {
        assert_eq!(Frame::text("héllo").size_in_bytes(), 6);
        assert!(!Frame::text("héllo").is_binary);
        assert!(Frame::binary(vec![0x68, 0x69]).is_binary);
    }
}
