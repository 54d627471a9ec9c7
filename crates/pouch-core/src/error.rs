use thiserror::Error;

/// Failure classes shared by every gateway component.
///
/// Everything except `StaleData` terminates the connection it occurs on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Pool or capacity limit reached.
    #[error("exhausted: {0}")]
    Exhausted(String),
    /// Malformed frame, missing characteristic, or out-of-order completion.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Radio read/write/subscribe/discover failure.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// Non-success status from the cloud collaborator.
    #[error("cloud failure: {0}")]
    CloudFailure(String),
    /// Server certificate changed while it was being written to a device.
    #[error("stale data: {0}")]
    StaleData(String),
}

impl GatewayError {
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::CloudFailure(msg.into())
    }

    /// Whether this error ends the connection it was raised on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StaleData(_))
    }

    /// Short, stable label used for logging and counters.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Exhausted(_) => "exhausted",
            Self::ProtocolViolation(_) => "protocol",
            Self::TransportFailure(_) => "transport",
            Self::CloudFailure(_) => "cloud",
            Self::StaleData(_) => "stale",
        }
    }
}
