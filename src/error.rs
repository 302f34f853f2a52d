//! Error types shared by the capture, detection and configuration layers.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid network '{value}': {reason}")]
    InvalidNetwork { value: String, reason: String },

    /// Socket creation or bind failed. Fatal at startup, bounded retries on rebind.
    #[error("Failed to bind capture socket on {address}: {source}")]
    Bind {
        address: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// Steady-state receive failure. Always transient.
    #[error("Receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("Local address resolution failed: {0}")]
    AddressResolution(#[source] io::Error),

    #[error("No usable local address found")]
    NoLocalAddress,

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MonitorError {
    /// Errors that must stop startup rather than be logged and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::Bind { .. }
                | MonitorError::SocketOption { .. }
                | MonitorError::Config(_)
                | MonitorError::InvalidNetwork { .. }
                | MonitorError::NoLocalAddress
        )
    }
}

impl From<serde_yaml::Error> for MonitorError {
    fn from(err: serde_yaml::Error) -> Self {
        MonitorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_fatal_receive_is_not() {
        let bind = MonitorError::Bind {
            address: Ipv4Addr::new(10, 0, 0, 5),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let recv = MonitorError::Receive(io::Error::new(io::ErrorKind::Other, "reset"));

        assert!(bind.is_fatal());
        assert!(!recv.is_fatal());
        assert!(bind.to_string().contains("10.0.0.5"));
    }
}
