//! Protocol errors

use thiserror::Error;

/// Errors that can occur during panel communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The byte transport can no longer be read from or written to.
    #[error("Serial link broken: {0}")]
    LinkBroken(#[source] std::io::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Frame is not a message: {0}")]
    MalformedMessage(String),

    #[error("Timed out waiting for response")]
    Timeout,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected to panel")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Failed to open port {port}: {source}")]
    PortOpen {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("No panel found on any serial port")]
    NoDeviceFound,

    #[error("A request for '{0}' is already waiting for its reply")]
    RequestInFlight(String),

    #[error("Listener was cancelled")]
    Cancelled,

    #[error("Invalid response from panel: {0}")]
    InvalidResponse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProtocolError {
    /// True when the error means the physical link is gone.
    pub fn is_link_broken(&self) -> bool {
        matches!(self, ProtocolError::LinkBroken(_))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::LinkBroken(err)
    }
}

/// Result alias used throughout the protocol layer
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_link_broken() {
        let err: ProtocolError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(err.is_link_broken());
        assert!(!ProtocolError::Timeout.is_link_broken());
    }

    #[test]
    fn test_request_in_flight_display() {
        let err = ProtocolError::RequestInFlight("dialog".to_string());
        assert_eq!(
            err.to_string(),
            "A request for 'dialog' is already waiting for its reply"
        );
    }
}
