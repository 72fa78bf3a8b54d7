//! All error types for the client.
//!
//! Every error is `Clone` because the same failure is fanned out to every waiter of a
//! coalesced lookup and kept inside the published snapshots.
//!
use thiserror::Error;

/// Failure to establish a transport to the hub.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connection timed out.")]
    Timeout,
}

/// Failure to deliver one coordinate to the hub.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SendError {
    #[error("Not connected to the hub.")]
    NotConnected,
    #[error("Hub rejected the message: {0}")]
    TransportRejected(String),
}

/// Failure of a reverse lookup.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LookupError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("No place found for these coordinates.")]
    NotFound,
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Lookup timed out.")]
    Timeout,
}

impl LookupError {
    /// `Timeout` is reported separately but belongs to the network class of failures.
    ///
    pub fn is_network(&self) -> bool {
        matches!(self, LookupError::Network(_) | LookupError::Timeout)
    }
}

/// Out of range or non-finite coordinate.
///
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CoordinateError {
    #[error("Invalid latitude {0}, must be within [-90, 90]")]
    Latitude(f64),
    #[error("Invalid longitude {0}, must be within [-180, 180]")]
    Longitude(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_network_class() {
        assert!(LookupError::Timeout.is_network());
        assert!(LookupError::Network("reset".into()).is_network());
        assert!(!LookupError::NotFound.is_network());
        assert!(!LookupError::MalformedResponse("eof".into()).is_network());
    }

    #[test]
    fn test_error_display() {
        assert_eq!("Connection timed out.", ConnectError::Timeout.to_string());
        assert_eq!(
            "Hub rejected the message: nope",
            SendError::TransportRejected("nope".into()).to_string()
        );
    }
}
