use crate::types::SessionState;
use thiserror::Error;

/// Session controller error taxonomy.
///
/// Clonable so the last failure can be kept on the session and handed to
/// any UI surface that reattaches later.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Capture not supported in this context: {0}")]
    UnsupportedContext(String),

    #[error("Relay rejected negotiation: {0}")]
    NegotiationRejected(String),

    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Cannot go live without destinations")]
    NoDestinations,

    #[error("Invalid state for {op}: {state}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
