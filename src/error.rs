//! Error types shared across the session layer.
//!
//! None of these are fatal to a running session: transport errors feed the reconnect loop,
//! persistence errors are logged and swallowed, decode errors drop a single frame.
use thiserror::Error;

/// Failure reported by a [`Transport`](crate::transport::Transport) or an open link.
///
/// Every variant is recoverable by reconnecting; the adapter itself never retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The device path does not exist (unplugged, not yet re-enumerated).
    #[error("device not found: {0}")]
    NotFound(String),

    /// The OS refused access to the device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Read/write failure on an open link, or an operation that exceeded its I/O timeout.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransportError::PermissionDenied(e.to_string())
            }
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// Errors from the durable node store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background write task failed to complete.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A frame from the radio that could not be turned into events.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("frame is empty")]
    Empty,
}

/// Errors returned by [`SessionHandle`](crate::session::SessionHandle) calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session actor has shut down; no further commands are accepted.
    #[error("session is closed")]
    Closed,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("message text is {len} bytes, limit is {max}")]
    MessageTooLarge { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_map_to_transport_reasons() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(TransportError::from(nf), TransportError::NotFound(_)));
        let pd = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            TransportError::from(pd),
            TransportError::PermissionDenied(_)
        ));
        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }
}
