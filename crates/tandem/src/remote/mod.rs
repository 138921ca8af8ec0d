//! Remote objects: export a local object, hand out a serializable stub, invoke
//! it from another process, retract it again.
//!
//! The exporter is a trait so the controller can be driven against a
//! different transport (or a failing one, in tests). `SocketExporter` is the
//! Unix-socket implementation used by default.

mod exporter;
mod stub;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::bridge::protocol::ObjectId;

pub use exporter::SocketExporter;
pub use stub::Stub;

/// A local object that can be called from another process.
#[async_trait::async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Interface name recorded in the stub.
    fn interface(&self) -> &'static str;

    /// Handle one call. The error string is sent back to the caller verbatim.
    async fn dispatch(&self, call: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Makes objects callable from other processes.
pub trait RemoteObjectExporter: Send + Sync {
    /// Start serving `object`; the returned stub can be serialized and handed
    /// to another process.
    fn export(&self, object: Arc<dyn RemoteObject>) -> Result<Stub, ExportError>;

    /// Stop serving the object behind `stub`. In-flight connections are
    /// cancelled; later invocations through the stub fail to connect.
    fn unexport(&self, stub: &Stub) -> Result<(), ExportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("object {0} is not exported")]
    NotExported(ObjectId),
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to connect to remote object: {0}")]
    Connect(#[source] io::Error),
    #[error("remote channel I/O failure: {0}")]
    Io(#[source] io::Error),
    #[error("failed to encode call: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("remote side closed the connection without replying")]
    Closed,
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    /// The peer process is gone (or going), as opposed to a call that reached
    /// it and failed.
    pub fn is_peer_gone(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Connect(e) | Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Decode a call payload for a `RemoteObject::dispatch` implementation.
pub fn decode_call<T: DeserializeOwned>(call: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(call).map_err(|e| format!("malformed call: {}", e))
}

/// Encode a dispatch result.
pub fn encode_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to encode result: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_gone_classification() {
        assert!(RemoteError::Closed.is_peer_gone());
        assert!(
            RemoteError::Connect(io::Error::from(io::ErrorKind::ConnectionRefused)).is_peer_gone()
        );
        assert!(RemoteError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_peer_gone());
        assert!(!RemoteError::Remote("nope".to_string()).is_peer_gone());
        assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_peer_gone());
        assert!(
            !RemoteError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_peer_gone()
        );
    }

    #[test]
    fn decode_call_reports_malformed_payload() {
        let err = decode_call::<crate::bridge::protocol::SubordinateCall>(serde_json::json!(42))
            .unwrap_err();
        assert!(err.starts_with("malformed call"), "{}", err);
    }
}
