//! Serializable handle to an exported object, and the client side of an
//! invocation.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::RemoteError;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Invocation, ObjectId, Reply};

/// Opaque reference to an object exported by some process.
///
/// Stubs are plain data: they can be written to a file, passed in a call,
/// and used from any process that can reach the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stub {
    pub interface: String,
    /// Socket the exporting process listens on for this object.
    pub endpoint: PathBuf,
    pub object: ObjectId,
}

impl Stub {
    /// Invoke one method on the remote object and wait for its reply.
    ///
    /// Each invocation uses its own connection, so a stub carries no
    /// connection state and stays valid across peer restarts of the listener.
    pub async fn invoke<C, R>(&self, call: &C) -> Result<R, RemoteError>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let call = serde_json::to_value(call).map_err(RemoteError::Encode)?;

        let stream = UnixStream::connect(&self.endpoint)
            .await
            .map_err(RemoteError::Connect)?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, JsonCodec::<Invocation>::new());
        let mut reader = FramedRead::new(read_half, JsonCodec::<Reply>::new());

        tracing::trace!(interface = %self.interface, object = %self.object, "Invoking remote object");
        writer
            .send(Invocation {
                object: self.object,
                call,
            })
            .await
            .map_err(RemoteError::Io)?;

        match reader.next().await {
            Some(Ok(reply)) => match reply.into_result() {
                Ok(value) => serde_json::from_value(value).map_err(RemoteError::Decode),
                Err(message) => Err(RemoteError::Remote(message)),
            },
            Some(Err(e)) => Err(RemoteError::Io(e)),
            None => Err(RemoteError::Closed),
        }
    }
}

impl std::fmt::Display for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.interface,
            self.endpoint.display(),
            self.object
        )
    }
}
