//! Master-side reference to a connected subordinate.

use serde::{Serialize, de::DeserializeOwned};

use crate::bridge::protocol::SubordinateCall;
use crate::remote::{RemoteError, Stub};

/// Opaque handle to the subordinate, received at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubordinateHandle {
    stub: Stub,
}

impl SubordinateHandle {
    pub fn new(stub: Stub) -> Self {
        Self { stub }
    }

    pub fn stub(&self) -> &Stub {
        &self.stub
    }

    /// Ask the subordinate to exit. Returns once the request is acknowledged;
    /// the process exits shortly after.
    pub async fn quit(&self) -> Result<(), RemoteError> {
        self.stub.invoke(&SubordinateCall::Quit).await
    }

    /// Application-defined call, answered by the subordinate's entry point.
    pub async fn invoke<C, R>(&self, call: &C) -> Result<R, RemoteError>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.stub.invoke(call).await
    }
}

impl std::fmt::Display for SubordinateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.stub.fmt(f)
    }
}
