//! Wire protocol types for master/subordinate remote calls.
//!
//! Every connection to an exported object carries `Invocation` frames, each
//! answered by exactly one `Reply`. The `call` payload is interface-specific:
//! - **master** (served by the controller): `MasterCall`
//! - **subordinate** (served by the child runtime): `SubordinateCall`
//! - **code service** (served by the controller): `CodeCall`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::remote::Stub;

/// Bumped whenever a call or reply changes shape. Carried in registration so a
/// stale runner binary is rejected instead of misbehaving later.
pub const PROTOCOL_VERSION: u32 = 1;

/// Interface names carried in stubs.
pub const MASTER_INTERFACE: &str = "tandem.master";
pub const SUBORDINATE_INTERFACE: &str = "tandem.subordinate";
pub const CODE_SERVICE_INTERFACE: &str = "tandem.code_service";

/// Identity of one exported object.
///
/// A fresh UUID per export, so a stub that outlives its export (or points at a
/// reused socket path) is rejected rather than routed to the wrong object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(uuid::Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One remote method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub object: ObjectId,
    pub call: serde_json::Value,
}

/// Answer to one `Invocation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { value: serde_json::Value },
    Error { message: String },
}

impl Reply {
    pub fn ok(value: serde_json::Value) -> Self {
        Self::Ok { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Error { message } => Err(message),
        }
    }
}

/// Calls the subordinate makes into the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MasterCall {
    /// Completes the handshake. Must be the subordinate's first call and must
    /// happen exactly once per launch.
    RegisterSubordinate { handle: Stub, protocol: u32 },

    /// Liveness probe; does nothing.
    CheckAlive,

    /// The subordinate hit an error before it could register.
    ReportStartupError { cause: String },
}

/// Calls the master makes into the subordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SubordinateCall {
    Quit,
}

/// Calls the subordinate makes into the code service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CodeCall {
    /// Fetch a resource by classpath-relative name, e.g. `lib/util.wasm`.
    LoadResource { name: String },
}

/// A resource served by the code service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeResource {
    pub name: String,
    /// Classpath entry the resource was found under.
    pub origin: PathBuf,
    /// Base64 (standard alphabet) file contents.
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_id() -> ObjectId {
        ObjectId::parse("6f9c1b7e-2d1a-4c53-9a57-3e0e7b8c2f10").unwrap()
    }

    #[test]
    fn object_id_display_matches_parse() {
        let id = ObjectId::new();
        assert_eq!(ObjectId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn register_call_wire_shape() {
        let call = MasterCall::RegisterSubordinate {
            handle: Stub {
                interface: SUBORDINATE_INTERFACE.to_string(),
                endpoint: PathBuf::from("/tmp/tandem-42/obj.sock"),
                object: fixed_id(),
            },
            protocol: PROTOCOL_VERSION,
        };
        insta::assert_json_snapshot!(call, @r#"
        {
          "method": "register_subordinate",
          "handle": {
            "interface": "tandem.subordinate",
            "endpoint": "/tmp/tandem-42/obj.sock",
            "object": "6f9c1b7e-2d1a-4c53-9a57-3e0e7b8c2f10"
          },
          "protocol": 1
        }
        "#);
    }

    #[test]
    fn unit_calls_wire_shape() {
        insta::assert_json_snapshot!(MasterCall::CheckAlive, @r#"
        {
          "method": "check_alive"
        }
        "#);
        insta::assert_json_snapshot!(SubordinateCall::Quit, @r#"
        {
          "method": "quit"
        }
        "#);
    }

    #[test]
    fn reply_wire_shape() {
        insta::assert_json_snapshot!(Reply::ok(serde_json::Value::Null), @r#"
        {
          "status": "ok",
          "value": null
        }
        "#);
        insta::assert_json_snapshot!(Reply::error("no such object"), @r#"
        {
          "status": "error",
          "message": "no such object"
        }
        "#);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let parsed = serde_json::from_value::<MasterCall>(serde_json::json!({"method": "reboot"}));
        assert!(parsed.is_err());
    }
}
