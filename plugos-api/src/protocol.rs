//! Worker protocol between a host and an execution unit
//!
//! Every message is one record tagged by `type`. Ids are scoped per
//! direction and per channel: host-issued `invoke` ids and unit-issued
//! `syscall` ids are independent numbering spaces.
//!
//! ```text
//! host                                   unit
//!  │── load {name, code} ─────────────────▶│
//!  │◀──────────────────── inited {name} ───│
//!  │── invoke {id, name, args} ───────────▶│
//!  │◀──────────── syscall {id, name, args} │   (nested, optional)
//!  │── syscall-response {id, result} ─────▶│
//!  │◀─────────── result {id, result|error} │
//! ```

use crate::{CallOutcome, LogLevel, Value};
use serde::{Deserialize, Serialize};

/// Messages sent from the host to an execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Compile and register a function under `name`
    Load { name: String, code: String },

    /// Instantiate a dependency module importable as `name`
    LoadDependency { name: String, code: String },

    /// Run a loaded function
    Invoke {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Answer to a unit-initiated syscall
    SyscallResponse {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Messages sent from an execution unit to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UnitMessage {
    /// A function is ready to invoke (or failed to compile)
    Inited {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A dependency module is instantiated (or failed to)
    DependencyInited {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Answer to a host-initiated invoke
    Result {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The unit requests a host capability
    Syscall {
        id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Console output from plug code
    Log { level: LogLevel, message: String },

    #[serde(other)]
    Unknown,
}

impl HostMessage {
    pub fn syscall_response(id: u64, outcome: CallOutcome) -> Self {
        HostMessage::SyscallResponse {
            id,
            result: outcome.result,
            error: outcome.error,
        }
    }
}

impl UnitMessage {
    pub fn result(id: u64, outcome: CallOutcome) -> Self {
        UnitMessage::Result {
            id,
            result: outcome.result,
            error: outcome.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_tags() {
        let msg = HostMessage::syscall_response(3, CallOutcome::ok(json!("hi")));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "syscall-response", "id": 3, "result": "hi"}));

        let msg = UnitMessage::DependencyInited {
            name: "lib".into(),
            error: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "dependency-inited", "name": "lib"}));
    }

    #[test]
    fn test_msgpack_roundtrip_invoke() {
        let msg = HostMessage::Invoke {
            id: 7,
            name: "greet".into(),
            args: vec![json!("world"), json!({"loud": true})],
        };
        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        let decoded: HostMessage = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_msgpack_result_error() {
        let msg = UnitMessage::result(1, CallOutcome::err("BOOM"));
        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        match rmp_serde::from_slice::<UnitMessage>(&bytes).unwrap() {
            UnitMessage::Result { id, result, error } => {
                assert_eq!(id, 1);
                assert!(result.is_none());
                assert_eq!(error.as_deref(), Some("BOOM"));
            }
            other => panic!("Expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let msg: UnitMessage = serde_json::from_value(json!({"type": "heartbeat"})).unwrap();
        assert_eq!(msg, UnitMessage::Unknown);
    }
}
