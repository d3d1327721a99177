//! plugos-api: Shared types for the PlugOS plug runtime
//!
//! This crate defines what both sides of an execution unit agree on:
//! the plug manifest, the worker protocol, the guest call ABI and the
//! frame codec used when a unit lives in a separate process.
//!
//! Everything crossing the unit boundary is a [`Value`]. The guest ABI and
//! the process framing use MessagePack.

pub mod codec;
pub mod protocol;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub use serde_json::{Map, Value};

/// Import module name for host functions available to plug code
pub const IMPORT_MODULE: &str = "plugos";

/// Host import: `syscall(ptr, len) -> i64`
pub const SYSCALL_IMPORT: &str = "syscall";

/// Host import: `log(level, ptr, len)`
pub const LOG_IMPORT: &str = "log";

/// Linear memory export required from function modules
pub const MEMORY_EXPORT: &str = "memory";

/// Guest allocator export: `plug_alloc(size) -> ptr`
pub const ALLOC_EXPORT: &str = "plug_alloc";

/// Optional guest deallocator export: `plug_dealloc(ptr, size)`
pub const DEALLOC_EXPORT: &str = "plug_dealloc";

/// Function entry point: `plug_run(ptr, len) -> packed(ptr, len)`
pub const RUN_EXPORT: &str = "plug_run";

/// Runtime environment a host runs in and a function may be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Client,
    Server,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Client => "client",
            Environment::Server => "server",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Environment::Client),
            "server" => Ok(Environment::Server),
            other => Err(format!("Unknown environment: {}", other)),
        }
    }
}

/// Declarative description of one plug
///
/// `name` is the key a plug is registered under. Loading another manifest
/// with the same name replaces the plug entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Unique plug name
    pub name: String,

    /// Permissions this plug asks for (and is granted at load time)
    #[serde(default)]
    pub required_permissions: BTreeSet<String>,

    /// Dependency modules by name, as code blobs
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Exported functions by name
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDef>,
}

/// A single plug function
///
/// Anything besides `path`, `code` and `env` is hook metadata, kept opaque
/// here and decoded by the hook that owns it (see [`FunctionDef::hook_metadata`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Source path the function was compiled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Compiled code blob (WAT text or base64 wasm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Environment this function is restricted to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Environment>,

    /// Hook-specific fields (`events`, `http`, ...)
    #[serde(flatten)]
    pub hooks: Map<String, Value>,
}

impl Manifest {
    /// Create an empty manifest
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a required permission
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.insert(permission.into());
        self
    }

    /// Add a dependency module
    pub fn dependency(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), code.into());
        self
    }

    /// Add a function
    pub fn function(mut self, name: impl Into<String>, def: FunctionDef) -> Self {
        self.functions.insert(name.into(), def);
        self
    }
}

impl FunctionDef {
    /// Create a function definition from a code blob
    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Restrict to an environment
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Attach a hook metadata field
    pub fn hook(mut self, key: impl Into<String>, value: Value) -> Self {
        self.hooks.insert(key.into(), value);
        self
    }

    /// Whether this function may run on a host in `host_env`
    ///
    /// A host without an environment (`None`) runs everything.
    pub fn is_runnable_in(&self, host_env: Option<Environment>) -> bool {
        match (self.env, host_env) {
            (Some(required), Some(host)) => required == host,
            _ => true,
        }
    }

    /// Decode the hook metadata into a hook's own typed view
    pub fn hook_metadata<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.hooks.clone()))
    }
}

/// Result of running a guest function or a syscall
///
/// A present `error` wins over `result`. A missing `result` means null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallOutcome {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

impl From<Result<Value, String>> for CallOutcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::err(error),
        }
    }
}

/// Request passed to the `syscall` host import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallCall {
    pub name: String,

    #[serde(default)]
    pub args: Vec<Value>,
}

/// Log level of guest console output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level passed through the `log` import (unknown values map to info)
    pub fn from_i32(level: i32) -> Self {
        match level {
            0 => LogLevel::Debug,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

/// Pack a pointer and length into a single i64 value
#[inline]
pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
    ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
}

/// Unpack ptr and len from a packed i64
#[inline]
pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}
