//! A loaded plug: one manifest bound to one execution unit

use crate::sandbox::{LogEntry, Sandbox, SandboxError, UnitChannel};
use crate::syscall::{SyscallContext, SyscallError};
use crate::system::{System, WeakSystem};
use plugos_api::{Environment, FunctionDef, Manifest, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors from invoking plug functions
#[derive(Debug, Error)]
pub enum PlugError {
    #[error("Function {function} not found in plug {plug}")]
    FunctionNotFound { plug: String, function: String },

    #[error("Function {function} can only run in the {required} environment (host is {host})")]
    EnvironmentMismatch {
        function: String,
        required: Environment,
        host: Environment,
    },

    #[error("Function {function} has no code")]
    MissingCode { function: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// A plug registered in a [`System`]
///
/// Permissions are fixed when the plug is constructed. Replacing a plug
/// means loading a new manifest, which builds a new `Plug` with a fresh
/// execution unit.
pub struct Plug {
    name: String,
    manifest: Manifest,
    granted_permissions: BTreeSet<String>,
    env: Option<Environment>,
    sandbox: Sandbox,
    system: WeakSystem,
}

impl Plug {
    pub(crate) fn new(system: &System, manifest: Manifest, channel: UnitChannel) -> Arc<Self> {
        let name = manifest.name.clone();
        let log_capacity = system.config().log_buffer_size;

        Arc::new_cyclic(|plug| Self {
            sandbox: Sandbox::new(&name, channel, plug.clone(), log_capacity),
            granted_permissions: manifest.required_permissions.clone(),
            env: system.config().env,
            system: system.downgrade(),
            manifest,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Permissions this plug may use in syscalls
    pub fn granted_permissions(&self) -> &BTreeSet<String> {
        &self.granted_permissions
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.granted_permissions.contains(permission)
    }

    /// Buffered console output of the plug's code
    pub fn logs(&self) -> Vec<LogEntry> {
        self.sandbox.logs()
    }

    /// Whether a function exists and may run in this host's environment
    pub fn can_invoke(&self, function: &str) -> bool {
        self.manifest
            .functions
            .get(function)
            .map(|def| def.is_runnable_in(self.env))
            .unwrap_or(false)
    }

    /// Invoke a function, loading its code into the unit on first use
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value, PlugError> {
        let def = self.runnable_function(function)?;

        if !self.sandbox.is_loaded(function) {
            let code = def.code.as_deref().ok_or_else(|| PlugError::MissingCode {
                function: function.to_string(),
            })?;
            self.sandbox.load(function, code).await?;
            tracing::debug!(plug = %self.name, function = %function, "Function loaded into unit");
        }

        Ok(self.sandbox.invoke(function, args).await?)
    }

    fn runnable_function(&self, function: &str) -> Result<&FunctionDef, PlugError> {
        let def = self
            .manifest
            .functions
            .get(function)
            .ok_or_else(|| PlugError::FunctionNotFound {
                plug: self.name.clone(),
                function: function.to_string(),
            })?;

        match (def.env, self.env) {
            (Some(required), Some(host)) if !def.is_runnable_in(self.env) => Err(PlugError::EnvironmentMismatch {
                function: function.to_string(),
                required,
                host,
            }),
            _ => Ok(def),
        }
    }

    /// Make a syscall on behalf of this plug
    pub async fn syscall(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<Value, SyscallError> {
        let system = self.system.upgrade().ok_or(SyscallError::SystemUnavailable)?;
        system
            .syscall_with_context(SyscallContext::for_plug(self.clone()), name, args)
            .await
    }

    /// Push the manifest's dependency modules into the unit
    pub(crate) async fn load(&self) -> Result<(), SandboxError> {
        for (name, code) in &self.manifest.dependencies {
            self.sandbox.load_dependency(name, code).await?;
            tracing::debug!(plug = %self.name, dependency = %name, "Dependency loaded");
        }
        Ok(())
    }

    /// Terminate the execution unit
    pub fn stop(&self) {
        self.sandbox.terminate();
    }

    pub fn is_stopped(&self) -> bool {
        self.sandbox.is_terminated()
    }
}

impl std::fmt::Debug for Plug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plug")
            .field("name", &self.name)
            .field("functions", &self.manifest.functions.keys().collect::<Vec<_>>())
            .field("permissions", &self.granted_permissions)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
