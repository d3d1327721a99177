//! The plug system: registry of plugs, syscalls and hooks
//!
//! [`System`] is a cheap handle (clone it freely). Loading and unloading
//! are serialized; syscall dispatch and invocation run concurrently.

use crate::audit::{AuditEvent, AuditSink, NullAuditSink};
use crate::config::SystemConfig;
use crate::hook::{Hook, LifecycleListener};
use crate::plug::{Plug, PlugError};
use crate::sandbox::{SandboxError, UnitFactory};
use crate::syscall::{RegisteredSyscall, SyscallContext, SyscallError, SyscallInfo, SyscallMapping};
use plugos_api::{Environment, Manifest, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;

/// Errors from loading and unloading plugs
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invalid manifest: {}", .0.join(", "))]
    InvalidManifest(Vec<String>),

    #[error("Plug {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Plug(#[from] PlugError),
}

/// Registry of plugs, syscalls and hooks
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

/// Non-owning handle to a [`System`]
///
/// Plugs and hooks hold one of these so they never keep the system alive.
#[derive(Clone, Default)]
pub struct WeakSystem {
    inner: Weak<SystemInner>,
}

impl WeakSystem {
    pub fn upgrade(&self) -> Option<System> {
        self.inner.upgrade().map(|inner| System { inner })
    }
}

struct SystemInner {
    config: SystemConfig,
    plugs: RwLock<BTreeMap<String, Arc<Plug>>>,
    syscalls: RwLock<BTreeMap<String, RegisteredSyscall>>,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
    /// Serializes load/unload
    lifecycle: tokio::sync::Mutex<()>,
    audit: Arc<dyn AuditSink>,
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        let plugs = std::mem::take(self.plugs.get_mut().unwrap_or_else(|e| e.into_inner()));
        for plug in plugs.values() {
            plug.stop();
        }
    }
}

impl System {
    /// Create a system that discards audit events
    pub fn new(config: SystemConfig) -> Self {
        Self::with_audit(config, Arc::new(NullAuditSink::new()))
    }

    /// Create a system recording to an audit sink
    pub fn with_audit(config: SystemConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            inner: Arc::new(SystemInner {
                config,
                plugs: RwLock::new(BTreeMap::new()),
                syscalls: RwLock::new(BTreeMap::new()),
                hooks: RwLock::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                audit,
            }),
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.inner.config
    }

    /// Environment of this host (`None` for a hybrid host)
    pub fn env(&self) -> Option<Environment> {
        self.inner.config.env
    }

    pub fn downgrade(&self) -> WeakSystem {
        WeakSystem {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Add a hook and let it attach to this system
    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.inner.hooks.write().unwrap().push(hook.clone());
        hook.apply(self);
    }

    /// Subscribe to plug lifecycle events
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    fn validate(&self, manifest: &Manifest) -> Vec<String> {
        let mut errors = Vec::new();
        if manifest.name.trim().is_empty() {
            errors.push("Manifest name must not be empty".to_string());
        }

        let hooks = self.inner.hooks.read().unwrap().clone();
        for hook in hooks {
            errors.extend(hook.validate_manifest(manifest));
        }
        errors
    }

    // ========================================================================
    // Plug lifecycle
    // ========================================================================

    /// Load a plug, replacing any plug with the same name
    ///
    /// The manifest is validated by every hook first; a rejected manifest
    /// leaves the system untouched.
    pub async fn load(&self, manifest: Manifest, factory: &dyn UnitFactory) -> Result<Arc<Plug>, SystemError> {
        let errors = self.validate(&manifest);
        if !errors.is_empty() {
            tracing::warn!(plug = %manifest.name, errors = ?errors, "Manifest rejected");
            self.record(AuditEvent::manifest_rejected(&manifest.name, &errors));
            return Err(SystemError::InvalidManifest(errors));
        }

        let name = manifest.name.clone();
        let (replaced, result) = {
            let _guard = self.inner.lifecycle.lock().await;

            let old = self.inner.plugs.write().unwrap().remove(&name);
            if let Some(old) = &old {
                old.stop();
                self.record(AuditEvent::plug_unloaded(&name));
                tracing::info!(plug = %name, "Plug unloaded for replacement");
            }

            (old.is_some(), self.start_plug(manifest, factory).await)
        };

        if replaced {
            self.notify_unloaded(&name).await;
        }
        let plug = result?;
        self.notify_loaded(&plug).await;
        Ok(plug)
    }

    async fn start_plug(&self, manifest: Manifest, factory: &dyn UnitFactory) -> Result<Arc<Plug>, SystemError> {
        let channel = factory.spawn(&manifest.name)?;
        let event = AuditEvent::plug_loaded(&manifest);
        let plug = Plug::new(self, manifest, channel);

        if let Err(e) = plug.load().await {
            plug.stop();
            tracing::error!(plug = %plug.name(), error = %e, "Failed to load plug dependencies");
            return Err(e.into());
        }

        self.inner
            .plugs
            .write()
            .unwrap()
            .insert(plug.name().to_string(), plug.clone());
        self.record(event);
        tracing::info!(
            plug = %plug.name(),
            functions = plug.manifest().functions.len(),
            "Plug loaded"
        );
        Ok(plug)
    }

    /// Unload a plug and terminate its execution unit
    pub async fn unload(&self, name: &str) -> Result<(), SystemError> {
        {
            let _guard = self.inner.lifecycle.lock().await;
            let plug = self
                .inner
                .plugs
                .write()
                .unwrap()
                .remove(name)
                .ok_or_else(|| SystemError::NotFound(name.to_string()))?;
            plug.stop();
            self.record(AuditEvent::plug_unloaded(name));
            tracing::info!(plug = %name, "Plug unloaded");
        }

        self.notify_unloaded(name).await;
        Ok(())
    }

    /// Unload every plug
    pub async fn unload_all(&self) {
        let plugs = {
            let _guard = self.inner.lifecycle.lock().await;
            let plugs = std::mem::take(&mut *self.inner.plugs.write().unwrap());
            for (name, plug) in &plugs {
                plug.stop();
                self.record(AuditEvent::plug_unloaded(name));
            }
            plugs
        };

        for name in plugs.keys() {
            self.notify_unloaded(name).await;
        }
        tracing::info!(count = plugs.len(), "All plugs unloaded");
    }

    /// Manifests of all loaded plugs, sorted by name
    pub fn to_json(&self) -> Vec<Manifest> {
        self.inner
            .plugs
            .read()
            .unwrap()
            .values()
            .map(|plug| plug.manifest().clone())
            .collect()
    }

    /// Unload everything, then load `manifests` in order
    ///
    /// Stops at the first failure; plugs loaded before it stay loaded.
    pub async fn replace_all_from_json(
        &self,
        manifests: Vec<Manifest>,
        factory: &dyn UnitFactory,
    ) -> Result<(), SystemError> {
        self.unload_all().await;
        for manifest in manifests {
            self.load(manifest, factory).await?;
        }
        Ok(())
    }

    async fn notify_loaded(&self, plug: &Arc<Plug>) {
        let listeners = self.inner.listeners.read().unwrap().clone();
        for listener in listeners {
            listener.plug_loaded(plug).await;
        }
    }

    async fn notify_unloaded(&self, name: &str) {
        let listeners = self.inner.listeners.read().unwrap().clone();
        for listener in listeners {
            listener.plug_unloaded(name).await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn plug(&self, name: &str) -> Option<Arc<Plug>> {
        self.inner.plugs.read().unwrap().get(name).cloned()
    }

    /// All loaded plugs, sorted by name
    pub fn loaded_plugs(&self) -> Vec<Arc<Plug>> {
        self.inner.plugs.read().unwrap().values().cloned().collect()
    }

    pub fn plug_names(&self) -> Vec<String> {
        self.inner.plugs.read().unwrap().keys().cloned().collect()
    }

    /// Invoke a function of a loaded plug
    pub async fn invoke(&self, plug: &str, function: &str, args: Vec<Value>) -> Result<Value, SystemError> {
        let plug = self
            .plug(plug)
            .ok_or_else(|| SystemError::NotFound(plug.to_string()))?;
        Ok(plug.invoke(function, args).await?)
    }

    // ========================================================================
    // Syscalls
    // ========================================================================

    /// Register handlers, each requiring all of `required_permissions`
    ///
    /// Registering an existing name replaces its handler and permissions.
    pub fn register_syscalls(&self, required_permissions: &[&str], mapping: SyscallMapping) {
        let required: std::collections::BTreeSet<String> =
            required_permissions.iter().map(|p| p.to_string()).collect();

        let mut syscalls = self.inner.syscalls.write().unwrap();
        for (name, handler) in mapping {
            tracing::debug!(syscall = %name, permissions = ?required, "Syscall registered");
            syscalls.insert(
                name,
                RegisteredSyscall {
                    required_permissions: required.clone(),
                    handler,
                },
            );
        }
    }

    /// Names and permissions of every registered syscall
    pub fn registered_syscalls(&self) -> Vec<SyscallInfo> {
        self.inner
            .syscalls
            .read()
            .unwrap()
            .iter()
            .map(|(name, entry)| SyscallInfo {
                name: name.clone(),
                required_permissions: entry.required_permissions.iter().cloned().collect(),
            })
            .collect()
    }

    /// Dispatch a syscall after checking the caller's permissions
    pub async fn syscall_with_context(
        &self,
        ctx: SyscallContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, SyscallError> {
        let entry = self
            .inner
            .syscalls
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SyscallError::Unregistered(name.to_string()))?;

        for permission in &entry.required_permissions {
            let Some(plug) = &ctx.plug else {
                return Err(SyscallError::MissingContext {
                    syscall: name.to_string(),
                });
            };
            if !plug.has_permission(permission) {
                tracing::warn!(
                    plug = %plug.name(),
                    syscall = %name,
                    permission = %permission,
                    "Syscall denied"
                );
                self.record(AuditEvent::syscall_denied(plug.name(), name, permission));
                return Err(SyscallError::MissingPermission {
                    syscall: name.to_string(),
                    permission: permission.clone(),
                });
            }
        }

        Ok(entry.handler.call(ctx, args).await?)
    }

    /// Dispatch a syscall as the host (no plug context)
    pub async fn syscall(&self, name: &str, args: Vec<Value>) -> Result<Value, SyscallError> {
        self.syscall_with_context(SyscallContext::host(), name, args).await
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.inner.audit
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.inner.audit.record(event) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("env", &self.inner.config.env)
            .field("plugs", &self.plug_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::sandbox::ThreadUnitFactory;
    use crate::testing::wat;
    use plugos_api::FunctionDef;
    use serde_json::json;

    struct RejectAll;

    impl Hook for RejectAll {
        fn validate_manifest(&self, manifest: &Manifest) -> Vec<String> {
            vec![format!("{} is not welcome", manifest.name)]
        }

        fn apply(self: Arc<Self>, _system: &System) {}
    }

    #[tokio::test]
    async fn test_unregistered_syscall() {
        let system = System::default();
        let err = system.syscall("nope", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Unregistered syscall nope");
    }

    #[tokio::test]
    async fn test_host_context_needs_no_permission_for_open_syscalls() {
        let system = System::default();
        system.register_syscalls(
            &[],
            SyscallMapping::new().with("echo", |_ctx, args: Vec<Value>| async move {
                anyhow::Ok(args.into_iter().next().unwrap_or_default())
            }),
        );
        system.register_syscalls(
            &["admin"],
            SyscallMapping::new().with("danger", |_ctx, _args| async move { anyhow::Ok(json!(true)) }),
        );

        assert_eq!(system.syscall("echo", vec![json!("hi")]).await.unwrap(), json!("hi"));
        assert!(matches!(
            system.syscall("danger", vec![]).await,
            Err(SyscallError::MissingContext { .. })
        ));

        let infos = system.registered_syscalls();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "danger");
        assert_eq!(infos[0].required_permissions, vec!["admin"]);
    }

    #[tokio::test]
    async fn test_reregister_overwrites_permissions() {
        let system = System::default();
        system.register_syscalls(
            &["admin"],
            SyscallMapping::new().with("x", |_ctx, _args| async move { anyhow::Ok(json!(1)) }),
        );
        system.register_syscalls(
            &[],
            SyscallMapping::new().with("x", |_ctx, _args| async move { anyhow::Ok(json!(2)) }),
        );

        assert_eq!(system.syscall("x", vec![]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_rejected_manifest_is_audited() {
        let sink = Arc::new(MemoryAuditSink::new());
        let system = System::with_audit(SystemConfig::default(), sink.clone());
        system.add_hook(Arc::new(RejectAll));

        let manifest = Manifest::new("x").function("f", FunctionDef::with_code(wat::returns(&json!(1))));
        let err = system.load(manifest, &ThreadUnitFactory).await.unwrap_err();

        assert_eq!(err.to_string(), "Invalid manifest: x is not welcome");
        assert!(system.plug("x").is_none());
        assert_eq!(sink.count("manifest_rejected"), 1);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let system = System::default();
        let err = system.load(Manifest::new(""), &ThreadUnitFactory).await.unwrap_err();
        assert!(matches!(err, SystemError::InvalidManifest(ref errors) if errors.len() == 1));
    }

    #[tokio::test]
    async fn test_unload_missing() {
        let system = System::default();
        assert!(matches!(
            system.unload("ghost").await,
            Err(SystemError::NotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_load_invoke_unload() {
        let system = System::default();
        let manifest = Manifest::new("greeter").function("hello", FunctionDef::with_code(wat::returns(&json!("hello"))));

        let plug = system.load(manifest, &ThreadUnitFactory).await.unwrap();
        assert_eq!(system.plug_names(), vec!["greeter"]);
        assert_eq!(
            system.invoke("greeter", "hello", vec![]).await.unwrap(),
            json!("hello")
        );

        system.unload("greeter").await.unwrap();
        assert!(plug.is_stopped());
        assert!(system.plug("greeter").is_none());
    }
}
