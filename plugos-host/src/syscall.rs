//! Syscall handlers and their registry entries
//!
//! A syscall is a named host function plug code can call. Every syscall is
//! registered together with the permissions a plug must hold to call it;
//! the check happens in [`System::syscall_with_context`](crate::System::syscall_with_context)
//! before the handler runs.

use crate::Plug;
use async_trait::async_trait;
use plugos_api::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors from syscall dispatch
#[derive(Debug, Error)]
pub enum SyscallError {
    #[error("Unregistered syscall {0}")]
    Unregistered(String),

    #[error("Syscall {syscall} requires permission and no plug is set")]
    MissingContext { syscall: String },

    #[error("Missing permission '{permission}' for syscall {syscall}")]
    MissingPermission { syscall: String, permission: String },

    #[error("System is no longer available")]
    SystemUnavailable,

    /// Error returned by the handler itself
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Who is making a syscall
#[derive(Clone, Default)]
pub struct SyscallContext {
    /// Calling plug; `None` for calls made by the host itself
    pub plug: Option<Arc<Plug>>,
}

impl SyscallContext {
    /// Context for host-initiated calls
    pub fn host() -> Self {
        Self { plug: None }
    }

    /// Context for calls made by `plug`
    pub fn for_plug(plug: Arc<Plug>) -> Self {
        Self { plug: Some(plug) }
    }

    /// Name of the calling plug, if any
    pub fn plug_name(&self) -> Option<&str> {
        self.plug.as_deref().map(Plug::name)
    }
}

impl std::fmt::Debug for SyscallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallContext")
            .field("plug", &self.plug_name())
            .finish()
    }
}

/// Host function behind a syscall name
///
/// Implemented for every async closure `Fn(SyscallContext, Vec<Value>) -> Future<Output = anyhow::Result<Value>>`.
#[async_trait]
pub trait SyscallHandler: Send + Sync {
    async fn call(&self, ctx: SyscallContext, args: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> SyscallHandler for F
where
    F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: SyscallContext, args: Vec<Value>) -> anyhow::Result<Value> {
        (self)(ctx, args).await
    }
}

/// A set of named handlers, registered together
///
/// ```rust
/// use plugos_host::SyscallMapping;
/// use serde_json::json;
///
/// let mapping = SyscallMapping::new()
///     .with("echo", |_ctx, args| async move {
///         anyhow::Ok(args.into_iter().next().unwrap_or_default())
///     })
///     .with("version", |_ctx, _args| async move { anyhow::Ok(json!("1.0")) });
///
/// assert_eq!(mapping.names().collect::<Vec<_>>(), vec!["echo", "version"]);
/// ```
#[derive(Default, Clone)]
pub struct SyscallMapping {
    handlers: BTreeMap<String, Arc<dyn SyscallHandler>>,
}

impl SyscallMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a closure handler
    pub fn with<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SyscallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.with_handler(name, Arc::new(handler))
    }

    /// Add a shared handler
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn SyscallHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl IntoIterator for SyscallMapping {
    type Item = (String, Arc<dyn SyscallHandler>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Arc<dyn SyscallHandler>>;

    fn into_iter(self) -> Self::IntoIter {
        self.handlers.into_iter()
    }
}

/// Registry entry: handler plus the permissions it demands
#[derive(Clone)]
pub(crate) struct RegisteredSyscall {
    pub(crate) required_permissions: BTreeSet<String>,
    pub(crate) handler: Arc<dyn SyscallHandler>,
}

/// Public description of a registered syscall
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyscallInfo {
    pub name: String,
    pub required_permissions: Vec<String>,
}
