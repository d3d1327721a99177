//! plugos-host: Plug runtime for PlugOS
//!
//! Loads plugs (manifests of WebAssembly functions) into isolated
//! execution units and connects them to host-provided syscalls:
//!
//! - [`System`]: registry of plugs, syscalls and hooks
//! - [`Plug`]: one loaded manifest and its execution unit
//! - [`Sandbox`]: host-side proxy speaking the worker protocol
//! - [`ThreadUnitFactory`] / [`ProcessUnitFactory`]: unit substrates
//! - [`hooks`]: event and endpoint hooks
//!
//! # Example
//!
//! ```no_run
//! use plugos_host::{FunctionDef, Manifest, System, SystemConfig, SyscallMapping, ThreadUnitFactory};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let system = System::new(SystemConfig::default());
//! system.register_syscalls(
//!     &[],
//!     SyscallMapping::new().with("echo", |_ctx, args| async move {
//!         anyhow::Ok(args.into_iter().next().unwrap_or_default())
//!     }),
//! );
//!
//! let manifest = Manifest::new("hello").function("greet", FunctionDef::with_code("..."));
//! let plug = system.load(manifest, &ThreadUnitFactory).await?;
//! let greeting = plug.invoke("greet", vec![json!("world")]).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod discovery;
pub mod hook;
pub mod hooks;
pub mod plug;
pub mod sandbox;
pub mod syscall;
pub mod syscalls;
pub mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracing_support;
pub mod unit;
pub mod watcher;

pub use config::SystemConfig;
pub use hook::{Hook, LifecycleListener};
pub use plug::{Plug, PlugError};
pub use sandbox::{
    LogEntry, ProcessUnitFactory, Sandbox, SandboxError, ThreadUnitFactory, UnitChannel, UnitFactory,
    UnitHandle,
};
pub use syscall::{SyscallContext, SyscallError, SyscallHandler, SyscallInfo, SyscallMapping};
pub use syscalls::system_syscalls;
pub use system::{System, SystemError, WeakSystem};
pub use plugos_api::{Environment, FunctionDef, LogLevel, Manifest, Value};
