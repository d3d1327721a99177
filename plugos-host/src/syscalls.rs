//! Builtin `system.*` syscalls

use crate::syscall::{SyscallContext, SyscallMapping};
use crate::system::{System, WeakSystem};
use anyhow::{anyhow, bail};
use plugos_api::Value;

fn upgrade(system: &WeakSystem) -> anyhow::Result<System> {
    system.upgrade().ok_or_else(|| anyhow!("System is no longer available"))
}

/// Syscalls giving plugs a view of the system they run in
///
/// - `system.invokeFunction("plug.function", ...args)`: call a function of
///   any loaded plug; a bare `function` name targets the calling plug
/// - `system.listSyscalls()`: `[{name, requiredPermissions}]`
/// - `system.listPlugs()`: names of loaded plugs
/// - `system.getEnv()`: `"client"`, `"server"` or null
///
/// None of them require a permission.
pub fn system_syscalls(system: &System) -> SyscallMapping {
    let weak = system.downgrade();

    let invoke = weak.clone();
    let list_syscalls = weak.clone();
    let list_plugs = weak.clone();
    let get_env = weak;

    SyscallMapping::new()
        .with("system.invokeFunction", move |ctx: SyscallContext, args: Vec<Value>| {
            let system = invoke.clone();
            async move {
                let system = upgrade(&system)?;
                let mut args = args.into_iter();
                let target = match args.next() {
                    Some(Value::String(target)) => target,
                    _ => bail!("system.invokeFunction expects a \"plug.function\" name"),
                };

                let (plug_name, function) = match target.split_once('.') {
                    Some((plug, function)) => (plug.to_string(), function.to_string()),
                    None => match ctx.plug_name() {
                        Some(plug) => (plug.to_string(), target.clone()),
                        None => bail!("Function name {} has no plug prefix", target),
                    },
                };

                let plug = system
                    .plug(&plug_name)
                    .ok_or_else(|| anyhow!("Plug {} not found", plug_name))?;
                let result = plug.invoke(&function, args.collect()).await?;
                anyhow::Ok(result)
            }
        })
        .with("system.listSyscalls", move |_ctx, _args| {
            let system = list_syscalls.clone();
            async move {
                let syscalls = upgrade(&system)?.registered_syscalls();
                anyhow::Ok(serde_json::to_value(syscalls)?)
            }
        })
        .with("system.listPlugs", move |_ctx, _args| {
            let system = list_plugs.clone();
            async move {
                let names = upgrade(&system)?.plug_names();
                anyhow::Ok(Value::Array(names.into_iter().map(Value::String).collect()))
            }
        })
        .with("system.getEnv", move |_ctx, _args| {
            let system = get_env.clone();
            async move {
                let env = upgrade(&system)?.env();
                anyhow::Ok(env.map(|env| Value::String(env.to_string())).unwrap_or(Value::Null))
            }
        })
}
