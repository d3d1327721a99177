//! Execution unit worker
//!
//! Runs one plug's wasm code on the calling thread, talking to the host
//! only through the two protocol channels. All dependencies and functions
//! of the plug are instances in a single wasmtime store, so function
//! modules can import dependency modules by name.
//!
//! A syscall made by guest code blocks that guest call until the matching
//! `syscall-response` arrives. While it waits the worker keeps handling
//! `load` and `invoke` messages by re-entering the store, which lets a
//! function invoke another function of the same plug through a syscall.

mod guest;

use anyhow::{anyhow, Context as _};
use base64::Engine as _;
use guest::GuestExports;
use plugos_api::protocol::{HostMessage, UnitMessage};
use plugos_api::{
    pack_ptr_len, unpack_ptr_len, CallOutcome, LogLevel, SyscallCall, Value, IMPORT_MODULE,
    LOG_IMPORT, MEMORY_EXPORT, RUN_EXPORT, SYSCALL_IMPORT,
};
use std::collections::HashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use wasmtime::{
    AsContextMut, Caller, Config, Engine, Extern, Instance, Linker, Module, Store, StoreContextMut,
};

/// Store data of an execution unit
pub(crate) struct UnitState {
    inbox: UnboundedReceiver<HostMessage>,
    outbox: UnboundedSender<UnitMessage>,
    /// Host imports plus every instantiated dependency
    linker: Linker<UnitState>,
    functions: HashMap<String, Instance>,
    next_syscall_id: u64,
    /// Responses that arrived while a nested syscall was outstanding
    held_responses: HashMap<u64, CallOutcome>,
}

/// Create an engine for execution units
///
/// Epoch interruption is enabled so [`interrupt`] can stop runaway guest code.
pub fn create_engine() -> anyhow::Result<Engine> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    config.wasm_memory64(false);
    Engine::new(&config)
}

/// Trap any guest code currently running on stores of `engine`
pub fn interrupt(engine: &Engine) {
    engine.increment_epoch();
}

/// Run an execution unit until the host closes its channel
///
/// Must not be called from inside an async runtime: the worker blocks on
/// its inbox.
pub fn run_unit(
    engine: &Engine,
    inbox: UnboundedReceiver<HostMessage>,
    outbox: UnboundedSender<UnitMessage>,
) -> anyhow::Result<()> {
    let mut linker = Linker::new(engine);
    linker.allow_shadowing(true);
    define_imports(&mut linker)?;

    let mut store = Store::new(
        engine,
        UnitState {
            inbox,
            outbox,
            linker,
            functions: HashMap::new(),
            next_syscall_id: 0,
            held_responses: HashMap::new(),
        },
    );
    store.set_epoch_deadline(1);

    while let Some(message) = store.data_mut().inbox.blocking_recv() {
        if let Err(e) = handle_message(&mut store.as_context_mut(), message) {
            tracing::debug!(error = %e, "Execution unit stopping");
            break;
        }
    }

    Ok(())
}

/// Decode a code blob: WebAssembly text is passed through, anything else is base64
pub fn decode_code(code: &str) -> anyhow::Result<Vec<u8>> {
    let trimmed = code.trim();
    if trimmed.starts_with('(') {
        return Ok(trimmed.as_bytes().to_vec());
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .context("Code is neither WebAssembly text nor base64")
}

/// Handle one host message; fails only when the host is gone
fn handle_message(
    cx: &mut StoreContextMut<'_, UnitState>,
    message: HostMessage,
) -> anyhow::Result<()> {
    let reply = match message {
        HostMessage::Load { name, code } => {
            let error = load_function(cx, &name, &code).err().map(|e| format!("{e:#}"));
            UnitMessage::Inited { name, error }
        }
        HostMessage::LoadDependency { name, code } => {
            let error = load_dependency(cx, &name, &code).err().map(|e| format!("{e:#}"));
            UnitMessage::DependencyInited { name, error }
        }
        HostMessage::Invoke { id, name, args } => {
            let outcome = invoke_function(cx, &name, &args)
                .unwrap_or_else(|e| CallOutcome::err(format!("{e:#}")));
            UnitMessage::result(id, outcome)
        }
        HostMessage::SyscallResponse { id, .. } => {
            tracing::warn!(id, "Syscall response with no waiting call");
            return Ok(());
        }
        HostMessage::Unknown => {
            tracing::warn!("Unknown message type from host");
            return Ok(());
        }
    };
    send(cx.data(), reply)
}

fn send(state: &UnitState, message: UnitMessage) -> anyhow::Result<()> {
    state
        .outbox
        .send(message)
        .map_err(|_| anyhow!("Host channel closed"))
}

fn instantiate(cx: &mut StoreContextMut<'_, UnitState>, code: &str) -> anyhow::Result<Instance> {
    let bytes = decode_code(code)?;
    let module = Module::new(cx.engine(), &bytes).context("Failed to compile module")?;
    let linker = cx.data().linker.clone();
    linker
        .instantiate(&mut *cx, &module)
        .context("Failed to instantiate module")
}

fn load_function(
    cx: &mut StoreContextMut<'_, UnitState>,
    name: &str,
    code: &str,
) -> anyhow::Result<()> {
    let instance = instantiate(cx, code)?;
    GuestExports::of_instance(cx, instance)?;
    instance
        .get_typed_func::<(i32, i32), i64>(&mut *cx, RUN_EXPORT)
        .with_context(|| format!("Guest does not export `{}`", RUN_EXPORT))?;

    cx.data_mut().functions.insert(name.to_string(), instance);
    tracing::debug!(function = %name, "Function loaded");
    Ok(())
}

fn load_dependency(
    cx: &mut StoreContextMut<'_, UnitState>,
    name: &str,
    code: &str,
) -> anyhow::Result<()> {
    let instance = instantiate(cx, code)?;
    let mut linker = cx.data().linker.clone();
    linker.instance(&mut *cx, name, instance)?;
    cx.data_mut().linker = linker;
    tracing::debug!(dependency = %name, "Dependency loaded");
    Ok(())
}

fn invoke_function(
    cx: &mut StoreContextMut<'_, UnitState>,
    name: &str,
    args: &[Value],
) -> anyhow::Result<CallOutcome> {
    let instance = cx
        .data()
        .functions
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("Function {} is not loaded", name))?;
    let exports = GuestExports::of_instance(cx, instance)?;
    let run = instance.get_typed_func::<(i32, i32), i64>(&mut *cx, RUN_EXPORT)?;

    let input = rmp_serde::to_vec_named(args)?;
    let (ptr, len) = exports.write(&mut *cx, &input)?;
    let called = run.call(&mut *cx, (ptr, len));
    exports.release(&mut *cx, ptr, len);
    let packed = called?;

    let (out_ptr, out_len) = unpack_ptr_len(packed);
    let output = exports.read(&*cx, out_ptr, out_len)?;
    exports.release(&mut *cx, out_ptr, out_len);

    rmp_serde::from_slice(&output).context("Malformed call outcome from guest")
}

/// Send a syscall to the host and wait for its response
fn request_syscall(
    cx: &mut StoreContextMut<'_, UnitState>,
    call: SyscallCall,
) -> anyhow::Result<CallOutcome> {
    let id = {
        let state = cx.data_mut();
        state.next_syscall_id += 1;
        state.next_syscall_id
    };
    send(
        cx.data(),
        UnitMessage::Syscall {
            id,
            name: call.name,
            args: call.args,
        },
    )?;

    loop {
        if let Some(outcome) = cx.data_mut().held_responses.remove(&id) {
            return Ok(outcome);
        }

        let message = cx
            .data_mut()
            .inbox
            .blocking_recv()
            .ok_or_else(|| anyhow!("Execution unit terminated"))?;

        match message {
            HostMessage::SyscallResponse {
                id: reply_id,
                result,
                error,
            } => {
                let outcome = CallOutcome { result, error };
                if reply_id == id {
                    return Ok(outcome);
                }
                cx.data_mut().held_responses.insert(reply_id, outcome);
            }
            other => handle_message(cx, other)?,
        }
    }
}

fn define_imports(linker: &mut Linker<UnitState>) -> anyhow::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        SYSCALL_IMPORT,
        |mut caller: Caller<'_, UnitState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let exports = GuestExports::of_caller(&mut caller)?;
            let request = exports.read(&caller, ptr, len)?;
            let call: SyscallCall =
                rmp_serde::from_slice(&request).context("Malformed syscall request")?;

            let outcome = request_syscall(&mut caller.as_context_mut(), call)?;

            let response = rmp_serde::to_vec_named(&outcome)?;
            let (out_ptr, out_len) = exports.write(&mut caller, &response)?;
            Ok(pack_ptr_len(out_ptr, out_len))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        LOG_IMPORT,
        |mut caller: Caller<'_, UnitState>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = caller
                .get_export(MEMORY_EXPORT)
                .and_then(Extern::into_memory)
                .ok_or_else(|| anyhow!("Guest does not export `{}`", MEMORY_EXPORT))?;
            let bytes = guest::read_memory(&memory, &caller, ptr, len)?;
            send(
                caller.data(),
                UnitMessage::Log {
                    level: LogLevel::from_i32(level),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                },
            )
        },
    )?;

    Ok(())
}
