//! In-process execution units, one OS thread each

use super::{SandboxError, UnitChannel, UnitFactory, UnitHandle};
use crate::unit;
use tokio::sync::mpsc;
use wasmtime::Engine;

/// Spawns each unit on a dedicated thread with its own wasm engine
///
/// Every unit gets a private engine so interrupting one plug never traps
/// code of another.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadUnitFactory;

impl ThreadUnitFactory {
    pub fn new() -> Self {
        Self
    }
}

struct ThreadUnit {
    engine: Engine,
}

impl UnitHandle for ThreadUnit {
    fn terminate(&self) {
        // Traps running guest code; the worker then sees its inbox closed
        unit::interrupt(&self.engine);
    }
}

impl UnitFactory for ThreadUnitFactory {
    fn spawn(&self, plug_name: &str) -> Result<UnitChannel, SandboxError> {
        let engine = unit::create_engine().map_err(SandboxError::Spawn)?;
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();

        let worker_engine = engine.clone();
        let name = plug_name.to_string();
        std::thread::Builder::new()
            .name(format!("plug-{}", plug_name))
            .spawn(move || {
                if let Err(e) = unit::run_unit(&worker_engine, host_rx, unit_tx) {
                    tracing::error!(plug = %name, error = %e, "Execution unit failed");
                }
            })
            .map_err(|e| SandboxError::Spawn(e.into()))?;

        Ok(UnitChannel {
            outbox: host_tx,
            inbox: unit_rx,
            handle: Box::new(ThreadUnit { engine }),
        })
    }
}
