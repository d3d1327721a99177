//! Sandbox: host-side proxy for one execution unit
//!
//! A sandbox owns the channel to a unit and turns the message protocol
//! into async calls:
//!
//! ```text
//!  Plug ──load/invoke──▶ Sandbox ──HostMessage──▶ execution unit
//!                          ▲  │                        │
//!                          │  └──── reactor task ◀─────┘ UnitMessage
//!                          │         │ syscall
//!                          └─────────┴──▶ Plug::syscall ──▶ System
//! ```
//!
//! Outstanding loads are keyed by function name (concurrent loads share
//! one message), outstanding invocations by a monotonically increasing id.
//! On termination every outstanding call is rejected with
//! [`SandboxError::Terminated`].

mod process;
mod thread;

pub use process::ProcessUnitFactory;
pub use thread::ThreadUnitFactory;

use crate::Plug;
use chrono::{DateTime, Utc};
use plugos_api::protocol::{HostMessage, UnitMessage};
use plugos_api::{CallOutcome, LogLevel, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;

/// Default number of log entries kept per sandbox
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 100;

/// Errors that can occur talking to an execution unit
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Execution unit terminated")]
    Terminated,

    /// Error raised inside the unit, carried as its message
    #[error("{0}")]
    Unit(String),

    #[error("Failed to spawn execution unit: {0}")]
    Spawn(#[source] anyhow::Error),
}

/// Handle used to kill an execution unit
pub trait UnitHandle: Send + Sync {
    /// Stop the unit. Must not block.
    fn terminate(&self);
}

/// Both ends of a freshly spawned execution unit, as seen from the host
pub struct UnitChannel {
    pub outbox: UnboundedSender<HostMessage>,
    pub inbox: UnboundedReceiver<UnitMessage>,
    pub handle: Box<dyn UnitHandle>,
}

/// Creates execution units
///
/// One unit is spawned per plug. Implementations decide the substrate
/// (thread, process, ...); all of them speak the same protocol.
pub trait UnitFactory: Send + Sync {
    fn spawn(&self, plug_name: &str) -> Result<UnitChannel, SandboxError>;
}

/// One line of console output from plug code
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

type LoadWaiter = oneshot::Sender<Result<(), SandboxError>>;
type InvokeWaiter = oneshot::Sender<Result<Value, SandboxError>>;

#[derive(Debug, Clone, Copy)]
enum LoadKind {
    Function,
    Dependency,
}

#[derive(Default)]
struct PendingState {
    terminated: bool,
    next_request_id: u64,
    loaded_functions: HashSet<String>,
    loaded_dependencies: HashSet<String>,
    pending_functions: HashMap<String, Vec<LoadWaiter>>,
    pending_dependencies: HashMap<String, Vec<LoadWaiter>>,
    pending_invocations: HashMap<u64, InvokeWaiter>,
}

impl PendingState {
    fn loaded(&mut self, kind: LoadKind) -> &mut HashSet<String> {
        match kind {
            LoadKind::Function => &mut self.loaded_functions,
            LoadKind::Dependency => &mut self.loaded_dependencies,
        }
    }

    fn pending(&mut self, kind: LoadKind) -> &mut HashMap<String, Vec<LoadWaiter>> {
        match kind {
            LoadKind::Function => &mut self.pending_functions,
            LoadKind::Dependency => &mut self.pending_dependencies,
        }
    }

    /// Mark terminated and take every outstanding waiter
    fn abandon(&mut self) -> (Vec<LoadWaiter>, Vec<InvokeWaiter>) {
        self.terminated = true;
        let loads = self
            .pending_functions
            .drain()
            .chain(self.pending_dependencies.drain())
            .flat_map(|(_, waiters)| waiters)
            .collect();
        let invocations = self.pending_invocations.drain().map(|(_, w)| w).collect();
        (loads, invocations)
    }
}

struct Shared {
    plug_name: String,
    state: Mutex<PendingState>,
    logs: Mutex<VecDeque<LogEntry>>,
    log_capacity: usize,
}

impl Shared {
    fn complete_load(&self, kind: LoadKind, name: String, error: Option<String>) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            let waiters = state.pending(kind).remove(&name).unwrap_or_default();
            if error.is_none() {
                state.loaded(kind).insert(name.clone());
            }
            waiters
        };

        if waiters.is_empty() {
            tracing::warn!(plug = %self.plug_name, name = %name, "Load completion with no waiting call");
        }
        for waiter in waiters {
            let result = match &error {
                None => Ok(()),
                Some(message) => Err(SandboxError::Unit(message.clone())),
            };
            let _ = waiter.send(result);
        }
    }

    fn complete_invocation(&self, id: u64, outcome: CallOutcome) {
        let waiter = self.state.lock().unwrap().pending_invocations.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome.into_result().map_err(SandboxError::Unit));
            }
            None => {
                tracing::warn!(plug = %self.plug_name, id, "Result for unknown request id");
            }
        }
    }

    /// Reject everything outstanding; returns false if already terminated
    fn terminate(&self) -> bool {
        let (loads, invocations) = {
            let mut state = self.state.lock().unwrap();
            if state.terminated {
                return false;
            }
            state.abandon()
        };

        for waiter in loads {
            let _ = waiter.send(Err(SandboxError::Terminated));
        }
        for waiter in invocations {
            let _ = waiter.send(Err(SandboxError::Terminated));
        }
        true
    }

    fn push_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(plug = %self.plug_name, "{}", message),
            LogLevel::Info => tracing::info!(plug = %self.plug_name, "{}", message),
            LogLevel::Warn => tracing::warn!(plug = %self.plug_name, "{}", message),
            LogLevel::Error => tracing::error!(plug = %self.plug_name, "{}", message),
        }

        if self.log_capacity == 0 {
            return;
        }
        let mut logs = self.logs.lock().unwrap();
        while logs.len() >= self.log_capacity {
            logs.pop_front();
        }
        logs.push_back(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }
}

/// Host-side proxy for one execution unit
pub struct Sandbox {
    shared: Arc<Shared>,
    outbox: Mutex<Option<UnboundedSender<HostMessage>>>,
    unit: Box<dyn UnitHandle>,
}

impl Sandbox {
    /// Wrap a spawned unit and start its reactor task
    ///
    /// Syscalls from the unit are routed to `plug`. Must be called inside a
    /// tokio runtime.
    pub(crate) fn new(
        plug_name: &str,
        channel: UnitChannel,
        plug: Weak<Plug>,
        log_capacity: usize,
    ) -> Self {
        let UnitChannel {
            outbox,
            inbox,
            handle,
        } = channel;

        let shared = Arc::new(Shared {
            plug_name: plug_name.to_string(),
            state: Mutex::new(PendingState::default()),
            logs: Mutex::new(VecDeque::with_capacity(log_capacity.min(1000))),
            log_capacity,
        });

        tokio::spawn(run_reactor(shared.clone(), inbox, outbox.downgrade(), plug));

        Self {
            shared,
            outbox: Mutex::new(Some(outbox)),
            unit: handle,
        }
    }

    /// Name of the plug this sandbox runs
    pub fn plug_name(&self) -> &str {
        &self.shared.plug_name
    }

    /// Load a function into the unit
    ///
    /// Concurrent loads of the same name attach to one outstanding request.
    pub async fn load(&self, name: &str, code: &str) -> Result<(), SandboxError> {
        self.request_load(LoadKind::Function, name, code).await
    }

    /// Instantiate a dependency module in the unit
    pub async fn load_dependency(&self, name: &str, code: &str) -> Result<(), SandboxError> {
        self.request_load(LoadKind::Dependency, name, code).await
    }

    async fn request_load(&self, kind: LoadKind, name: &str, code: &str) -> Result<(), SandboxError> {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if state.terminated {
                return Err(SandboxError::Terminated);
            }
            if state.loaded(kind).contains(name) {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            if let Some(waiters) = state.pending(kind).get_mut(name) {
                waiters.push(tx);
            } else {
                state.pending(kind).insert(name.to_string(), vec![tx]);
                let message = match kind {
                    LoadKind::Function => HostMessage::Load {
                        name: name.to_string(),
                        code: code.to_string(),
                    },
                    LoadKind::Dependency => HostMessage::LoadDependency {
                        name: name.to_string(),
                        code: code.to_string(),
                    },
                };
                if self.send(message).is_err() {
                    state.pending(kind).remove(name);
                    return Err(SandboxError::Terminated);
                }
            }
            rx
        };

        rx.await.map_err(|_| SandboxError::Terminated)?
    }

    /// Invoke a loaded function
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if state.terminated {
                return Err(SandboxError::Terminated);
            }
            state.next_request_id += 1;
            let id = state.next_request_id;

            let (tx, rx) = oneshot::channel();
            state.pending_invocations.insert(id, tx);
            let message = HostMessage::Invoke {
                id,
                name: name.to_string(),
                args,
            };
            if self.send(message).is_err() {
                state.pending_invocations.remove(&id);
                return Err(SandboxError::Terminated);
            }
            rx
        };

        rx.await.map_err(|_| SandboxError::Terminated)?
    }

    /// Whether a function has been loaded into the unit
    pub fn is_loaded(&self, name: &str) -> bool {
        self.shared
            .state
            .lock()
            .unwrap()
            .loaded_functions
            .contains(name)
    }

    /// Whether the unit has been terminated
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().unwrap().terminated
    }

    /// Snapshot of buffered console output, oldest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.logs.lock().unwrap().iter().cloned().collect()
    }

    /// Kill the unit and reject every outstanding call
    pub fn terminate(&self) {
        if !self.shared.terminate() {
            return;
        }
        self.outbox.lock().unwrap().take();
        self.unit.terminate();
        tracing::debug!(plug = %self.shared.plug_name, "Execution unit terminated");
    }

    fn send(&self, message: HostMessage) -> Result<(), SandboxError> {
        match self.outbox.lock().unwrap().as_ref() {
            Some(outbox) => outbox.send(message).map_err(|_| SandboxError::Terminated),
            None => Err(SandboxError::Terminated),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("plug", &self.shared.plug_name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Consume unit messages until the unit side closes
async fn run_reactor(
    shared: Arc<Shared>,
    mut inbox: UnboundedReceiver<UnitMessage>,
    outbox: WeakUnboundedSender<HostMessage>,
    plug: Weak<Plug>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            UnitMessage::Inited { name, error } => {
                shared.complete_load(LoadKind::Function, name, error);
            }
            UnitMessage::DependencyInited { name, error } => {
                shared.complete_load(LoadKind::Dependency, name, error);
            }
            UnitMessage::Result { id, result, error } => {
                shared.complete_invocation(id, CallOutcome { result, error });
            }
            UnitMessage::Syscall { id, name, args } => {
                let plug = plug.clone();
                let outbox = outbox.clone();
                let plug_name = shared.plug_name.clone();
                tokio::spawn(async move {
                    let outcome: CallOutcome = match plug.upgrade() {
                        Some(plug) => plug.syscall(&name, args).await.map_err(|e| e.to_string()).into(),
                        None => CallOutcome::err(format!("Plug {} is no longer loaded", plug_name)),
                    };
                    if let Some(outbox) = outbox.upgrade() {
                        let _ = outbox.send(HostMessage::syscall_response(id, outcome));
                    }
                });
            }
            UnitMessage::Log { level, message } => shared.push_log(level, message),
            UnitMessage::Unknown => {
                tracing::warn!(plug = %shared.plug_name, "Unknown message type from execution unit");
            }
        }
    }

    if shared.terminate() {
        tracing::warn!(plug = %shared.plug_name, "Execution unit exited");
    }
}
