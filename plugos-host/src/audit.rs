//! Audit log for plug lifecycle and permission events
//!
//! The [`System`](crate::System) records every plug load and unload, every
//! rejected manifest and every syscall denied by the permission check.
//! Where events go is up to the [`AuditSink`] the system is built with.

use plugos_api::Manifest;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Events kept by [`MemoryAuditSink::new`]
pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;

/// One audited runtime action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// RFC 3339 time the event was recorded
    pub timestamp: String,
    pub plug: String,
    #[serde(flatten)]
    pub action: AuditAction,
}

/// What happened to the plug
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    PlugLoaded {
        functions: Vec<String>,
        permissions: Vec<String>,
    },
    /// Unloaded explicitly or replaced by a new load
    PlugUnloaded,
    ManifestRejected {
        errors: Vec<String>,
    },
    SyscallDenied {
        syscall: String,
        permission: String,
    },
}

impl AuditAction {
    /// Serialized tag of this action
    pub fn name(&self) -> &'static str {
        match self {
            AuditAction::PlugLoaded { .. } => "plug_loaded",
            AuditAction::PlugUnloaded => "plug_unloaded",
            AuditAction::ManifestRejected { .. } => "manifest_rejected",
            AuditAction::SyscallDenied { .. } => "syscall_denied",
        }
    }
}

impl AuditEvent {
    fn new(plug: impl Into<String>, action: AuditAction) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            plug: plug.into(),
            action,
        }
    }

    pub fn plug_loaded(manifest: &Manifest) -> Self {
        Self::new(
            &manifest.name,
            AuditAction::PlugLoaded {
                functions: manifest.functions.keys().cloned().collect(),
                permissions: manifest.required_permissions.iter().cloned().collect(),
            },
        )
    }

    pub fn plug_unloaded(plug: &str) -> Self {
        Self::new(plug, AuditAction::PlugUnloaded)
    }

    pub fn manifest_rejected(plug: &str, errors: &[String]) -> Self {
        Self::new(
            plug,
            AuditAction::ManifestRejected {
                errors: errors.to_vec(),
            },
        )
    }

    pub fn syscall_denied(plug: &str, syscall: &str, permission: &str) -> Self {
        Self::new(
            plug,
            AuditAction::SyscallDenied {
                syscall: syscall.to_string(),
                permission: permission.to_string(),
            },
        )
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for audit events
///
/// # Example
///
/// ```rust
/// use plugos_host::audit::{AuditError, AuditEvent, AuditSink};
///
/// struct StderrAuditSink;
///
/// impl AuditSink for StderrAuditSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{} {}", event.action.name(), event.plug);
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Flush buffered events, if the sink buffers
    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Appends events to a file as JSON lines
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    /// Open the log in append mode, creating it and its parent directories
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{}", line)?;
        // Denials hit the file right away, the rest on flush or drop
        if matches!(event.action, AuditAction::SyscallDenied { .. }) {
            writer.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.writer.lock().unwrap().flush()?;
        Ok(())
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush audit log");
        }
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink").field("path", &self.path).finish()
    }
}

/// Keeps the most recent events in memory
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// Keep at most `capacity` events, dropping the oldest
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Action names recorded for `plug`, in order
    pub fn actions_for(&self, plug: &str) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.plug == plug)
            .map(|event| event.action.name())
            .collect()
    }

    /// Number of events with the given action name
    pub fn count(&self, action: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.action.name() == action)
            .count()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl NullAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}
