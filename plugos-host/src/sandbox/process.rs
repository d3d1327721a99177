//! Out-of-process execution units
//!
//! Each unit is a `plug-worker` child process. Protocol messages travel
//! over its stdin/stdout as length-prefixed MessagePack frames; its stderr
//! is inherited so worker logs end up next to the host's.

use super::{SandboxError, UnitChannel, UnitFactory, UnitHandle};
use plugos_api::codec::{self, CodecError};
use plugos_api::protocol::{HostMessage, UnitMessage};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

/// Spawns each unit as a child process running the worker binary
#[derive(Debug, Clone)]
pub struct ProcessUnitFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessUnitFactory {
    /// Use the worker executable at `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra command line arguments for the worker
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

struct ProcessUnit {
    child: Mutex<Child>,
}

impl UnitHandle for ProcessUnit {
    fn terminate(&self) {
        if let Err(e) = self.child.lock().unwrap().start_kill() {
            tracing::debug!(error = %e, "Worker process already gone");
        }
    }
}

impl UnitFactory for ProcessUnitFactory {
    fn spawn(&self, plug_name: &str) -> Result<UnitChannel, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Spawn(anyhow::anyhow!(
                    "Failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxError::Spawn(anyhow::anyhow!(
                "Worker process has no stdio pipes"
            )));
        };

        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_frames(plug_name.to_string(), stdin, host_rx));
        tokio::spawn(read_frames(plug_name.to_string(), stdout, unit_tx));

        tracing::debug!(plug = %plug_name, pid = ?child.id(), "Worker process started");

        Ok(UnitChannel {
            outbox: host_tx,
            inbox: unit_rx,
            handle: Box::new(ProcessUnit {
                child: Mutex::new(child),
            }),
        })
    }
}

/// Forward host messages to the worker until the host side closes
async fn write_frames(
    plug: String,
    mut stdin: ChildStdin,
    mut messages: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = messages.recv().await {
        let frame = match codec::encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(plug = %plug, error = %e, "Failed to encode host message");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(&frame).await {
            tracing::debug!(plug = %plug, error = %e, "Worker stdin closed");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    // Dropping stdin signals end of input to the worker
}

/// Forward worker messages to the host until the worker exits
async fn read_frames(
    plug: String,
    mut stdout: ChildStdout,
    messages: mpsc::UnboundedSender<UnitMessage>,
) {
    loop {
        match read_frame(&mut stdout).await {
            Ok(Some(message)) => {
                if messages.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(CodecError::Decode(e)) => {
                tracing::warn!(plug = %plug, error = %e, "Skipping malformed frame from worker");
            }
            Err(e) => {
                tracing::warn!(plug = %plug, error = %e, "Worker stdout failed");
                break;
            }
        }
    }
    tracing::debug!(plug = %plug, "Worker process output closed");
}

async fn read_frame(stdout: &mut ChildStdout) -> Result<Option<UnitMessage>, CodecError> {
    let mut prefix = [0u8; 4];
    match stdout.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = codec::frame_len(prefix)?;
    let mut payload = vec![0u8; len];
    stdout.read_exact(&mut payload).await?;
    codec::decode_payload(&payload).map(Some)
}
