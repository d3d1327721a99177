//! plug-worker: runs one execution unit over stdin/stdout
//!
//! Reads length-prefixed host messages from stdin and writes unit messages
//! to stdout. Exits when stdin closes. Logs go to stderr.

use anyhow::Context;
use plugos_api::codec::{self, CodecError};
use plugos_api::protocol::{HostMessage, UnitMessage};
use plugos_host::tracing_support::{init_subscriber_with_config, TracingConfig};
use plugos_host::unit;
use std::io::{BufReader, BufWriter};
use tokio::sync::mpsc;

fn main() -> anyhow::Result<()> {
    init_subscriber_with_config(TracingConfig {
        thread_names: true,
        ..Default::default()
    });

    let engine = unit::create_engine().context("Failed to create wasm engine")?;
    let (host_tx, host_rx) = mpsc::unbounded_channel::<HostMessage>();
    let (unit_tx, mut unit_rx) = mpsc::unbounded_channel::<UnitMessage>();

    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let mut stdin = BufReader::new(std::io::stdin().lock());
            loop {
                match codec::read_frame::<_, HostMessage>(&mut stdin) {
                    Ok(Some(message)) => {
                        if host_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(CodecError::Decode(e)) => {
                        tracing::warn!(error = %e, "Skipping malformed frame from host");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read from host");
                        break;
                    }
                }
            }
        })
        .context("Failed to start stdin reader")?;

    let writer = std::thread::Builder::new()
        .name("stdout".into())
        .spawn(move || {
            let mut stdout = BufWriter::new(std::io::stdout().lock());
            while let Some(message) = unit_rx.blocking_recv() {
                if let Err(e) = codec::write_frame(&mut stdout, &message) {
                    tracing::error!(error = %e, "Failed to write to host");
                    break;
                }
            }
        })
        .context("Failed to start stdout writer")?;

    tracing::debug!("Execution unit worker started");
    unit::run_unit(&engine, host_rx, unit_tx)?;

    // Let queued messages reach the host; the store (and its sender) is gone
    let _ = writer.join();
    Ok(())
}
