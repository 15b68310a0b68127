//! Enclave worker: one pool slot hosted in a child process.
//!
//! Spawned by the host's process spawner. Reads framed `ParentMessage`s from
//! stdin, runs each execution in a fresh V8 isolate, and writes
//! `ChildMessage`s to stdout. Tool calls are forwarded to the host over the
//! same stream.
//!
//! The process runs with an empty environment and holds no credentials.

use anyhow::{Context, Result};
use enclave_core::ipc::DEFAULT_MAX_MESSAGE_BYTES;
use enclave_core::runtime::KillSwitch;
use tokio::io::{self, BufReader};

fn parse_args() -> Result<usize> {
    let mut max_message_bytes = DEFAULT_MAX_MESSAGE_BYTES;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--max-message-bytes" => {
                let value = args
                    .next()
                    .context("--max-message-bytes requires a value")?;
                max_message_bytes = value
                    .parse()
                    .with_context(|| format!("invalid --max-message-bytes: {value}"))?;
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }
    anyhow::ensure!(max_message_bytes > 0, "--max-message-bytes must be positive");
    Ok(max_message_bytes)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // The host already clears the environment; this covers direct launches.
    let keys: Vec<String> = std::env::vars_os()
        .filter_map(|(k, _)| k.into_string().ok())
        .collect();
    for key in keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let max_message_bytes = parse_args()?;

    let stdin = BufReader::new(io::stdin());
    let stdout = io::stdout();
    enclave_core::worker::serve(stdin, stdout, KillSwitch::default(), max_message_bytes)
        .await
        .context("worker session ended with an IPC error")?;

    Ok(())
}
