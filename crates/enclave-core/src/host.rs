//! Host-side handles to worker slots.
//!
//! A worker is anything that speaks the IPC protocol on a byte stream:
//! a dedicated OS thread running [`worker::serve`](crate::worker::serve)
//! over an in-memory duplex, or an `enclave-worker` child process over its
//! stdin/stdout. [`WorkerHandle`] hides the difference from the pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::EnclaveError;
use crate::ipc::{read_frame, write_message, FrameError, ParentMessage};
use crate::runtime::KillSwitch;

/// Environment variable naming the worker binary. Must be absolute.
pub const WORKER_BIN_ENV: &str = "ENCLAVE_WORKER_BIN";

/// Name of the worker executable.
pub const WORKER_BIN_NAME: &str = "enclave-worker";

/// Set to pass the worker's stderr through.
pub const DEBUG_ENV: &str = "ENCLAVE_DEBUG";

const FRAME_BUFFER: usize = 64;
const DUPLEX_BUFFER: usize = 256 * 1024;
const WORKER_THREAD_STACK: usize = 8 * 1024 * 1024;

enum Control {
    Thread { kill_switch: KillSwitch },
    Process { child: Child },
    Task { task: JoinHandle<()> },
}

/// A live worker: an outbound frame writer, an inbound frame stream, and a
/// way to kill it.
pub struct WorkerHandle {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    frames: mpsc::Receiver<Result<Vec<u8>, FrameError>>,
    pump: JoinHandle<()>,
    control: Control,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    fn new<R>(
        reader: R,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        control: Control,
        max_message_bytes: usize,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, frames) = mpsc::channel(FRAME_BUFFER);
        let pump = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader, max_message_bytes).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Self {
            writer,
            frames,
            pump,
            control,
        }
    }

    /// Wrap an in-process task that serves the protocol on the given stream
    /// halves. Killing the handle aborts the task.
    pub fn from_task<R, W>(reader: R, writer: W, task: JoinHandle<()>, max_message_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(reader, Box::new(writer), Control::Task { task }, max_message_bytes)
    }

    /// `thread`, `process`, or `task`.
    pub fn kind(&self) -> &'static str {
        match self.control {
            Control::Thread { .. } => "thread",
            Control::Process { .. } => "process",
            Control::Task { .. } => "task",
        }
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &ParentMessage) -> Result<(), FrameError> {
        write_message(&mut self.writer, msg).await
    }

    /// Next inbound frame. `None` once the worker has closed its side.
    pub async fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        self.frames.recv().await
    }

    /// Stop the worker now. The handle is unusable afterwards.
    pub fn kill(&mut self) {
        match &mut self.control {
            Control::Thread { kill_switch } => {
                kill_switch.kill();
            }
            Control::Process { child } => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill worker process");
                }
            }
            Control::Task { task } => task.abort(),
        }
        self.pump.abort();
    }

    /// Ask the worker to exit, then make sure it does.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.send(&ParentMessage::Shutdown).await;
        if let Control::Process { child } = &mut self.control {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                let _ = child.start_kill();
            }
        }
        // Dropping the writer closes a thread worker's stream.
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.pump.abort();
        if let Control::Task { task } = &self.control {
            task.abort();
        }
    }
}

/// Creates workers for the pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start one worker.
    async fn spawn(&self) -> Result<WorkerHandle, EnclaveError>;
}

/// Workers on dedicated OS threads, each with its own current-thread
/// runtime and V8 isolates.
#[derive(Debug)]
pub struct ThreadSpawner {
    max_message_bytes: usize,
    next_id: AtomicU64,
}

impl ThreadSpawner {
    /// Spawner whose workers accept frames up to `max_message_bytes`.
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    async fn spawn(&self) -> Result<WorkerHandle, EnclaveError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let max = self.max_message_bytes;
        let (host_io, worker_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let (worker_r, worker_w) = tokio::io::split(worker_io);
        let (host_r, host_w) = tokio::io::split(host_io);
        let kill_switch = KillSwitch::default();
        let worker_kill = kill_switch.clone();

        std::thread::Builder::new()
            .name(format!("enclave-worker-{id}"))
            .stack_size(WORKER_THREAD_STACK)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                if let Err(e) = rt.block_on(crate::worker::serve(worker_r, worker_w, worker_kill, max)) {
                    tracing::warn!(error = %e, "worker thread session ended with error");
                }
            })
            .map_err(|e| EnclaveError::WorkerStartup {
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        tracing::debug!(worker = id, "spawned thread worker");
        Ok(WorkerHandle::new(
            host_r,
            Box::new(host_w),
            Control::Thread { kill_switch },
            max,
        ))
    }
}

/// Workers in `enclave-worker` child processes with a cleared environment.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    binary: Option<PathBuf>,
    max_message_bytes: usize,
}

impl ProcessSpawner {
    /// Locate the binary on every spawn (see [`find_worker_binary`]).
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            binary: None,
            max_message_bytes,
        }
    }

    /// Always spawn `binary`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<WorkerHandle, EnclaveError> {
        let bin = match &self.binary {
            Some(b) => {
                validate_binary_permissions(b)?;
                b.clone()
            }
            None => find_worker_binary()?,
        };

        let mut child = Command::new(&bin)
            .arg("--max-message-bytes")
            .arg(self.max_message_bytes.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var_os(DEBUG_ENV).is_some() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnclaveError::WorkerStartup {
                reason: format!("failed to spawn worker at {}: {e}", bin.display()),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| EnclaveError::WorkerStartup {
            reason: "worker has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EnclaveError::WorkerStartup {
            reason: "worker has no stdout".into(),
        })?;

        tracing::debug!(pid = child.id(), "spawned process worker");
        Ok(WorkerHandle::new(
            BufReader::new(stdout),
            Box::new(stdin),
            Control::Process { child },
            self.max_message_bytes,
        ))
    }
}

/// Find the `enclave-worker` binary.
///
/// Search order:
/// 1. `ENCLAVE_WORKER_BIN` (must be an absolute path)
/// 2. the directory of the current executable, then its parent (test
///    binaries live in `target/<profile>/deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_worker_binary() -> Result<PathBuf, EnclaveError> {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(EnclaveError::WorkerStartup {
                reason: format!("{WORKER_BIN_ENV} must be an absolute path"),
            });
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        let dirs = exe.parent().into_iter().flat_map(|d| [Some(d), d.parent()]).flatten();
        for dir in dirs {
            let candidate = dir.join(WORKER_BIN_NAME);
            if candidate.exists() {
                validate_binary_permissions(&candidate)?;
                return Ok(candidate);
            }
        }
    }

    Err(EnclaveError::WorkerStartup {
        reason: format!(
            "{WORKER_BIN_NAME} binary not found; set {WORKER_BIN_ENV} or install it next to the host"
        ),
    })
}

fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), EnclaveError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| EnclaveError::WorkerStartup {
            reason: format!("cannot read metadata for {}: {e}", _path.display()),
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(EnclaveError::WorkerStartup {
                reason: format!(
                    "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
                    _path.display()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{decode, ChildMessage, ConsoleLevel, DEFAULT_MAX_MESSAGE_BYTES};
    use serial_test::serial;

    #[test]
    #[serial]
    fn relative_env_path_is_rejected() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/worker");
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn world_writable_binary_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, &bin);
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        assert!(result.unwrap_err().to_string().contains("insecure"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn secure_binary_from_env_is_used() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, &bin);
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        assert_eq!(result.unwrap(), bin);
    }

    #[tokio::test]
    async fn task_worker_frames_flow_both_ways() {
        let (host_io, worker_io) = tokio::io::duplex(4096);
        let (host_r, host_w) = tokio::io::split(host_io);
        let (mut worker_r, mut worker_w) = tokio::io::split(worker_io);
        let task = tokio::spawn(async move {
            let frame = read_frame(&mut worker_r, 4096).await.unwrap().unwrap();
            let msg: ParentMessage = decode(&frame).unwrap();
            assert_eq!(msg, ParentMessage::Shutdown);
            write_message(
                &mut worker_w,
                &ChildMessage::Console {
                    level: ConsoleLevel::Info,
                    message: "bye".into(),
                },
            )
            .await
            .unwrap();
        });
        let mut handle = WorkerHandle::from_task(host_r, host_w, task, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(handle.kind(), "task");
        handle.send(&ParentMessage::Shutdown).await.unwrap();
        let frame = handle.next_frame().await.unwrap().unwrap();
        let msg: ChildMessage = decode(&frame).unwrap();
        assert!(matches!(msg, ChildMessage::Console { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn thread_worker_runs_a_script() {
        let spawner = ThreadSpawner::new(DEFAULT_MAX_MESSAGE_BYTES);
        let mut handle = spawner.spawn().await.unwrap();
        handle
            .send(&ParentMessage::Execute {
                execution_id: "t1".into(),
                code: "async function __ag_main() { return 6 * 7; }".into(),
                limits: crate::request::ExecutionLimits::default(),
            })
            .await
            .unwrap();
        let frame = handle.next_frame().await.unwrap().unwrap();
        let msg: ChildMessage = decode(&frame).unwrap();
        let ChildMessage::ExecutionComplete { result, .. } = msg else {
            panic!("expected completion, got {msg:?}");
        };
        assert_eq!(result.unwrap(), serde_json::json!(42));
        handle.shutdown(Duration::from_secs(1)).await;
    }
}
