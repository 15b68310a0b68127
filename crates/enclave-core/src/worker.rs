//! Worker side of a slot.
//!
//! [`serve`] reads [`ParentMessage`]s, runs each `Execute` to completion on
//! the calling thread, and writes [`ChildMessage`]s back. Tool calls are
//! forwarded to the host and their results routed back to the waiting op by
//! request id. The same loop backs thread slots and the `enclave-worker`
//! binary.
//!
//! V8 runtimes are `!Send`, so `serve` must be driven by a current-thread
//! tokio runtime. Only the framing tasks are spawned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::{EnclaveError, ErrorKind};
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ConsoleLevel, FrameError, ParentMessage,
    ToolCallOutcome,
};
use crate::runtime::{run_script, HostChannel, KillSwitch, ScriptJob};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<ToolCallOutcome>>>>;

fn lock_pending(
    pending: &PendingCalls,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ToolCallOutcome>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`HostChannel`] that forwards over the IPC stream.
struct IpcHostChannel {
    outbound: mpsc::UnboundedSender<ChildMessage>,
    pending: PendingCalls,
    next_id: AtomicU64,
}

#[async_trait]
impl HostChannel for IpcHostChannel {
    fn console(&self, level: ConsoleLevel, message: String) {
        let _ = self.outbound.send(ChildMessage::Console { level, message });
    }

    async fn call_tool(&self, tool: String, args: Value) -> ToolCallOutcome {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast reply cannot miss its waiter.
        lock_pending(&self.pending).insert(request_id, tx);

        if self
            .outbound
            .send(ChildMessage::ToolCallRequest {
                request_id,
                tool,
                args,
            })
            .is_err()
        {
            lock_pending(&self.pending).remove(&request_id);
            return channel_closed();
        }
        rx.await.unwrap_or_else(|_| channel_closed())
    }
}

fn channel_closed() -> ToolCallOutcome {
    ToolCallOutcome::Fatal {
        kind: ErrorKind::WorkerCrashed,
        message: "host channel closed during tool call".into(),
    }
}

/// Serve executions until the host sends `Shutdown` or closes the stream.
///
/// # Errors
///
/// Returns the framing error that ended the session, if any. A clean EOF or
/// `Shutdown` is `Ok`.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    kill_switch: KillSwitch,
    max_message_bytes: usize,
) -> Result<(), EnclaveError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChildMessage>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(msg) = out_rx.recv().await {
            write_message(&mut writer, &msg).await?;
        }
        Ok::<(), FrameError>(())
    });

    let pending: PendingCalls = Arc::default();
    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<ScriptJob>();
    let reader_task = tokio::spawn(read_loop(reader, max_message_bytes, job_tx, pending.clone()));

    while let Some(job) = job_rx.recv().await {
        tracing::debug!(execution_id = %job.execution_id, "execution started");
        let host = Arc::new(IpcHostChannel {
            outbound: out_tx.clone(),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
        });
        let (result, stats) = run_script(&job, host, &kill_switch).await;
        // Waiters left behind by a terminated script are never answered.
        lock_pending(&pending).clear();
        if out_tx
            .send(ChildMessage::ExecutionComplete { result, stats })
            .is_err()
        {
            break;
        }
    }

    drop(out_tx);
    let read_result = match reader_task.await {
        Ok(r) => r,
        Err(e) => Err(FrameError::Invalid(format!("reader task failed: {e}"))),
    };
    let write_result = match writer_task.await {
        Ok(r) => r,
        Err(e) => Err(FrameError::Invalid(format!("writer task failed: {e}"))),
    };
    read_result?;
    write_result?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    max_message_bytes: usize,
    jobs: mpsc::UnboundedSender<ScriptJob>,
    pending: PendingCalls,
) -> Result<(), FrameError> {
    let result = loop {
        match read_message_with_limit::<ParentMessage, _>(&mut reader, max_message_bytes).await {
            Ok(Some(ParentMessage::Execute {
                execution_id,
                code,
                limits,
            })) => {
                let job = ScriptJob {
                    execution_id,
                    code,
                    limits,
                };
                if jobs.send(job).is_err() {
                    break Ok(());
                }
            }
            Ok(Some(ParentMessage::ToolCallResult {
                request_id,
                outcome,
            })) => match lock_pending(&pending).remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(outcome);
                }
                None => tracing::warn!(request_id, "tool result for unknown request"),
            },
            Ok(Some(ParentMessage::Shutdown)) | Ok(None) => break Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "failed to read from host");
                break Err(e);
            }
        }
    };
    // Fail any call still waiting so a blocked script can finish.
    lock_pending(&pending).clear();
    result
}
