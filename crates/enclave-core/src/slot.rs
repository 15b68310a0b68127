//! One worker slot.
//!
//! A [`Slot`] owns at most one live worker. For each job it sends `Execute`,
//! then multiplexes inbound worker frames against tool-call completions and
//! a hard deadline until the worker reports `ExecutionComplete`. Tool calls
//! run concurrently on the host; results are written back by request id.
//!
//! Any lifecycle or messaging fault kills the worker. The slot respawns it
//! before the pool hands it another job.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{EnclaveError, ExecutionError};
use crate::governor::{MessageGuard, MessageLimits};
use crate::host::{WorkerHandle, WorkerSpawner};
use crate::ipc::{decode, ChildMessage, ConsoleLevel, ParentMessage, ToolCallOutcome};
use crate::pool::PoolMetrics;
use crate::request::{ExecutionLimits, ExecutionStats};

/// Answers the tool requests of one execution.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run one tool request.
    async fn invoke(&self, tool: String, args: Value) -> ToolCallOutcome;
}

/// Work for one slot.
#[derive(Clone)]
pub struct SlotJob {
    /// Execution id, for logs.
    pub execution_id: String,
    /// Transformed code.
    pub code: String,
    /// Limits for the run.
    pub limits: ExecutionLimits,
    /// Where tool requests go.
    pub tools: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for SlotJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotJob")
            .field("execution_id", &self.execution_id)
            .field("code_bytes", &self.code.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// What a slot reports for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotOutcome {
    /// Value or fault.
    pub result: Result<Value, ExecutionError>,
    /// Counters; host-measured when the worker never reported.
    pub stats: ExecutionStats,
}

impl SlotOutcome {
    fn fault(err: &EnclaveError, stats: ExecutionStats) -> Self {
        Self {
            result: Err(err.to_execution_error()),
            stats,
        }
    }
}

/// Slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for work.
    Idle,
    /// Running an execution.
    Busy,
    /// Worker lost; respawning.
    Crashed,
    /// Shut down.
    Disposed,
}

/// Tuning shared by every slot of a pool.
pub(crate) struct SlotSettings {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub message_limits: MessageLimits,
    pub kill_grace: Duration,
    pub max_executions: u64,
}

pub(crate) struct Slot {
    id: usize,
    settings: Arc<SlotSettings>,
    metrics: Arc<PoolMetrics>,
    worker: Option<WorkerHandle>,
    executions: u64,
}

struct Driven {
    outcome: SlotOutcome,
    poisoned: bool,
}

impl Slot {
    pub(crate) fn new(id: usize, settings: Arc<SlotSettings>, metrics: Arc<PoolMetrics>) -> Self {
        Self {
            id,
            settings,
            metrics,
            worker: None,
            executions: 0,
        }
    }

    /// Start a worker if none is live.
    pub(crate) async fn warm(&mut self) -> Result<(), EnclaveError> {
        if self.worker.is_none() {
            let handle = self.settings.spawner.spawn().await?;
            self.metrics.spawned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(slot_id = self.id, kind = handle.kind(), "slot worker started");
            self.worker = Some(handle);
            self.executions = 0;
        }
        Ok(())
    }

    /// Whether the slot needs a fresh worker before its next job.
    pub(crate) fn needs_respawn(&self) -> bool {
        self.worker.is_none()
    }

    pub(crate) async fn execute(&mut self, job: &SlotJob) -> SlotOutcome {
        let started = Instant::now();
        if let Err(e) = self.warm().await {
            tracing::error!(slot_id = self.id, error = %e, "worker failed to start");
            return SlotOutcome::fault(&e, host_stats(started, 0));
        }
        let Some(worker) = self.worker.as_mut() else {
            let e = EnclaveError::WorkerStartup {
                reason: "no worker available".into(),
            };
            return SlotOutcome::fault(&e, host_stats(started, 0));
        };

        self.executions += 1;
        let driven = drive(
            worker,
            job,
            self.id,
            self.settings.message_limits.clone(),
            self.settings.kill_grace,
            started,
        )
        .await;

        if driven.poisoned {
            if let Err(e) = &driven.outcome.result {
                if e.kind == crate::error::ErrorKind::WorkerTimeout {
                    self.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.crashed.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.retire("fault").await;
        } else if self.executions >= self.settings.max_executions {
            self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
            self.retire("recycle").await;
        }
        driven.outcome
    }

    async fn retire(&mut self, reason: &'static str) {
        if let Some(mut worker) = self.worker.take() {
            tracing::debug!(slot_id = self.id, reason, executions = self.executions, "retiring worker");
            if reason == "fault" {
                worker.kill();
            } else {
                worker.shutdown(self.settings.kill_grace).await;
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        self.retire("shutdown").await;
    }
}

fn host_stats(started: Instant, tool_call_count: usize) -> ExecutionStats {
    ExecutionStats {
        tool_call_count,
        elapsed_ms: started.elapsed().as_millis() as u64,
        ..ExecutionStats::default()
    }
}

fn log_console(execution_id: &str, level: ConsoleLevel, message: &str) {
    match level {
        ConsoleLevel::Error => tracing::error!(target: "enclave::script", execution_id, "{message}"),
        ConsoleLevel::Warn => tracing::warn!(target: "enclave::script", execution_id, "{message}"),
        ConsoleLevel::Info | ConsoleLevel::Log => {
            tracing::info!(target: "enclave::script", execution_id, "{message}")
        }
        ConsoleLevel::Debug => tracing::debug!(target: "enclave::script", execution_id, "{message}"),
    }
}

async fn drive(
    worker: &mut WorkerHandle,
    job: &SlotJob,
    slot_id: usize,
    message_limits: MessageLimits,
    grace: Duration,
    started: Instant,
) -> Driven {
    let mut tool_calls = 0usize;
    let fault = |worker: &mut WorkerHandle, err: EnclaveError, tool_calls: usize| {
        tracing::warn!(
            slot_id,
            execution_id = %job.execution_id,
            error = %err,
            "execution aborted by host"
        );
        worker.kill();
        Driven {
            outcome: SlotOutcome::fault(&err, host_stats(started, tool_calls)),
            poisoned: true,
        }
    };

    let execute = ParentMessage::Execute {
        execution_id: job.execution_id.clone(),
        code: job.code.clone(),
        limits: job.limits.clone(),
    };
    if let Err(e) = worker.send(&execute).await {
        return fault(worker, e.into(), 0);
    }

    let deadline = started + job.limits.timeout() + grace;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    let mut guard = MessageGuard::new(message_limits);
    let mut calls: JoinSet<(u64, ToolCallOutcome)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut sleep => {
                calls.abort_all();
                let err = EnclaveError::WorkerTimeout { timeout_ms: job.limits.timeout_ms };
                return fault(worker, err, tool_calls);
            }
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                let (request_id, outcome) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        calls.abort_all();
                        let err = EnclaveError::Internal(anyhow::anyhow!("tool handler failed: {e}"));
                        return fault(worker, err, tool_calls);
                    }
                };
                if let Err(e) = worker.send(&ParentMessage::ToolCallResult { request_id, outcome }).await {
                    calls.abort_all();
                    return fault(worker, e.into(), tool_calls);
                }
            }
            frame = worker.next_frame() => {
                let bytes = match frame {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        calls.abort_all();
                        return fault(worker, e.into(), tool_calls);
                    }
                    None => {
                        calls.abort_all();
                        let err = EnclaveError::WorkerCrashed { reason: "worker exited during execution".into() };
                        return fault(worker, err, tool_calls);
                    }
                };
                if let Err(e) = guard.admit(bytes.len()) {
                    calls.abort_all();
                    return fault(worker, e, tool_calls);
                }
                match decode::<ChildMessage>(&bytes) {
                    Ok(ChildMessage::Console { level, message }) => {
                        log_console(&job.execution_id, level, &message);
                    }
                    Ok(ChildMessage::ToolCallRequest { request_id, tool, args }) => {
                        if calls.len() >= job.limits.max_pending_tool_calls {
                            calls.abort_all();
                            let err = EnclaveError::MessageValidation {
                                reason: format!(
                                    "worker exceeded {} in-flight tool calls",
                                    job.limits.max_pending_tool_calls
                                ),
                            };
                            return fault(worker, err, tool_calls);
                        }
                        tool_calls += 1;
                        let tools = job.tools.clone();
                        calls.spawn(async move { (request_id, tools.invoke(tool, args).await) });
                    }
                    Ok(ChildMessage::ExecutionComplete { result, stats }) => {
                        calls.abort_all();
                        let poisoned = result.as_ref().err().is_some_and(|e| e.kind.poisons_worker());
                        return Driven {
                            outcome: SlotOutcome { result, stats },
                            poisoned,
                        };
                    }
                    Err(e) => {
                        calls.abort_all();
                        return fault(worker, e.into(), tool_calls);
                    }
                }
            }
        }
    }
}
