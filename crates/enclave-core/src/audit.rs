//! Audit events for executions and tool calls.
//!
//! Events never carry script text, tool arguments, or tool results: only a
//! SHA-256 hash of the script, byte lengths, counts, and sanitized error
//! messages. The [`AuditSink`] trait allows pluggable backends;
//! [`JsonLinesAuditSink`] writes newline-delimited JSON to any `AsyncWrite`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{ErrorKind, ExecutionError};
use crate::level::SecurityLevel;
use crate::request::ExecutionStats;

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Execution the event belongs to.
    pub execution_id: String,
    /// What happened.
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditEvent {
    /// Stamp `kind` with the current time.
    pub fn now(execution_id: impl Into<String>, kind: AuditEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_id: execution_id.into(),
            kind,
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditEventKind {
    /// Accepted for execution.
    ExecutionStarted {
        /// SHA-256 hex of the source.
        script_hash: String,
        /// Source length.
        script_bytes: usize,
        /// Runtime level in force.
        security_level: SecurityLevel,
    },
    /// Returned a value.
    ExecutionSucceeded {
        /// Serialized result length.
        result_bytes: usize,
        /// Counters.
        stats: ExecutionStats,
    },
    /// Failed for any reason other than a timeout.
    ExecutionFailed {
        /// Fault kind.
        error_kind: ErrorKind,
        /// Sanitized message.
        message: String,
        /// Counters.
        stats: ExecutionStats,
    },
    /// Stopped by the wall-clock limit.
    ExecutionTimedOut {
        /// Budget in force.
        timeout_ms: u64,
        /// Counters.
        stats: ExecutionStats,
    },
    /// A tool call was dispatched.
    ToolCallStarted {
        /// Tool name.
        tool: String,
        /// Serialized argument length, before reference resolution.
        args_bytes: usize,
    },
    /// A tool call returned.
    ToolCallSucceeded {
        /// Tool name.
        tool: String,
        /// Time spent in the bridge.
        duration_ms: u64,
        /// Serialized result length.
        result_bytes: usize,
    },
    /// A tool call failed or was refused.
    ToolCallFailed {
        /// Tool name.
        tool: String,
        /// Time spent before failing.
        duration_ms: u64,
        /// Failure code (`circuit_open`, `tool_not_available`, a tool error code, ...).
        code: String,
        /// Sanitized message.
        message: String,
    },
}

impl AuditEventKind {
    /// Event name as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionSucceeded { .. } => "execution_succeeded",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionTimedOut { .. } => "execution_timed_out",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallSucceeded { .. } => "tool_call_succeeded",
            Self::ToolCallFailed { .. } => "tool_call_failed",
        }
    }

    /// The terminal event for an execution outcome.
    pub fn finished(
        outcome: &Result<serde_json::Value, ExecutionError>,
        stats: ExecutionStats,
        timeout_ms: u64,
    ) -> Self {
        match outcome {
            Ok(value) => Self::ExecutionSucceeded {
                result_bytes: serde_json::to_string(value).map(|s| s.len()).unwrap_or(0),
                stats,
            },
            Err(e) if e.kind == ErrorKind::WorkerTimeout => {
                Self::ExecutionTimedOut { timeout_ms, stats }
            }
            Err(e) => Self::ExecutionFailed {
                error_kind: e.kind,
                message: e.message.clone(),
                stats,
            },
        }
    }
}

/// Audit backend.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event. Failures are logged, never propagated.
    async fn record(&self, event: &AuditEvent);
}

/// Newline-delimited JSON to an `AsyncWrite`.
pub struct JsonLinesAuditSink<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditSink<W> {
    /// Write to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl JsonLinesAuditSink<tokio::fs::File> {
    /// Append to the file at `path`, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditSink for JsonLinesAuditSink<W> {
    async fn record(&self, event: &AuditEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit event");
        }
        let _ = writer.flush().await;
    }
}

/// Drops every event.
pub struct NoopAuditSink;

#[async_trait::async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: &AuditEvent) {}
}

/// Re-emits events as `tracing` events under target `enclave::audit`.
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) {
        let id = &event.execution_id;
        match &event.kind {
            AuditEventKind::ExecutionStarted {
                script_hash,
                script_bytes,
                security_level,
            } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                script_hash = %script_hash,
                script_bytes,
                security_level = %security_level,
                "execution_started"
            ),
            AuditEventKind::ExecutionSucceeded { result_bytes, stats } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                result_bytes,
                tool_calls = stats.tool_call_count,
                elapsed_ms = stats.elapsed_ms,
                "execution_succeeded"
            ),
            AuditEventKind::ExecutionFailed {
                error_kind,
                message,
                stats,
            } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                error_kind = %error_kind,
                message = %message,
                elapsed_ms = stats.elapsed_ms,
                "execution_failed"
            ),
            AuditEventKind::ExecutionTimedOut { timeout_ms, stats } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                timeout_ms,
                elapsed_ms = stats.elapsed_ms,
                "execution_timed_out"
            ),
            AuditEventKind::ToolCallStarted { tool, args_bytes } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                tool = %tool,
                args_bytes,
                "tool_call_started"
            ),
            AuditEventKind::ToolCallSucceeded {
                tool,
                duration_ms,
                result_bytes,
            } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                tool = %tool,
                duration_ms,
                result_bytes,
                "tool_call_succeeded"
            ),
            AuditEventKind::ToolCallFailed {
                tool,
                duration_ms,
                code,
                message,
            } => tracing::info!(
                target: "enclave::audit",
                execution_id = %id,
                tool = %tool,
                duration_ms,
                code = %code,
                message = %message,
                "tool_call_failed"
            ),
        }
    }
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
