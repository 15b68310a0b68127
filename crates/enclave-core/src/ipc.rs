//! Host ↔ worker protocol.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. The same
//! framing is used for thread slots (over an in-memory duplex) and process
//! slots (over the child's stdin/stdout).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EnclaveError, ErrorKind, ExecutionError};
use crate::request::{ExecutionLimits, ExecutionStats};

/// Default largest frame either side accepts: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Run transformed code.
    Execute {
        /// Correlates audit events and sidecar ownership.
        execution_id: String,
        /// Output of the transformer.
        code: String,
        /// Resolved limits.
        limits: ExecutionLimits,
    },
    /// Answer to [`ChildMessage::ToolCallRequest`].
    ToolCallResult {
        /// Echoes the request id.
        request_id: u64,
        /// What happened.
        outcome: ToolCallOutcome,
    },
    /// Exit after the current execution.
    Shutdown,
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// The script called a tool.
    ToolCallRequest {
        /// Unique within one execution.
        request_id: u64,
        /// Tool name.
        tool: String,
        /// Arguments, possibly holding reference tokens.
        args: Value,
    },
    /// The script wrote to the console.
    Console {
        /// Console method.
        level: ConsoleLevel,
        /// Serialized arguments.
        message: String,
    },
    /// The execution finished.
    ExecutionComplete {
        /// Returned value or failure.
        result: Result<Value, ExecutionError>,
        /// Counters at termination.
        stats: ExecutionStats,
    },
}

/// Console method a message was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
    /// `console.debug`
    Debug,
}

impl ConsoleLevel {
    /// Map the numeric level used by the runtime bootstrap.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Info,
            2 => Self::Warn,
            3 => Self::Error,
            4 => Self::Debug,
            _ => Self::Log,
        }
    }
}

/// Host-side result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    /// The tool returned a value.
    Ok {
        /// Result, possibly a reference token.
        value: Value,
    },
    /// The call failed; the script sees a catchable error.
    Failed {
        /// Stable failure code (`circuit_open`, `tool_not_available`, ...).
        code: String,
        /// Sanitized message.
        message: String,
    },
    /// The call failed in a way that ends the execution.
    Fatal {
        /// Fault kind.
        kind: ErrorKind,
        /// Sanitized message.
        message: String,
    },
}

impl ToolCallOutcome {
    /// A catchable failure.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A fatal failure from a host error.
    pub fn fatal(err: &EnclaveError) -> Self {
        Self::Fatal {
            kind: err.kind(),
            message: crate::redact::sanitize_error_message(&err.to_string()),
        }
    }
}

/// Framing failure.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream failed or closed mid-frame.
    #[error("ipc i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The length prefix exceeds the limit.
    #[error("ipc frame of {size} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Announced size.
        size: usize,
        /// Limit.
        max: usize,
    },
    /// The payload is not a valid message.
    #[error("invalid ipc message: {0}")]
    Invalid(String),
}

impl From<FrameError> for EnclaveError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => EnclaveError::WorkerCrashed {
                reason: format!("worker channel failed: {io}"),
            },
            FrameError::TooLarge { size, max } => EnclaveError::MessageSize { size, max },
            FrameError::Invalid(reason) => EnclaveError::MessageValidation { reason },
        }
    }
}

/// Write one frame.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg).map_err(|e| FrameError::Invalid(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw frame. `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_size,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Decode a frame payload.
pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::Invalid(e.to_string()))
}

/// Read and decode one frame.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, FrameError> {
    match read_frame(reader, max_size).await? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}
