//! Error types for the enclave.
//!
//! [`EnclaveError`] is the single error enum used throughout the crate.
//! [`ErrorKind`] is its closed, serializable tag; it is what callers see in an
//! [`ExecutionResult`](crate::ExecutionResult).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while validating, transforming, or running a script.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnclaveError {
    /// The script could not be parsed.
    #[error("parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// The script parsed but violated the security policy.
    #[error("validation failed: {summary}")]
    ValidationFailed {
        /// Issue codes and messages, without any script source.
        summary: String,
    },

    /// A validator rule was configured with contradictory or missing parameters.
    #[error("rule configuration error in {rule}: {reason}")]
    RuleConfiguration {
        /// The rule that was rejected.
        rule: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Enclave or execution configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The script threw an uncaught error.
    #[error("script error: {message}")]
    Script {
        /// The error message thrown by the script.
        message: String,
    },

    /// Execution exceeded its wall-clock budget.
    #[error("execution timed out after {timeout_ms}ms")]
    WorkerTimeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Execution exceeded its memory ceiling and was terminated.
    #[error("memory limit of {max_bytes} bytes exceeded")]
    WorkerMemory {
        /// Configured memory ceiling.
        max_bytes: usize,
    },

    /// The worker died unexpectedly.
    #[error("worker crashed: {reason}")]
    WorkerCrashed {
        /// What was observed.
        reason: String,
    },

    /// A worker could not be started.
    #[error("worker failed to start: {reason}")]
    WorkerStartup {
        /// Why startup failed.
        reason: String,
    },

    /// The admission queue is full.
    #[error("execution queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A queued execution waited too long for a free slot.
    #[error("execution waited more than {waited_ms}ms for a worker")]
    QueueTimeout {
        /// Configured wait bound in milliseconds.
        waited_ms: u64,
    },

    /// The pool was disposed before the execution could run.
    #[error("worker pool has been disposed")]
    WorkerPoolDisposed,

    /// The worker sent messages faster than allowed.
    #[error("worker message rate exceeded ({max_per_window} per {window_ms}ms)")]
    MessageFlood {
        /// Messages allowed per window.
        max_per_window: u32,
        /// Window length in milliseconds.
        window_ms: u64,
    },

    /// The worker sent a message larger than allowed.
    #[error("worker message of {size} bytes exceeds limit of {max} bytes")]
    MessageSize {
        /// Size of the offending message.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The worker sent a malformed or unexpected message.
    #[error("invalid worker message: {reason}")]
    MessageValidation {
        /// What was wrong with it.
        reason: String,
    },

    /// The sidecar cannot hold another value.
    #[error("sidecar limit exceeded: {reason}")]
    SidecarLimit {
        /// Which budget was exhausted.
        reason: String,
    },

    /// A reference token is unknown, expired, or owned by another execution.
    #[error("reference not found: {id}")]
    ReferenceNotFound {
        /// The reference id (never the value).
        id: String,
    },

    /// Resolving references would exceed a resolution budget.
    #[error("reference resolution limit exceeded: {reason}")]
    ResolutionLimit {
        /// Which budget was exceeded.
        reason: String,
    },

    /// Too many tool calls were in flight at once.
    #[error("too many pending tool calls (max {max})")]
    TooManyPendingCalls {
        /// Configured maximum.
        max: usize,
    },

    /// Too many loop iterations.
    #[error("iteration limit of {max} exceeded")]
    IterationLimit {
        /// Configured maximum.
        max: u64,
    },

    /// Too many bytes written to the console.
    #[error("console output limit of {max} bytes exceeded")]
    ConsoleOutputLimit {
        /// Configured maximum.
        max: usize,
    },

    /// Too many console calls.
    #[error("console call limit of {max} exceeded")]
    ConsoleCallLimit {
        /// Configured maximum.
        max: usize,
    },

    /// Too many tool calls in one execution.
    #[error("tool call limit exceeded (max {max} calls per execution)")]
    ToolCallLimit {
        /// Configured maximum.
        max: usize,
    },

    /// The script's return value is too large.
    #[error("result exceeds maximum size of {max} bytes")]
    ResultTooLarge {
        /// Configured maximum.
        max: usize,
    },

    /// The circuit breaker for a tool target is open.
    #[error("circuit breaker open for target '{target}'")]
    CircuitOpen {
        /// The breaker's target id.
        target: String,
    },

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Closed set of fault kinds carried in execution results and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`EnclaveError::Parse`].
    Parse,
    /// See [`EnclaveError::ValidationFailed`].
    Validation,
    /// See [`EnclaveError::RuleConfiguration`].
    RuleConfiguration,
    /// See [`EnclaveError::Configuration`].
    Configuration,
    /// See [`EnclaveError::Script`].
    Script,
    /// See [`EnclaveError::WorkerTimeout`].
    WorkerTimeout,
    /// See [`EnclaveError::WorkerMemory`].
    WorkerMemory,
    /// See [`EnclaveError::WorkerCrashed`].
    WorkerCrashed,
    /// See [`EnclaveError::WorkerStartup`].
    WorkerStartup,
    /// See [`EnclaveError::QueueFull`].
    QueueFull,
    /// See [`EnclaveError::QueueTimeout`].
    QueueTimeout,
    /// See [`EnclaveError::WorkerPoolDisposed`].
    WorkerPoolDisposed,
    /// See [`EnclaveError::MessageFlood`].
    MessageFlood,
    /// See [`EnclaveError::MessageSize`].
    MessageSize,
    /// See [`EnclaveError::MessageValidation`].
    MessageValidation,
    /// See [`EnclaveError::SidecarLimit`].
    SidecarLimit,
    /// See [`EnclaveError::ReferenceNotFound`].
    ReferenceNotFound,
    /// See [`EnclaveError::ResolutionLimit`].
    ResolutionLimit,
    /// See [`EnclaveError::TooManyPendingCalls`].
    TooManyPendingCalls,
    /// See [`EnclaveError::IterationLimit`].
    IterationLimit,
    /// See [`EnclaveError::ConsoleOutputLimit`].
    ConsoleOutputLimit,
    /// See [`EnclaveError::ConsoleCallLimit`].
    ConsoleCallLimit,
    /// See [`EnclaveError::ToolCallLimit`].
    ToolCallLimit,
    /// See [`EnclaveError::ResultTooLarge`].
    ResultTooLarge,
    /// See [`EnclaveError::CircuitOpen`].
    CircuitOpen,
    /// Serialization or other unexpected failure.
    Internal,
}

/// Whether a fault came from the script's own logic or from the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOrigin {
    /// The script ran and failed on its own terms.
    Script,
    /// The sandbox or its infrastructure rejected or stopped the script.
    Sandbox,
}

impl ErrorKind {
    /// Classify this kind for clients.
    pub fn origin(self) -> FaultOrigin {
        match self {
            Self::Script | Self::CircuitOpen => FaultOrigin::Script,
            _ => FaultOrigin::Sandbox,
        }
    }

    /// Whether a fault of this kind leaves the worker slot unusable.
    ///
    /// Lifecycle and messaging faults force the pool to recycle the slot.
    pub fn poisons_worker(self) -> bool {
        matches!(
            self,
            Self::WorkerTimeout
                | Self::WorkerMemory
                | Self::WorkerCrashed
                | Self::WorkerStartup
                | Self::MessageFlood
                | Self::MessageSize
                | Self::MessageValidation
        )
    }

    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::RuleConfiguration => "rule_configuration",
            Self::Configuration => "configuration",
            Self::Script => "script",
            Self::WorkerTimeout => "worker_timeout",
            Self::WorkerMemory => "worker_memory",
            Self::WorkerCrashed => "worker_crashed",
            Self::WorkerStartup => "worker_startup",
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::WorkerPoolDisposed => "worker_pool_disposed",
            Self::MessageFlood => "message_flood",
            Self::MessageSize => "message_size",
            Self::MessageValidation => "message_validation",
            Self::SidecarLimit => "sidecar_limit",
            Self::ReferenceNotFound => "reference_not_found",
            Self::ResolutionLimit => "resolution_limit",
            Self::TooManyPendingCalls => "too_many_pending_calls",
            Self::IterationLimit => "iteration_limit",
            Self::ConsoleOutputLimit => "console_output_limit",
            Self::ConsoleCallLimit => "console_call_limit",
            Self::ToolCallLimit => "tool_call_limit",
            Self::ResultTooLarge => "result_too_large",
            Self::CircuitOpen => "circuit_open",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EnclaveError {
    /// The closed kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::ValidationFailed { .. } => ErrorKind::Validation,
            Self::RuleConfiguration { .. } => ErrorKind::RuleConfiguration,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Script { .. } => ErrorKind::Script,
            Self::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            Self::WorkerMemory { .. } => ErrorKind::WorkerMemory,
            Self::WorkerCrashed { .. } => ErrorKind::WorkerCrashed,
            Self::WorkerStartup { .. } => ErrorKind::WorkerStartup,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::WorkerPoolDisposed => ErrorKind::WorkerPoolDisposed,
            Self::MessageFlood { .. } => ErrorKind::MessageFlood,
            Self::MessageSize { .. } => ErrorKind::MessageSize,
            Self::MessageValidation { .. } => ErrorKind::MessageValidation,
            Self::SidecarLimit { .. } => ErrorKind::SidecarLimit,
            Self::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            Self::ResolutionLimit { .. } => ErrorKind::ResolutionLimit,
            Self::TooManyPendingCalls { .. } => ErrorKind::TooManyPendingCalls,
            Self::IterationLimit { .. } => ErrorKind::IterationLimit,
            Self::ConsoleOutputLimit { .. } => ErrorKind::ConsoleOutputLimit,
            Self::ConsoleCallLimit { .. } => ErrorKind::ConsoleCallLimit,
            Self::ToolCallLimit { .. } => ErrorKind::ToolCallLimit,
            Self::ResultTooLarge { .. } => ErrorKind::ResultTooLarge,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Convert into the serializable form carried in results, sanitizing the message.
    pub fn to_execution_error(&self) -> ExecutionError {
        ExecutionError::new(self.kind(), &self.to_string())
    }
}

/// The error half of an [`ExecutionResult`](crate::ExecutionResult).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Closed fault kind.
    pub kind: ErrorKind,
    /// Sanitized, length-bounded message.
    pub message: String,
    /// Whether the script or the sandbox is responsible.
    pub origin: FaultOrigin,
}

impl ExecutionError {
    /// Build an execution error, sanitizing `message`.
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: crate::redact::sanitize_error_message(message),
            origin: kind.origin(),
        }
    }
}
