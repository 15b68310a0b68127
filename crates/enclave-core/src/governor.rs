//! Per-execution resource counters and host-side message guards.
//!
//! A [`ResourceGovernor`] is created fresh for every execution and checked at
//! the safe points the runtime exposes: loop-body entry, console calls, and
//! tool-call boundaries. The first breach is recorded and wins; the runtime
//! then terminates the isolate so there is no partial continuation.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::{EnclaveError, ErrorKind, ExecutionError};
use crate::request::{ExecutionLimits, ExecutionStats};

/// A breached limit, or a fatal fault reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    /// Wall-clock budget exhausted.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Budget in milliseconds.
        timeout_ms: u64,
    },
    /// Heap usage over the ceiling.
    #[error("memory limit of {max_bytes} bytes exceeded")]
    Memory {
        /// Ceiling in bytes.
        max_bytes: usize,
    },
    /// Too many loop-body entries.
    #[error("iteration limit of {max} exceeded")]
    Iterations {
        /// Configured maximum.
        max: u64,
    },
    /// Too many console bytes.
    #[error("console output limit of {max} bytes exceeded")]
    ConsoleBytes {
        /// Configured maximum.
        max: usize,
    },
    /// Too many console calls.
    #[error("console call limit of {max} exceeded")]
    ConsoleCalls {
        /// Configured maximum.
        max: usize,
    },
    /// Too many tool calls in flight.
    #[error("too many pending tool calls (max {max})")]
    PendingToolCalls {
        /// Configured maximum.
        max: usize,
    },
    /// Too many tool calls in total.
    #[error("tool call limit exceeded (max {max} calls per execution)")]
    ToolCalls {
        /// Configured maximum.
        max: usize,
    },
    /// The host reported a fault that ends the execution.
    #[error("{message}")]
    HostFault {
        /// Fault kind.
        kind: ErrorKind,
        /// Sanitized description.
        message: String,
    },
}

impl LimitViolation {
    /// The result kind this violation surfaces as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::WorkerTimeout,
            Self::Memory { .. } => ErrorKind::WorkerMemory,
            Self::Iterations { .. } => ErrorKind::IterationLimit,
            Self::ConsoleBytes { .. } => ErrorKind::ConsoleOutputLimit,
            Self::ConsoleCalls { .. } => ErrorKind::ConsoleCallLimit,
            Self::PendingToolCalls { .. } => ErrorKind::TooManyPendingCalls,
            Self::ToolCalls { .. } => ErrorKind::ToolCallLimit,
            Self::HostFault { kind, .. } => *kind,
        }
    }

    /// Wrap a host-side error as a fatal violation.
    pub fn host(err: &EnclaveError) -> Self {
        Self::HostFault {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<&LimitViolation> for ExecutionError {
    fn from(v: &LimitViolation) -> Self {
        ExecutionError::new(v.kind(), &v.to_string())
    }
}

#[derive(Debug, Default)]
struct Counters {
    iterations: u64,
    console_bytes: usize,
    console_calls: usize,
    pending_tool_calls: usize,
    tool_calls: usize,
    violation: Option<LimitViolation>,
}

/// Stateful limit checks for one execution.
#[derive(Debug)]
pub struct ResourceGovernor {
    limits: ExecutionLimits,
    started: Instant,
    counters: Mutex<Counters>,
}

impl ResourceGovernor {
    /// Start the clock for a new execution.
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Limits in force.
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the execution started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record `violation` unless an earlier one is already recorded.
    ///
    /// Returns the violation that is now on record.
    pub fn trip(&self, violation: LimitViolation) -> LimitViolation {
        let mut c = self.lock();
        c.violation.get_or_insert(violation).clone()
    }

    /// The first recorded violation, if any.
    pub fn violation(&self) -> Option<LimitViolation> {
        self.lock().violation.clone()
    }

    /// Fail once the wall-clock budget is spent.
    pub fn check_time(&self) -> Result<(), LimitViolation> {
        if self.elapsed() > self.limits.timeout() {
            return Err(LimitViolation::Timeout {
                timeout_ms: self.limits.timeout_ms,
            });
        }
        Ok(())
    }

    /// Count one loop-body entry, then check the clock.
    pub fn tick_iteration(&self) -> Result<(), LimitViolation> {
        {
            let mut c = self.lock();
            c.iterations += 1;
            if c.iterations > self.limits.max_iterations {
                return Err(LimitViolation::Iterations {
                    max: self.limits.max_iterations,
                });
            }
        }
        self.check_time()
    }

    /// Account for one console call of `bytes` serialized bytes.
    ///
    /// The call that pushes a counter past its limit fails and is not counted.
    pub fn record_console(&self, bytes: usize) -> Result<(), LimitViolation> {
        let mut c = self.lock();
        if c.console_calls + 1 > self.limits.max_console_calls {
            return Err(LimitViolation::ConsoleCalls {
                max: self.limits.max_console_calls,
            });
        }
        if c.console_bytes.saturating_add(bytes) > self.limits.max_console_bytes {
            return Err(LimitViolation::ConsoleBytes {
                max: self.limits.max_console_bytes,
            });
        }
        c.console_calls += 1;
        c.console_bytes += bytes;
        Ok(())
    }

    /// Admit one tool call, raising the pending count.
    pub fn begin_tool_call(&self) -> Result<(), LimitViolation> {
        let mut c = self.lock();
        if c.tool_calls + 1 > self.limits.max_tool_calls {
            return Err(LimitViolation::ToolCalls {
                max: self.limits.max_tool_calls,
            });
        }
        if c.pending_tool_calls + 1 > self.limits.max_pending_tool_calls {
            return Err(LimitViolation::PendingToolCalls {
                max: self.limits.max_pending_tool_calls,
            });
        }
        c.tool_calls += 1;
        c.pending_tool_calls += 1;
        Ok(())
    }

    /// Lower the pending count after a tool call settles either way.
    pub fn end_tool_call(&self) {
        let mut c = self.lock();
        c.pending_tool_calls = c.pending_tool_calls.saturating_sub(1);
    }

    /// Tool calls currently in flight.
    pub fn pending_tool_calls(&self) -> usize {
        self.lock().pending_tool_calls
    }

    /// Record that the heap reached its ceiling. Called from the isolate's
    /// near-heap-limit callback.
    pub fn memory_exhausted(&self) -> LimitViolation {
        self.trip(LimitViolation::Memory {
            max_bytes: self.limits.max_memory_bytes,
        })
    }

    /// Counters as of now.
    pub fn stats(&self) -> ExecutionStats {
        let c = self.lock();
        ExecutionStats {
            tool_call_count: c.tool_calls,
            console_bytes: c.console_bytes,
            console_calls: c.console_calls,
            elapsed_ms: self.elapsed().as_millis() as u64,
            iterations: c.iterations,
        }
    }
}

/// Size and rate limits for messages a worker sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLimits {
    /// Largest single frame accepted.
    pub max_message_bytes: usize,
    /// Messages accepted per window.
    pub max_messages_per_window: u32,
    /// Rate window length.
    pub window: Duration,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: crate::ipc::DEFAULT_MAX_MESSAGE_BYTES,
            max_messages_per_window: 20_000,
            window: Duration::from_secs(1),
        }
    }
}

/// Host-side guard over one execution's inbound message stream.
#[derive(Debug)]
pub struct MessageGuard {
    limits: MessageLimits,
    window_start: tokio::time::Instant,
    in_window: u32,
}

impl MessageGuard {
    /// A guard whose first window starts now.
    pub fn new(limits: MessageLimits) -> Self {
        Self {
            limits,
            window_start: tokio::time::Instant::now(),
            in_window: 0,
        }
    }

    /// Admit one message of `size` bytes.
    pub fn admit(&mut self, size: usize) -> Result<(), EnclaveError> {
        if size > self.limits.max_message_bytes {
            return Err(EnclaveError::MessageSize {
                size,
                max: self.limits.max_message_bytes,
            });
        }
        let now = tokio::time::Instant::now();
        if now.duration_since(self.window_start) >= self.limits.window {
            self.window_start = now;
            self.in_window = 0;
        }
        self.in_window += 1;
        if self.in_window > self.limits.max_messages_per_window {
            return Err(EnclaveError::MessageFlood {
                max_per_window: self.limits.max_messages_per_window,
                window_ms: self.limits.window.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: 60_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_iterations: 1000,
            max_console_bytes: 500,
            max_console_calls: 100,
            max_pending_tool_calls: 2,
            max_tool_calls: 3,
            max_result_bytes: 1024,
        }
    }

    #[test]
    fn iteration_limit_breaches_after_max() {
        let g = ResourceGovernor::new(limits());
        for _ in 0..1000 {
            g.tick_iteration().unwrap();
        }
        assert_eq!(
            g.tick_iteration(),
            Err(LimitViolation::Iterations { max: 1000 })
        );
    }

    #[test]
    fn console_bytes_fail_on_the_call_that_crosses() {
        let g = ResourceGovernor::new(limits());
        for i in 0..5 {
            assert!(g.record_console(100).is_ok(), "call {i} should pass");
        }
        assert_eq!(
            g.record_console(100),
            Err(LimitViolation::ConsoleBytes { max: 500 })
        );
        let stats = g.stats();
        assert_eq!(stats.console_bytes, 500);
        assert_eq!(stats.console_calls, 5);
    }

    #[test]
    fn console_call_limit() {
        let g = ResourceGovernor::new(ExecutionLimits {
            max_console_calls: 2,
            ..limits()
        });
        g.record_console(1).unwrap();
        g.record_console(1).unwrap();
        assert!(matches!(
            g.record_console(1),
            Err(LimitViolation::ConsoleCalls { max: 2 })
        ));
    }

    #[test]
    fn pending_tool_calls_are_bounded() {
        let g = ResourceGovernor::new(limits());
        g.begin_tool_call().unwrap();
        g.begin_tool_call().unwrap();
        assert_eq!(
            g.begin_tool_call(),
            Err(LimitViolation::PendingToolCalls { max: 2 })
        );
        g.end_tool_call();
        assert_eq!(g.pending_tool_calls(), 1);
        g.begin_tool_call().unwrap();
    }

    #[test]
    fn total_tool_calls_are_bounded() {
        let g = ResourceGovernor::new(limits());
        for _ in 0..3 {
            g.begin_tool_call().unwrap();
            g.end_tool_call();
        }
        assert_eq!(g.begin_tool_call(), Err(LimitViolation::ToolCalls { max: 3 }));
        assert_eq!(g.stats().tool_call_count, 3);
    }

    #[test]
    fn timeout_is_detected() {
        let g = ResourceGovernor::new(ExecutionLimits {
            timeout_ms: 1,
            ..limits()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(g.check_time(), Err(LimitViolation::Timeout { .. })));
    }

    #[test]
    fn memory_exhaustion_is_recorded() {
        let g = ResourceGovernor::new(limits());
        assert!(matches!(g.memory_exhausted(), LimitViolation::Memory { .. }));
        assert_eq!(g.violation().map(|v| v.kind()), Some(ErrorKind::WorkerMemory));
    }

    #[test]
    fn first_violation_wins() {
        let g = ResourceGovernor::new(limits());
        g.trip(LimitViolation::Iterations { max: 1 });
        let kept = g.trip(LimitViolation::Timeout { timeout_ms: 5 });
        assert_eq!(kept, LimitViolation::Iterations { max: 1 });
        assert_eq!(g.violation().map(|v| v.kind()), Some(ErrorKind::IterationLimit));
    }

    #[test]
    fn host_fault_keeps_kind() {
        let v = LimitViolation::host(&EnclaveError::ResolutionLimit {
            reason: "too big".into(),
        });
        assert_eq!(v.kind(), ErrorKind::ResolutionLimit);
        let e = ExecutionError::from(&v);
        assert!(e.message.contains("too big"));
    }

    #[test]
    fn message_size_guard() {
        let mut g = MessageGuard::new(MessageLimits {
            max_message_bytes: 10,
            ..Default::default()
        });
        assert!(g.admit(10).is_ok());
        assert!(matches!(g.admit(11), Err(EnclaveError::MessageSize { size: 11, max: 10 })));
    }

    #[tokio::test(start_paused = true)]
    async fn message_rate_guard_resets_each_window() {
        let mut g = MessageGuard::new(MessageLimits {
            max_messages_per_window: 3,
            window: Duration::from_millis(100),
            ..Default::default()
        });
        for _ in 0..3 {
            g.admit(1).unwrap();
        }
        assert!(matches!(g.admit(1), Err(EnclaveError::MessageFlood { .. })));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(g.admit(1).is_ok());
    }
}
