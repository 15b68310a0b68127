#![warn(missing_docs)]

//! # enclave-core
//!
//! Runs short, untrusted AgentScript programs that orchestrate host tools.
//!
//! A script goes through four stages:
//!
//! 1. **Validation**: parsed with oxc and checked against a tiered
//!    [`SecurityPolicy`](validator::SecurityPolicy).
//! 2. **Transformation**: proxied globals renamed, loop bodies instrumented,
//!    large literals moved into the [`ReferenceSidecar`](sidecar::ReferenceSidecar).
//! 3. **Execution**: a fresh deno_core isolate per run inside a pooled worker
//!    slot (thread or child process), metered by a
//!    [`ResourceGovernor`](governor::ResourceGovernor).
//! 4. **Tool calls**: forwarded over IPC to the host, where references are
//!    resolved and each target is guarded by a circuit breaker before the
//!    [`ToolBridge`] is invoked.
//!
//! ## Security model
//!
//! - **No ambient capabilities**: no fs, net, env, timers, or code generation
//! - **Fresh isolate per execution**: no state leakage between runs
//! - **Hard ceilings**: wall clock, heap, iterations, console, tool calls
//! - **Pass-by-reference**: large payloads never enter the isolate
//! - **Sanitized errors**: no paths, stack frames, or payloads in results

pub mod audit;
pub mod circuit_breaker;
pub mod config;
pub mod enclave;
pub mod error;
pub mod gateway;
pub mod governor;
pub mod host;
pub mod ipc;
pub mod level;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod redact;
pub mod request;
pub mod resolver;
pub mod runtime;
pub mod sidecar;
pub mod slot;
pub mod transform;
pub mod validator;
pub mod worker;

pub use config::EnclaveConfig;
pub use enclave::{Enclave, EnclaveBuilder};
pub use error::{EnclaveError, ErrorKind, ExecutionError, FaultOrigin};
pub use level::{SecurityLevel, SecurityLevelConfig};
pub use request::{ExecutionLimits, ExecutionRequest, ExecutionResult, ExecutionStats, LimitOverrides};

/// Host-side tool implementation.
///
/// Implementations hold credentials and connections. Scripts never see them:
/// they call `callTool(name, args)` and the enclave routes the call here
/// after allowlist, reference resolution, and circuit-breaker checks.
#[async_trait::async_trait]
pub trait ToolBridge: Send + Sync {
    /// Invoke `tool` with fully resolved `args`.
    async fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, enclave_error::ToolError>;

    /// Circuit-breaker target for `tool`. Defaults to the part before the
    /// first `.` (`github.search` -> `github`).
    fn target_id(&self, tool: &str) -> String {
        tool.split('.').next().unwrap_or(tool).to_string()
    }

    /// Tool names used for "did you mean" suggestions.
    fn known_tools(&self) -> Vec<String> {
        Vec::new()
    }
}
