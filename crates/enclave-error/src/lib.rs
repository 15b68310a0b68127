//! Typed error types for enclave tool bridges.
//!
//! Provides [`ToolError`], the error type returned by every host-side
//! `ToolBridge` implementation. The sandbox records any `ToolError` as a
//! failure against the circuit breaker of the tool's target, and the script
//! observes it as a catchable tool-call failure.

use thiserror::Error;

/// Canonical error type for tool invocations made on behalf of a script.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The requested tool does not exist.
    #[error("tool not found: '{tool}'")]
    NotFound {
        /// The tool name that was requested.
        tool: String,
    },

    /// The tool did not answer within its deadline.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The tool that timed out.
        tool: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The tool rejected its arguments.
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments {
        /// The tool that rejected the call.
        tool: String,
        /// Why the arguments were rejected.
        message: String,
    },

    /// The downstream service behind the tool returned an error.
    #[error("upstream error from tool '{tool}': {message}")]
    Upstream {
        /// The tool whose backend failed.
        tool: String,
        /// The upstream error message.
        message: String,
    },

    /// The host refused the call by policy.
    #[error("tool call denied: {reason}")]
    Denied {
        /// Explanation of why the call was denied.
        reason: String,
    },

    /// A rate limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "TOOL_NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Denied { .. } => "DENIED",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

/// Find the closest matching tool name using Levenshtein distance.
///
/// Tool names are dotted (`namespace.tool`); both the full name and the part
/// after the namespace are compared. Returns a suggestion when a candidate is
/// within edit distance 3.
pub fn find_similar_tool(tool: &str, known_tools: &[&str]) -> Option<String> {
    let short = tool.rsplit('.').next().unwrap_or(tool);
    let mut best: Option<(usize, &str)> = None;

    for &candidate in known_tools {
        let full = strsim::levenshtein(tool, candidate);
        let candidate_short = candidate.rsplit('.').next().unwrap_or(candidate);
        let partial = strsim::levenshtein(short, candidate_short);
        let dist = full.min(partial);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }

    best.map(|(_, name)| format!("Did you mean '{name}'?"))
}

// Compile-time assertion: ToolError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ToolError>();
};
