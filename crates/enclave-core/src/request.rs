//! Execution request and result schema.
//!
//! This is the whole contract with the transport layer: both types are plain
//! JSON with camelCase field names.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnclaveError, ExecutionError};
use crate::level::{SecurityLevel, SecurityLevelConfig};
use crate::validator::PolicyOverrides;

/// Smallest heap ceiling a request may ask for.
pub const MIN_MEMORY_BYTES: usize = 4 * 1024 * 1024;

/// A script to run, plus per-request adjustments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// AgentScript source.
    pub script_source: String,
    /// Tools the script may call. `None` leaves the bridge unrestricted.
    #[serde(default)]
    pub tools_available: Option<Vec<String>>,
    /// Per-field overrides of the security level's limits.
    #[serde(default)]
    pub limits: LimitOverrides,
    /// Runtime level; the enclave default applies when absent.
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    /// Adjustments to the validator preset.
    #[serde(default)]
    pub policy_overrides: PolicyOverrides,
}

impl ExecutionRequest {
    /// A request with every option left at its default.
    pub fn new(script_source: impl Into<String>) -> Self {
        Self {
            script_source: script_source.into(),
            ..Default::default()
        }
    }

    /// Select a security level.
    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    /// Restrict callable tools.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools_available = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Override limits.
    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    /// Adjust the validator preset.
    pub fn with_policy_overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.policy_overrides = overrides;
        self
    }
}

/// Optional per-request limit overrides. Absent fields keep the level default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverrides {
    /// Wall-clock budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Heap ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<usize>,
    /// Loop-body entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    /// Cumulative console bytes.
    #[serde(
        default,
        alias = "maxConsoleOutputBytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_console_bytes: Option<usize>,
    /// Console calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_console_calls: Option<usize>,
    /// Tool calls in flight at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_tool_calls: Option<usize>,
    /// Total tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
}

impl LimitOverrides {
    /// Fill every field `self` leaves empty from `fallback`.
    pub fn or(&self, fallback: &LimitOverrides) -> LimitOverrides {
        LimitOverrides {
            timeout_ms: self.timeout_ms.or(fallback.timeout_ms),
            max_memory_bytes: self.max_memory_bytes.or(fallback.max_memory_bytes),
            max_iterations: self.max_iterations.or(fallback.max_iterations),
            max_console_bytes: self.max_console_bytes.or(fallback.max_console_bytes),
            max_console_calls: self.max_console_calls.or(fallback.max_console_calls),
            max_pending_tool_calls: self.max_pending_tool_calls.or(fallback.max_pending_tool_calls),
            max_tool_calls: self.max_tool_calls.or(fallback.max_tool_calls),
        }
    }
}

/// Fully resolved limits for one execution. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// Heap ceiling.
    pub max_memory_bytes: usize,
    /// Loop-body entries allowed.
    pub max_iterations: u64,
    /// Cumulative console bytes allowed.
    pub max_console_bytes: usize,
    /// Console calls allowed.
    pub max_console_calls: usize,
    /// Tool calls allowed in flight at once.
    pub max_pending_tool_calls: usize,
    /// Tool calls allowed in total.
    pub max_tool_calls: usize,
    /// Serialized return value ceiling.
    pub max_result_bytes: usize,
}

impl ExecutionLimits {
    /// Merge level defaults with overrides and validate the outcome.
    pub fn resolve(
        defaults: &SecurityLevelConfig,
        overrides: &LimitOverrides,
        max_result_bytes: usize,
    ) -> Result<Self, EnclaveError> {
        let limits = Self {
            timeout_ms: overrides
                .timeout_ms
                .unwrap_or(defaults.timeout.as_millis() as u64),
            max_memory_bytes: overrides.max_memory_bytes.unwrap_or(defaults.max_memory_bytes),
            max_iterations: overrides.max_iterations.unwrap_or(defaults.max_iterations),
            max_console_bytes: overrides
                .max_console_bytes
                .unwrap_or(defaults.max_console_bytes),
            max_console_calls: overrides
                .max_console_calls
                .unwrap_or(defaults.max_console_calls),
            max_pending_tool_calls: overrides
                .max_pending_tool_calls
                .unwrap_or(defaults.max_pending_tool_calls),
            max_tool_calls: overrides.max_tool_calls.unwrap_or(defaults.max_tool_calls),
            max_result_bytes,
        };
        limits.validate()?;
        Ok(limits)
    }

    fn validate(&self) -> Result<(), EnclaveError> {
        let zero = [
            ("timeoutMs", self.timeout_ms == 0),
            ("maxIterations", self.max_iterations == 0),
            ("maxConsoleCalls", self.max_console_calls == 0),
            ("maxPendingToolCalls", self.max_pending_tool_calls == 0),
            ("maxResultBytes", self.max_result_bytes == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(EnclaveError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.max_memory_bytes < MIN_MEMORY_BYTES {
            return Err(EnclaveError::Configuration(format!(
                "maxMemoryBytes must be at least {MIN_MEMORY_BYTES}"
            )));
        }
        Ok(())
    }

    /// Wall-clock budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        let d = SecurityLevelConfig::default();
        Self {
            timeout_ms: d.timeout.as_millis() as u64,
            max_memory_bytes: d.max_memory_bytes,
            max_iterations: d.max_iterations,
            max_console_bytes: d.max_console_bytes,
            max_console_calls: d.max_console_calls,
            max_pending_tool_calls: d.max_pending_tool_calls,
            max_tool_calls: d.max_tool_calls,
            max_result_bytes: crate::config::DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

/// Counters reported with every result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Tool calls started.
    pub tool_call_count: usize,
    /// Console bytes accepted.
    pub console_bytes: usize,
    /// Console calls accepted.
    pub console_calls: usize,
    /// Wall-clock time from start to termination.
    pub elapsed_ms: u64,
    /// Loop-body entries at termination.
    pub iterations: u64,
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the script returned normally.
    pub success: bool,
    /// The returned value, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// The fault, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Counters at termination.
    pub stats: ExecutionStats,
    /// Identifier used in logs and audit events.
    pub execution_id: String,
}

impl ExecutionResult {
    /// A successful result.
    pub fn success(execution_id: impl Into<String>, value: Value, stats: ExecutionStats) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            stats,
            execution_id: execution_id.into(),
        }
    }

    /// A failed result.
    pub fn failure(
        execution_id: impl Into<String>,
        error: ExecutionError,
        stats: ExecutionStats,
    ) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            stats,
            execution_id: execution_id.into(),
        }
    }

    /// The fault kind, when the execution failed.
    pub fn error_kind(&self) -> Option<crate::error::ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn request_parses_camel_case() {
        let req: ExecutionRequest = serde_json::from_value(serde_json::json!({
            "scriptSource": "return 1;",
            "toolsAvailable": ["x.y"],
            "limits": { "timeoutMs": 100, "maxConsoleOutputBytes": 500 },
            "securityLevel": "locked_down",
            "policyOverrides": { "allowLoops": true }
        }))
        .unwrap();
        assert_eq!(req.tools_available.as_deref(), Some(&["x.y".to_string()][..]));
        assert_eq!(req.limits.timeout_ms, Some(100));
        assert_eq!(req.limits.max_console_bytes, Some(500));
        assert_eq!(req.security_level, Some(SecurityLevel::Strict));
        assert_eq!(req.policy_overrides.allow_loops, Some(true));
    }

    #[test]
    fn minimal_request_parses() {
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"scriptSource":"return 1;"}"#).unwrap();
        assert!(req.tools_available.is_none());
        assert_eq!(req.limits, LimitOverrides::default());
    }

    #[test]
    fn resolve_applies_overrides_over_level_defaults() {
        let defaults = SecurityLevel::Secure.config();
        let limits = ExecutionLimits::resolve(
            &defaults,
            &LimitOverrides {
                max_iterations: Some(1000),
                ..Default::default()
            },
            1024,
        )
        .unwrap();
        assert_eq!(limits.max_iterations, 1000);
        assert_eq!(limits.timeout_ms, 15_000);
        assert_eq!(limits.max_result_bytes, 1024);
    }

    #[test]
    fn resolve_rejects_zero_timeout() {
        let err = ExecutionLimits::resolve(
            &SecurityLevelConfig::default(),
            &LimitOverrides {
                timeout_ms: Some(0),
                ..Default::default()
            },
            1024,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeoutMs"));
    }

    #[test]
    fn resolve_rejects_tiny_heap() {
        let err = ExecutionLimits::resolve(
            &SecurityLevelConfig::default(),
            &LimitOverrides {
                max_memory_bytes: Some(1024),
                ..Default::default()
            },
            1024,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn overrides_or_prefers_self() {
        let a = LimitOverrides {
            timeout_ms: Some(1),
            ..Default::default()
        };
        let b = LimitOverrides {
            timeout_ms: Some(2),
            max_iterations: Some(3),
            ..Default::default()
        };
        let merged = a.or(&b);
        assert_eq!(merged.timeout_ms, Some(1));
        assert_eq!(merged.max_iterations, Some(3));
    }

    #[test]
    fn result_serializes_discriminated_on_success() {
        let ok = ExecutionResult::success("e1", serde_json::json!(42), ExecutionStats::default());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["value"], 42);
        assert!(json.get("error").is_none());
        assert_eq!(json["stats"]["toolCallCount"], 0);

        let err = ExecutionResult::failure(
            "e2",
            ExecutionError::new(ErrorKind::IterationLimit, "iteration limit of 10 exceeded"),
            ExecutionStats::default(),
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "iteration_limit");
        assert_eq!(json["error"]["origin"], "sandbox");
        assert!(json.get("value").is_none());
    }
}
