//! Validated runtime configuration.
//!
//! [`EnclaveConfig`] is assembled once (in code or by `enclave-config` from
//! a TOML file), validated, and then only read.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::EnclaveError;
use crate::gateway::GatewayConfig;
use crate::governor::MessageLimits;
use crate::level::SecurityLevel;
use crate::pool::PoolConfig;
use crate::request::LimitOverrides;
use crate::sidecar::SidecarConfig;
use crate::validator::PolicyOverrides;

/// Default ceiling on a script's serialized return value (1 MiB).
pub const DEFAULT_MAX_RESULT_BYTES: usize = 1024 * 1024;

/// Default literal length that triggers extraction into the sidecar.
pub const DEFAULT_EXTRACTION_THRESHOLD: usize = 4096;

/// Everything the enclave needs besides the tool bridge and audit sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveConfig {
    /// Level used when a request names none.
    pub default_security_level: SecurityLevel,
    /// Limit overrides applied to every request, below the request's own.
    pub limit_overrides: LimitOverrides,
    /// Policy overrides applied to every request, below the request's own.
    pub policy_overrides: PolicyOverrides,
    /// Worker pool.
    pub pool: PoolConfig,
    /// Worker-to-host message limits.
    pub messages: MessageLimits,
    /// Reference store budgets.
    pub sidecar: SidecarConfig,
    /// Tool-call timeout, lifting, and resolution budgets.
    pub gateway: GatewayConfig,
    /// Breaker tuning per tool target.
    pub breaker: CircuitBreakerConfig,
    /// Literal extraction threshold; `None` disables extraction.
    pub extraction_threshold: Option<usize>,
    /// Serialized return value ceiling.
    pub max_result_bytes: usize,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            default_security_level: SecurityLevel::default(),
            limit_overrides: LimitOverrides::default(),
            policy_overrides: PolicyOverrides::default(),
            pool: PoolConfig::default(),
            messages: MessageLimits::default(),
            sidecar: SidecarConfig::default(),
            gateway: GatewayConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            extraction_threshold: Some(DEFAULT_EXTRACTION_THRESHOLD),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

fn invalid(msg: impl Into<String>) -> EnclaveError {
    EnclaveError::Configuration(msg.into())
}

impl EnclaveConfig {
    /// Reject zero and contradictory values.
    pub fn validate(&self) -> Result<(), EnclaveError> {
        let pool = &self.pool;
        if pool.slots == 0 {
            return Err(invalid("pool.slots must be at least 1"));
        }
        if pool.queue_timeout.is_zero() {
            return Err(invalid("pool.queue_timeout must be greater than zero"));
        }
        if pool.max_executions_per_slot == 0 {
            return Err(invalid("pool.max_executions_per_slot must be at least 1"));
        }

        if self.messages.max_message_bytes == 0 || self.messages.max_messages_per_window == 0 {
            return Err(invalid("message limits must be greater than zero"));
        }
        if self.messages.window.is_zero() {
            return Err(invalid("message rate window must be greater than zero"));
        }

        let sidecar = &self.sidecar;
        if sidecar.max_entries == 0 || sidecar.max_total_bytes == 0 {
            return Err(invalid("sidecar budgets must be greater than zero"));
        }
        if sidecar.max_entry_bytes > sidecar.max_total_bytes {
            return Err(invalid(format!(
                "sidecar.max_entry_bytes ({}) cannot exceed sidecar.max_total_bytes ({})",
                sidecar.max_entry_bytes, sidecar.max_total_bytes
            )));
        }

        let resolver = &self.gateway.resolver;
        if resolver.max_depth == 0 || resolver.max_references_per_call == 0 {
            return Err(invalid("resolver limits must be greater than zero"));
        }
        if resolver.max_bytes_per_call > resolver.max_bytes_per_execution {
            return Err(invalid(
                "resolver.max_bytes_per_call cannot exceed resolver.max_bytes_per_execution",
            ));
        }
        if self.gateway.tool_call_timeout.is_zero() {
            return Err(invalid("tool_call_timeout must be greater than zero"));
        }
        if self.gateway.lift_threshold_bytes == Some(0) {
            return Err(invalid("lift_threshold_bytes must be greater than zero"));
        }

        let breaker = &self.breaker;
        if breaker.failure_threshold == 0
            || breaker.success_threshold == 0
            || breaker.half_open_max_calls == 0
        {
            return Err(invalid("circuit breaker thresholds must be at least 1"));
        }
        if breaker.failure_window.is_zero() || breaker.reset_timeout.is_zero() {
            return Err(invalid("circuit breaker durations must be greater than zero"));
        }

        if self.extraction_threshold == Some(0) {
            return Err(invalid("extraction_threshold must be greater than zero"));
        }
        if let Some(t) = self.extraction_threshold {
            if t > sidecar.max_entry_bytes {
                return Err(invalid(
                    "extraction_threshold cannot exceed sidecar.max_entry_bytes",
                ));
            }
        }
        if self.max_result_bytes == 0 {
            return Err(invalid("max_result_bytes must be greater than zero"));
        }
        if self.max_result_bytes > self.messages.max_message_bytes {
            return Err(invalid(
                "max_result_bytes cannot exceed the IPC message size limit",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        EnclaveConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_slots_rejected() {
        let mut config = EnclaveConfig::default();
        config.pool.slots = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.slots"));
    }

    #[test]
    fn entry_larger_than_store_rejected() {
        let mut config = EnclaveConfig::default();
        config.sidecar.max_entry_bytes = config.sidecar.max_total_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_breaker_window_rejected() {
        let mut config = EnclaveConfig::default();
        config.breaker.failure_window = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn result_larger_than_frame_rejected() {
        let mut config = EnclaveConfig::default();
        config.messages.max_message_bytes = 1024;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_result_bytes"));
    }

    #[test]
    fn disabled_extraction_is_valid() {
        let config = EnclaveConfig {
            extraction_threshold: None,
            ..EnclaveConfig::default()
        };
        config.validate().unwrap();
    }
}
