#![warn(missing_docs)]

//! # enclave-config
//!
//! Configuration file loading for the enclave sandbox.
//!
//! Every key is optional; anything left out keeps the
//! [`EnclaveConfig`] default. `${VAR}` and `${VAR:-fallback}` references are
//! expanded from the environment before parsing.
//!
//! ## Example
//!
//! ```toml
//! default_security_level = "secure"
//! max_result_bytes = 1048576
//! extraction_threshold = 4096
//!
//! [limits]
//! timeout_ms = 10000
//! max_tool_calls = 50
//!
//! [policy]
//! allow_loops = true
//! additional_disallowed = ["JSON"]
//!
//! [pool]
//! slots = 8
//! queue_capacity = 32
//! queue_timeout_ms = 15000
//! backend = "${ENCLAVE_BACKEND:-thread}"
//!
//! [sidecar]
//! max_total_bytes = 67108864
//! ttl_secs = 300
//!
//! [gateway]
//! tool_call_timeout_ms = 30000
//! lift_threshold_bytes = 65536
//!
//! [breaker]
//! failure_threshold = 5
//! reset_timeout_secs = 30
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use enclave_core::pool::SlotBackend;
use enclave_core::validator::PolicyOverrides;
use enclave_core::{EnclaveConfig, EnclaveError, LimitOverrides, SecurityLevel};
use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

/// Errors from config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was rejected by validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<EnclaveError> for ConfigError {
    fn from(err: EnclaveError) -> Self {
        match err {
            EnclaveError::Configuration(msg) => Self::Invalid(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// The file as written. Mapped onto [`EnclaveConfig`] by
/// [`FileConfig::into_config`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Level used when a request names none.
    pub default_security_level: Option<SecurityLevel>,
    /// Serialized return value ceiling.
    pub max_result_bytes: Option<usize>,
    /// Literal extraction threshold. `0` disables extraction.
    pub extraction_threshold: Option<usize>,
    /// Limit overrides applied to every request.
    pub limits: LimitsSection,
    /// Policy overrides applied to every request.
    pub policy: PolicySection,
    /// Worker pool.
    pub pool: PoolSection,
    /// Worker-to-host message limits.
    pub messages: MessagesSection,
    /// Reference store budgets.
    pub sidecar: SidecarSection,
    /// Tool-call handling.
    pub gateway: GatewaySection,
    /// Reference resolution budgets.
    pub resolver: ResolverSection,
    /// Circuit breaker tuning.
    pub breaker: BreakerSection,
}

/// `[limits]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct LimitsSection {
    pub timeout_ms: Option<u64>,
    pub max_memory_bytes: Option<usize>,
    pub max_iterations: Option<u64>,
    pub max_console_bytes: Option<usize>,
    pub max_console_calls: Option<usize>,
    pub max_pending_tool_calls: Option<usize>,
    pub max_tool_calls: Option<usize>,
}

/// `[policy]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct PolicySection {
    pub allow_loops: Option<bool>,
    pub allow_async: Option<bool>,
    pub additional_disallowed: Vec<String>,
    pub allowed_identifiers: Vec<String>,
}

/// `[pool]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct PoolSection {
    pub slots: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub queue_timeout_ms: Option<u64>,
    pub max_executions_per_slot: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub backend: Option<SlotBackend>,
}

/// `[messages]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct MessagesSection {
    pub max_message_bytes: Option<usize>,
    pub max_messages_per_window: Option<u32>,
    pub window_ms: Option<u64>,
}

/// `[sidecar]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidecarSection {
    /// Ceiling on the sum of all stored sizes.
    pub max_total_bytes: Option<usize>,
    /// Ceiling on the number of live entries.
    pub max_entries: Option<usize>,
    /// Ceiling on one entry.
    pub max_entry_bytes: Option<usize>,
    /// Entry TTL. `0` keeps entries until their execution ends.
    pub ttl_secs: Option<u64>,
}

/// `[gateway]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    /// Per tool-call timeout.
    pub tool_call_timeout_ms: Option<u64>,
    /// Tool results at least this large are returned as references.
    pub lift_threshold_bytes: Option<usize>,
}

/// `[resolver]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct ResolverSection {
    pub max_bytes_per_call: Option<usize>,
    pub max_bytes_per_execution: Option<usize>,
    pub max_references_per_call: Option<usize>,
    pub max_depth: Option<usize>,
    pub allow_composites: Option<bool>,
}

/// `[breaker]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(missing_docs)]
pub struct BreakerSection {
    pub failure_threshold: Option<u32>,
    pub failure_window_secs: Option<u64>,
    pub reset_timeout_secs: Option<u64>,
    pub success_threshold: Option<u32>,
    pub half_open_max_calls: Option<u32>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

impl FileConfig {
    /// Parse TOML without touching the environment.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Apply the file on top of the defaults and validate the result.
    pub fn into_config(self) -> Result<EnclaveConfig, ConfigError> {
        let mut config = EnclaveConfig::default();

        set(&mut config.default_security_level, self.default_security_level);
        set(&mut config.max_result_bytes, self.max_result_bytes);
        if let Some(threshold) = self.extraction_threshold {
            config.extraction_threshold = (threshold > 0).then_some(threshold);
        }

        let l = self.limits;
        config.limit_overrides = LimitOverrides {
            timeout_ms: l.timeout_ms,
            max_memory_bytes: l.max_memory_bytes,
            max_iterations: l.max_iterations,
            max_console_bytes: l.max_console_bytes,
            max_console_calls: l.max_console_calls,
            max_pending_tool_calls: l.max_pending_tool_calls,
            max_tool_calls: l.max_tool_calls,
        };

        let p = self.policy;
        config.policy_overrides = PolicyOverrides {
            allow_loops: p.allow_loops,
            allow_async: p.allow_async,
            additional_disallowed: p.additional_disallowed,
            allowed_identifiers: p.allowed_identifiers,
        };

        let pool = &mut config.pool;
        set(&mut pool.slots, self.pool.slots);
        set(&mut pool.queue_capacity, self.pool.queue_capacity);
        set(&mut pool.queue_timeout, self.pool.queue_timeout_ms.map(Duration::from_millis));
        set(&mut pool.max_executions_per_slot, self.pool.max_executions_per_slot);
        set(&mut pool.kill_grace, self.pool.kill_grace_ms.map(Duration::from_millis));
        set(&mut pool.backend, self.pool.backend);

        let messages = &mut config.messages;
        set(&mut messages.max_message_bytes, self.messages.max_message_bytes);
        set(&mut messages.max_messages_per_window, self.messages.max_messages_per_window);
        set(&mut messages.window, self.messages.window_ms.map(Duration::from_millis));

        let sidecar = &mut config.sidecar;
        set(&mut sidecar.max_total_bytes, self.sidecar.max_total_bytes);
        set(&mut sidecar.max_entries, self.sidecar.max_entries);
        set(&mut sidecar.max_entry_bytes, self.sidecar.max_entry_bytes);
        if let Some(secs) = self.sidecar.ttl_secs {
            sidecar.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        let gateway = &mut config.gateway;
        set(
            &mut gateway.tool_call_timeout,
            self.gateway.tool_call_timeout_ms.map(Duration::from_millis),
        );
        if self.gateway.lift_threshold_bytes.is_some() {
            gateway.lift_threshold_bytes = self.gateway.lift_threshold_bytes;
        }

        let resolver = &mut gateway.resolver;
        set(&mut resolver.max_bytes_per_call, self.resolver.max_bytes_per_call);
        set(&mut resolver.max_bytes_per_execution, self.resolver.max_bytes_per_execution);
        set(&mut resolver.max_references_per_call, self.resolver.max_references_per_call);
        set(&mut resolver.max_depth, self.resolver.max_depth);
        set(&mut resolver.allow_composites, self.resolver.allow_composites);

        let breaker = &mut config.breaker;
        set(&mut breaker.failure_threshold, self.breaker.failure_threshold);
        set(
            &mut breaker.failure_window,
            self.breaker.failure_window_secs.map(Duration::from_secs),
        );
        set(
            &mut breaker.reset_timeout,
            self.breaker.reset_timeout_secs.map(Duration::from_secs),
        );
        set(&mut breaker.success_threshold, self.breaker.success_threshold);
        set(&mut breaker.half_open_max_calls, self.breaker.half_open_max_calls);

        config.validate()?;
        Ok(config)
    }
}

/// Parse and validate a config from a TOML string.
pub fn from_toml(toml_str: &str) -> Result<EnclaveConfig, ConfigError> {
    FileConfig::from_toml(toml_str)?.into_config()
}

/// Parse a config from a TOML string, expanding `${VAR}` references first.
pub fn from_toml_with_env(toml_str: &str) -> Result<EnclaveConfig, ConfigError> {
    from_toml(&expand_env_vars(toml_str))
}

/// Load config from a file path.
pub fn from_file(path: &Path) -> Result<EnclaveConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    from_toml(&content)
}

/// Load config from a file path, expanding environment variables.
pub fn from_file_with_env(path: &Path) -> Result<EnclaveConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = from_toml_with_env(&content)?;
    tracing::debug!(path = %path.display(), "loaded enclave config");
    Ok(config)
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap()
});

/// Expand `${VAR}` and `${VAR:-fallback}`. Unset variables without a
/// fallback are left as written.
fn expand_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            match (std::env::var(name), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(fallback)) => fallback.as_str().to_string(),
                (Err(_), None) => {
                    tracing::warn!(var = name, "config references unset environment variable");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
