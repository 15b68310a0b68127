//! Runtime security levels and their default limit bundles.
//!
//! A [`SecurityLevel`] selects a [`SecurityLevelConfig`] of runtime limits.
//! It is a separate taxonomy from the validator's
//! [`PresetLevel`](crate::validator::PresetLevel); the two are joined by
//! [`SecurityLevel::preset_level`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EnclaveError;
use crate::validator::PresetLevel;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Named runtime posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Tightest limits.
    #[serde(alias = "locked_down", alias = "locked-down")]
    Strict,
    /// Tight limits suitable for untrusted model output.
    Secure,
    /// General-purpose defaults.
    #[default]
    #[serde(alias = "default")]
    Standard,
    /// Generous limits for trusted workloads.
    Permissive,
}

impl SecurityLevel {
    /// All levels, most restrictive first.
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Strict,
        SecurityLevel::Secure,
        SecurityLevel::Standard,
        SecurityLevel::Permissive,
    ];

    /// The validator preset seeded for this level.
    ///
    /// Total and order-preserving: a stricter level never maps to a looser
    /// preset than a less strict level.
    pub fn preset_level(self) -> PresetLevel {
        match self {
            Self::Strict => PresetLevel::Strict,
            Self::Secure => PresetLevel::Secure,
            Self::Standard => PresetLevel::Standard,
            Self::Permissive => PresetLevel::Permissive,
        }
    }

    /// Default runtime limits for this level.
    pub fn config(self) -> SecurityLevelConfig {
        match self {
            Self::Strict => SecurityLevelConfig {
                timeout: Duration::from_millis(5_000),
                max_iterations: 1_000,
                max_tool_calls: 10,
                max_console_bytes: 64 * KIB,
                max_console_calls: 100,
                max_memory_bytes: 32 * MIB,
                max_pending_tool_calls: 4,
            },
            Self::Secure => SecurityLevelConfig {
                timeout: Duration::from_millis(15_000),
                max_iterations: 5_000,
                max_tool_calls: 50,
                max_console_bytes: 256 * KIB,
                max_console_calls: 500,
                max_memory_bytes: 64 * MIB,
                max_pending_tool_calls: 8,
            },
            Self::Standard => SecurityLevelConfig {
                timeout: Duration::from_millis(30_000),
                max_iterations: 10_000,
                max_tool_calls: 100,
                max_console_bytes: MIB,
                max_console_calls: 1_000,
                max_memory_bytes: 128 * MIB,
                max_pending_tool_calls: 16,
            },
            Self::Permissive => SecurityLevelConfig {
                timeout: Duration::from_millis(60_000),
                max_iterations: 100_000,
                max_tool_calls: 1_000,
                max_console_bytes: 10 * MIB,
                max_console_calls: 10_000,
                max_memory_bytes: 256 * MIB,
                max_pending_tool_calls: 32,
            },
        }
    }

    /// Lowercase canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Secure => "secure",
            Self::Standard => "standard",
            Self::Permissive => "permissive",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "locked_down" | "locked-down" => Ok(Self::Strict),
            "secure" => Ok(Self::Secure),
            "standard" | "default" => Ok(Self::Standard),
            "permissive" => Ok(Self::Permissive),
            other => Err(EnclaveError::Configuration(format!(
                "unknown security level '{other}' (expected strict, secure, standard or permissive)"
            ))),
        }
    }
}

/// Default runtime limits for one [`SecurityLevel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityLevelConfig {
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Loop-body entries allowed.
    pub max_iterations: u64,
    /// Tool calls allowed per execution.
    pub max_tool_calls: usize,
    /// Cumulative console bytes allowed.
    pub max_console_bytes: usize,
    /// Console calls allowed.
    pub max_console_calls: usize,
    /// V8 heap ceiling.
    pub max_memory_bytes: usize,
    /// Tool calls allowed in flight at once.
    pub max_pending_tool_calls: usize,
}

impl Default for SecurityLevelConfig {
    fn default() -> Self {
        SecurityLevel::default().config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("STRICT".parse::<SecurityLevel>().unwrap(), SecurityLevel::Strict);
        assert_eq!(" Secure ".parse::<SecurityLevel>().unwrap(), SecurityLevel::Secure);
        assert_eq!("permissive".parse::<SecurityLevel>().unwrap(), SecurityLevel::Permissive);
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("locked_down".parse::<SecurityLevel>().unwrap(), SecurityLevel::Strict);
        assert_eq!("Locked-Down".parse::<SecurityLevel>().unwrap(), SecurityLevel::Strict);
        assert_eq!("default".parse::<SecurityLevel>().unwrap(), SecurityLevel::Standard);
    }

    #[test]
    fn rejects_unknown_level() {
        let err = "paranoid".parse::<SecurityLevel>().unwrap_err();
        assert!(err.to_string().contains("paranoid"));
    }

    #[test]
    fn preset_mapping_is_total_and_order_preserving() {
        for pair in SecurityLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(
                pair[0].preset_level() <= pair[1].preset_level(),
                "{} maps looser than {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn limits_loosen_with_level() {
        for pair in SecurityLevel::ALL.windows(2) {
            let (a, b) = (pair[0].config(), pair[1].config());
            assert!(a.timeout <= b.timeout);
            assert!(a.max_iterations <= b.max_iterations);
            assert!(a.max_tool_calls <= b.max_tool_calls);
            assert!(a.max_console_bytes <= b.max_console_bytes);
            assert!(a.max_console_calls <= b.max_console_calls);
            assert!(a.max_memory_bytes <= b.max_memory_bytes);
            assert!(a.max_pending_tool_calls <= b.max_pending_tool_calls);
        }
    }

    #[test]
    fn secure_defaults() {
        let c = SecurityLevel::Secure.config();
        assert_eq!(c.timeout, Duration::from_secs(15));
        assert_eq!(c.max_iterations, 5_000);
        assert_eq!(c.max_console_bytes, 256 * 1024);
        assert_eq!(c.max_pending_tool_calls, 8);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&SecurityLevel::Permissive).unwrap();
        assert_eq!(json, "\"permissive\"");
    }
}
