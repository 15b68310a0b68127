//! Preset rule bundles, most restrictive first.
//!
//! Each preset's blocked identifiers are a superset of the next looser
//! preset's, and the same holds for forbidden loop kinds and async checks.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::rules::{ArgType, Rule, RuleId};
use super::walker::LoopKind;

/// Blocked by every preset.
const PERMISSIVE_BLOCKED: &[&str] = &[
    "process",
    "require",
    "module",
    "exports",
    "Deno",
    "WebAssembly",
    "Function",
    "eval",
    "importScripts",
    "SharedArrayBuffer",
    "Atomics",
];

/// Added by `standard`.
const STANDARD_BLOCKED: &[&str] = &[
    "Proxy",
    "Reflect",
    "globalThis",
    "global",
    "self",
    "window",
    "__dirname",
    "__filename",
];

/// Added by `secure`.
const SECURE_BLOCKED: &[&str] = &[
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "Worker",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "queueMicrotask",
    "FinalizationRegistry",
    "WeakRef",
];

/// Added by `strict`.
const STRICT_BLOCKED: &[&str] = &["Promise", "Symbol", "WeakMap", "WeakSet", "ArrayBuffer", "DataView"];

/// Prefixes the runtime reserves for its own bindings.
pub const RESERVED_PREFIXES: &[&str] = &["__safe_", "__ag_"];

/// The tool-call function exposed to scripts.
pub const TOOL_CALL_FUNCTION: &str = "callTool";

/// Named validator posture. Ordered from most to least restrictive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PresetLevel {
    /// No async functions or `await`; `for-of` is the only loop.
    Strict,
    /// No network or timer globals; `for` and `for-of` loops.
    Secure,
    /// No reflection or global-object access.
    #[default]
    Standard,
    /// Only the runtime-breaking globals are blocked.
    Permissive,
}

impl PresetLevel {
    /// All presets, most restrictive first.
    pub const ALL: [PresetLevel; 4] = [
        PresetLevel::Strict,
        PresetLevel::Secure,
        PresetLevel::Standard,
        PresetLevel::Permissive,
    ];

    /// Serialized name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Secure => "secure",
            Self::Standard => "standard",
            Self::Permissive => "permissive",
        }
    }

    /// Identifiers blocked at this level.
    pub fn blocked_identifiers(self) -> BTreeSet<&'static str> {
        let tiers: &[&[&str]] = match self {
            Self::Strict => &[PERMISSIVE_BLOCKED, STANDARD_BLOCKED, SECURE_BLOCKED, STRICT_BLOCKED],
            Self::Secure => &[PERMISSIVE_BLOCKED, STANDARD_BLOCKED, SECURE_BLOCKED],
            Self::Standard => &[PERMISSIVE_BLOCKED, STANDARD_BLOCKED],
            Self::Permissive => &[PERMISSIVE_BLOCKED],
        };
        tiers.iter().flat_map(|t| t.iter().copied()).collect()
    }

    /// Identifiers no override may unblock.
    pub fn always_blocked() -> BTreeSet<&'static str> {
        PERMISSIVE_BLOCKED.iter().copied().collect()
    }

    /// Loop kinds permitted at this level.
    pub fn allowed_loops(self) -> BTreeSet<LoopKind> {
        let kinds: &[LoopKind] = match self {
            Self::Strict => &[LoopKind::ForOf],
            Self::Secure => &[LoopKind::For, LoopKind::ForOf],
            Self::Standard => &[LoopKind::For, LoopKind::ForOf, LoopKind::ForIn, LoopKind::While],
            Self::Permissive => &LoopKind::ALL,
        };
        kinds.iter().copied().collect()
    }

    /// `(forbid_async_functions, forbid_await)`.
    pub fn async_restrictions(self) -> (bool, bool) {
        match self {
            Self::Strict => (true, true),
            Self::Secure => (true, false),
            Self::Standard | Self::Permissive => (false, false),
        }
    }

    /// The rule set this preset seeds, in registration order.
    pub fn rules(self) -> Vec<(RuleId, Rule)> {
        let mut rules = vec![
            (RuleId::from("no-eval"), Rule::NoEval),
            (RuleId::from("sandbox-escape"), Rule::SandboxEscape),
            (
                RuleId::from("reserved-prefix"),
                Rule::ReservedPrefix {
                    prefixes: RESERVED_PREFIXES.iter().map(|p| p.to_string()).collect(),
                },
            ),
            (
                RuleId::from("disallowed-identifier"),
                Rule::DisallowedIdentifier {
                    names: self
                        .blocked_identifiers()
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
            ),
        ];

        let allowed = self.allowed_loops();
        let forbidden: BTreeSet<LoopKind> = LoopKind::ALL
            .into_iter()
            .filter(|k| !allowed.contains(k))
            .collect();
        if !forbidden.is_empty() {
            rules.push((RuleId::from("forbidden-loop"), Rule::ForbiddenLoop { forbidden }));
        }

        let (forbid_async_functions, forbid_await) = self.async_restrictions();
        if forbid_async_functions || forbid_await {
            rules.push((
                RuleId::from("no-async"),
                Rule::NoAsync {
                    forbid_async_functions,
                    forbid_await,
                },
            ));
        }

        let strict_types = self <= Self::Secure;
        rules.push((
            RuleId::new(format!("call-args:{TOOL_CALL_FUNCTION}")),
            Rule::CallArgumentValidation {
                function: TOOL_CALL_FUNCTION.to_string(),
                min_args: 1,
                max_args: Some(2),
                expected: vec![ArgType::String],
                strict_types,
                custom: None,
            },
        ));
        rules
    }
}

impl fmt::Display for PresetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
