//! Immutable security policy and its builder.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::presets::{PresetLevel, TOOL_CALL_FUNCTION};
use super::rules::{Rule, RuleId, Severity};
use super::walker::LoopKind;
use crate::error::EnclaveError;

/// Default ceiling on script source size.
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 100 * 1024;

/// Names the transformer redirects to runtime proxies.
pub const PROXIED_NAMES: &[&str] = &["console", TOOL_CALL_FUNCTION];

/// Prefix of every proxy alias.
pub const SAFE_PREFIX: &str = "__safe_";

const LOOP_RULE: &str = "forbidden-loop";
const ASYNC_RULE: &str = "no-async";
const IDENTIFIER_RULE: &str = "disallowed-identifier";

/// Request-level adjustments applied on top of a preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverrides {
    /// `true` permits every loop kind, `false` forbids every kind.
    pub allow_loops: Option<bool>,
    /// `true` permits async functions and `await`, `false` forbids both.
    pub allow_async: Option<bool>,
    /// Extra identifiers to block.
    pub additional_disallowed: Vec<String>,
    /// Identifiers to unblock. Names every preset blocks cannot be unblocked.
    pub allowed_identifiers: Vec<String>,
}

impl PolicyOverrides {
    /// No adjustments requested.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A registered rule with its severity.
#[derive(Debug, Clone)]
pub struct RegisteredRule {
    /// Unique id.
    pub id: RuleId,
    /// The rule.
    pub rule: Rule,
    /// Severity of every issue it raises.
    pub severity: Severity,
}

/// Ordered rules keyed by unique id.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
    ids: HashSet<RuleId>,
}

impl RuleRegistry {
    /// Register a rule at the end of the order.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::RuleConfiguration`] for a duplicate id or malformed parameters.
    pub fn register(
        &mut self,
        id: impl Into<RuleId>,
        rule: Rule,
        severity: Severity,
    ) -> Result<(), EnclaveError> {
        let id = id.into();
        if self.ids.contains(&id) {
            return Err(EnclaveError::RuleConfiguration {
                rule: id.to_string(),
                reason: "a rule with this id is already registered".into(),
            });
        }
        rule.check_params()
            .map_err(|reason| EnclaveError::RuleConfiguration {
                rule: id.to_string(),
                reason,
            })?;
        self.ids.insert(id.clone());
        self.rules.push(RegisteredRule { id, rule, severity });
        Ok(())
    }

    /// Drop a rule; returns whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id.as_str() != id);
        self.ids.retain(|i| i.as_str() != id);
        before != self.rules.len()
    }

    /// Mutable access by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut RegisteredRule> {
        self.rules.iter_mut().find(|r| r.id.as_str() == id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.rules.iter().any(|r| r.id.as_str() == id)
    }

    /// Rules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.rules.iter()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// No rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// An immutable validation policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    preset: PresetLevel,
    registry: RuleRegistry,
    max_source_bytes: usize,
}

impl SecurityPolicy {
    /// The unmodified preset.
    pub fn preset(level: PresetLevel) -> Result<Self, EnclaveError> {
        PolicyBuilder::from_preset(level).build()
    }

    /// A preset with request overrides applied.
    pub fn with_overrides(level: PresetLevel, overrides: &PolicyOverrides) -> Result<Self, EnclaveError> {
        PolicyBuilder::from_preset(level)
            .apply_overrides(overrides)?
            .build()
    }

    /// Builder seeded from `level`.
    pub fn builder(level: PresetLevel) -> PolicyBuilder {
        PolicyBuilder::from_preset(level)
    }

    /// Seeding preset.
    pub fn preset_level(&self) -> PresetLevel {
        self.preset
    }

    /// Rules in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.registry.iter()
    }

    /// Source size ceiling.
    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Names renamed to runtime proxies.
    pub fn proxied_names(&self) -> &'static [&'static str] {
        PROXIED_NAMES
    }

    /// The proxy alias for `name`, if it is proxied.
    pub fn alias_for(&self, name: &str) -> Option<String> {
        PROXIED_NAMES
            .contains(&name)
            .then(|| format!("{SAFE_PREFIX}{name}"))
    }

    /// Every identifier the policy blocks.
    pub fn blocked_identifiers(&self) -> BTreeSet<String> {
        self.registry
            .iter()
            .filter_map(|r| match &r.rule {
                Rule::DisallowedIdentifier { names } => Some(names.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Loop kinds not forbidden by any rule.
    pub fn allowed_loops(&self) -> BTreeSet<LoopKind> {
        let forbidden: BTreeSet<LoopKind> = self
            .registry
            .iter()
            .filter_map(|r| match &r.rule {
                Rule::ForbiddenLoop { forbidden } => Some(forbidden.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();
        LoopKind::ALL
            .into_iter()
            .filter(|k| !forbidden.contains(k))
            .collect()
    }
}

/// Builds a [`SecurityPolicy`] from a preset plus registered rules.
#[derive(Debug)]
pub struct PolicyBuilder {
    preset: PresetLevel,
    registry: RuleRegistry,
    max_source_bytes: usize,
    errors: Vec<EnclaveError>,
}

impl PolicyBuilder {
    /// Seed with `level`'s rules.
    pub fn from_preset(level: PresetLevel) -> Self {
        let mut builder = Self {
            preset: level,
            registry: RuleRegistry::default(),
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            errors: Vec::new(),
        };
        for (id, rule) in level.rules() {
            builder = builder.rule(id, rule);
        }
        builder
    }

    /// Register an error-severity rule. Failures surface from [`build`](Self::build).
    pub fn rule(self, id: impl Into<RuleId>, rule: Rule) -> Self {
        self.rule_with_severity(id, rule, Severity::Error)
    }

    /// Register a rule with an explicit severity.
    pub fn rule_with_severity(mut self, id: impl Into<RuleId>, rule: Rule, severity: Severity) -> Self {
        if let Err(e) = self.registry.register(id, rule, severity) {
            self.errors.push(e);
        }
        self
    }

    /// Remove a seeded rule.
    pub fn without_rule(mut self, id: &str) -> Self {
        self.registry.remove(id);
        self
    }

    /// Change the source size ceiling.
    pub fn max_source_bytes(mut self, bytes: usize) -> Self {
        self.max_source_bytes = bytes;
        self
    }

    /// Apply request overrides.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::RuleConfiguration`] when an override tries to unblock
    /// a name every preset blocks.
    pub fn apply_overrides(mut self, overrides: &PolicyOverrides) -> Result<Self, EnclaveError> {
        match overrides.allow_loops {
            Some(true) => {
                self.registry.remove(LOOP_RULE);
            }
            Some(false) => {
                self.registry.remove(LOOP_RULE);
                self.registry.register(
                    LOOP_RULE,
                    Rule::ForbiddenLoop {
                        forbidden: LoopKind::ALL.into_iter().collect(),
                    },
                    Severity::Error,
                )?;
            }
            None => {}
        }

        match overrides.allow_async {
            Some(true) => {
                self.registry.remove(ASYNC_RULE);
            }
            Some(false) => {
                self.registry.remove(ASYNC_RULE);
                self.registry.register(
                    ASYNC_RULE,
                    Rule::NoAsync {
                        forbid_async_functions: true,
                        forbid_await: true,
                    },
                    Severity::Error,
                )?;
            }
            None => {}
        }

        let floor = PresetLevel::always_blocked();
        if let Some(name) = overrides
            .allowed_identifiers
            .iter()
            .find(|n| floor.contains(n.as_str()))
        {
            return Err(EnclaveError::RuleConfiguration {
                rule: IDENTIFIER_RULE.into(),
                reason: format!("'{name}' is blocked by every preset and cannot be allowed"),
            });
        }

        if !overrides.additional_disallowed.is_empty() && !self.registry.contains(IDENTIFIER_RULE) {
            self.registry.register(
                IDENTIFIER_RULE,
                Rule::DisallowedIdentifier {
                    names: BTreeSet::new(),
                },
                Severity::Error,
            )?;
        }
        if let Some(entry) = self.registry.get_mut(IDENTIFIER_RULE) {
            if let Rule::DisallowedIdentifier { names } = &mut entry.rule {
                names.extend(overrides.additional_disallowed.iter().cloned());
                for allowed in &overrides.allowed_identifiers {
                    names.remove(allowed);
                }
            }
            entry
                .rule
                .check_params()
                .map_err(|reason| EnclaveError::RuleConfiguration {
                    rule: IDENTIFIER_RULE.into(),
                    reason,
                })?;
        }
        Ok(self)
    }

    /// Finish.
    ///
    /// # Errors
    ///
    /// The first registration error, or [`EnclaveError::RuleConfiguration`]
    /// for a zero source ceiling.
    pub fn build(mut self) -> Result<SecurityPolicy, EnclaveError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        if self.max_source_bytes == 0 {
            return Err(EnclaveError::RuleConfiguration {
                rule: "policy".into(),
                reason: "maxSourceBytes must be greater than zero".into(),
            });
        }
        Ok(SecurityPolicy {
            preset: self.preset,
            registry: self.registry,
            max_source_bytes: self.max_source_bytes,
        })
    }
}
