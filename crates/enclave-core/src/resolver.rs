//! Expands reference tokens in tool arguments at the tool-call boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::EnclaveError;
use crate::sidecar::{find_references, is_reference, value_size, ReferenceSidecar};

/// Resolution budgets, independent of the sidecar's storage budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverLimits {
    /// Bytes one tool call may expand.
    pub max_bytes_per_call: usize,
    /// Bytes one execution may expand across all its tool calls.
    pub max_bytes_per_execution: usize,
    /// Tokens one tool call may expand.
    pub max_references_per_call: usize,
    /// Deepest array/object nesting walked.
    pub max_depth: usize,
    /// Splice tokens embedded inside larger strings.
    pub allow_composites: bool,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self {
            max_bytes_per_call: 8 * 1024 * 1024,
            max_bytes_per_execution: 32 * 1024 * 1024,
            max_references_per_call: 64,
            max_depth: 32,
            allow_composites: true,
        }
    }
}

/// Per-execution resolver. Tokens owned by other executions do not resolve.
pub struct ReferenceResolver {
    sidecar: Arc<ReferenceSidecar>,
    owner: String,
    limits: ResolverLimits,
    resolved_bytes: AtomicU64,
}

struct CallBudget {
    bytes: usize,
    references: usize,
    max_bytes: usize,
}

impl ReferenceResolver {
    /// Create a resolver for the execution `owner`.
    pub fn new(sidecar: Arc<ReferenceSidecar>, owner: impl Into<String>, limits: ResolverLimits) -> Self {
        Self {
            sidecar,
            owner: owner.into(),
            limits,
            resolved_bytes: AtomicU64::new(0),
        }
    }

    /// Total bytes expanded so far in this execution.
    pub fn resolved_bytes(&self) -> u64 {
        self.resolved_bytes.load(Ordering::Acquire)
    }

    /// Replace every token in `args` with its value.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::ResolutionLimit`] when a budget is exceeded and
    /// [`EnclaveError::ReferenceNotFound`] for unknown, expired, or foreign tokens.
    /// Nothing is charged against the execution budget on failure.
    pub fn resolve_args(&self, args: Value) -> Result<Value, EnclaveError> {
        let already = self.resolved_bytes() as usize;
        let remaining = self.limits.max_bytes_per_execution.saturating_sub(already);
        let mut budget = CallBudget {
            bytes: 0,
            references: 0,
            max_bytes: self.limits.max_bytes_per_call.min(remaining),
        };
        let resolved = self.walk(args, 0, &mut budget)?;
        if budget.bytes > 0 {
            self.commit(budget.bytes)?;
        }
        Ok(resolved)
    }

    fn commit(&self, bytes: usize) -> Result<(), EnclaveError> {
        let max = self.limits.max_bytes_per_execution as u64;
        self.resolved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur.checked_add(bytes as u64)?;
                (next <= max).then_some(next)
            })
            .map(|_| ())
            .map_err(|_| EnclaveError::ResolutionLimit {
                reason: format!(
                    "execution would expand more than {} bytes",
                    self.limits.max_bytes_per_execution
                ),
            })
    }

    fn walk(&self, value: Value, depth: usize, budget: &mut CallBudget) -> Result<Value, EnclaveError> {
        if depth > self.limits.max_depth {
            return Err(EnclaveError::ResolutionLimit {
                reason: format!("arguments nest deeper than {}", self.limits.max_depth),
            });
        }
        match value {
            Value::String(s) if is_reference(&s) => self.expand(&s, budget),
            Value::String(s) if self.limits.allow_composites => self.splice(s, budget),
            Value::Array(items) => items
                .into_iter()
                .map(|v| self.walk(v, depth + 1, budget))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, self.walk(v, depth + 1, budget)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    }

    fn expand(&self, token: &str, budget: &mut CallBudget) -> Result<Value, EnclaveError> {
        budget.references += 1;
        if budget.references > self.limits.max_references_per_call {
            return Err(EnclaveError::ResolutionLimit {
                reason: format!(
                    "more than {} references in one tool call",
                    self.limits.max_references_per_call
                ),
            });
        }
        let value = self.sidecar.resolve_scoped(&self.owner, token)?;
        budget.bytes += value_size(&value)?;
        if budget.bytes > budget.max_bytes {
            return Err(EnclaveError::ResolutionLimit {
                reason: format!(
                    "tool call would expand more than {} bytes",
                    budget.max_bytes
                ),
            });
        }
        Ok(value)
    }

    fn splice(&self, s: String, budget: &mut CallBudget) -> Result<Value, EnclaveError> {
        let mut out = String::new();
        let mut last = 0;
        for m in find_references(&s) {
            out.push_str(&s[last..m.start()]);
            match self.expand(m.as_str(), budget)? {
                Value::String(inner) => out.push_str(&inner),
                other => out.push_str(&serde_json::to_string(&other)?),
            }
            last = m.end();
        }
        if last == 0 {
            return Ok(Value::String(s));
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }
}
