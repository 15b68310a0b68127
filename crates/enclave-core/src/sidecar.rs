//! Reference sidecar: a bounded store for values kept outside the isolate.
//!
//! Large literals and (optionally) large tool results never enter V8. The
//! script sees an opaque token of the form `__REF_<uuid>__`; the value stays
//! here until the tool-call boundary resolves it or the owning execution ends.
//!
//! # Ownership
//!
//! Every entry records the execution that created it. [`ReferenceSidecar::resolve_scoped`]
//! refuses tokens owned by another execution, reporting them exactly like
//! unknown tokens so one execution cannot discover another's references.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::EnclaveError;

/// Literal prefix of every reference token.
pub const REFERENCE_PREFIX: &str = "__REF_";
/// Literal suffix of every reference token.
pub const REFERENCE_SUFFIX: &str = "__";

const UUID_LEN: usize = 36;
const TOKEN_LEN: usize = REFERENCE_PREFIX.len() + UUID_LEN + REFERENCE_SUFFIX.len();

static EMBEDDED_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__REF_[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}__").unwrap()
});

/// Cheap structural test: is `s` exactly one reference token?
///
/// Uses the same pattern as [`find_references`], so only lowercase hex is
/// accepted. Does not consult any store.
pub fn is_reference(s: &str) -> bool {
    s.len() == TOKEN_LEN
        && EMBEDDED_REF_RE
            .find(s)
            .is_some_and(|m| m.start() == 0 && m.end() == s.len())
}

/// Every reference token embedded in `s`, left to right.
pub fn find_references(s: &str) -> impl Iterator<Item = regex::Match<'_>> {
    EMBEDDED_REF_RE.find_iter(s)
}

/// An opaque reference token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceHandle(String);

impl ReferenceHandle {
    fn generate() -> Self {
        Self(format!(
            "{REFERENCE_PREFIX}{}{REFERENCE_SUFFIX}",
            uuid::Uuid::new_v4()
        ))
    }

    /// Parse a token string.
    pub fn parse(token: &str) -> Option<Self> {
        is_reference(token).then(|| Self(token.to_string()))
    }

    /// The full token, as seen by scripts.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id between prefix and suffix. Safe to log.
    pub fn id(&self) -> &str {
        token_id(&self.0)
    }
}

impl fmt::Display for ReferenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn token_id(token: &str) -> &str {
    token
        .strip_prefix(REFERENCE_PREFIX)
        .and_then(|t| t.strip_suffix(REFERENCE_SUFFIX))
        .unwrap_or("<malformed>")
}

/// Where a stored value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    /// A large literal pulled out of the script by the transformer.
    Extraction,
    /// A large tool result lifted out of the isolate.
    ToolResult,
    /// Stored directly by the host.
    Host,
}

/// Public description of a stored value. Never includes the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceMetadata {
    /// Token id.
    pub id: String,
    /// Size of the value in bytes (UTF-8 length for strings, JSON length otherwise).
    pub size_bytes: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Origin of the value.
    pub source: ReferenceSource,
    /// Time to live, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

/// Sidecar budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Ceiling on the sum of all stored sizes.
    pub max_total_bytes: usize,
    /// Ceiling on the number of live entries.
    pub max_entries: usize,
    /// Ceiling on one entry.
    pub max_entry_bytes: usize,
    /// TTL applied to every new entry. `None` keeps entries until disposed.
    pub default_ttl: Option<Duration>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 64 * 1024 * 1024,
            max_entries: 4096,
            max_entry_bytes: 16 * 1024 * 1024,
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    owner: String,
    metadata: ReferenceMetadata,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, Entry>,
    total_bytes: usize,
}

impl Store {
    fn remove(&mut self, token: &str) -> Option<Entry> {
        let entry = self.entries.remove(token)?;
        self.total_bytes -= entry.metadata.size_bytes;
        Some(entry)
    }

    fn reap(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for token in &expired {
            self.remove(token);
        }
        expired.len()
    }
}

/// Shared, bounded reference store. Safe for concurrent use across slots.
#[derive(Debug)]
pub struct ReferenceSidecar {
    config: SidecarConfig,
    store: Mutex<Store>,
}

impl ReferenceSidecar {
    /// Create an empty sidecar.
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
        }
    }

    /// Budgets in force.
    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` on behalf of `owner` with the default TTL.
    pub fn store(
        &self,
        owner: &str,
        value: Value,
        source: ReferenceSource,
    ) -> Result<ReferenceHandle, EnclaveError> {
        self.store_with_ttl(owner, value, source, self.config.default_ttl)
    }

    /// Store `value` on behalf of `owner` with an explicit TTL.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::SidecarLimit`] when the entry, the entry count, or the
    /// total byte budget would be exceeded. Expired entries are reaped first.
    pub fn store_with_ttl(
        &self,
        owner: &str,
        value: Value,
        source: ReferenceSource,
        ttl: Option<Duration>,
    ) -> Result<ReferenceHandle, EnclaveError> {
        let size_bytes = value_size(&value)?;
        if size_bytes > self.config.max_entry_bytes {
            return Err(EnclaveError::SidecarLimit {
                reason: format!(
                    "entry of {size_bytes} bytes exceeds per-entry limit of {} bytes",
                    self.config.max_entry_bytes
                ),
            });
        }

        let now = Instant::now();
        let mut store = self.lock();
        store.reap(now);

        if store.entries.len() >= self.config.max_entries {
            return Err(EnclaveError::SidecarLimit {
                reason: format!("entry limit of {} reached", self.config.max_entries),
            });
        }
        let projected = store.total_bytes + size_bytes;
        if projected > self.config.max_total_bytes {
            return Err(EnclaveError::SidecarLimit {
                reason: format!(
                    "storing {size_bytes} bytes would exceed total limit of {} bytes",
                    self.config.max_total_bytes
                ),
            });
        }

        let handle = ReferenceHandle::generate();
        let metadata = ReferenceMetadata {
            id: handle.id().to_string(),
            size_bytes,
            created_at: Utc::now(),
            source,
            ttl_ms: ttl.map(|d| d.as_millis() as u64),
        };
        store.total_bytes = projected;
        store.entries.insert(
            handle.as_str().to_string(),
            Entry {
                value,
                owner: owner.to_string(),
                metadata,
                expires_at: ttl.map(|d| now + d),
            },
        );
        tracing::debug!(
            reference = handle.id(),
            owner,
            size_bytes,
            ?source,
            "sidecar: stored"
        );
        Ok(handle)
    }

    /// Resolve a token regardless of owner. Reads are repeatable until expiry.
    pub fn resolve(&self, token: &str) -> Result<Value, EnclaveError> {
        self.lookup(token, None)
    }

    /// Resolve a token only if `owner` stored it.
    pub fn resolve_scoped(&self, owner: &str, token: &str) -> Result<Value, EnclaveError> {
        self.lookup(token, Some(owner))
    }

    fn lookup(&self, token: &str, owner: Option<&str>) -> Result<Value, EnclaveError> {
        let not_found = || EnclaveError::ReferenceNotFound {
            id: token_id(token).to_string(),
        };
        let now = Instant::now();
        let mut store = self.lock();
        let expired = match store.entries.get(token) {
            None => return Err(not_found()),
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            store.remove(token);
            return Err(not_found());
        }
        match store.entries.get(token) {
            Some(entry) if owner.is_none_or(|o| o == entry.owner) => Ok(entry.value.clone()),
            _ => Err(not_found()),
        }
    }

    /// Size of a live entry, without copying its value.
    pub fn size_of(&self, token: &str) -> Option<usize> {
        self.metadata(token).map(|m| m.size_bytes)
    }

    /// Metadata of a live entry.
    pub fn metadata(&self, token: &str) -> Option<ReferenceMetadata> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(token)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.metadata.clone())
    }

    /// Evict every entry owned by `owner`. Returns the number evicted.
    pub fn dispose_owner(&self, owner: &str) -> usize {
        let mut store = self.lock();
        let owned: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();
        for token in &owned {
            store.remove(token);
        }
        if !owned.is_empty() {
            tracing::debug!(owner, evicted = owned.len(), "sidecar: disposed owner");
        }
        owned.len()
    }

    /// Evict expired entries. Returns the number evicted.
    pub fn reap_expired(&self) -> usize {
        self.lock().reap(Instant::now())
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of stored sizes.
    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }
}

impl Default for ReferenceSidecar {
    fn default() -> Self {
        Self::new(SidecarConfig::default())
    }
}

/// Byte size used for every budget: UTF-8 length for strings, JSON length otherwise.
pub fn value_size(value: &Value) -> Result<usize, EnclaveError> {
    match value {
        Value::String(s) => Ok(s.len()),
        other => Ok(serde_json::to_vec(other)?.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sidecar() -> ReferenceSidecar {
        ReferenceSidecar::default()
    }

    #[test]
    fn token_format_is_recognised() {
        let sc = sidecar();
        let handle = sc.store("e1", json!("x"), ReferenceSource::Host).unwrap();
        assert!(is_reference(handle.as_str()));
        assert!(handle.as_str().starts_with(REFERENCE_PREFIX));
        assert_eq!(handle.id().len(), 36);
    }

    #[test]
    fn ordinary_strings_are_not_references() {
        assert!(!is_reference("hello"));
        assert!(!is_reference("__REF_short__"));
        assert!(!is_reference("__REF_zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz__"));
        assert!(!is_reference(""));
    }

    #[test]
    fn uppercase_token_is_neither_whole_nor_embedded_reference() {
        let upper = "__REF_ABCDEF00-0000-4000-8000-00000000ABCD__";
        assert!(!is_reference(upper));
        assert_eq!(find_references(&format!("see {upper}")).count(), 0);

        let lower = upper.to_ascii_lowercase().replace("__ref_", "__REF_");
        assert!(is_reference(&lower));
        assert_eq!(find_references(&format!("see {lower}")).count(), 1);
    }

    #[test]
    fn store_then_resolve_is_repeatable() {
        let sc = sidecar();
        let value = json!({"rows": [1, 2, 3]});
        let handle = sc.store("e1", value.clone(), ReferenceSource::ToolResult).unwrap();
        assert_eq!(sc.resolve(handle.as_str()).unwrap(), value);
        assert_eq!(sc.resolve(handle.as_str()).unwrap(), value);
    }

    #[test]
    fn unknown_token_is_not_found() {
        let sc = sidecar();
        let err = sc
            .resolve("__REF_00000000-0000-0000-0000-000000000000__")
            .unwrap_err();
        assert!(matches!(err, EnclaveError::ReferenceNotFound { .. }));
        assert!(err.to_string().contains("00000000-0000"));
    }

    #[test]
    fn scoped_resolve_hides_other_owners() {
        let sc = sidecar();
        let handle = sc.store("e1", json!("secret"), ReferenceSource::Extraction).unwrap();
        assert!(sc.resolve_scoped("e1", handle.as_str()).is_ok());
        let err = sc.resolve_scoped("e2", handle.as_str()).unwrap_err();
        assert!(matches!(err, EnclaveError::ReferenceNotFound { .. }));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn entry_limit_is_enforced() {
        let sc = ReferenceSidecar::new(SidecarConfig {
            max_entries: 2,
            ..Default::default()
        });
        sc.store("e", json!("a"), ReferenceSource::Host).unwrap();
        sc.store("e", json!("b"), ReferenceSource::Host).unwrap();
        let err = sc.store("e", json!("c"), ReferenceSource::Host).unwrap_err();
        assert!(matches!(err, EnclaveError::SidecarLimit { .. }));
    }

    #[test]
    fn total_byte_limit_is_enforced() {
        let sc = ReferenceSidecar::new(SidecarConfig {
            max_total_bytes: 10,
            ..Default::default()
        });
        sc.store("e", json!("123456"), ReferenceSource::Host).unwrap();
        let err = sc.store("e", json!("123456"), ReferenceSource::Host).unwrap_err();
        assert!(matches!(err, EnclaveError::SidecarLimit { .. }));
        assert_eq!(sc.total_bytes(), 6);
    }

    #[test]
    fn per_entry_limit_is_enforced() {
        let sc = ReferenceSidecar::new(SidecarConfig {
            max_entry_bytes: 4,
            ..Default::default()
        });
        let err = sc.store("e", json!("12345"), ReferenceSource::Host).unwrap_err();
        assert!(err.to_string().contains("per-entry"));
    }

    #[test]
    fn string_size_is_utf8_length() {
        let sc = sidecar();
        let handle = sc.store("e", json!("héllo"), ReferenceSource::Host).unwrap();
        assert_eq!(sc.size_of(handle.as_str()), Some(6));
    }

    #[test]
    fn dispose_owner_frees_bytes() {
        let sc = sidecar();
        sc.store("e1", json!("aaaa"), ReferenceSource::Host).unwrap();
        sc.store("e1", json!("bbbb"), ReferenceSource::Host).unwrap();
        let keep = sc.store("e2", json!("cc"), ReferenceSource::Host).unwrap();
        assert_eq!(sc.dispose_owner("e1"), 2);
        assert_eq!(sc.len(), 1);
        assert_eq!(sc.total_bytes(), 2);
        assert!(sc.resolve(keep.as_str()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_not_resolvable() {
        let sc = sidecar();
        let handle = sc
            .store_with_ttl(
                "e",
                json!("v"),
                ReferenceSource::Host,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(sc.resolve(handle.as_str()).is_ok());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(sc.resolve(handle.as_str()).is_err());
        assert_eq!(sc.total_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_expired_frees_room() {
        let sc = ReferenceSidecar::new(SidecarConfig {
            max_entries: 1,
            default_ttl: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        sc.store("e", json!("a"), ReferenceSource::Host).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(sc.store("e", json!("b"), ReferenceSource::Host).is_ok());
        assert_eq!(sc.reap_expired(), 0);
    }

    #[test]
    fn finds_embedded_references() {
        let sc = sidecar();
        let a = sc.store("e", json!("A"), ReferenceSource::Host).unwrap();
        let b = sc.store("e", json!("B"), ReferenceSource::Host).unwrap();
        let text = format!("head {a} mid {b} tail");
        let found: Vec<&str> = find_references(&text).map(|m| m.as_str()).collect();
        assert_eq!(found, vec![a.as_str(), b.as_str()]);
    }

    #[test]
    fn metadata_never_contains_value() {
        let sc = sidecar();
        let handle = sc.store("e", json!("payload"), ReferenceSource::Extraction).unwrap();
        let meta = sc.metadata(handle.as_str()).unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("payload"));
        assert_eq!(meta.source, ReferenceSource::Extraction);
        assert_eq!(meta.ttl_ms, Some(300_000));
    }
}
