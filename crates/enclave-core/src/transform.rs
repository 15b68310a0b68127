//! Source rewriting for validated scripts.
//!
//! Works on the original source plus the walker's spans: every change is a
//! span edit, collected first and applied in one pass, so the parsed facts
//! are never mutated and a [`ParsedScript`] may be shared between requests.
//!
//! Passes:
//! - proxied identifiers (`console`, `callTool`) are renamed to their
//!   `__safe_` aliases;
//! - string and fully static template literals at or above the extraction
//!   threshold are moved into the sidecar and replaced by a quoted token;
//! - every loop body starts with a `__safe_loopTick()` call;
//! - the result is wrapped in the strict-mode async entry function.

use serde::Serialize;
use serde_json::Value;

use crate::error::EnclaveError;
use crate::sidecar::{ReferenceSidecar, ReferenceSource};
use crate::validator::{walker::SourceSpan, ParsedScript, SecurityPolicy};

/// Name of the generated entry function.
pub const ENTRY_FUNCTION: &str = "__ag_main";

/// Runtime binding called at every loop-body entry.
pub const LOOP_TICK: &str = "__safe_loopTick";

/// Inputs the transformer needs besides the script.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Where extracted literals go.
    pub sidecar: &'a ReferenceSidecar,
    /// Execution that owns extracted entries.
    pub owner: &'a str,
    /// Minimum UTF-8 length for extraction; `None` disables it.
    pub extraction_threshold: Option<usize>,
}

/// Rewritten code and what the rewrite did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    /// Code ready for the runtime.
    pub code: String,
    /// Literals moved to the sidecar.
    pub extracted_count: usize,
    /// Bytes moved to the sidecar.
    pub extracted_bytes: usize,
    /// Ids of the created references.
    pub reference_ids: Vec<String>,
    /// Identifier occurrences renamed to proxies.
    pub renamed_count: usize,
    /// Loop bodies instrumented.
    pub instrumented_loops: usize,
}

#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

impl Edit {
    fn insert(at: u32, text: impl Into<String>) -> Self {
        Self {
            start: at as usize,
            end: at as usize,
            text: text.into(),
        }
    }

    fn replace(span: SourceSpan, text: impl Into<String>) -> Self {
        Self {
            start: span.start as usize,
            end: span.end as usize,
            text: text.into(),
        }
    }
}

/// Rewrite `script` for execution.
///
/// # Errors
///
/// - [`EnclaveError::SidecarLimit`] when an extracted literal does not fit
/// - [`EnclaveError::Internal`] when the collected edits overlap
pub fn transform(
    script: &ParsedScript,
    policy: &SecurityPolicy,
    ctx: &TransformContext<'_>,
) -> Result<TransformResult, EnclaveError> {
    let facts = &script.facts;
    let mut edits = Vec::new();

    let mut renamed_count = 0;
    for ident in &facts.identifiers {
        let Some(alias) = policy.alias_for(&ident.name) else {
            continue;
        };
        let text = if ident.shorthand {
            format!("{}: {alias}", ident.name)
        } else {
            alias
        };
        edits.push(Edit::replace(ident.span, text));
        renamed_count += 1;
    }

    let mut reference_ids = Vec::new();
    let mut extracted_bytes = 0;
    if let Some(threshold) = ctx.extraction_threshold {
        for lit in facts.literals.iter().filter(|l| l.value.len() >= threshold) {
            let handle = ctx.sidecar.store(
                ctx.owner,
                Value::String(lit.value.clone()),
                ReferenceSource::Extraction,
            )?;
            extracted_bytes += lit.value.len();
            edits.push(Edit::replace(lit.span, serde_json::to_string(handle.as_str())?));
            reference_ids.push(handle.id().to_string());
        }
    }

    let tick = format!("{LOOP_TICK}(); ");
    for lp in &facts.loops {
        if lp.body_is_block {
            edits.push(Edit::insert(lp.body.start + 1, tick.clone()));
        } else {
            edits.push(Edit::insert(lp.body.start, format!("{{ {tick}")));
            edits.push(Edit::insert(lp.body.end, " }"));
        }
    }

    let body = apply_edits(&script.source, edits)?;
    let code = format!("async function {ENTRY_FUNCTION}() {{\n\"use strict\";\n{body}\n}}");

    tracing::debug!(
        owner = ctx.owner,
        extracted = reference_ids.len(),
        extracted_bytes,
        renamed = renamed_count,
        loops = facts.loops.len(),
        "script transformed"
    );

    Ok(TransformResult {
        code,
        extracted_count: reference_ids.len(),
        extracted_bytes,
        reference_ids,
        renamed_count,
        instrumented_loops: facts.loops.len(),
    })
}

/// Apply non-overlapping edits. At equal offsets, insertions go before the
/// replacement that starts there.
///
/// Overlapping edits mean the walker reported inconsistent spans; that is an
/// internal fault, never silently resolved.
fn apply_edits(source: &str, mut edits: Vec<Edit>) -> Result<String, EnclaveError> {
    edits.sort_by_key(|e| (e.start, e.end != e.start));
    let mut out = String::with_capacity(source.len() + edits.len() * 16);
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor {
            return Err(EnclaveError::Internal(anyhow::anyhow!(
                "overlapping source edits at {}..{} (previous edit ends at {cursor})",
                edit.start,
                edit.end
            )));
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    Ok(out)
}
