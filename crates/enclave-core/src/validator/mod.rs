//! Static validation of AgentScript against a [`SecurityPolicy`].
//!
//! The source is pre-checked (size, bracket nesting), parsed once with oxc,
//! and walked once into [`ScriptFacts`]. Every registered rule then runs over
//! those facts. Validation has no side effects; a rejected script never
//! touches the sidecar.
//!
//! Static analysis cannot see through names built at runtime (string
//! concatenation, `\u` escapes in computed keys). The runtime lockdown and
//! proxy bindings cover that gap.

mod policy;
mod presets;
mod rules;
pub mod walker;

use oxc_allocator::Allocator;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::SourceType;
use serde::Serialize;
use serde_json::Value;

pub use policy::{
    PolicyBuilder, PolicyOverrides, RegisteredRule, RuleRegistry, SecurityPolicy,
    DEFAULT_MAX_SOURCE_BYTES, PROXIED_NAMES, SAFE_PREFIX,
};
pub use presets::{PresetLevel, RESERVED_PREFIXES, TOOL_CALL_FUNCTION};
pub use rules::{ArgType, CallMode, CustomArgValidator, Finding, IssueCode, Rule, RuleId, Severity};
pub use walker::ScriptFacts;

use crate::error::EnclaveError;

/// Maximum bracket nesting accepted before parsing.
pub const MAX_NESTING_DEPTH: usize = 256;

/// 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Line number.
    pub line: u32,
    /// Column in characters.
    pub column: u32,
}

/// One problem found in a script.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Closed code.
    pub code: IssueCode,
    /// Severity.
    pub severity: Severity,
    /// Message.
    pub message: String,
    /// Where, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The rule that raised it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleId>,
}

/// A script that parsed, with the facts the transformer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScript {
    /// Original source.
    pub source: String,
    /// Walk results.
    pub facts: ScriptFacts,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// No error-severity issue was found.
    pub valid: bool,
    /// Issues in rule registration order.
    pub issues: Vec<ValidationIssue>,
    /// Present when parsing succeeded.
    #[serde(skip)]
    pub script: Option<ParsedScript>,
    /// Parser diagnostic when parsing failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ValidationResult {
    fn parse_failure(message: String) -> Self {
        Self {
            valid: false,
            issues: vec![ValidationIssue {
                code: IssueCode::ParseError,
                severity: Severity::Error,
                message: message.clone(),
                location: None,
                data: None,
                rule: None,
            }],
            script: None,
            parse_error: Some(message),
        }
    }

    /// Error-severity issues.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// The parsed script, or the error that rejects it.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Parse`] for a parse failure and
    /// [`EnclaveError::ValidationFailed`] for policy violations.
    pub fn into_script(self) -> Result<ParsedScript, EnclaveError> {
        if let Some(message) = self.parse_error {
            return Err(EnclaveError::Parse { message });
        }
        if !self.valid {
            const SHOWN: usize = 5;
            let errors: Vec<_> = self.errors().collect();
            let mut summary = errors
                .iter()
                .take(SHOWN)
                .map(|i| format!("{}: {}", i.code, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            if errors.len() > SHOWN {
                summary.push_str(&format!(" (and {} more)", errors.len() - SHOWN));
            }
            return Err(EnclaveError::ValidationFailed { summary });
        }
        self.script.ok_or_else(|| EnclaveError::Parse {
            message: "no syntax tree produced".into(),
        })
    }
}

/// Reject inputs whose bracket nesting would exhaust the parser stack.
pub fn check_nesting_depth(code: &str) -> Result<(), String> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(format!(
            "nesting depth {max_depth} exceeds maximum of {MAX_NESTING_DEPTH}"
        ));
    }
    Ok(())
}

/// Parse and walk `code`. Returns the first parser diagnostic on failure.
pub(crate) fn parse_facts(code: &str) -> Result<ScriptFacts, String> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, SourceType::mjs())
        .with_options(ParseOptions {
            allow_return_outside_function: true,
            ..ParseOptions::default()
        })
        .parse();
    if ret.panicked {
        return Err("parser panicked on malformed input".into());
    }
    if let Some(first) = ret.errors.first() {
        return Err(first.to_string());
    }
    Ok(walker::collect(&ret.program))
}

/// Validate `source` against `policy`.
pub fn validate(source: &str, policy: &SecurityPolicy) -> ValidationResult {
    if source.len() > policy.max_source_bytes() {
        return ValidationResult::parse_failure(format!(
            "source is {} bytes, maximum is {}",
            source.len(),
            policy.max_source_bytes()
        ));
    }
    if let Err(message) = check_nesting_depth(source) {
        return ValidationResult::parse_failure(message);
    }
    let facts = match parse_facts(source) {
        Ok(facts) => facts,
        Err(message) => return ValidationResult::parse_failure(message),
    };

    let lines = LineIndex::new(source);
    let mut issues = Vec::new();
    for registered in policy.rules() {
        for finding in registered.rule.check(&facts) {
            issues.push(ValidationIssue {
                code: finding.code,
                severity: registered.severity,
                message: finding.message,
                location: finding.span.map(|s| lines.locate(s.start)),
                data: finding.data,
                rule: Some(registered.id.clone()),
            });
        }
    }
    let valid = !issues.iter().any(|i| i.severity == Severity::Error);
    tracing::debug!(
        preset = %policy.preset_level(),
        issues = issues.len(),
        valid,
        "script validated"
    );
    ValidationResult {
        valid,
        issues,
        script: Some(ParsedScript {
            source: source.to_string(),
            facts,
        }),
        parse_error: None,
    }
}

/// Byte offset to line/column mapping.
struct LineIndex<'a> {
    source: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(source: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { source, starts }
    }

    fn locate(&self, offset: u32) -> Location {
        let offset = (offset as usize).min(self.source.len());
        let line = self.starts.partition_point(|&s| s <= offset) - 1;
        let column = self
            .source
            .get(self.starts[line]..offset)
            .map_or(0, |s| s.chars().count());
        Location {
            line: line as u32 + 1,
            column: column as u32 + 1,
        }
    }
}
