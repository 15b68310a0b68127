//! Rule families and their checks over [`ScriptFacts`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::walker::{ArgumentShape, Callee, LoopKind, ScriptFacts, SourceSpan};

/// Objects whose members are treated as global names.
const GLOBAL_OBJECTS: &[&str] = &["globalThis", "global", "self", "window"];

/// Names that compile source text when called.
const CODE_CONSTRUCTORS: &[&str] = &["eval", "Function", "AsyncFunction", "GeneratorFunction"];

/// Timers that compile a string first argument.
const STRING_TIMERS: &[&str] = &["setTimeout", "setInterval", "setImmediate"];

/// How severe an issue is. Only `Error` makes a script invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Rejects the script.
    Error,
    /// Reported, but the script may run.
    Warning,
    /// Informational.
    Info,
}

/// Closed set of issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    /// The source failed to parse or failed a pre-parse check.
    ParseError,
    /// A blocked identifier was referenced.
    DisallowedIdentifier,
    /// A forbidden loop kind was used.
    ForbiddenLoop,
    /// Source-compiling call.
    NoEval,
    /// Async function or `await`.
    NoAsync,
    /// A required call count was not met.
    RequiredFunctionCall,
    /// A call's arguments did not match the expected shape.
    CallArgumentValidation,
    /// An identifier used a runtime-reserved prefix.
    ReservedPrefix,
    /// A sandbox escape pattern.
    SandboxEscape,
}

impl IssueCode {
    /// Serialized name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::DisallowedIdentifier => "DISALLOWED_IDENTIFIER",
            Self::ForbiddenLoop => "FORBIDDEN_LOOP",
            Self::NoEval => "NO_EVAL",
            Self::NoAsync => "NO_ASYNC",
            Self::RequiredFunctionCall => "REQUIRED_FUNCTION_CALL",
            Self::CallArgumentValidation => "CALL_ARGUMENT_VALIDATION",
            Self::ReservedPrefix => "RESERVED_PREFIX",
            Self::SandboxEscape => "SANDBOX_ESCAPE",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique name of a registered rule instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Wrap a name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How [`Rule::RequiredFunctionCall`] combines its names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Each name must be called within bounds.
    All,
    /// The combined count across names must be within bounds.
    Any,
}

/// Expected type of one positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    /// String or template literal.
    String,
    /// Numeric literal.
    Number,
    /// Boolean literal.
    Boolean,
    /// Object literal.
    Object,
    /// Array literal.
    Array,
    /// Function or arrow.
    Function,
    /// Anything.
    Any,
}

impl ArgType {
    /// Whether `shape` satisfies this type. With `strict`, a value whose
    /// type is unknown statically does not.
    pub fn accepts(self, shape: ArgumentShape, strict: bool) -> bool {
        use ArgumentShape as S;
        match (self, shape) {
            (Self::Any, _) => true,
            (_, S::Dynamic | S::Spread) => !strict,
            (Self::String, S::String) => true,
            (Self::String, S::Template { is_static }) => is_static || !strict,
            (Self::Number, S::Number) => true,
            (Self::Boolean, S::Boolean) => true,
            (Self::Object, S::Object) => true,
            (Self::Array, S::Array) => true,
            (Self::Function, S::Function) => true,
            _ => false,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Function => "function",
            Self::Any => "any",
        }
    }
}

/// Caller-supplied argument check. Returns a rejection reason, or `None` to accept.
#[derive(Clone)]
pub struct CustomArgValidator(Arc<dyn Fn(&[ArgumentShape]) -> Option<String> + Send + Sync>);

impl CustomArgValidator {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[ArgumentShape]) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn check(&self, args: &[ArgumentShape]) -> Option<String> {
        (self.0)(args)
    }
}

impl fmt::Debug for CustomArgValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomArgValidator(..)")
    }
}

/// One configured rule.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Reject references to any of `names`, including members of global objects.
    DisallowedIdentifier {
        /// Blocked names.
        names: BTreeSet<String>,
    },
    /// Reject the listed loop kinds.
    ForbiddenLoop {
        /// Forbidden kinds.
        forbidden: BTreeSet<LoopKind>,
    },
    /// Reject `eval`, the `Function` family, and string-argument timers.
    NoEval,
    /// Reject async functions and/or `await`.
    NoAsync {
        /// Reject `async function` and `async () =>`.
        forbid_async_functions: bool,
        /// Reject `await` and `for await`.
        forbid_await: bool,
    },
    /// Require calls to `names` between `min_calls` and `max_calls` times.
    RequiredFunctionCall {
        /// Function names.
        names: Vec<String>,
        /// Minimum count.
        min_calls: usize,
        /// Maximum count, unbounded if `None`.
        max_calls: Option<usize>,
        /// Per-name or combined counting.
        mode: CallMode,
    },
    /// Check argument count and shape for every call to `function`.
    CallArgumentValidation {
        /// Function name.
        function: String,
        /// Minimum argument count.
        min_args: usize,
        /// Maximum argument count.
        max_args: Option<usize>,
        /// Expected types by position.
        expected: Vec<ArgType>,
        /// Statically unknown arguments fail the type check.
        strict_types: bool,
        /// Extra check.
        custom: Option<CustomArgValidator>,
    },
    /// Reject identifiers starting with any of `prefixes`.
    ReservedPrefix {
        /// Reserved prefixes.
        prefixes: Vec<String>,
    },
    /// Reject prototype and constructor escapes, `with`, and module access.
    SandboxEscape,
}

/// An issue raised by a rule, before line/column mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    /// Issue code.
    pub code: IssueCode,
    /// Human-readable message.
    pub message: String,
    /// Where, when it has a location.
    pub span: Option<SourceSpan>,
    /// Structured detail.
    pub data: Option<Value>,
}

impl Finding {
    fn at(code: IssueCode, span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            span: Some(span),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Rule {
    /// Family name.
    pub fn family(&self) -> &'static str {
        match self {
            Self::DisallowedIdentifier { .. } => "disallowed-identifier",
            Self::ForbiddenLoop { .. } => "forbidden-loop",
            Self::NoEval => "no-eval",
            Self::NoAsync { .. } => "no-async",
            Self::RequiredFunctionCall { .. } => "required-function-call",
            Self::CallArgumentValidation { .. } => "call-argument-validation",
            Self::ReservedPrefix { .. } => "reserved-prefix",
            Self::SandboxEscape => "sandbox-escape",
        }
    }

    /// Check the rule's own parameters.
    pub fn check_params(&self) -> Result<(), String> {
        match self {
            Self::DisallowedIdentifier { names } => {
                if names.iter().any(|n| n.trim().is_empty()) {
                    return Err("identifier names must not be empty".into());
                }
            }
            Self::NoAsync {
                forbid_async_functions,
                forbid_await,
            } => {
                if !forbid_async_functions && !forbid_await {
                    return Err("rule forbids nothing; remove it instead".into());
                }
            }
            Self::RequiredFunctionCall {
                names,
                min_calls,
                max_calls,
                ..
            } => {
                if names.is_empty() {
                    return Err("at least one function name is required".into());
                }
                if let Some(max) = max_calls {
                    if max < min_calls {
                        return Err(format!("maxCalls {max} is below minCalls {min_calls}"));
                    }
                }
            }
            Self::CallArgumentValidation {
                function,
                min_args,
                max_args,
                expected,
                ..
            } => {
                if function.trim().is_empty() {
                    return Err("function name must not be empty".into());
                }
                if let Some(max) = max_args {
                    if max < min_args {
                        return Err(format!("maxArgs {max} is below minArgs {min_args}"));
                    }
                    if expected.len() > *max {
                        return Err(format!(
                            "{} expected types for at most {max} arguments",
                            expected.len()
                        ));
                    }
                }
            }
            Self::ReservedPrefix { prefixes } => {
                if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
                    return Err("prefixes must be non-empty".into());
                }
            }
            Self::ForbiddenLoop { .. } | Self::NoEval | Self::SandboxEscape => {}
        }
        Ok(())
    }

    /// Run the rule.
    pub fn check(&self, facts: &ScriptFacts) -> Vec<Finding> {
        match self {
            Self::DisallowedIdentifier { names } => check_disallowed(names, facts),
            Self::ForbiddenLoop { forbidden } => facts
                .loops
                .iter()
                .filter(|l| forbidden.contains(&l.kind))
                .map(|l| {
                    Finding::at(
                        IssueCode::ForbiddenLoop,
                        l.span,
                        format!("'{}' loops are not allowed", l.kind.as_str()),
                    )
                    .with_data(json!({ "loopKind": l.kind }))
                })
                .collect(),
            Self::NoEval => check_no_eval(facts),
            Self::NoAsync {
                forbid_async_functions,
                forbid_await,
            } => {
                let mut out = Vec::new();
                if *forbid_async_functions {
                    out.extend(facts.async_functions.iter().map(|s| {
                        Finding::at(IssueCode::NoAsync, *s, "async functions are not allowed")
                    }));
                }
                if *forbid_await {
                    out.extend(
                        facts
                            .awaits
                            .iter()
                            .map(|s| Finding::at(IssueCode::NoAsync, *s, "await is not allowed")),
                    );
                }
                out
            }
            Self::RequiredFunctionCall {
                names,
                min_calls,
                max_calls,
                mode,
            } => check_required(names, *min_calls, *max_calls, *mode, facts),
            Self::CallArgumentValidation {
                function,
                min_args,
                max_args,
                expected,
                strict_types,
                custom,
            } => {
                let mut out = Vec::new();
                let calls = facts.calls.iter().filter(|c| {
                    !c.is_new && matches!(&c.callee, Callee::Identifier(n) if n == function)
                });
                for call in calls {
                    let n = call.arguments.len();
                    if n < *min_args {
                        out.push(Finding::at(
                            IssueCode::CallArgumentValidation,
                            call.span,
                            format!("{function}() expects at least {min_args} argument(s), got {n}"),
                        ));
                        continue;
                    }
                    if let Some(max) = max_args {
                        if n > *max {
                            out.push(Finding::at(
                                IssueCode::CallArgumentValidation,
                                call.span,
                                format!("{function}() expects at most {max} argument(s), got {n}"),
                            ));
                            continue;
                        }
                    }
                    for (pos, (want, got)) in expected.iter().zip(&call.arguments).enumerate() {
                        if !want.accepts(*got, *strict_types) {
                            out.push(
                                Finding::at(
                                    IssueCode::CallArgumentValidation,
                                    call.span,
                                    format!(
                                        "argument {} of {function}() must be a {}{}",
                                        pos + 1,
                                        if *strict_types { "static " } else { "" },
                                        want.as_str()
                                    ),
                                )
                                .with_data(json!({ "position": pos, "expected": want })),
                            );
                        }
                    }
                    if let Some(reason) = custom.as_ref().and_then(|c| c.check(&call.arguments)) {
                        out.push(Finding::at(
                            IssueCode::CallArgumentValidation,
                            call.span,
                            format!("{function}(): {reason}"),
                        ));
                    }
                }
                out
            }
            Self::ReservedPrefix { prefixes } => facts
                .identifiers
                .iter()
                .filter(|i| prefixes.iter().any(|p| i.name.starts_with(p.as_str())))
                .map(|i| {
                    Finding::at(
                        IssueCode::ReservedPrefix,
                        i.span,
                        format!("identifier '{}' uses a reserved prefix", i.name),
                    )
                })
                .collect(),
            Self::SandboxEscape => facts
                .escapes
                .iter()
                .map(|e| Finding::at(IssueCode::SandboxEscape, e.span, e.message))
                .collect(),
        }
    }
}

fn check_disallowed(names: &BTreeSet<String>, facts: &ScriptFacts) -> Vec<Finding> {
    let mut out: Vec<Finding> = facts
        .identifiers
        .iter()
        .filter(|i| names.contains(&i.name))
        .map(|i| {
            Finding::at(
                IssueCode::DisallowedIdentifier,
                i.span,
                format!("identifier '{}' is not allowed", i.name),
            )
            .with_data(json!({ "identifier": i.name }))
        })
        .collect();
    // `globalThis.process`, `self["fetch"]`, `this["eval"]`.
    for m in &facts.members {
        let global_object = match &m.object {
            Some(obj) => GLOBAL_OBJECTS.contains(&obj.as_str()),
            None => m.computed,
        };
        if global_object && names.contains(&m.property) {
            out.push(
                Finding::at(
                    IssueCode::DisallowedIdentifier,
                    m.span,
                    format!("access to global '{}' is not allowed", m.property),
                )
                .with_data(json!({ "identifier": m.property })),
            );
        }
    }
    out
}

fn check_no_eval(facts: &ScriptFacts) -> Vec<Finding> {
    let mut out = Vec::new();
    for call in &facts.calls {
        let name = match &call.callee {
            Callee::Identifier(n) => Some(n.as_str()),
            Callee::Member {
                object: Some(obj),
                property,
            } if GLOBAL_OBJECTS.contains(&obj.as_str()) => Some(property.as_str()),
            _ => None,
        };
        let Some(name) = name else { continue };
        if CODE_CONSTRUCTORS.contains(&name) {
            out.push(Finding::at(
                IssueCode::NoEval,
                call.span,
                format!("{name}() compiles code at runtime and is not allowed"),
            ));
        } else if STRING_TIMERS.contains(&name)
            && matches!(
                call.arguments.first(),
                Some(ArgumentShape::String | ArgumentShape::Template { .. })
            )
        {
            out.push(Finding::at(
                IssueCode::NoEval,
                call.span,
                format!("{name}() with a string argument is not allowed"),
            ));
        }
    }
    out
}

fn check_required(
    names: &[String],
    min: usize,
    max: Option<usize>,
    mode: CallMode,
    facts: &ScriptFacts,
) -> Vec<Finding> {
    let count = |name: &str| {
        facts
            .calls
            .iter()
            .filter(|c| matches!(&c.callee, Callee::Identifier(n) if n == name))
            .count()
    };
    let in_bounds = |n: usize| n >= min && max.map_or(true, |m| n <= m);
    let bounds = match max {
        Some(m) => format!("between {min} and {m}"),
        None => format!("at least {min}"),
    };
    let finding = |message: String, data: Value| Finding {
        code: IssueCode::RequiredFunctionCall,
        message,
        span: None,
        data: Some(data),
    };
    match mode {
        CallMode::All => names
            .iter()
            .filter_map(|name| {
                let n = count(name);
                (!in_bounds(n)).then(|| {
                    finding(
                        format!("{name}() must be called {bounds} time(s), found {n}"),
                        json!({ "function": name, "count": n }),
                    )
                })
            })
            .collect(),
        CallMode::Any => {
            let total: usize = names.iter().map(|n| count(n)).sum();
            if in_bounds(total) {
                Vec::new()
            } else {
                vec![finding(
                    format!(
                        "calls to {} must total {bounds}, found {total}",
                        names.join(" / ")
                    ),
                    json!({ "functions": names, "count": total }),
                )]
            }
        }
    }
}
