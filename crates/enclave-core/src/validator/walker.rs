//! Single pass over the oxc AST that collects owned, span-addressed facts.
//!
//! Rules and the transformer work on [`ScriptFacts`] instead of the arena AST,
//! so nothing borrowed from the parser outlives validation and no pass ever
//! mutates a tree.

use oxc_ast::ast::*;
use oxc_span::{GetSpan, Span};
use serde::Serialize;

/// Recursion bound for the walker itself. Deep operator chains are not
/// caught by the bracket pre-scan.
const MAX_WALK_DEPTH: usize = 512;

/// Byte range into the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceSpan {
    /// Inclusive start offset.
    pub start: u32,
    /// Exclusive end offset.
    pub end: u32,
}

impl From<Span> for SourceSpan {
    fn from(s: Span) -> Self {
        Self {
            start: s.start,
            end: s.end,
        }
    }
}

/// Whether an identifier reads a name or declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentRole {
    /// `foo` in an expression or assignment target.
    Reference,
    /// `foo` in a declaration, parameter, or pattern.
    Binding,
}

/// One identifier occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierFact {
    /// The name.
    pub name: String,
    /// Span of the name only.
    pub span: SourceSpan,
    /// Reference or binding.
    pub role: IdentRole,
    /// The identifier is an object shorthand (`{ name }`), so it doubles as a key.
    pub shorthand: bool,
}

/// One member access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFact {
    /// Object name when the object is a plain identifier.
    pub object: Option<String>,
    /// Property name; for computed access, the string literal key.
    pub property: String,
    /// `obj["x"]` rather than `obj.x`.
    pub computed: bool,
    /// Span of the whole member expression.
    pub span: SourceSpan,
}

/// What a call or `new` expression invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// `name(...)`
    Identifier(String),
    /// `obj.name(...)` or `obj["name"](...)`
    Member {
        /// Object name when it is a plain identifier.
        object: Option<String>,
        /// Property name.
        property: String,
    },
    /// Anything not statically nameable.
    Dynamic,
}

/// Statically known shape of one call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentShape {
    /// String literal.
    String,
    /// Template literal; `is_static` when it has no interpolations.
    Template {
        /// No `${}` parts.
        is_static: bool,
    },
    /// Numeric or bigint literal.
    Number,
    /// `true` / `false`.
    Boolean,
    /// `null`.
    Null,
    /// The identifier `undefined`.
    Undefined,
    /// Object literal.
    Object,
    /// Array literal.
    Array,
    /// Function or arrow expression.
    Function,
    /// `...spread`.
    Spread,
    /// Not statically known.
    Dynamic,
}

impl ArgumentShape {
    /// Statically a string with a known value.
    pub fn is_static_string(self) -> bool {
        matches!(self, Self::String | Self::Template { is_static: true })
    }
}

/// One call or `new` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFact {
    /// What is called.
    pub callee: Callee,
    /// Argument shapes, in order.
    pub arguments: Vec<ArgumentShape>,
    /// `new X(...)`.
    pub is_new: bool,
    /// Span of the whole call.
    pub span: SourceSpan,
}

/// Loop statement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopKind {
    /// `for (;;)`
    For,
    /// `while`
    While,
    /// `do ... while`
    DoWhile,
    /// `for ... in`
    ForIn,
    /// `for ... of` and `for await ... of`
    ForOf,
}

impl LoopKind {
    /// Every kind.
    pub const ALL: [LoopKind; 5] = [
        LoopKind::For,
        LoopKind::While,
        LoopKind::DoWhile,
        LoopKind::ForIn,
        LoopKind::ForOf,
    ];

    /// Source keyword form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::For => "for",
            Self::While => "while",
            Self::DoWhile => "do-while",
            Self::ForIn => "for-in",
            Self::ForOf => "for-of",
        }
    }
}

/// One loop statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFact {
    /// Kind.
    pub kind: LoopKind,
    /// Span of the loop statement.
    pub span: SourceSpan,
    /// Span of the body statement.
    pub body: SourceSpan,
    /// Body is a `{ ... }` block.
    pub body_is_block: bool,
}

/// A string or fully static template literal eligible for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralFact {
    /// Cooked value.
    pub value: String,
    /// Span including quotes or backticks.
    pub span: SourceSpan,
}

/// A syntactic sandbox-escape pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapeFact {
    /// Where.
    pub span: SourceSpan,
    /// What, without quoting source.
    pub message: &'static str,
}

/// Everything rules and the transformer need to know about a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFacts {
    /// Identifier occurrences in source order.
    pub identifiers: Vec<IdentifierFact>,
    /// Member accesses.
    pub members: Vec<MemberFact>,
    /// Calls and `new` expressions.
    pub calls: Vec<CallFact>,
    /// Loops.
    pub loops: Vec<LoopFact>,
    /// Spans of async functions and arrows.
    pub async_functions: Vec<SourceSpan>,
    /// Spans of `await` expressions and `for await` loops.
    pub awaits: Vec<SourceSpan>,
    /// Extraction candidates.
    pub literals: Vec<LiteralFact>,
    /// Escape patterns.
    pub escapes: Vec<EscapeFact>,
}

/// Walk a parsed program.
pub fn collect(program: &Program<'_>) -> ScriptFacts {
    let mut walker = FactWalker::default();
    for stmt in &program.body {
        walker.walk_statement(stmt);
    }
    walker.facts
}

#[derive(Default)]
struct FactWalker {
    facts: ScriptFacts,
    depth: usize,
    overflowed: bool,
}

fn ident_name(expr: &Expression<'_>) -> Option<String> {
    match expr {
        Expression::Identifier(id) => Some(id.name.to_string()),
        Expression::ParenthesizedExpression(p) => ident_name(&p.expression),
        _ => None,
    }
}

fn callee_of(expr: &Expression<'_>) -> Callee {
    match expr {
        Expression::Identifier(id) => Callee::Identifier(id.name.to_string()),
        Expression::ParenthesizedExpression(p) => callee_of(&p.expression),
        Expression::StaticMemberExpression(m) => Callee::Member {
            object: ident_name(&m.object),
            property: m.property.name.to_string(),
        },
        Expression::ComputedMemberExpression(m) => match &m.expression {
            Expression::StringLiteral(s) => Callee::Member {
                object: ident_name(&m.object),
                property: s.value.to_string(),
            },
            _ => Callee::Dynamic,
        },
        _ => Callee::Dynamic,
    }
}

fn shape_of(expr: &Expression<'_>) -> ArgumentShape {
    match expr {
        Expression::StringLiteral(_) => ArgumentShape::String,
        Expression::TemplateLiteral(t) => ArgumentShape::Template {
            is_static: t.expressions.is_empty(),
        },
        Expression::NumericLiteral(_) | Expression::BigIntLiteral(_) => ArgumentShape::Number,
        Expression::BooleanLiteral(_) => ArgumentShape::Boolean,
        Expression::NullLiteral(_) => ArgumentShape::Null,
        Expression::Identifier(id) if id.name == "undefined" => ArgumentShape::Undefined,
        Expression::ObjectExpression(_) => ArgumentShape::Object,
        Expression::ArrayExpression(_) => ArgumentShape::Array,
        Expression::ArrowFunctionExpression(_) | Expression::FunctionExpression(_) => {
            ArgumentShape::Function
        }
        Expression::ParenthesizedExpression(p) => shape_of(&p.expression),
        _ => ArgumentShape::Dynamic,
    }
}

fn argument_shapes(args: &[Argument<'_>]) -> Vec<ArgumentShape> {
    args.iter()
        .map(|arg| match arg {
            Argument::SpreadElement(_) => ArgumentShape::Spread,
            _ => arg.as_expression().map_or(ArgumentShape::Dynamic, shape_of),
        })
        .collect()
}

impl FactWalker {
    fn escape(&mut self, span: Span, message: &'static str) {
        self.facts.escapes.push(EscapeFact {
            span: span.into(),
            message,
        });
    }

    fn enter(&mut self, span: Span) -> bool {
        if self.depth >= MAX_WALK_DEPTH {
            if !self.overflowed {
                self.overflowed = true;
                self.escape(span, "script nesting is too deep to analyse");
            }
            return false;
        }
        self.depth += 1;
        true
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn reference(&mut self, id: &IdentifierReference<'_>, shorthand: bool) {
        self.facts.identifiers.push(IdentifierFact {
            name: id.name.to_string(),
            span: id.span.into(),
            role: IdentRole::Reference,
            shorthand,
        });
    }

    fn binding(&mut self, id: &BindingIdentifier<'_>, shorthand: bool) {
        self.facts.identifiers.push(IdentifierFact {
            name: id.name.to_string(),
            span: id.span.into(),
            role: IdentRole::Binding,
            shorthand,
        });
    }

    // --- Statements ---

    fn walk_statements(&mut self, stmts: &[Statement<'_>]) {
        for s in stmts {
            self.walk_statement(s);
        }
    }

    fn walk_statement(&mut self, stmt: &Statement<'_>) {
        if !self.enter(stmt.span()) {
            return;
        }
        self.walk_statement_inner(stmt);
        self.leave();
    }

    fn walk_statement_inner(&mut self, stmt: &Statement<'_>) {
        match stmt {
            Statement::ExpressionStatement(es) => self.walk_expression(&es.expression),
            Statement::BlockStatement(block) => self.walk_statements(&block.body),
            Statement::IfStatement(ifs) => {
                self.walk_expression(&ifs.test);
                self.walk_statement(&ifs.consequent);
                if let Some(alt) = &ifs.alternate {
                    self.walk_statement(alt);
                }
            }
            Statement::ReturnStatement(ret) => {
                if let Some(arg) = &ret.argument {
                    self.walk_expression(arg);
                }
            }
            Statement::ThrowStatement(ts) => self.walk_expression(&ts.argument),
            Statement::VariableDeclaration(decl) => self.walk_variable_declaration(decl),
            Statement::FunctionDeclaration(fd) => self.walk_function(fd),
            Statement::ClassDeclaration(cd) => self.walk_class(cd),
            Statement::ForStatement(fors) => {
                if let Some(init) = &fors.init {
                    match init {
                        ForStatementInit::VariableDeclaration(decl) => {
                            self.walk_variable_declaration(decl)
                        }
                        _ => {
                            if let Some(expr) = init.as_expression() {
                                self.walk_expression(expr);
                            }
                        }
                    }
                }
                if let Some(test) = &fors.test {
                    self.walk_expression(test);
                }
                if let Some(update) = &fors.update {
                    self.walk_expression(update);
                }
                self.record_loop(LoopKind::For, fors.span, &fors.body);
            }
            Statement::ForInStatement(fis) => {
                self.walk_for_left(&fis.left);
                self.walk_expression(&fis.right);
                self.record_loop(LoopKind::ForIn, fis.span, &fis.body);
            }
            Statement::ForOfStatement(fos) => {
                if fos.r#await {
                    self.facts.awaits.push(fos.span.into());
                }
                self.walk_for_left(&fos.left);
                self.walk_expression(&fos.right);
                self.record_loop(LoopKind::ForOf, fos.span, &fos.body);
            }
            Statement::WhileStatement(ws) => {
                self.walk_expression(&ws.test);
                self.record_loop(LoopKind::While, ws.span, &ws.body);
            }
            Statement::DoWhileStatement(dws) => {
                self.record_loop(LoopKind::DoWhile, dws.span, &dws.body);
                self.walk_expression(&dws.test);
            }
            Statement::WithStatement(ws) => {
                self.escape(ws.span, "with statements are not allowed");
                self.walk_expression(&ws.object);
                self.walk_statement(&ws.body);
            }
            Statement::SwitchStatement(ss) => {
                self.walk_expression(&ss.discriminant);
                for case in &ss.cases {
                    if let Some(test) = &case.test {
                        self.walk_expression(test);
                    }
                    self.walk_statements(&case.consequent);
                }
            }
            Statement::TryStatement(ts) => {
                self.walk_statements(&ts.block.body);
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.walk_binding_pattern(&param.pattern, false);
                    }
                    self.walk_statements(&handler.body.body);
                }
                if let Some(finalizer) = &ts.finalizer {
                    self.walk_statements(&finalizer.body);
                }
            }
            Statement::LabeledStatement(ls) => self.walk_statement(&ls.body),
            Statement::ImportDeclaration(d) => {
                self.escape(d.span, "module imports are not allowed")
            }
            Statement::ExportAllDeclaration(d) => {
                self.escape(d.span, "module exports are not allowed")
            }
            Statement::ExportDefaultDeclaration(d) => {
                self.escape(d.span, "module exports are not allowed")
            }
            Statement::ExportNamedDeclaration(d) => {
                self.escape(d.span, "module exports are not allowed")
            }
            // Break, continue, empty, debugger, and TypeScript-only statements.
            _ => {}
        }
    }

    fn record_loop(&mut self, kind: LoopKind, span: Span, body: &Statement<'_>) {
        self.facts.loops.push(LoopFact {
            kind,
            span: span.into(),
            body: body.span().into(),
            body_is_block: matches!(body, Statement::BlockStatement(_)),
        });
        self.walk_statement(body);
    }

    fn walk_for_left(&mut self, left: &ForStatementLeft<'_>) {
        match left {
            ForStatementLeft::VariableDeclaration(decl) => self.walk_variable_declaration(decl),
            _ => {
                if let Some(target) = left.as_assignment_target() {
                    self.walk_assignment_target(target);
                }
            }
        }
    }

    fn walk_variable_declaration(&mut self, decl: &VariableDeclaration<'_>) {
        for declarator in &decl.declarations {
            self.walk_binding_pattern(&declarator.id, false);
            if let Some(init) = &declarator.init {
                self.walk_expression(init);
            }
        }
    }

    // --- Bindings ---

    fn walk_binding_pattern(&mut self, pattern: &BindingPattern<'_>, shorthand: bool) {
        match &pattern.kind {
            BindingPatternKind::BindingIdentifier(id) => self.binding(id, shorthand),
            BindingPatternKind::ObjectPattern(obj) => {
                for prop in &obj.properties {
                    if prop.computed {
                        self.walk_property_key(&prop.key);
                    }
                    self.walk_binding_pattern(&prop.value, prop.shorthand);
                }
                if let Some(rest) = &obj.rest {
                    self.walk_binding_pattern(&rest.argument, false);
                }
            }
            BindingPatternKind::ArrayPattern(arr) => {
                for el in arr.elements.iter().flatten() {
                    self.walk_binding_pattern(el, false);
                }
                if let Some(rest) = &arr.rest {
                    self.walk_binding_pattern(&rest.argument, false);
                }
            }
            BindingPatternKind::AssignmentPattern(ap) => {
                self.walk_binding_pattern(&ap.left, shorthand);
                self.walk_expression(&ap.right);
            }
        }
    }

    fn walk_function(&mut self, func: &Function<'_>) {
        if func.r#async {
            self.facts.async_functions.push(func.span.into());
        }
        if let Some(id) = &func.id {
            self.binding(id, false);
        }
        self.walk_params(&func.params);
        if let Some(body) = &func.body {
            self.walk_statements(&body.statements);
        }
    }

    fn walk_params(&mut self, params: &FormalParameters<'_>) {
        for p in &params.items {
            self.walk_binding_pattern(&p.pattern, false);
        }
        if let Some(rest) = &params.rest {
            self.walk_binding_pattern(&rest.argument, false);
        }
    }

    fn walk_class(&mut self, class: &Class<'_>) {
        if let Some(id) = &class.id {
            self.binding(id, false);
        }
        if let Some(sup) = &class.super_class {
            self.walk_expression(sup);
        }
        for element in &class.body.body {
            match element {
                ClassElement::MethodDefinition(md) => {
                    if md.computed {
                        self.walk_property_key(&md.key);
                    }
                    self.walk_function(&md.value);
                }
                ClassElement::PropertyDefinition(pd) => {
                    if pd.computed {
                        self.walk_property_key(&pd.key);
                    }
                    if let Some(val) = &pd.value {
                        self.walk_expression(val);
                    }
                }
                ClassElement::StaticBlock(sb) => self.walk_statements(&sb.body),
                _ => {}
            }
        }
    }

    /// Computed keys only. A string literal key is recorded as a member-style
    /// escape check but never as an extraction candidate.
    fn walk_property_key(&mut self, key: &PropertyKey<'_>) {
        match key {
            PropertyKey::StringLiteral(s) => self.check_key_literal(s),
            _ => {
                if let Some(expr) = key.as_expression() {
                    self.walk_expression(expr);
                }
            }
        }
    }

    fn check_key_literal(&mut self, s: &StringLiteral<'_>) {
        match s.value.as_str() {
            "constructor" => self.escape(s.span, "computed access to 'constructor' is not allowed"),
            "__proto__" => self.escape(s.span, "access to '__proto__' is not allowed"),
            _ => {}
        }
    }

    // --- Assignment targets ---

    fn walk_assignment_target(&mut self, target: &AssignmentTarget<'_>) {
        match target {
            AssignmentTarget::AssignmentTargetIdentifier(id) => self.reference(id, false),
            AssignmentTarget::ArrayAssignmentTarget(arr) => {
                for el in arr.elements.iter().flatten() {
                    self.walk_target_maybe_default(el);
                }
                if let Some(rest) = &arr.rest {
                    self.walk_assignment_target(&rest.target);
                }
            }
            AssignmentTarget::ObjectAssignmentTarget(obj) => {
                for prop in &obj.properties {
                    match prop {
                        AssignmentTargetProperty::AssignmentTargetPropertyIdentifier(p) => {
                            self.reference(&p.binding, true);
                            if let Some(init) = &p.init {
                                self.walk_expression(init);
                            }
                        }
                        AssignmentTargetProperty::AssignmentTargetPropertyProperty(p) => {
                            if p.computed {
                                self.walk_property_key(&p.name);
                            }
                            self.walk_target_maybe_default(&p.binding);
                        }
                    }
                }
                if let Some(rest) = &obj.rest {
                    self.walk_assignment_target(&rest.target);
                }
            }
            _ => {
                if let Some(member) = target.as_member_expression() {
                    self.walk_member(member);
                }
            }
        }
    }

    fn walk_target_maybe_default(&mut self, el: &AssignmentTargetMaybeDefault<'_>) {
        match el {
            AssignmentTargetMaybeDefault::AssignmentTargetWithDefault(d) => {
                self.walk_assignment_target(&d.binding);
                self.walk_expression(&d.init);
            }
            _ => {
                if let Some(target) = el.as_assignment_target() {
                    self.walk_assignment_target(target);
                }
            }
        }
    }

    // --- Members and calls ---

    fn walk_member(&mut self, member: &MemberExpression<'_>) {
        match member {
            MemberExpression::StaticMemberExpression(m) => self.walk_static_member(m),
            MemberExpression::ComputedMemberExpression(m) => self.walk_computed_member(m),
            MemberExpression::PrivateFieldExpression(pf) => self.walk_expression(&pf.object),
        }
    }

    fn walk_static_member(&mut self, m: &StaticMemberExpression<'_>) {
        let prop = m.property.name.as_str();
        if prop == "__proto__" {
            self.escape(m.span, "access to '__proto__' is not allowed");
        }
        if prop == "constructor" {
            if let Expression::StaticMemberExpression(inner) = &m.object {
                if inner.property.name == "constructor" {
                    self.escape(m.span, "constructor.constructor chains are not allowed");
                }
            }
        }
        self.facts.members.push(MemberFact {
            object: ident_name(&m.object),
            property: prop.to_string(),
            computed: false,
            span: m.span.into(),
        });
        self.walk_expression(&m.object);
    }

    fn walk_computed_member(&mut self, m: &ComputedMemberExpression<'_>) {
        if let Expression::StringLiteral(s) = &m.expression {
            self.check_key_literal(s);
            self.facts.members.push(MemberFact {
                object: ident_name(&m.object),
                property: s.value.to_string(),
                computed: true,
                span: m.span.into(),
            });
            self.walk_expression(&m.object);
            return;
        }
        self.walk_expression(&m.object);
        self.walk_expression(&m.expression);
    }

    fn walk_arguments(&mut self, args: &[Argument<'_>]) {
        for arg in args {
            match arg {
                Argument::SpreadElement(spread) => self.walk_expression(&spread.argument),
                _ => {
                    if let Some(expr) = arg.as_expression() {
                        self.walk_expression(expr);
                    }
                }
            }
        }
    }

    fn walk_call(&mut self, call: &CallExpression<'_>) {
        self.facts.calls.push(CallFact {
            callee: callee_of(&call.callee),
            arguments: argument_shapes(&call.arguments),
            is_new: false,
            span: call.span.into(),
        });
        self.walk_expression(&call.callee);
        self.walk_arguments(&call.arguments);
    }

    // --- Expressions ---

    fn walk_expression(&mut self, expr: &Expression<'_>) {
        if !self.enter(expr.span()) {
            return;
        }
        self.walk_expression_inner(expr);
        self.leave();
    }

    fn walk_expression_inner(&mut self, expr: &Expression<'_>) {
        match expr {
            Expression::Identifier(id) => self.reference(id, false),
            Expression::StringLiteral(s) => self.facts.literals.push(LiteralFact {
                value: s.value.to_string(),
                span: s.span.into(),
            }),
            Expression::TemplateLiteral(tl) => {
                if tl.expressions.is_empty() {
                    if let Some(cooked) = tl.quasis.first().and_then(|q| q.value.cooked.as_ref()) {
                        self.facts.literals.push(LiteralFact {
                            value: cooked.to_string(),
                            span: tl.span.into(),
                        });
                    }
                }
                for e in &tl.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::TaggedTemplateExpression(tagged) => {
                self.facts.calls.push(CallFact {
                    callee: callee_of(&tagged.tag),
                    arguments: Vec::new(),
                    is_new: false,
                    span: tagged.span.into(),
                });
                self.walk_expression(&tagged.tag);
                for e in &tagged.quasi.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::CallExpression(call) => self.walk_call(call),
            Expression::NewExpression(new_expr) => {
                self.facts.calls.push(CallFact {
                    callee: callee_of(&new_expr.callee),
                    arguments: argument_shapes(&new_expr.arguments),
                    is_new: true,
                    span: new_expr.span.into(),
                });
                self.walk_expression(&new_expr.callee);
                self.walk_arguments(&new_expr.arguments);
            }
            Expression::StaticMemberExpression(m) => self.walk_static_member(m),
            Expression::ComputedMemberExpression(m) => self.walk_computed_member(m),
            Expression::PrivateFieldExpression(pf) => self.walk_expression(&pf.object),
            Expression::ChainExpression(chain) => match &chain.expression {
                ChainElement::CallExpression(call) => self.walk_call(call),
                other => {
                    if let Some(member) = other.as_member_expression() {
                        self.walk_member(member);
                    }
                }
            },
            Expression::MetaProperty(meta) => {
                if meta.meta.name == "import" {
                    self.escape(meta.span, "import.meta is not allowed");
                }
            }
            Expression::ImportExpression(imp) => {
                self.escape(imp.span, "dynamic import() is not allowed");
            }
            Expression::ArrowFunctionExpression(arrow) => {
                if arrow.r#async {
                    self.facts.async_functions.push(arrow.span.into());
                }
                self.walk_params(&arrow.params);
                self.walk_statements(&arrow.body.statements);
            }
            Expression::FunctionExpression(func) => self.walk_function(func),
            Expression::ClassExpression(class) => self.walk_class(class),
            Expression::AssignmentExpression(assign) => {
                self.walk_assignment_target(&assign.left);
                self.walk_expression(&assign.right);
            }
            Expression::UpdateExpression(update) => match &update.argument {
                SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => self.reference(id, false),
                other => {
                    if let Some(member) = other.as_member_expression() {
                        self.walk_member(member);
                    }
                }
            },
            Expression::BinaryExpression(bin) => {
                self.walk_expression(&bin.left);
                self.walk_expression(&bin.right);
            }
            Expression::LogicalExpression(log) => {
                self.walk_expression(&log.left);
                self.walk_expression(&log.right);
            }
            Expression::ConditionalExpression(cond) => {
                self.walk_expression(&cond.test);
                self.walk_expression(&cond.consequent);
                self.walk_expression(&cond.alternate);
            }
            Expression::UnaryExpression(unary) => self.walk_expression(&unary.argument),
            Expression::SequenceExpression(seq) => {
                for e in &seq.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::ArrayExpression(arr) => {
                for elem in &arr.elements {
                    match elem {
                        ArrayExpressionElement::SpreadElement(spread) => {
                            self.walk_expression(&spread.argument)
                        }
                        ArrayExpressionElement::Elision(_) => {}
                        _ => {
                            if let Some(e) = elem.as_expression() {
                                self.walk_expression(e);
                            }
                        }
                    }
                }
            }
            Expression::ObjectExpression(obj) => {
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            if p.computed {
                                self.walk_property_key(&p.key);
                            }
                            match &p.value {
                                Expression::Identifier(id) if p.shorthand => self.reference(id, true),
                                value => self.walk_expression(value),
                            }
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            self.walk_expression(&spread.argument)
                        }
                    }
                }
            }
            Expression::AwaitExpression(aw) => {
                self.facts.awaits.push(aw.span.into());
                self.walk_expression(&aw.argument);
            }
            Expression::YieldExpression(y) => {
                if let Some(arg) = &y.argument {
                    self.walk_expression(arg);
                }
            }
            Expression::ParenthesizedExpression(paren) => self.walk_expression(&paren.expression),
            // Literals other than strings, `this`, `super`, and TypeScript-only forms.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::{ParseOptions, Parser};
    use oxc_span::SourceType;

    fn facts(code: &str) -> ScriptFacts {
        let alloc = Allocator::default();
        let ret = Parser::new(&alloc, code, SourceType::mjs())
            .with_options(ParseOptions {
                allow_return_outside_function: true,
                ..Default::default()
            })
            .parse();
        assert!(ret.errors.is_empty(), "parse errors: {:?}", ret.errors);
        collect(&ret.program)
    }

    fn names(f: &ScriptFacts) -> Vec<&str> {
        f.identifiers.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn collects_references_and_bindings() {
        let f = facts("const a = b; function g(c) { return a + c; }");
        let a: Vec<_> = f.identifiers.iter().filter(|i| i.name == "a").collect();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].role, IdentRole::Binding);
        assert_eq!(a[1].role, IdentRole::Reference);
        assert!(names(&f).contains(&"b"));
        assert!(names(&f).contains(&"c"));
    }

    #[test]
    fn marks_shorthand_properties() {
        let f = facts("const o = { console }; const { callTool } = o;");
        let console = f.identifiers.iter().find(|i| i.name == "console").unwrap();
        assert!(console.shorthand);
        let ct = f.identifiers.iter().find(|i| i.name == "callTool").unwrap();
        assert!(ct.shorthand);
        assert_eq!(ct.role, IdentRole::Binding);
    }

    #[test]
    fn property_names_are_not_identifiers() {
        let f = facts("x.process; ({ require: 1 });");
        assert!(!names(&f).contains(&"process"));
        assert!(!names(&f).contains(&"require"));
        assert_eq!(f.members[0].property, "process");
    }

    #[test]
    fn records_call_shapes() {
        let f = facts("callTool('x.y', { a: 1 }); callTool(name, ...rest); new Foo(`t`);");
        assert_eq!(f.calls.len(), 3);
        assert_eq!(f.calls[0].callee, Callee::Identifier("callTool".into()));
        assert_eq!(
            f.calls[0].arguments,
            vec![ArgumentShape::String, ArgumentShape::Object]
        );
        assert_eq!(
            f.calls[1].arguments,
            vec![ArgumentShape::Dynamic, ArgumentShape::Spread]
        );
        assert!(f.calls[2].is_new);
        assert!(f.calls[2].arguments[0].is_static_string());
    }

    #[test]
    fn records_member_callee() {
        let f = facts("globalThis.eval('1'); obj['run']();");
        assert_eq!(
            f.calls[0].callee,
            Callee::Member {
                object: Some("globalThis".into()),
                property: "eval".into()
            }
        );
        assert_eq!(
            f.calls[1].callee,
            Callee::Member {
                object: Some("obj".into()),
                property: "run".into()
            }
        );
    }

    #[test]
    fn records_loops_with_body_spans() {
        let code = "for (let i=0;i<3;i++) x(); while (a) { b(); } do c(); while (d); for (k in o) {} for (v of l) {}";
        let f = facts(code);
        let kinds: Vec<_> = f.loops.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LoopKind::For,
                LoopKind::While,
                LoopKind::DoWhile,
                LoopKind::ForIn,
                LoopKind::ForOf
            ]
        );
        assert!(!f.loops[0].body_is_block);
        assert_eq!(
            &code[f.loops[0].body.start as usize..f.loops[0].body.end as usize],
            "x();"
        );
        assert!(f.loops[1].body_is_block);
    }

    #[test]
    fn records_async_and_await() {
        let f = facts("const f = async () => 1; async function g() {} await f(); for await (const x of y) {}");
        assert_eq!(f.async_functions.len(), 2);
        assert_eq!(f.awaits.len(), 2);
    }

    #[test]
    fn collects_static_literals_only() {
        let f = facts("a('plain'); b(`static`); c(`dyn ${x}`); tag`quasi`; ({ 'key': 1 });");
        let values: Vec<_> = f.literals.iter().map(|l| l.value.as_str()).collect();
        assert_eq!(values, vec!["plain", "static"]);
    }

    #[test]
    fn literal_spans_include_quotes() {
        let code = "x = \"abc\";";
        let f = facts(code);
        let span = f.literals[0].span;
        assert_eq!(&code[span.start as usize..span.end as usize], "\"abc\"");
    }

    #[test]
    fn detects_escape_patterns() {
        let cases = [
            "o.__proto__",
            "o['constructor']",
            "o.constructor.constructor('x')",
            "import('x')",
            "import.meta",
        ];
        for code in cases {
            let f = facts(code);
            assert!(!f.escapes.is_empty(), "missed escape in {code}");
        }
    }

    #[test]
    fn detects_module_syntax() {
        let f = facts("import x from 'y';");
        assert_eq!(f.escapes[0].message, "module imports are not allowed");
    }

    #[test]
    fn deep_operator_chains_stop_the_walk() {
        let code = format!("x = {}1;", "1 + ".repeat(MAX_WALK_DEPTH + 10));
        let f = facts(&code);
        assert!(f
            .escapes
            .iter()
            .any(|e| e.message.contains("too deep")));
    }
}
