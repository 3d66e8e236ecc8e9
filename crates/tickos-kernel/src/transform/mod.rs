//! The task-body transformer.
//!
//! Takes user-authored source text and produces a restartable-unit factory.
//! The pipeline is: parse, detect suspension calls, canonicalize the receiver
//! parameter, then lower to a flat op program in which every suspension point
//! is an explicit yield op. A body with no suspension points compiles to a
//! straight-line program that completes on its first `step()`.

mod lower;
pub mod op;

use std::fmt;
use std::sync::Arc;

use tickos_parser::ast::{
    Expression, ForInit, Statement, TaskBody,
};
use tickos_parser::{parse_task_body, ParseError, Span};

use crate::unit::TaskUnit;
use crate::value::Value;
use op::UnitProgram;

/// The canonical name the runtime binds to the kernel. References to the
/// body's first parameter are rewritten to this name.
pub const CANONICAL_RECEIVER: &str = "__kernel";

/// Which suspension points the transformer inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Suspension points are exactly the receiver-qualified
    /// `delay`/`delayMs`/`yield` call sites (the default).
    DelayOnly,

    /// Every top-level statement of the body is additionally a suspension
    /// point.
    StatementLevel,
}

/// Transformation failure, surfaced synchronously from task creation.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The body source did not parse. `mentions_delay` is the textual
    /// fallback heuristic: whether the raw source contains a `.delay(` call,
    /// i.e. whether a rewrite would have been needed.
    #[error("task body failed to parse: {}", first_error(.errors))]
    Parse {
        errors: Vec<ParseError>,
        mentions_delay: bool,
    },

    /// The body parsed but could not be lowered.
    #[error("task body rejected at {line}:{column}: {message}")]
    Lower {
        message: String,
        line: u32,
        column: u32,
    },
}

fn first_error(errors: &[ParseError]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Non-fatal findings reported alongside a successful transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The body calls a bare `delay(…)` but never a receiver-qualified one.
    /// The bare form is inert, so the body runs without suspending; the
    /// rewrite is skipped rather than guessing at the caller's intent.
    BareDelay { line: u32, column: u32 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::BareDelay { line, column } => write!(
                f,
                "bare delay() at {}:{} is not a suspension point; call it on the task's first parameter",
                line, column
            ),
        }
    }
}

/// Creates one restartable unit per task from a compiled program.
#[derive(Debug, Clone)]
pub struct UnitFactory {
    program: Arc<UnitProgram>,
}

impl UnitFactory {
    /// Instantiate a fresh restartable unit with the given params value.
    pub fn instantiate(&self, params: &Value) -> TaskUnit {
        TaskUnit::new(self.program.clone(), params)
    }

    /// The compiled program backing this factory.
    pub fn program(&self) -> &Arc<UnitProgram> {
        &self.program
    }
}

/// Result of a successful transform.
#[derive(Debug)]
pub struct TransformOutput {
    pub factory: UnitFactory,
    pub diagnostics: Vec<Diagnostic>,
}

/// The source-to-unit transformer.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    mode: TransformMode,
}

impl Transformer {
    pub fn new(mode: TransformMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    /// Transform body source text into a restartable-unit factory.
    pub fn transform(&self, source: &str) -> Result<TransformOutput, TransformError> {
        let mut body = match parse_task_body(source) {
            Ok(body) => body,
            Err(errors) => {
                return Err(TransformError::Parse {
                    errors,
                    mentions_delay: source_mentions_delay(source),
                });
            }
        };

        let mut diagnostics = Vec::new();

        // Detect suspension calls before any renaming.
        let scan = DelayScan::run(&body);
        if let (false, Some(span)) = (scan.receiver_qualified, scan.first_bare) {
            diagnostics.push(Diagnostic::BareDelay {
                line: span.line,
                column: span.column,
            });
        }

        // Canonicalize the receiver parameter. The binding is treated as
        // reserved inside its body, so shadowing declarations are rejected
        // rather than silently capturing the kernel.
        if let Some(first) = body.params.first().cloned() {
            if let Some(span) = find_shadowing_decl(&body.body, &first.name) {
                return Err(TransformError::Lower {
                    message: format!(
                        "`{}` shadows the task's kernel parameter",
                        first.name
                    ),
                    line: span.line,
                    column: span.column,
                });
            }
            body.params[0].name = CANONICAL_RECEIVER.to_string();
            rename_in_statements(&mut body.body, &first.name);
        }

        let program = lower::lower_body(&body, self.mode)?;

        Ok(TransformOutput {
            factory: UnitFactory {
                program: Arc::new(program),
            },
            diagnostics,
        })
    }
}

/// Textual fallback heuristic used when the source cannot be parsed.
fn source_mentions_delay(source: &str) -> bool {
    source.contains(".delay(") || source.contains(".delayMs(")
}

// ============================================================================
// Suspension-call detection
// ============================================================================

#[derive(Default)]
struct DelayScan {
    receiver: Option<String>,
    /// Any `RECV.delay(…)` / `RECV.delayMs(…)` / `RECV.yield(…)` call.
    receiver_qualified: bool,
    /// Location of the first bare `delay(…)` / `delayMs(…)` call.
    first_bare: Option<Span>,
}

impl DelayScan {
    fn run(body: &TaskBody) -> Self {
        let mut scan = DelayScan {
            receiver: body.params.first().map(|p| p.name.clone()),
            ..Default::default()
        };
        for stmt in &body.body {
            scan.stmt(stmt);
        }
        scan
    }

    fn stmt(&mut self, stmt: &Statement) {
        match stmt {
            Statement::VariableDecl(decl) => {
                if let Some(init) = &decl.initializer {
                    self.expr(init);
                }
            }
            Statement::Expression(s) => self.expr(&s.expression),
            Statement::If(s) => {
                self.expr(&s.condition);
                self.stmt(&s.consequent);
                if let Some(alt) = &s.alternate {
                    self.stmt(alt);
                }
            }
            Statement::While(s) => {
                self.expr(&s.condition);
                self.stmt(&s.body);
            }
            Statement::DoWhile(s) => {
                self.stmt(&s.body);
                self.expr(&s.condition);
            }
            Statement::For(s) => {
                match &s.init {
                    Some(ForInit::Decl(decl)) => {
                        if let Some(init) = &decl.initializer {
                            self.expr(init);
                        }
                    }
                    Some(ForInit::Expr(expr)) => self.expr(expr),
                    None => {}
                }
                if let Some(cond) = &s.condition {
                    self.expr(cond);
                }
                if let Some(update) = &s.update {
                    self.expr(update);
                }
                self.stmt(&s.body);
            }
            Statement::Return(s) => {
                if let Some(value) = &s.value {
                    self.expr(value);
                }
            }
            Statement::Throw(s) => self.expr(&s.value),
            Statement::Try(s) => {
                for inner in &s.block.statements {
                    self.stmt(inner);
                }
                for inner in &s.catch_block.statements {
                    self.stmt(inner);
                }
            }
            Statement::FunctionDecl(decl) => {
                for inner in &decl.body.statements {
                    self.stmt(inner);
                }
            }
            Statement::Block(block) => {
                for inner in &block.statements {
                    self.stmt(inner);
                }
            }
            Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => {}
        }
    }

    fn expr(&mut self, expr: &Expression) {
        match expr {
            Expression::Call(call) => {
                match &*call.callee {
                    Expression::Member(member) => {
                        if let Expression::Identifier(object) = &*member.object {
                            if Some(object.name.as_str()) == self.receiver.as_deref()
                                && matches!(
                                    member.property.name.as_str(),
                                    "delay" | "delayMs" | "yield"
                                )
                            {
                                self.receiver_qualified = true;
                            }
                        }
                        self.expr(&member.object);
                    }
                    Expression::Identifier(ident) => {
                        if matches!(ident.name.as_str(), "delay" | "delayMs")
                            && self.first_bare.is_none()
                        {
                            self.first_bare = Some(call.span);
                        }
                    }
                    other => self.expr(other),
                }
                for arg in &call.args {
                    self.expr(arg);
                }
            }
            Expression::Array(array) => {
                for element in &array.elements {
                    self.expr(element);
                }
            }
            Expression::Index(index) => {
                self.expr(&index.object);
                self.expr(&index.index);
            }
            Expression::Member(member) => self.expr(&member.object),
            Expression::Assign(assign) => {
                if let tickos_parser::ast::AssignTarget::Index(index) = &assign.target {
                    self.expr(&index.object);
                    self.expr(&index.index);
                }
                self.expr(&assign.value);
            }
            Expression::Unary(unary) => self.expr(&unary.operand),
            Expression::Binary(binary) => {
                self.expr(&binary.left);
                self.expr(&binary.right);
            }
            Expression::Logical(logical) => {
                self.expr(&logical.left);
                self.expr(&logical.right);
            }
            Expression::Conditional(cond) => {
                self.expr(&cond.condition);
                self.expr(&cond.consequent);
                self.expr(&cond.alternate);
            }
            Expression::IntLiteral(_)
            | Expression::FloatLiteral(_)
            | Expression::StringLiteral(_)
            | Expression::BooleanLiteral(_)
            | Expression::NullLiteral(_)
            | Expression::Identifier(_)
            | Expression::Update(_) => {}
        }
    }
}

// ============================================================================
// Receiver canonicalization
// ============================================================================

/// Find a declaration (variable, catch binding, function name or parameter)
/// that would shadow the receiver parameter.
fn find_shadowing_decl(statements: &[Statement], receiver: &str) -> Option<Span> {
    for stmt in statements {
        let found = match stmt {
            Statement::VariableDecl(decl) if decl.name.name == receiver => Some(decl.name.span),
            Statement::If(s) => find_shadowing_decl(std::slice::from_ref(&s.consequent), receiver)
                .or_else(|| {
                    s.alternate
                        .as_deref()
                        .and_then(|a| find_shadowing_decl(std::slice::from_ref(a), receiver))
                }),
            Statement::While(s) => {
                find_shadowing_decl(std::slice::from_ref(&s.body), receiver)
            }
            Statement::DoWhile(s) => {
                find_shadowing_decl(std::slice::from_ref(&s.body), receiver)
            }
            Statement::For(s) => {
                let init_hit = match &s.init {
                    Some(ForInit::Decl(decl)) if decl.name.name == receiver => {
                        Some(decl.name.span)
                    }
                    _ => None,
                };
                init_hit.or_else(|| find_shadowing_decl(std::slice::from_ref(&s.body), receiver))
            }
            Statement::Try(s) => {
                let param_hit = s
                    .catch_param
                    .as_ref()
                    .filter(|p| p.name == receiver)
                    .map(|p| p.span);
                param_hit
                    .or_else(|| find_shadowing_decl(&s.block.statements, receiver))
                    .or_else(|| find_shadowing_decl(&s.catch_block.statements, receiver))
            }
            Statement::FunctionDecl(decl) => {
                if decl.name.name == receiver {
                    Some(decl.name.span)
                } else if let Some(p) = decl.params.iter().find(|p| p.name == receiver) {
                    Some(p.span)
                } else {
                    find_shadowing_decl(&decl.body.statements, receiver)
                }
            }
            Statement::Block(block) => find_shadowing_decl(&block.statements, receiver),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn rename_in_statements(statements: &mut [Statement], from: &str) {
    for stmt in statements {
        rename_in_stmt(stmt, from);
    }
}

fn rename_in_stmt(stmt: &mut Statement, from: &str) {
    match stmt {
        Statement::VariableDecl(decl) => {
            if let Some(init) = &mut decl.initializer {
                rename_in_expr(init, from);
            }
        }
        Statement::Expression(s) => rename_in_expr(&mut s.expression, from),
        Statement::If(s) => {
            rename_in_expr(&mut s.condition, from);
            rename_in_stmt(&mut s.consequent, from);
            if let Some(alt) = &mut s.alternate {
                rename_in_stmt(alt, from);
            }
        }
        Statement::While(s) => {
            rename_in_expr(&mut s.condition, from);
            rename_in_stmt(&mut s.body, from);
        }
        Statement::DoWhile(s) => {
            rename_in_stmt(&mut s.body, from);
            rename_in_expr(&mut s.condition, from);
        }
        Statement::For(s) => {
            match &mut s.init {
                Some(ForInit::Decl(decl)) => {
                    if let Some(init) = &mut decl.initializer {
                        rename_in_expr(init, from);
                    }
                }
                Some(ForInit::Expr(expr)) => rename_in_expr(expr, from),
                None => {}
            }
            if let Some(cond) = &mut s.condition {
                rename_in_expr(cond, from);
            }
            if let Some(update) = &mut s.update {
                rename_in_expr(update, from);
            }
            rename_in_stmt(&mut s.body, from);
        }
        Statement::Return(s) => {
            if let Some(value) = &mut s.value {
                rename_in_expr(value, from);
            }
        }
        Statement::Throw(s) => rename_in_expr(&mut s.value, from),
        Statement::Try(s) => {
            rename_in_statements(&mut s.block.statements, from);
            rename_in_statements(&mut s.catch_block.statements, from);
        }
        Statement::FunctionDecl(decl) => {
            rename_in_statements(&mut decl.body.statements, from);
        }
        Statement::Block(block) => rename_in_statements(&mut block.statements, from),
        Statement::Break(_) | Statement::Continue(_) | Statement::Empty(_) => {}
    }
}

fn rename_in_expr(expr: &mut Expression, from: &str) {
    match expr {
        Expression::Identifier(ident) => {
            if ident.name == from {
                ident.name = CANONICAL_RECEIVER.to_string();
            }
        }
        Expression::Array(array) => {
            for element in &mut array.elements {
                rename_in_expr(element, from);
            }
        }
        Expression::Index(index) => {
            rename_in_expr(&mut index.object, from);
            rename_in_expr(&mut index.index, from);
        }
        Expression::Member(member) => {
            // Property names are not identifier references; only the object
            // side is renamed.
            rename_in_expr(&mut member.object, from);
        }
        Expression::Call(call) => {
            rename_in_expr(&mut call.callee, from);
            for arg in &mut call.args {
                rename_in_expr(arg, from);
            }
        }
        Expression::Assign(assign) => {
            match &mut assign.target {
                tickos_parser::ast::AssignTarget::Ident(ident) => {
                    if ident.name == from {
                        ident.name = CANONICAL_RECEIVER.to_string();
                    }
                }
                tickos_parser::ast::AssignTarget::Index(index) => {
                    rename_in_expr(&mut index.object, from);
                    rename_in_expr(&mut index.index, from);
                }
            }
            rename_in_expr(&mut assign.value, from);
        }
        Expression::Update(update) => {
            if update.target.name == from {
                update.target.name = CANONICAL_RECEIVER.to_string();
            }
        }
        Expression::Unary(unary) => rename_in_expr(&mut unary.operand, from),
        Expression::Binary(binary) => {
            rename_in_expr(&mut binary.left, from);
            rename_in_expr(&mut binary.right, from);
        }
        Expression::Logical(logical) => {
            rename_in_expr(&mut logical.left, from);
            rename_in_expr(&mut logical.right, from);
        }
        Expression::Conditional(cond) => {
            rename_in_expr(&mut cond.condition, from);
            rename_in_expr(&mut cond.consequent, from);
            rename_in_expr(&mut cond.alternate, from);
        }
        Expression::IntLiteral(_)
        | Expression::FloatLiteral(_)
        | Expression::StringLiteral(_)
        | Expression::BooleanLiteral(_)
        | Expression::NullLiteral(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::op::{Op, YieldKind};
    use super::*;

    fn transform(source: &str) -> TransformOutput {
        Transformer::new(TransformMode::DelayOnly)
            .transform(source)
            .unwrap()
    }

    fn yield_ops(output: &TransformOutput) -> Vec<YieldKind> {
        output
            .factory
            .program()
            .funcs
            .iter()
            .flat_map(|f| f.ops.iter())
            .filter_map(|op| match op {
                Op::Yield(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_no_delay_body_has_no_suspension_points() {
        let output = transform("let x = 1; x = x + 1;");
        assert!(!output.factory.program().has_suspension_points());
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn test_receiver_delay_becomes_suspension_point() {
        let output = transform("(rtos) => { rtos.delay(5); }");
        assert_eq!(yield_ops(&output), vec![YieldKind::Delay]);
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn test_delay_ms_and_yield_are_suspension_points() {
        let output = transform("(k) => { k.delayMs(250); k.yield(); }");
        assert_eq!(yield_ops(&output), vec![YieldKind::DelayMs, YieldKind::Now]);
    }

    #[test]
    fn test_bare_delay_emits_diagnostic_and_no_rewrite() {
        let output = transform("delay(5);");
        assert!(matches!(
            output.diagnostics.as_slice(),
            [Diagnostic::BareDelay { .. }]
        ));
        assert!(!output.factory.program().has_suspension_points());
    }

    #[test]
    fn test_receiver_delay_suppresses_bare_diagnostic() {
        let output = transform("(k) => { delay(1); k.delay(2); }");
        assert!(output.diagnostics.is_empty());
    }

    #[test]
    fn test_parse_failure_carries_delay_heuristic() {
        let err = Transformer::new(TransformMode::DelayOnly)
            .transform("(k) => { k.delay(1); !!! }")
            .unwrap_err();
        match err {
            TransformError::Parse { mentions_delay, .. } => assert!(mentions_delay),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_failure_without_delay() {
        let err = Transformer::new(TransformMode::DelayOnly)
            .transform("let = ;")
            .unwrap_err();
        match err {
            TransformError::Parse { mentions_delay, .. } => assert!(!mentions_delay),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_shadowing_receiver_is_rejected() {
        let err = Transformer::new(TransformMode::DelayOnly)
            .transform("(k) => { let k = 1; }")
            .unwrap_err();
        assert!(matches!(err, TransformError::Lower { .. }));
    }

    #[test]
    fn test_unknown_kernel_method_is_rejected() {
        let err = Transformer::new(TransformMode::DelayOnly)
            .transform("(k) => { k.reboot(); }")
            .unwrap_err();
        assert!(matches!(err, TransformError::Lower { .. }));
    }

    #[test]
    fn test_statement_mode_adds_statement_yields() {
        let output = Transformer::new(TransformMode::StatementLevel)
            .transform("(k) => { let x = 1; x = x + 1; k.delay(2); x = x + 1; }")
            .unwrap();
        let kinds = yield_ops(&output);
        assert_eq!(
            kinds,
            vec![
                YieldKind::Stmt,
                YieldKind::Stmt,
                YieldKind::Delay,
                YieldKind::Stmt,
            ]
        );
    }

    #[test]
    fn test_delay_in_nested_function() {
        let output = transform(
            "(k) => { function pause() { k.delay(1); } pause(); }",
        );
        assert_eq!(yield_ops(&output), vec![YieldKind::Delay]);
    }

    #[test]
    fn test_capture_is_rejected() {
        let err = Transformer::new(TransformMode::DelayOnly)
            .transform("(k) => { let total = 0; function bump() { total = total + 1; } bump(); }")
            .unwrap_err();
        match err {
            TransformError::Lower { message, .. } => {
                assert!(message.contains("captures are not supported"), "{}", message);
            }
            other => panic!("expected lower error, got {:?}", other),
        }
    }
}
