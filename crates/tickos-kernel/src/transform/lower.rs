//! AST-to-op lowering.
//!
//! Lowering resolves names to local slots with lexical scoping, flattens
//! control flow into jumps, turns canonical-receiver calls into explicit
//! yield/query ops, and compiles nested function declarations into separate
//! functions with real call frames (no closures).

use rustc_hash::{FxHashMap, FxHashSet};
use tickos_parser::ast::*;
use tickos_parser::Span;

use super::op::{BuiltinFn, CompiledFn, KernelQuery, MethodId, Op, UnitProgram, YieldKind};
use super::{TransformError, TransformMode, CANONICAL_RECEIVER};
use crate::value::Value;

const PLACEHOLDER: usize = usize::MAX;

/// Maximum nesting of registered functions; a backstop against pathological
/// inputs, far above anything a task body reasonably declares.
const MAX_FUNCTIONS: usize = 256;

fn lower_err(message: impl Into<String>, span: &Span) -> TransformError {
    TransformError::Lower {
        message: message.into(),
        line: span.line,
        column: span.column,
    }
}

/// Lower a (receiver-canonicalized) task body to a [`UnitProgram`].
pub(crate) fn lower_body(body: &TaskBody, mode: TransformMode) -> Result<UnitProgram, TransformError> {
    let mut registry = FunctionRegistry::new();
    registry.register_tree(body)?;

    // Entry function
    let mut entry = FnLowerer::new(&registry, FxHashSet::default());
    entry.push_scope();

    let mut params_slot = None;
    for (i, param) in body.params.iter().enumerate() {
        if i == 0 {
            // The first parameter is the kernel binding; it is recognized
            // syntactically and never occupies a local slot.
            continue;
        }
        let slot = entry.declare(&param.name, false, &param.span)?;
        if i == 1 {
            params_slot = Some(slot);
        }
    }

    entry.lower_entry_statements(&body.body, mode)?;
    let entry_fn = entry.finish("<body>", 0);

    // Nested functions
    let mut funcs = vec![entry_fn];
    for reg in &registry.functions {
        let outer = registry.outer_names(reg);
        let mut lowerer = FnLowerer::new(&registry, outer);
        lowerer.push_scope();
        for param in &reg.decl.params {
            lowerer.declare(&param.name, false, &param.span)?;
        }
        for stmt in &reg.decl.body.statements {
            lowerer.lower_stmt(stmt, true)?;
        }
        funcs.push(lowerer.finish(&reg.decl.name.name, reg.decl.params.len() as u8));
    }

    Ok(UnitProgram { funcs, params_slot })
}

// ============================================================================
// Function registry (hoisting)
// ============================================================================

struct RegisteredFn {
    decl: FunctionDecl,
    /// Index of the enclosing registered function, or None for the body.
    parent: Option<u16>,
    /// Names declared directly inside this function (for capture
    /// diagnostics in its children).
    declared: FxHashSet<String>,
}

struct FunctionRegistry {
    functions: Vec<RegisteredFn>,
    indices: FxHashMap<String, u16>,
    body_declared: FxHashSet<String>,
}

impl FunctionRegistry {
    fn new() -> Self {
        Self {
            functions: Vec::new(),
            indices: FxHashMap::default(),
            body_declared: FxHashSet::default(),
        }
    }

    /// Register the body's function declarations and, transitively, the
    /// declarations at the top level of each registered function.
    fn register_tree(&mut self, body: &TaskBody) -> Result<(), TransformError> {
        self.body_declared = collect_declared_names(&body.body);
        for param in body.params.iter().skip(1) {
            self.body_declared.insert(param.name.clone());
        }

        self.register_block(&body.body, None)?;

        // Worklist over newly registered functions
        let mut next = 0;
        while next < self.functions.len() {
            let decl = self.functions[next].decl.clone();
            self.register_block(&decl.body.statements, Some(next as u16))?;
            next += 1;
        }
        Ok(())
    }

    fn register_block(
        &mut self,
        statements: &[Statement],
        parent: Option<u16>,
    ) -> Result<(), TransformError> {
        for stmt in statements {
            if let Statement::FunctionDecl(decl) = stmt {
                if self.functions.len() >= MAX_FUNCTIONS {
                    return Err(lower_err("too many function declarations", &decl.span));
                }
                if self.indices.contains_key(&decl.name.name) {
                    return Err(lower_err(
                        format!("function `{}` is declared twice", decl.name.name),
                        &decl.name.span,
                    ));
                }
                let mut declared = collect_declared_names(&decl.body.statements);
                for param in &decl.params {
                    declared.insert(param.name.clone());
                }
                // Function indices are offset by one: index 0 is the body.
                let index = self.functions.len() as u16 + 1;
                self.indices.insert(decl.name.name.clone(), index);
                self.functions.push(RegisteredFn {
                    decl: decl.clone(),
                    parent,
                    declared,
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<u16> {
        self.indices.get(name).copied()
    }

    /// Union of names declared in the enclosing functions of `reg`, used to
    /// distinguish "you tried to capture" from "this name does not exist".
    fn outer_names(&self, reg: &RegisteredFn) -> FxHashSet<String> {
        let mut names = self.body_declared.clone();
        let mut parent = reg.parent;
        while let Some(p) = parent {
            let ancestor = &self.functions[p as usize];
            names.extend(ancestor.declared.iter().cloned());
            parent = ancestor.parent;
        }
        names
    }
}

/// Names declared by `let`/`const` in a statement list, without descending
/// into nested function declarations.
fn collect_declared_names(statements: &[Statement]) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    collect_into(statements, &mut names);
    names
}

fn collect_into(statements: &[Statement], names: &mut FxHashSet<String>) {
    for stmt in statements {
        match stmt {
            Statement::VariableDecl(decl) => {
                names.insert(decl.name.name.clone());
            }
            Statement::If(s) => {
                collect_into(std::slice::from_ref(&s.consequent), names);
                if let Some(alt) = &s.alternate {
                    collect_into(std::slice::from_ref(alt), names);
                }
            }
            Statement::While(s) => collect_into(std::slice::from_ref(&s.body), names),
            Statement::DoWhile(s) => collect_into(std::slice::from_ref(&s.body), names),
            Statement::For(s) => {
                if let Some(ForInit::Decl(decl)) = &s.init {
                    names.insert(decl.name.name.clone());
                }
                collect_into(std::slice::from_ref(&s.body), names);
            }
            Statement::Try(s) => {
                if let Some(param) = &s.catch_param {
                    names.insert(param.name.clone());
                }
                collect_into(&s.block.statements, names);
                collect_into(&s.catch_block.statements, names);
            }
            Statement::Block(b) => collect_into(&b.statements, names),
            _ => {}
        }
    }
}

// ============================================================================
// Per-function lowering
// ============================================================================

#[derive(Clone, Copy)]
struct LocalVar {
    slot: u16,
    is_const: bool,
}

struct LoopCtx {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
    handler_depth: usize,
}

struct FnLowerer<'a> {
    registry: &'a FunctionRegistry,
    ops: Vec<Op>,
    scopes: Vec<FxHashMap<String, LocalVar>>,
    next_slot: u16,
    loops: Vec<LoopCtx>,
    handler_depth: usize,
    outer_names: FxHashSet<String>,
}

impl<'a> FnLowerer<'a> {
    fn new(registry: &'a FunctionRegistry, outer_names: FxHashSet<String>) -> Self {
        Self {
            registry,
            ops: Vec::new(),
            scopes: Vec::new(),
            next_slot: 0,
            loops: Vec::new(),
            handler_depth: 0,
            outer_names,
        }
    }

    fn finish(mut self, name: &str, param_count: u8) -> CompiledFn {
        self.ops.push(Op::Const(Value::Null));
        self.ops.push(Op::Return);
        CompiledFn {
            name: name.to_string(),
            param_count,
            local_count: self.next_slot,
            ops: self.ops,
        }
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn here(&self) -> usize {
        self.ops.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.ops[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => *t = target,
            Op::PushHandler { catch_pc } => *catch_pc = target,
            other => unreachable!("patched op is not a jump: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, is_const: bool, span: &Span) -> Result<u16, TransformError> {
        if name == CANONICAL_RECEIVER {
            return Err(lower_err(
                "the kernel binding cannot be redeclared",
                span,
            ));
        }
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if scope.contains_key(name) {
            return Err(lower_err(
                format!("`{}` is already declared in this scope", name),
                span,
            ));
        }
        let slot = self.next_slot;
        self.next_slot = self
            .next_slot
            .checked_add(1)
            .ok_or_else(|| lower_err("too many local variables", span))?;
        scope.insert(name.to_string(), LocalVar { slot, is_const });
        Ok(slot)
    }

    fn resolve(&self, name: &str) -> Option<LocalVar> {
        for scope in self.scopes.iter().rev() {
            if let Some(var) = scope.get(name) {
                return Some(*var);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Lower the body's top-level statements, inserting statement-level
    /// suspension points when the transformer runs in statement mode.
    fn lower_entry_statements(
        &mut self,
        statements: &[Statement],
        mode: TransformMode,
    ) -> Result<(), TransformError> {
        for stmt in statements {
            if mode == TransformMode::DelayOnly {
                self.lower_stmt(stmt, true)?;
                continue;
            }

            // Statement mode: each top-level statement is a suspension point,
            // except function definitions, statements that already are
            // suspension points, and statements that never complete normally.
            match stmt {
                Statement::FunctionDecl(_) => self.lower_stmt(stmt, true)?,
                s if s.is_terminal() => self.lower_stmt(stmt, true)?,
                Statement::Expression(es) if is_suspension_call(&es.expression) => {
                    self.lower_stmt(stmt, true)?;
                }
                Statement::Expression(es) => {
                    self.lower_expr(&es.expression)?;
                    self.emit(Op::Yield(YieldKind::Stmt));
                }
                other => {
                    self.lower_stmt(other, true)?;
                    self.emit(Op::Const(Value::Null));
                    self.emit(Op::Yield(YieldKind::Stmt));
                }
            }
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Statement, top_level: bool) -> Result<(), TransformError> {
        match stmt {
            Statement::VariableDecl(decl) => {
                match &decl.initializer {
                    Some(init) => self.lower_expr(init)?,
                    None => {
                        self.emit(Op::Const(Value::Null));
                    }
                }
                let slot = self.declare(
                    &decl.name.name,
                    decl.kind == VariableKind::Const,
                    &decl.name.span,
                )?;
                self.emit(Op::StoreLocal(slot));
                Ok(())
            }

            Statement::Expression(es) => {
                self.lower_expr(&es.expression)?;
                self.emit(Op::Pop);
                Ok(())
            }

            Statement::If(s) => self.lower_if(s),
            Statement::While(s) => self.lower_while(s),
            Statement::DoWhile(s) => self.lower_do_while(s),
            Statement::For(s) => self.lower_for(s),

            Statement::Break(span) => self.lower_break(span),
            Statement::Continue(span) => self.lower_continue(span),

            Statement::Return(s) => {
                match &s.value {
                    Some(value) => self.lower_expr(value)?,
                    None => {
                        self.emit(Op::Const(Value::Null));
                    }
                }
                self.emit(Op::Return);
                Ok(())
            }

            Statement::Throw(s) => {
                self.lower_expr(&s.value)?;
                self.emit(Op::Throw);
                Ok(())
            }

            Statement::Try(s) => self.lower_try(s),

            Statement::FunctionDecl(decl) => {
                if top_level {
                    // Already registered and compiled separately.
                    Ok(())
                } else {
                    Err(lower_err(
                        "function declarations must be at the top level of the body or of another function",
                        &decl.span,
                    ))
                }
            }

            Statement::Block(block) => {
                self.push_scope();
                for inner in &block.statements {
                    self.lower_stmt(inner, false)?;
                }
                self.pop_scope();
                Ok(())
            }

            Statement::Empty(_) => Ok(()),
        }
    }

    fn lower_if(&mut self, s: &IfStatement) -> Result<(), TransformError> {
        self.lower_expr(&s.condition)?;
        let jf = self.emit(Op::JumpIfFalse(PLACEHOLDER));
        self.lower_stmt(&s.consequent, false)?;

        match &s.alternate {
            Some(alt) => {
                let je = self.emit(Op::Jump(PLACEHOLDER));
                let else_target = self.here();
                self.patch(jf, else_target);
                self.lower_stmt(alt, false)?;
                let end = self.here();
                self.patch(je, end);
            }
            None => {
                let end = self.here();
                self.patch(jf, end);
            }
        }
        Ok(())
    }

    fn lower_while(&mut self, s: &WhileStatement) -> Result<(), TransformError> {
        let start = self.here();
        self.lower_expr(&s.condition)?;
        let jf = self.emit(Op::JumpIfFalse(PLACEHOLDER));

        self.loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            handler_depth: self.handler_depth,
        });
        self.lower_stmt(&s.body, false)?;
        let ctx = self.loops.pop().expect("loop context pushed above");

        self.emit(Op::Jump(start));
        let end = self.here();
        self.patch(jf, end);
        for j in ctx.break_jumps {
            self.patch(j, end);
        }
        for j in ctx.continue_jumps {
            self.patch(j, start);
        }
        Ok(())
    }

    fn lower_do_while(&mut self, s: &DoWhileStatement) -> Result<(), TransformError> {
        let start = self.here();

        self.loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            handler_depth: self.handler_depth,
        });
        self.lower_stmt(&s.body, false)?;
        let ctx = self.loops.pop().expect("loop context pushed above");

        let cond_pos = self.here();
        self.lower_expr(&s.condition)?;
        self.emit(Op::JumpIfTrue(start));
        let end = self.here();

        for j in ctx.break_jumps {
            self.patch(j, end);
        }
        for j in ctx.continue_jumps {
            self.patch(j, cond_pos);
        }
        Ok(())
    }

    fn lower_for(&mut self, s: &ForStatement) -> Result<(), TransformError> {
        self.push_scope();

        match &s.init {
            Some(ForInit::Decl(decl)) => {
                self.lower_stmt(&Statement::VariableDecl(decl.clone()), false)?;
            }
            Some(ForInit::Expr(expr)) => {
                self.lower_expr(expr)?;
                self.emit(Op::Pop);
            }
            None => {}
        }

        let start = self.here();
        let jf = match &s.condition {
            Some(cond) => {
                self.lower_expr(cond)?;
                Some(self.emit(Op::JumpIfFalse(PLACEHOLDER)))
            }
            None => None,
        };

        self.loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            handler_depth: self.handler_depth,
        });
        self.lower_stmt(&s.body, false)?;
        let ctx = self.loops.pop().expect("loop context pushed above");

        let update_pos = self.here();
        if let Some(update) = &s.update {
            self.lower_expr(update)?;
            self.emit(Op::Pop);
        }
        self.emit(Op::Jump(start));

        let end = self.here();
        if let Some(jf) = jf {
            self.patch(jf, end);
        }
        for j in ctx.break_jumps {
            self.patch(j, end);
        }
        for j in ctx.continue_jumps {
            self.patch(j, update_pos);
        }

        self.pop_scope();
        Ok(())
    }

    fn lower_break(&mut self, span: &Span) -> Result<(), TransformError> {
        let Some(ctx) = self.loops.last() else {
            return Err(lower_err("break outside of a loop", span));
        };
        // Leaving a try block through the loop edge discards its handlers.
        let pops = self.handler_depth - ctx.handler_depth;
        for _ in 0..pops {
            self.emit(Op::PopHandler);
        }
        let j = self.emit(Op::Jump(PLACEHOLDER));
        self.loops
            .last_mut()
            .expect("checked above")
            .break_jumps
            .push(j);
        Ok(())
    }

    fn lower_continue(&mut self, span: &Span) -> Result<(), TransformError> {
        let Some(ctx) = self.loops.last() else {
            return Err(lower_err("continue outside of a loop", span));
        };
        let pops = self.handler_depth - ctx.handler_depth;
        for _ in 0..pops {
            self.emit(Op::PopHandler);
        }
        let j = self.emit(Op::Jump(PLACEHOLDER));
        self.loops
            .last_mut()
            .expect("checked above")
            .continue_jumps
            .push(j);
        Ok(())
    }

    fn lower_try(&mut self, s: &TryStatement) -> Result<(), TransformError> {
        let ph = self.emit(Op::PushHandler {
            catch_pc: PLACEHOLDER,
        });
        self.handler_depth += 1;

        self.push_scope();
        for stmt in &s.block.statements {
            self.lower_stmt(stmt, false)?;
        }
        self.pop_scope();

        self.handler_depth -= 1;
        self.emit(Op::PopHandler);
        let je = self.emit(Op::Jump(PLACEHOLDER));

        // Catch: the unwinder leaves the raised value on the stack.
        let catch_pc = self.here();
        self.patch(ph, catch_pc);
        self.push_scope();
        match &s.catch_param {
            Some(param) => {
                let slot = self.declare(&param.name, false, &param.span)?;
                self.emit(Op::StoreLocal(slot));
            }
            None => {
                self.emit(Op::Pop);
            }
        }
        for stmt in &s.catch_block.statements {
            self.lower_stmt(stmt, false)?;
        }
        self.pop_scope();

        let end = self.here();
        self.patch(je, end);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expression) -> Result<(), TransformError> {
        match expr {
            Expression::IntLiteral(lit) => {
                self.emit(Op::Const(Value::Int(lit.value)));
                Ok(())
            }
            Expression::FloatLiteral(lit) => {
                self.emit(Op::Const(Value::Float(lit.value)));
                Ok(())
            }
            Expression::StringLiteral(lit) => {
                self.emit(Op::Const(Value::Str(lit.value.clone())));
                Ok(())
            }
            Expression::BooleanLiteral(lit) => {
                self.emit(Op::Const(Value::Bool(lit.value)));
                Ok(())
            }
            Expression::NullLiteral(_) => {
                self.emit(Op::Const(Value::Null));
                Ok(())
            }

            Expression::Identifier(ident) => self.lower_identifier(ident),

            Expression::Array(array) => {
                if array.elements.len() > u16::MAX as usize {
                    return Err(lower_err("array literal is too large", &array.span));
                }
                for element in &array.elements {
                    self.lower_expr(element)?;
                }
                self.emit(Op::MakeArray(array.elements.len() as u16));
                Ok(())
            }

            Expression::Index(index) => {
                self.lower_expr(&index.object)?;
                self.lower_expr(&index.index)?;
                self.emit(Op::IndexGet);
                Ok(())
            }

            Expression::Member(member) => self.lower_member(member),

            Expression::Call(call) => self.lower_call(call),

            Expression::Assign(assign) => self.lower_assign(assign),

            Expression::Update(update) => self.lower_update(update),

            Expression::Unary(unary) => {
                self.lower_expr(&unary.operand)?;
                self.emit(Op::Unary(unary.op));
                Ok(())
            }

            Expression::Binary(binary) => {
                self.lower_expr(&binary.left)?;
                self.lower_expr(&binary.right)?;
                self.emit(Op::Binary(binary.op));
                Ok(())
            }

            Expression::Logical(logical) => self.lower_logical(logical),

            Expression::Conditional(cond) => {
                self.lower_expr(&cond.condition)?;
                let jf = self.emit(Op::JumpIfFalse(PLACEHOLDER));
                self.lower_expr(&cond.consequent)?;
                let je = self.emit(Op::Jump(PLACEHOLDER));
                let alt_target = self.here();
                self.patch(jf, alt_target);
                self.lower_expr(&cond.alternate)?;
                let end = self.here();
                self.patch(je, end);
                Ok(())
            }
        }
    }

    fn lower_identifier(&mut self, ident: &Ident) -> Result<(), TransformError> {
        if ident.name == CANONICAL_RECEIVER {
            return Err(lower_err(
                "the kernel binding can only be used for method calls",
                &ident.span,
            ));
        }
        if let Some(var) = self.resolve(&ident.name) {
            self.emit(Op::LoadLocal(var.slot));
            return Ok(());
        }
        if self.registry.lookup(&ident.name).is_some() {
            return Err(lower_err(
                format!("function `{}` can only be called, not used as a value", ident.name),
                &ident.span,
            ));
        }
        if is_builtin_name(&ident.name) {
            return Err(lower_err(
                format!("builtin `{}` can only be called, not used as a value", ident.name),
                &ident.span,
            ));
        }
        Err(self.unresolved(&ident.name, &ident.span))
    }

    /// Build the error for a name that did not resolve to a local slot,
    /// distinguishing attempted captures from genuinely unknown names.
    fn unresolved(&self, name: &str, span: &Span) -> TransformError {
        if self.outer_names.contains(name) {
            lower_err(
                format!(
                    "`{}` is declared in an enclosing function; captures are not supported",
                    name
                ),
                span,
            )
        } else {
            lower_err(format!("unknown name `{}`", name), span)
        }
    }

    fn lower_member(&mut self, member: &MemberExpression) -> Result<(), TransformError> {
        if is_receiver(&member.object) {
            return Err(lower_err(
                format!("unknown kernel property `{}`", member.property.name),
                &member.property.span,
            ));
        }
        if member.property.name == "length" {
            self.lower_expr(&member.object)?;
            self.emit(Op::GetLength);
            return Ok(());
        }
        Err(lower_err(
            format!("unknown property `{}`", member.property.name),
            &member.property.span,
        ))
    }

    fn lower_call(&mut self, call: &CallExpression) -> Result<(), TransformError> {
        match &*call.callee {
            Expression::Member(member) if is_receiver(&member.object) => {
                self.lower_kernel_call(&member.property, &call.args, &call.span)
            }

            Expression::Member(member) => {
                if member.property.name != "push" {
                    return Err(lower_err(
                        format!("unknown method `{}`", member.property.name),
                        &member.property.span,
                    ));
                }
                if call.args.len() > u8::MAX as usize {
                    return Err(lower_err("too many arguments", &call.span));
                }
                self.lower_expr(&member.object)?;
                for arg in &call.args {
                    self.lower_expr(arg)?;
                }
                self.emit(Op::CallMethod {
                    method: MethodId::Push,
                    argc: call.args.len() as u8,
                });
                Ok(())
            }

            Expression::Identifier(ident) => {
                if call.args.len() > u8::MAX as usize {
                    return Err(lower_err("too many arguments", &call.span));
                }
                let argc = call.args.len() as u8;

                if self.resolve(&ident.name).is_some() {
                    return Err(lower_err(
                        format!("`{}` is a variable and cannot be called", ident.name),
                        &ident.span,
                    ));
                }
                if let Some(func) = self.registry.lookup(&ident.name) {
                    for arg in &call.args {
                        self.lower_expr(arg)?;
                    }
                    self.emit(Op::Call { func, argc });
                    return Ok(());
                }
                let builtin = match ident.name.as_str() {
                    "print" => Some(BuiltinFn::Print),
                    "delay" => Some(BuiltinFn::Delay),
                    "delayMs" => Some(BuiltinFn::DelayMs),
                    _ => None,
                };
                if let Some(builtin) = builtin {
                    for arg in &call.args {
                        self.lower_expr(arg)?;
                    }
                    self.emit(Op::CallBuiltin { builtin, argc });
                    return Ok(());
                }
                if self.outer_names.contains(&ident.name) {
                    return Err(self.unresolved(&ident.name, &ident.span));
                }
                Err(lower_err(
                    format!("unknown function `{}`", ident.name),
                    &ident.span,
                ))
            }

            other => Err(lower_err(
                "only named functions and methods can be called",
                other.span(),
            )),
        }
    }

    /// Lower a call on the canonical kernel binding. `delay`, `delayMs`, and
    /// `yield` become suspension points; the rest are synchronous queries.
    fn lower_kernel_call(
        &mut self,
        method: &Ident,
        args: &[Expression],
        call_span: &Span,
    ) -> Result<(), TransformError> {
        match method.name.as_str() {
            "delay" | "delayMs" => {
                let kind = if method.name == "delay" {
                    YieldKind::Delay
                } else {
                    YieldKind::DelayMs
                };
                match args {
                    [] => {
                        self.emit(Op::Const(Value::Int(0)));
                    }
                    [arg] => self.lower_expr(arg)?,
                    _ => {
                        return Err(lower_err(
                            format!("{} takes at most one argument", method.name),
                            call_span,
                        ));
                    }
                }
                self.emit(Op::Yield(kind));
                Ok(())
            }
            "yield" => {
                if !args.is_empty() {
                    return Err(lower_err("yield takes no arguments", call_span));
                }
                self.emit(Op::Yield(YieldKind::Now));
                Ok(())
            }
            "getTickCount" => {
                if !args.is_empty() {
                    return Err(lower_err("getTickCount takes no arguments", call_span));
                }
                self.emit(Op::KernelQuery(KernelQuery::TickCount));
                Ok(())
            }
            "getParams" => {
                if !args.is_empty() {
                    return Err(lower_err("getParams takes no arguments", call_span));
                }
                self.emit(Op::KernelQuery(KernelQuery::Params));
                Ok(())
            }
            other => Err(lower_err(
                format!("unknown kernel method `{}`", other),
                &method.span,
            )),
        }
    }

    fn lower_assign(&mut self, assign: &AssignExpression) -> Result<(), TransformError> {
        match &assign.target {
            AssignTarget::Ident(ident) => {
                if ident.name == CANONICAL_RECEIVER {
                    return Err(lower_err(
                        "the kernel binding cannot be reassigned",
                        &ident.span,
                    ));
                }
                let var = self
                    .resolve(&ident.name)
                    .ok_or_else(|| self.unresolved(&ident.name, &ident.span))?;
                if var.is_const {
                    return Err(lower_err(
                        format!("`{}` is a constant and cannot be reassigned", ident.name),
                        &ident.span,
                    ));
                }
                match assign.op {
                    AssignOp::Assign => {
                        self.lower_expr(&assign.value)?;
                    }
                    compound => {
                        self.emit(Op::LoadLocal(var.slot));
                        self.lower_expr(&assign.value)?;
                        self.emit(Op::Binary(compound_binary_op(compound)));
                    }
                }
                // Assignment is an expression; keep the stored value.
                self.emit(Op::Dup);
                self.emit(Op::StoreLocal(var.slot));
                Ok(())
            }
            AssignTarget::Index(index) => {
                self.lower_expr(&index.object)?;
                self.lower_expr(&index.index)?;
                self.lower_expr(&assign.value)?;
                self.emit(Op::IndexSet);
                Ok(())
            }
        }
    }

    fn lower_update(&mut self, update: &UpdateExpression) -> Result<(), TransformError> {
        if update.target.name == CANONICAL_RECEIVER {
            return Err(lower_err(
                "the kernel binding cannot be modified",
                &update.target.span,
            ));
        }
        let var = self
            .resolve(&update.target.name)
            .ok_or_else(|| self.unresolved(&update.target.name, &update.target.span))?;
        if var.is_const {
            return Err(lower_err(
                format!(
                    "`{}` is a constant and cannot be modified",
                    update.target.name
                ),
                &update.target.span,
            ));
        }

        let op = if update.increment {
            BinaryOp::Add
        } else {
            BinaryOp::Sub
        };

        self.emit(Op::LoadLocal(var.slot));
        if update.prefix {
            // ++x: compute, duplicate the new value, store
            self.emit(Op::Const(Value::Int(1)));
            self.emit(Op::Binary(op));
            self.emit(Op::Dup);
            self.emit(Op::StoreLocal(var.slot));
        } else {
            // x++: duplicate the old value, compute, store
            self.emit(Op::Dup);
            self.emit(Op::Const(Value::Int(1)));
            self.emit(Op::Binary(op));
            self.emit(Op::StoreLocal(var.slot));
        }
        Ok(())
    }

    fn lower_logical(&mut self, logical: &LogicalExpression) -> Result<(), TransformError> {
        self.lower_expr(&logical.left)?;
        match logical.op {
            LogicalOp::And => {
                let jf = self.emit(Op::JumpIfFalse(PLACEHOLDER));
                self.lower_expr(&logical.right)?;
                let je = self.emit(Op::Jump(PLACEHOLDER));
                let short = self.here();
                self.patch(jf, short);
                self.emit(Op::Const(Value::Bool(false)));
                let end = self.here();
                self.patch(je, end);
            }
            LogicalOp::Or => {
                let jt = self.emit(Op::JumpIfTrue(PLACEHOLDER));
                self.lower_expr(&logical.right)?;
                let je = self.emit(Op::Jump(PLACEHOLDER));
                let short = self.here();
                self.patch(jt, short);
                self.emit(Op::Const(Value::Bool(true)));
                let end = self.here();
                self.patch(je, end);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Shape helpers
// ============================================================================

fn is_receiver(expr: &Expression) -> bool {
    matches!(expr, Expression::Identifier(ident) if ident.name == CANONICAL_RECEIVER)
}

fn is_builtin_name(name: &str) -> bool {
    matches!(name, "print" | "delay" | "delayMs")
}

/// Is this expression exactly a receiver-qualified suspension call?
pub(crate) fn is_suspension_call(expr: &Expression) -> bool {
    let Expression::Call(call) = expr else {
        return false;
    };
    let Expression::Member(member) = &*call.callee else {
        return false;
    };
    is_receiver(&member.object)
        && matches!(member.property.name.as_str(), "delay" | "delayMs" | "yield")
}

fn compound_binary_op(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div => BinaryOp::Div,
        AssignOp::Rem => BinaryOp::Rem,
        AssignOp::Assign => unreachable!("plain assignment has no binary op"),
    }
}
