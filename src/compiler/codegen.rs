use std::collections::HashMap;

use super::ast::*;
use super::{CompilerLimits, Diagnostic, ENTRY_FUNCTION};
use crate::compiled::{Builtin, FuncId, Function, Instr, SymbolSpace};
use crate::session::SessionId;

/// The compiler ran out of capacity while emitting code
#[derive(Debug)]
pub struct Exhausted(pub String);

struct Signature {
    id: FuncId,
    arity: usize,
    unit: String,
    line: u32,
}

/// Resolves names and emits bytecode for every function of a submission
///
/// Signatures are collected from all units first, so calls may refer to
/// functions defined later or in other units of the same submission.
pub fn generate(
    session: SessionId,
    units: &[ParsedUnit<'_>],
    entry_unit: &str,
    limits: &CompilerLimits,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<SymbolSpace, Exhausted> {
    let mut signatures: HashMap<String, Signature> = HashMap::new();
    let mut ordered = Vec::new();

    for unit in units {
        for item in &unit.items {
            if Builtin::lookup(&item.name).is_some() {
                diagnostics.push(Diagnostic::error(
                    unit.name,
                    item.pos.line,
                    item.pos.column,
                    format!("function '{}' redefines a builtin", item.name),
                ));
                continue;
            }
            if let Some(existing) = signatures.get(&item.name) {
                diagnostics.push(Diagnostic::error(
                    unit.name,
                    item.pos.line,
                    item.pos.column,
                    format!(
                        "function '{}' is already defined in unit '{}' at line {}",
                        item.name, existing.unit, existing.line
                    ),
                ));
                continue;
            }
            let id = FuncId::try_from(ordered.len())
                .map_err(|_| Exhausted("too many functions".to_string()))?;
            signatures.insert(
                item.name.clone(),
                Signature {
                    id,
                    arity: item.params.len(),
                    unit: unit.name.to_string(),
                    line: item.pos.line,
                },
            );
            ordered.push((unit.name, item));
        }
    }

    let defines_main = signatures
        .get(ENTRY_FUNCTION)
        .is_some_and(|s| s.unit == entry_unit);
    if !defines_main {
        diagnostics.push(Diagnostic::error(
            entry_unit,
            1,
            1,
            format!("entry unit '{entry_unit}' does not define 'fn {ENTRY_FUNCTION}'"),
        ));
    }

    let mut strings = StringPool::default();
    let mut functions = Vec::with_capacity(ordered.len());
    for (unit, item) in ordered {
        let builder = FunctionBuilder {
            unit,
            signatures: &signatures,
            strings: &mut strings,
            limits,
            diagnostics: &mut *diagnostics,
            code: Vec::new(),
            lines: Vec::new(),
            scopes: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            loops: Vec::new(),
        };
        functions.push(builder.build(item)?);
    }

    let index = signatures
        .into_iter()
        .map(|(name, sig)| (name, sig.id))
        .collect();
    Ok(SymbolSpace::new(session, functions, index, strings.finish()))
}

#[derive(Default)]
struct StringPool {
    strings: Vec<Box<str>>,
    index: HashMap<String, u32>,
}

impl StringPool {
    fn intern(&mut self, s: &str) -> Result<u32, Exhausted> {
        if let Some(&idx) = self.index.get(s) {
            return Ok(idx);
        }
        let idx = u32::try_from(self.strings.len())
            .map_err(|_| Exhausted("string pool is full".to_string()))?;
        self.strings.push(s.into());
        self.index.insert(s.to_string(), idx);
        Ok(idx)
    }

    fn finish(self) -> Vec<Box<str>> {
        self.strings
    }
}

struct Local {
    name: String,
    slot: u16,
    used: bool,
    pos: Pos,
}

#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct FunctionBuilder<'a> {
    unit: &'a str,
    signatures: &'a HashMap<String, Signature>,
    strings: &'a mut StringPool,
    limits: &'a CompilerLimits,
    diagnostics: &'a mut Vec<Diagnostic>,
    code: Vec<Instr>,
    lines: Vec<u32>,
    scopes: Vec<Vec<Local>>,
    next_slot: usize,
    max_slots: usize,
    loops: Vec<LoopContext>,
}

impl FunctionBuilder<'_> {
    fn build(mut self, item: &FnDecl) -> Result<Function, Exhausted> {
        self.scopes.push(Vec::new());
        for (name, pos) in &item.params {
            let duplicate = self.scopes[0].iter().any(|l| &l.name == name);
            if duplicate {
                self.error(*pos, format!("duplicate parameter '{name}'"));
                continue;
            }
            self.declare(name, *pos)?;
        }
        // Parameters never warn as unused
        for local in &mut self.scopes[0] {
            local.used = true;
        }

        self.block_body(&item.body)?;
        self.emit(Instr::Nil, item.pos)?;
        self.emit(Instr::Return, item.pos)?;
        self.close_scope();

        let arity = u16::try_from(item.params.len())
            .map_err(|_| Exhausted(format!("function '{}' has too many parameters", item.name)))?;
        let locals = u16::try_from(self.max_slots)
            .map_err(|_| Exhausted(format!("function '{}' has too many locals", item.name)))?;

        Ok(Function {
            name: item.name.clone(),
            unit: self.unit.to_string(),
            arity,
            locals,
            code: self.code,
            lines: self.lines,
        })
    }

    fn error(&mut self, pos: Pos, message: String) {
        self.diagnostics
            .push(Diagnostic::error(self.unit, pos.line, pos.column, message));
    }

    fn emit(&mut self, instr: Instr, pos: Pos) -> Result<usize, Exhausted> {
        if self.code.len() >= self.limits.max_function_instructions {
            return Err(Exhausted(format!(
                "function exceeds {} instructions",
                self.limits.max_function_instructions
            )));
        }
        self.code.push(instr);
        self.lines.push(pos.line);
        Ok(self.code.len() - 1)
    }

    fn here(&self) -> Result<u32, Exhausted> {
        u32::try_from(self.code.len()).map_err(|_| Exhausted("jump target overflow".to_string()))
    }

    /// Points the jump at `at` to the current end of the code
    fn patch(&mut self, at: usize) -> Result<(), Exhausted> {
        let target = self.here()?;
        match &mut self.code[at] {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseKeep(t)
            | Instr::JumpIfTrueKeep(t) => *t = target,
            _ => unreachable!("patched instruction is not a jump"),
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, pos: Pos) -> Result<u16, Exhausted> {
        let slot = u16::try_from(self.next_slot)
            .map_err(|_| Exhausted("too many local variables".to_string()))?;
        self.next_slot += 1;
        self.max_slots = self.max_slots.max(self.next_slot);
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(Local {
                name: name.to_string(),
                slot,
                used: false,
                pos,
            });
        }
        Ok(slot)
    }

    fn resolve(&mut self, name: &str) -> Option<u16> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(local) = scope.iter_mut().rev().find(|l| l.name == name) {
                local.used = true;
                return Some(local.slot);
            }
        }
        None
    }

    fn open_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn close_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        self.next_slot -= scope.len();
        for local in scope {
            if !local.used && !local.name.is_empty() && !local.name.starts_with('_') {
                self.diagnostics.push(Diagnostic::warning(
                    self.unit,
                    local.pos.line,
                    local.pos.column,
                    format!("unused variable '{}'", local.name),
                ));
            }
        }
    }

    fn block(&mut self, block: &Block) -> Result<bool, Exhausted> {
        self.open_scope();
        let diverges = self.block_body(block)?;
        self.close_scope();
        Ok(diverges)
    }

    /// Emits the statements of a block; returns whether control never falls through
    fn block_body(&mut self, block: &Block) -> Result<bool, Exhausted> {
        let mut diverges = false;
        let mut warned = false;
        for stmt in &block.stmts {
            if diverges && !warned {
                self.diagnostics.push(Diagnostic::warning(
                    self.unit,
                    stmt.pos.line,
                    stmt.pos.column,
                    "unreachable statement",
                ));
                warned = true;
            }
            diverges |= self.statement(stmt)?;
        }
        Ok(diverges)
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<bool, Exhausted> {
        let pos = stmt.pos;
        match &stmt.kind {
            StmtKind::Let { name, init } => {
                if self
                    .scopes
                    .last()
                    .is_some_and(|s| s.iter().any(|l| &l.name == name))
                {
                    self.error(
                        pos,
                        format!("variable '{name}' is already defined in this scope"),
                    );
                }
                self.expression(init)?;
                let slot = self.declare(name, pos)?;
                self.emit(Instr::Store(slot), pos)?;
            }
            StmtKind::Assign { target, value } => match &target.kind {
                ExprKind::Var(name) => {
                    self.expression(value)?;
                    match self.resolve_for_write(name) {
                        Some(slot) => {
                            self.emit(Instr::Store(slot), pos)?;
                        }
                        None => self.error(target.pos, format!("undefined variable '{name}'")),
                    }
                }
                ExprKind::Index { target, index } => {
                    self.expression(target)?;
                    self.expression(index)?;
                    self.expression(value)?;
                    self.emit(Instr::StoreIndex, pos)?;
                }
                _ => self.error(target.pos, "invalid assignment target".to_string()),
            },
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                self.expression(cond)?;
                let to_else = self.emit(Instr::JumpIfFalse(0), pos)?;
                let then_diverges = self.block(then)?;
                let Some(otherwise) = otherwise else {
                    self.patch(to_else)?;
                    return Ok(false);
                };
                let to_end = self.emit(Instr::Jump(0), pos)?;
                self.patch(to_else)?;
                let else_diverges = self.block(otherwise)?;
                self.patch(to_end)?;
                return Ok(then_diverges && else_diverges);
            }
            StmtKind::While { cond, body } => {
                let start = self.here()?;
                self.expression(cond)?;
                let exit = self.emit(Instr::JumpIfFalse(0), pos)?;
                self.loop_body(body, start)?;
                self.emit(Instr::Jump(start), pos)?;
                self.patch(exit)?;
                self.finish_loop()?;
            }
            StmtKind::For {
                var,
                start,
                end,
                body,
            } => {
                self.open_scope();
                self.expression(start)?;
                let counter = self.declare(var, pos)?;
                self.emit(Instr::Store(counter), pos)?;
                self.expression(end)?;
                // Hidden slot holding the evaluated bound
                let bound = self.declare("", pos)?;
                self.emit(Instr::Store(bound), pos)?;

                let check = self.here()?;
                self.emit(Instr::Load(counter), pos)?;
                self.emit(Instr::Load(bound), pos)?;
                self.emit(Instr::Lt, pos)?;
                let exit = self.emit(Instr::JumpIfFalse(0), pos)?;

                self.loops.push(LoopContext::default());
                self.block(body)?;
                let step = self.here()?;
                self.patch_continues(step)?;
                self.emit(Instr::Load(counter), pos)?;
                self.emit(Instr::Int(1), pos)?;
                self.emit(Instr::Add, pos)?;
                self.emit(Instr::Store(counter), pos)?;
                self.emit(Instr::Jump(check), pos)?;
                self.patch(exit)?;
                self.finish_loop()?;
                self.close_scope();
            }
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.expression(expr)?,
                    None => {
                        self.emit(Instr::Nil, pos)?;
                    }
                }
                self.emit(Instr::Return, pos)?;
                return Ok(true);
            }
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                if self.loops.is_empty() {
                    let keyword = if is_break { "break" } else { "continue" };
                    self.error(pos, format!("'{keyword}' outside of a loop"));
                    return Ok(false);
                }
                let jump = self.emit(Instr::Jump(0), pos)?;
                if let Some(ctx) = self.loops.last_mut() {
                    if is_break {
                        ctx.breaks.push(jump);
                    } else {
                        ctx.continues.push(jump);
                    }
                }
                return Ok(true);
            }
            StmtKind::Block(block) => return self.block(block),
            StmtKind::Expr(expr) => {
                self.expression(expr)?;
                self.emit(Instr::Pop, pos)?;
            }
        }
        Ok(false)
    }

    /// Like [`Self::resolve`] but does not count as a read
    fn resolve_for_write(&mut self, name: &str) -> Option<u16> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().rev().find(|l| l.name == name))
            .map(|l| l.slot)
    }

    fn loop_body(&mut self, body: &Block, continue_target: u32) -> Result<(), Exhausted> {
        self.loops.push(LoopContext::default());
        self.block(body)?;
        self.patch_continues(continue_target)
    }

    fn patch_continues(&mut self, target: u32) -> Result<(), Exhausted> {
        let continues = self
            .loops
            .last_mut()
            .map(|ctx| std::mem::take(&mut ctx.continues))
            .unwrap_or_default();
        for at in continues {
            if let Instr::Jump(t) = &mut self.code[at] {
                *t = target;
            }
        }
        Ok(())
    }

    /// Pops the innermost loop and points its breaks past the loop
    fn finish_loop(&mut self) -> Result<(), Exhausted> {
        if let Some(ctx) = self.loops.pop() {
            for at in ctx.breaks {
                self.patch(at)?;
            }
        }
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> Result<(), Exhausted> {
        let pos = expr.pos;
        match &expr.kind {
            ExprKind::Int(v) => {
                self.emit(Instr::Int(*v), pos)?;
            }
            ExprKind::Str(s) => {
                let idx = self.strings.intern(s)?;
                self.emit(Instr::Str(idx), pos)?;
            }
            ExprKind::Bool(true) => {
                self.emit(Instr::True, pos)?;
            }
            ExprKind::Bool(false) => {
                self.emit(Instr::False, pos)?;
            }
            ExprKind::Nil => {
                self.emit(Instr::Nil, pos)?;
            }
            ExprKind::Var(name) => match self.resolve(name) {
                Some(slot) => {
                    self.emit(Instr::Load(slot), pos)?;
                }
                None => {
                    self.error(pos, format!("undefined variable '{name}'"));
                    self.emit(Instr::Nil, pos)?;
                }
            },
            ExprKind::Array(items) => {
                for item in items {
                    self.expression(item)?;
                }
                let count = u32::try_from(items.len())
                    .map_err(|_| Exhausted("array literal is too large".to_string()))?;
                self.emit(Instr::MakeArray(count), pos)?;
            }
            ExprKind::Index { target, index } => {
                self.expression(target)?;
                self.expression(index)?;
                self.emit(Instr::Index, pos)?;
            }
            ExprKind::Call { name, args } => self.call(name, args, pos)?,
            ExprKind::Unary { op, operand } => {
                if let (UnaryOp::Neg, ExprKind::Int(v)) = (op, &operand.kind) {
                    self.emit(Instr::Int(-v), pos)?;
                    return Ok(());
                }
                self.expression(operand)?;
                let instr = match op {
                    UnaryOp::Neg => Instr::Neg,
                    UnaryOp::Not => Instr::Not,
                };
                self.emit(instr, pos)?;
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    self.expression(lhs)?;
                    let jump = if *op == BinaryOp::And {
                        Instr::JumpIfFalseKeep(0)
                    } else {
                        Instr::JumpIfTrueKeep(0)
                    };
                    let short = self.emit(jump, pos)?;
                    self.expression(rhs)?;
                    self.emit(Instr::ExpectBool, pos)?;
                    self.patch(short)?;
                }
                _ => {
                    self.expression(lhs)?;
                    self.expression(rhs)?;
                    let instr = match op {
                        BinaryOp::Add => Instr::Add,
                        BinaryOp::Sub => Instr::Sub,
                        BinaryOp::Mul => Instr::Mul,
                        BinaryOp::Div => Instr::Div,
                        BinaryOp::Rem => Instr::Rem,
                        BinaryOp::Eq => Instr::Eq,
                        BinaryOp::Ne => Instr::Ne,
                        BinaryOp::Lt => Instr::Lt,
                        BinaryOp::Le => Instr::Le,
                        BinaryOp::Gt => Instr::Gt,
                        BinaryOp::Ge => Instr::Ge,
                        BinaryOp::And | BinaryOp::Or => unreachable!(),
                    };
                    self.emit(instr, pos)?;
                }
            },
        }
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[Expr], pos: Pos) -> Result<(), Exhausted> {
        for arg in args {
            self.expression(arg)?;
        }
        let Ok(argc) = u8::try_from(args.len()) else {
            self.error(pos, format!("call to '{name}' has too many arguments"));
            return Ok(());
        };

        if let Some(builtin) = Builtin::lookup(name) {
            let (min, max) = builtin.arity();
            if args.len() < min || args.len() > max {
                let expected = if min == max {
                    min.to_string()
                } else {
                    format!("{min} to {max}")
                };
                self.error(
                    pos,
                    format!(
                        "builtin '{name}' expects {expected} argument(s), found {}",
                        args.len()
                    ),
                );
            }
            self.emit(Instr::CallBuiltin { builtin, argc }, pos)?;
            return Ok(());
        }

        match self.signatures.get(name) {
            Some(sig) if sig.arity == args.len() => {
                self.emit(Instr::Call { func: sig.id, argc }, pos)?;
            }
            Some(sig) => {
                let expected = sig.arity;
                self.error(
                    pos,
                    format!(
                        "function '{name}' expects {expected} argument(s), found {}",
                        args.len()
                    ),
                );
            }
            None => self.error(pos, format!("undefined function '{name}'")),
        }
        Ok(())
    }
}
