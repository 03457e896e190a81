//! Front-end compiler: typed AST in, IR chunks and a resolved global
//! symbol table out. One pass per item; expression types are synthesized
//! bottom-up and implicit numeric widening casts are inserted where the
//! wider operand wins. Errors accumulate and compilation keeps going, so a
//! single run reports everything it can find.

use crate::ast::{BinaryOp, Expr, Function, Item, LogicalOp, Prim, Program, Stmt, Type, UnaryOp};
use crate::bytecode::Data;
use crate::codegen::GlobalDef;
use crate::ir::{BitOp, Instruction, IrChunk, JumpMode, TypeTag};
use crate::natives::NativeDef;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },
    #[error("undefined function: {name}")]
    UndefinedFunction { name: String },
    #[error("duplicate definition of '{name}'")]
    Duplicate { name: String },
    #[error("'{name}' expects {expected} argument(s), got {got}")]
    ArgCount { name: String, expected: usize, got: usize },
    #[error("function '{name}' must return a value on every path")]
    MissingReturn { name: String },
    #[error("return outside a function")]
    ReturnOutsideFunction,
    #[error("{0}")]
    Type(String),
}

/// Everything the lowering pass needs: one IR chunk per function (indexed
/// by `Data::Func`), the entry chunk of top-level code, and the resolved
/// global symbol table with initial values.
pub struct CompiledUnit {
    pub functions: Vec<IrChunk>,
    pub func_names: Vec<String>,
    pub entry: IrChunk,
    pub globals: Vec<GlobalDef>,
}

pub fn compile(program: &Program, natives: &[NativeDef]) -> (CompiledUnit, Vec<CompileError>) {
    Compiler::new(natives).compile(program)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Val {
    ty: Type,
    width: usize,
}

impl Val {
    fn prim(p: Prim) -> Val {
        Val { ty: Type::Prim(p), width: if p == Prim::Void { 0 } else { 1 } }
    }
}

#[derive(Debug, Clone)]
struct FuncSig {
    name: String,
    params: Vec<Type>,
    ret: Prim,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GlobalKind {
    Var,
    Func(u16),
    Native(u16),
}

#[derive(Debug, Clone)]
struct GlobalSym {
    name: String,
    ty: Type,
    slot: usize,
    init: Vec<Data>,
    kind: GlobalKind,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    ty: Type,
    slot: usize,
    depth: usize,
}

struct Compiler<'a> {
    natives: &'a [NativeDef],
    functions: Vec<FuncSig>,
    globals: Vec<GlobalSym>,
    next_global_slot: usize,
    locals: Vec<Local>,
    local_slots: usize,
    scope_depth: usize,
    current: IrChunk,
    current_ret: Option<Prim>,
    func_chunks: Vec<IrChunk>,
    errors: Vec<CompileError>,
}

fn tag(p: Prim) -> TypeTag {
    match p {
        Prim::Int => TypeTag::Integer,
        Prim::Float => TypeTag::Float,
        Prim::Double => TypeTag::Double,
        Prim::Bool => TypeTag::Bool,
        Prim::Char => TypeTag::Char,
        Prim::Void => TypeTag::Integer,
    }
}

fn prim_of_tag(t: TypeTag) -> Prim {
    match t {
        TypeTag::Integer => Prim::Int,
        TypeTag::Float => Prim::Float,
        TypeTag::Double => Prim::Double,
        TypeTag::Bool => Prim::Bool,
        TypeTag::Char => Prim::Char,
    }
}

/// Widening rank over the numeric primitives.
fn numeric_rank(p: Prim) -> Option<u8> {
    match p {
        Prim::Int => Some(0),
        Prim::Float => Some(1),
        Prim::Double => Some(2),
        _ => None,
    }
}

/// Rank including char/bool, which promote to int in arithmetic and
/// comparisons (the instruction set has no variants for them).
fn promoted_rank(p: Prim) -> Option<u8> {
    match p {
        Prim::Char | Prim::Bool => Some(0),
        _ => numeric_rank(p),
    }
}

fn default_data(p: Prim) -> Data {
    match p {
        Prim::Int => Data::Int(0),
        Prim::Float => Data::Float(0.0),
        Prim::Double => Data::Double(0.0),
        Prim::Bool => Data::Bool(false),
        Prim::Char => Data::Char('\0'),
        Prim::Void => Data::Int(0),
    }
}

impl<'a> Compiler<'a> {
    fn new(natives: &'a [NativeDef]) -> Self {
        let mut compiler = Compiler {
            natives,
            functions: Vec::new(),
            globals: Vec::new(),
            next_global_slot: 0,
            locals: Vec::new(),
            local_slots: 0,
            scope_depth: 0,
            current: IrChunk::new(),
            current_ret: None,
            func_chunks: Vec::new(),
            errors: Vec::new(),
        };
        for (i, native) in natives.iter().enumerate() {
            let slot = compiler.next_global_slot;
            compiler.next_global_slot += 1;
            compiler.globals.push(GlobalSym {
                name: native.name.to_string(),
                ty: Type::Prim(Prim::Int),
                slot,
                init: vec![Data::Native(i as u16)],
                kind: GlobalKind::Native(i as u16),
            });
        }
        compiler
    }

    fn compile(mut self, program: &Program) -> (CompiledUnit, Vec<CompileError>) {
        // Functions are callable before their declaration; collect every
        // signature (and give each a global slot holding its reference)
        // before compiling any body.
        for item in &program.items {
            if let Item::Function(f) = item {
                if self.lookup_global(&f.name).is_some()
                    || self.functions.iter().any(|s| s.name == f.name)
                {
                    self.errors.push(CompileError::Duplicate { name: f.name.clone() });
                    continue;
                }
                let index = self.functions.len() as u16;
                self.functions.push(FuncSig {
                    name: f.name.clone(),
                    params: f.params.iter().map(|(_, t)| *t).collect(),
                    ret: f.ret,
                });
                let slot = self.next_global_slot;
                self.next_global_slot += 1;
                self.globals.push(GlobalSym {
                    name: f.name.clone(),
                    ty: Type::Prim(Prim::Int),
                    slot,
                    init: vec![Data::Func(index)],
                    kind: GlobalKind::Func(index),
                });
            }
        }

        for item in &program.items {
            match item {
                Item::Function(f) => {
                    // A duplicate was reported in the pre-scan and owns no
                    // chunk slot; skip its body.
                    let registered = self
                        .functions
                        .get(self.func_chunks.len())
                        .is_some_and(|s| s.name == f.name);
                    if registered {
                        let chunk = self.compile_function(f);
                        self.func_chunks.push(chunk);
                    }
                }
                Item::Global { ty, name, init } => self.global_declaration(*ty, name, init),
                Item::Stmt(stmt) => self.stmt(stmt),
            }
        }

        let globals = self
            .globals
            .iter()
            .map(|g| GlobalDef {
                name: g.name.clone(),
                slot: g.slot,
                size: g.init.len(),
                init: g.init.clone(),
            })
            .collect();

        (
            CompiledUnit {
                functions: self.func_chunks,
                func_names: self.functions.into_iter().map(|s| s.name).collect(),
                entry: self.current,
                globals,
            },
            self.errors,
        )
    }

    // ---- Symbols ----

    fn lookup_global(&self, name: &str) -> Option<&GlobalSym> {
        self.globals.iter().find(|g| g.name == name)
    }

    fn resolve_local(&self, name: &str) -> Option<&Local> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    fn error(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    /// Reports and pushes a placeholder value so the stack model stays
    /// balanced and compilation can keep finding errors.
    fn error_val(&mut self, err: CompileError) -> Val {
        self.error(err);
        let id = self.current.add_constant(Data::Int(0));
        self.current.write(Instruction::Const { id });
        Val::prim(Prim::Int)
    }

    // ---- Declarations ----

    fn global_declaration(&mut self, ty: Type, name: &str, init: &Option<Expr>) {
        if self.lookup_global(name).is_some() {
            self.error(CompileError::Duplicate { name: name.to_string() });
            return;
        }

        let size = ty.size();
        let elem = match ty {
            Type::Prim(p) => p,
            Type::Array { elem, .. } => elem,
        };
        let slot = self.next_global_slot;
        self.next_global_slot += size;
        self.globals.push(GlobalSym {
            name: name.to_string(),
            ty,
            slot,
            init: vec![default_data(elem); size],
            kind: GlobalKind::Var,
        });

        let Some(init) = init else { return };

        if matches!(ty, Type::Array { .. }) {
            self.error(CompileError::Type(format!("array '{name}' cannot have an initializer")));
            return;
        }
        let target = elem;

        // A literal initializer folds straight into the globals snapshot;
        // anything else computes in the entry chunk before the first
        // statement that could observe it.
        if let Some(folded) = fold_literal(init, target) {
            let sym = self.globals.last_mut().expect("global was just pushed");
            sym.init = vec![folded];
            return;
        }

        self.expr_as(init, target);
        self.current.write(Instruction::SetGlobal {
            name: name.to_string(),
            size: 1,
            offset: false,
        });
        self.current.write(Instruction::Pop { widths: vec![1] });
    }

    fn compile_function(&mut self, f: &Function) -> IrChunk {
        let outer_chunk = std::mem::replace(&mut self.current, IrChunk::new());
        let outer_locals = std::mem::take(&mut self.locals);
        let outer_slots = self.local_slots;
        let outer_depth = self.scope_depth;
        let outer_ret = self.current_ret;

        self.local_slots = 0;
        self.scope_depth = 1;
        self.current_ret = Some(f.ret);

        for (name, ty) in &f.params {
            let slot = self.local_slots;
            self.local_slots += ty.size();
            self.locals.push(Local { name: name.clone(), ty: *ty, slot, depth: 1 });
        }

        for stmt in &f.body {
            self.stmt(stmt);
        }

        // A body that can fall off the end still needs a RETURN; for a
        // non-void function that path is a type error.
        let last_is_return = matches!(self.current.code().last(), Some(Instruction::Return { .. }));
        if !last_is_return {
            if f.ret != Prim::Void {
                self.error(CompileError::MissingReturn { name: f.name.clone() });
            }
            self.current.write(Instruction::Return { size: 0 });
        }

        self.locals = outer_locals;
        self.local_slots = outer_slots;
        self.scope_depth = outer_depth;
        self.current_ret = outer_ret;
        std::mem::replace(&mut self.current, outer_chunk)
    }

    // ---- Statements ----

    fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope_depth -= 1;
        let mut dropped = Vec::new();
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            dropped.push(local.ty.size());
            self.local_slots -= local.ty.size();
            self.locals.pop();
        }
        if !dropped.is_empty() {
            self.current.write(Instruction::Pop { widths: dropped });
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                let val = self.expr(expr);
                self.current.write(Instruction::Pop { widths: vec![val.width] });
            }
            Stmt::VarDecl { ty, name, init } => self.local_declaration(*ty, name, init),
            Stmt::Block(stmts) => {
                self.begin_scope();
                for s in stmts {
                    self.stmt(s);
                }
                self.end_scope();
            }
            Stmt::If { cond, then, els } => {
                self.condition(cond);
                match els {
                    None => {
                        let end = self.current.new_label();
                        self.current.write(Instruction::Jump { label: end, mode: JumpMode::IfFalsePop });
                        self.stmt(then);
                        self.current.write(Instruction::Label(end));
                    }
                    Some(els) => {
                        let else_l = self.current.new_label();
                        let end = self.current.new_label();
                        self.current.write(Instruction::Jump { label: else_l, mode: JumpMode::IfFalsePop });
                        self.stmt(then);
                        self.current.write(Instruction::Jump { label: end, mode: JumpMode::Always });
                        self.current.write(Instruction::Label(else_l));
                        self.stmt(els);
                        self.current.write(Instruction::Label(end));
                    }
                }
            }
            Stmt::While { cond, body } => {
                let top = self.current.new_label();
                let done = self.current.new_label();
                self.current.write(Instruction::Label(top));
                self.condition(cond);
                self.current.write(Instruction::Jump { label: done, mode: JumpMode::IfFalsePop });
                self.stmt(body);
                self.current.write(Instruction::Jump { label: top, mode: JumpMode::Always });
                self.current.write(Instruction::Label(done));
            }
            Stmt::For { init, cond, step, body } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.stmt(init);
                }
                let top = self.current.new_label();
                let done = self.current.new_label();
                self.current.write(Instruction::Label(top));
                if let Some(cond) = cond {
                    self.condition(cond);
                    self.current.write(Instruction::Jump { label: done, mode: JumpMode::IfFalsePop });
                }
                self.stmt(body);
                if let Some(step) = step {
                    let val = self.expr(step);
                    self.current.write(Instruction::Pop { widths: vec![val.width] });
                }
                self.current.write(Instruction::Jump { label: top, mode: JumpMode::Always });
                self.current.write(Instruction::Label(done));
                self.end_scope();
            }
            Stmt::Return(value) => {
                let Some(ret) = self.current_ret else {
                    self.error(CompileError::ReturnOutsideFunction);
                    return;
                };
                match value {
                    None => {
                        if ret != Prim::Void {
                            self.error(CompileError::Type(format!(
                                "return without a value in a function returning {ret}"
                            )));
                        }
                        self.current.write(Instruction::Return { size: 0 });
                    }
                    Some(expr) => {
                        if ret == Prim::Void {
                            self.error(CompileError::Type(
                                "cannot return a value from a void function".into(),
                            ));
                        }
                        self.expr_as(expr, ret);
                        self.current.write(Instruction::Return { size: 1 });
                    }
                }
            }
            Stmt::Error => {}
        }
    }

    fn local_declaration(&mut self, ty: Type, name: &str, init: &Option<Expr>) {
        let elem = match ty {
            Type::Prim(p) => p,
            Type::Array { elem, .. } => elem,
        };
        match init {
            Some(_) if matches!(ty, Type::Array { .. }) => {
                self.error(CompileError::Type(format!("array '{name}' cannot have an initializer")));
                // Keep the slot layout stable regardless.
                self.current.write(Instruction::Push { widths: vec![ty.size()] });
            }
            // The initializer's value becomes the local's slot: declaration
            // always happens with the stack at the next free slot.
            Some(init) => {
                self.expr_as(init, elem);
            }
            None => {
                self.current.write(Instruction::Push { widths: vec![ty.size()] });
            }
        }
        let slot = self.local_slots;
        self.local_slots += ty.size();
        self.locals.push(Local {
            name: name.to_string(),
            ty,
            slot,
            depth: self.scope_depth,
        });
    }

    /// Compiles a branch condition, which must be a bool.
    fn condition(&mut self, cond: &Expr) {
        let val = self.expr(cond);
        if val.ty != Type::Prim(Prim::Bool) {
            self.error(CompileError::Type(format!(
                "condition must be a bool, found {}",
                val.ty
            )));
        }
    }

    // ---- Expressions ----

    /// Best-effort type synthesis without emitting anything. Used to pick
    /// unified operand types before either side is compiled; resolution
    /// errors are reported by the emitting pass, not here.
    fn infer(&self, expr: &Expr) -> Type {
        match expr {
            Expr::IntLit(_) => Type::Prim(Prim::Int),
            Expr::FloatLit(_) => Type::Prim(Prim::Float),
            Expr::DoubleLit(_) => Type::Prim(Prim::Double),
            Expr::BoolLit(_) => Type::Prim(Prim::Bool),
            Expr::CharLit(_) => Type::Prim(Prim::Char),
            Expr::Variable(name) => self
                .resolve_local(name)
                .map(|l| l.ty)
                .or_else(|| {
                    self.lookup_global(name)
                        .filter(|g| g.kind == GlobalKind::Var)
                        .map(|g| g.ty)
                })
                .unwrap_or(Type::Prim(Prim::Int)),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => Type::Prim(Prim::Bool),
                UnaryOp::BitNot => Type::Prim(Prim::Int),
                _ => self.infer(expr),
            },
            Expr::Binary { op, left, right } => match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    let l = self.infer(left);
                    let r = self.infer(right);
                    match (l, r) {
                        (Type::Prim(a), Type::Prim(b)) => {
                            match (numeric_rank(a), numeric_rank(b)) {
                                (Some(ra), Some(rb)) => {
                                    Type::Prim(if ra >= rb { a } else { b })
                                }
                                _ => Type::Prim(Prim::Int),
                            }
                        }
                        _ => Type::Prim(Prim::Int),
                    }
                }
                BinaryOp::Mod
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::Shl
                | BinaryOp::Shr => Type::Prim(Prim::Int),
                _ => Type::Prim(Prim::Bool),
            },
            Expr::Logical { .. } => Type::Prim(Prim::Bool),
            Expr::Assign { target, .. } => self.infer(target),
            Expr::Cast { to, .. } => Type::Prim(*to),
            Expr::Call { callee, .. } => {
                if let Some(sig) = self.functions.iter().find(|s| &s.name == callee) {
                    Type::Prim(sig.ret)
                } else if let Some(native) = self.natives.iter().find(|n| n.name == callee) {
                    Type::Prim(native.ret.map(prim_of_tag).unwrap_or(Prim::Void))
                } else {
                    Type::Prim(Prim::Int)
                }
            }
            Expr::Index { base, .. } => match self.infer(base) {
                Type::Array { elem, .. } => Type::Prim(elem),
                other => other,
            },
        }
    }

    /// Compiles `expr` and converts the result to `target`, inserting a
    /// widening cast when the types differ. Narrowing must be written
    /// explicitly.
    fn expr_as(&mut self, expr: &Expr, target: Prim) -> Val {
        let val = self.expr(expr);
        let Type::Prim(from) = val.ty else {
            self.error(CompileError::Type(format!(
                "expected a {target} value, found {}",
                val.ty
            )));
            return val;
        };
        if from == target {
            return val;
        }
        // char and bool promote to int; numeric widening follows rank.
        if target == Prim::Int && matches!(from, Prim::Char | Prim::Bool) {
            self.current.write(Instruction::Cast { from: tag(from), to: tag(target) });
            return Val::prim(target);
        }
        match (numeric_rank(from), numeric_rank(target)) {
            (Some(rf), Some(rt)) if rt > rf => {
                self.current.write(Instruction::Cast { from: tag(from), to: tag(target) });
                Val::prim(target)
            }
            (Some(_), Some(_)) => {
                self.error(CompileError::Type(format!(
                    "cannot implicitly narrow {from} to {target}; write an explicit cast"
                )));
                Val::prim(target)
            }
            _ => {
                self.error(CompileError::Type(format!(
                    "expected a {target} value, found {from}"
                )));
                Val::prim(target)
            }
        }
    }

    fn literal(&mut self, value: Data, p: Prim) -> Val {
        let id = self.current.add_constant(value);
        self.current.write(Instruction::Const { id });
        Val::prim(p)
    }

    fn expr(&mut self, expr: &Expr) -> Val {
        match expr {
            Expr::IntLit(v) => self.literal(Data::Int(*v), Prim::Int),
            Expr::FloatLit(v) => self.literal(Data::Float(*v), Prim::Float),
            Expr::DoubleLit(v) => self.literal(Data::Double(*v), Prim::Double),
            Expr::BoolLit(v) => self.literal(Data::Bool(*v), Prim::Bool),
            Expr::CharLit(v) => self.literal(Data::Char(*v), Prim::Char),

            Expr::Variable(name) => self.variable_get(name),

            Expr::Unary { op, expr } => self.unary(*op, expr),
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Logical { op, left, right } => self.logical(*op, left, right),
            Expr::Assign { target, value } => self.assign(target, value),

            Expr::Cast { to, expr } => {
                let val = self.expr(expr);
                let Type::Prim(from) = val.ty else {
                    return self.error_val(CompileError::Type(format!(
                        "cannot cast {} to {to}",
                        val.ty
                    )));
                };
                if from == Prim::Void || *to == Prim::Void {
                    return self.error_val(CompileError::Type("cannot cast to or from void".into()));
                }
                if from != *to {
                    self.current.write(Instruction::Cast { from: tag(from), to: tag(*to) });
                }
                Val::prim(*to)
            }

            Expr::Call { callee, args } => self.call(callee, args),

            Expr::Index { base, index } => {
                let Expr::Variable(name) = base.as_ref() else {
                    return self.error_val(CompileError::Type(
                        "only named arrays can be indexed".into(),
                    ));
                };
                let Some((elem, inst)) = self.indexed_access(name, false) else {
                    return self.error_val(CompileError::Type(format!(
                        "'{name}' is not an array"
                    )));
                };
                self.expr_as(index, Prim::Int);
                self.current.write(inst);
                Val::prim(elem)
            }
        }
    }

    fn variable_get(&mut self, name: &str) -> Val {
        if let Some(local) = self.resolve_local(name) {
            let (ty, slot, size) = (local.ty, local.slot, local.ty.size());
            self.current.write(Instruction::GetLocal { slot, size, offset: false });
            return Val { ty, width: size };
        }
        if let Some(global) = self.lookup_global(name) {
            let (kind, ty) = (global.kind, global.ty);
            if kind != GlobalKind::Var {
                return self.error_val(CompileError::Type(format!(
                    "'{name}' is a function, not a value"
                )));
            }
            let size = ty.size();
            self.current.write(Instruction::GetGlobal {
                name: name.to_string(),
                size,
                offset: false,
            });
            return Val { ty, width: size };
        }
        self.error_val(CompileError::UndefinedVariable { name: name.to_string() })
    }

    /// Element load/store instruction for the named array, if it is one.
    fn indexed_access(&self, name: &str, store: bool) -> Option<(Prim, Instruction)> {
        if let Some(local) = self.resolve_local(name) {
            let Type::Array { elem, .. } = local.ty else { return None };
            let slot = local.slot;
            let inst = if store {
                Instruction::SetLocal { slot, size: 1, offset: true }
            } else {
                Instruction::GetLocal { slot, size: 1, offset: true }
            };
            return Some((elem, inst));
        }
        let global = self.lookup_global(name)?;
        let Type::Array { elem, .. } = global.ty else { return None };
        let inst = if store {
            Instruction::SetGlobal { name: name.to_string(), size: 1, offset: true }
        } else {
            Instruction::GetGlobal { name: name.to_string(), size: 1, offset: true }
        };
        Some((elem, inst))
    }

    fn unary(&mut self, op: UnaryOp, inner: &Expr) -> Val {
        match op {
            UnaryOp::Neg | UnaryOp::Plus => {
                let val = self.expr(inner);
                let Type::Prim(p) = val.ty else {
                    return self.error_val(CompileError::Type(format!("cannot negate {}", val.ty)));
                };
                if numeric_rank(p).is_none() {
                    return self.error_val(CompileError::Type(format!("cannot negate {p}")));
                }
                if op == UnaryOp::Neg {
                    self.current.write(Instruction::Neg { ty: tag(p) });
                }
                val
            }
            UnaryOp::Not => {
                let val = self.expr(inner);
                if val.ty != Type::Prim(Prim::Bool) {
                    self.error(CompileError::Type(format!("'!' needs a bool, found {}", val.ty)));
                }
                self.current.write(Instruction::Not);
                Val::prim(Prim::Bool)
            }
            UnaryOp::BitNot => {
                let val = self.expr(inner);
                if val.ty != Type::Prim(Prim::Int) {
                    self.error(CompileError::Type(format!("'~' needs an int, found {}", val.ty)));
                }
                self.current.write(Instruction::Bit { op: BitOp::Not });
                Val::prim(Prim::Int)
            }
            UnaryOp::PreInc | UnaryOp::PreDec => {
                let Expr::Variable(name) = inner else {
                    return self.error_val(CompileError::Type(
                        "'++'/'--' need a variable".into(),
                    ));
                };
                let val = self.variable_get(name);
                let Type::Prim(p) = val.ty else {
                    return self.error_val(CompileError::Type(format!(
                        "'++'/'--' need a numeric variable, '{name}' is {}",
                        val.ty
                    )));
                };
                if numeric_rank(p).is_none() {
                    return self.error_val(CompileError::Type(format!(
                        "'++'/'--' need a numeric variable, '{name}' is {p}"
                    )));
                }
                self.current.write(Instruction::Inc { ty: tag(p), dec: op == UnaryOp::PreDec });
                self.variable_set(name);
                val
            }
        }
    }

    /// Emits the store for a plain variable; the value stays on the stack
    /// as the expression result.
    fn variable_set(&mut self, name: &str) {
        if let Some(local) = self.resolve_local(name) {
            let slot = local.slot;
            self.current.write(Instruction::SetLocal { slot, size: 1, offset: false });
        } else {
            self.current.write(Instruction::SetGlobal {
                name: name.to_string(),
                size: 1,
                offset: false,
            });
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Val {
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let unified = self.unify_numeric(left, right, "arithmetic");
                self.expr_as(left, unified);
                self.expr_as(right, unified);
                let inst = match op {
                    BinaryOp::Add => Instruction::Add { ty: tag(unified) },
                    BinaryOp::Sub => Instruction::Sub { ty: tag(unified) },
                    BinaryOp::Mul => Instruction::Mul { ty: tag(unified) },
                    _ => Instruction::Div { ty: tag(unified) },
                };
                self.current.write(inst);
                Val::prim(unified)
            }
            BinaryOp::Mod => {
                self.int_operand(left, "'%'");
                self.int_operand(right, "'%'");
                self.current.write(Instruction::Mod);
                Val::prim(Prim::Int)
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
                self.int_operand(left, "bitwise operator");
                self.int_operand(right, "bitwise operator");
                let bit = match op {
                    BinaryOp::BitAnd => BitOp::And,
                    BinaryOp::BitOr => BitOp::Or,
                    BinaryOp::BitXor => BitOp::Xor,
                    BinaryOp::Shl => BitOp::ShiftLeft,
                    _ => BitOp::ShiftRight,
                };
                self.current.write(Instruction::Bit { op: bit });
                Val::prim(Prim::Int)
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                // Comparisons exist in integer and double variants only;
                // float operands widen to double.
                let unified = match self.unify_numeric(left, right, "comparison") {
                    Prim::Int => Prim::Int,
                    _ => Prim::Double,
                };
                self.expr_as(left, unified);
                self.expr_as(right, unified);
                let t = tag(unified);
                let inst = match op {
                    BinaryOp::Eq => Instruction::Eq { ty: t },
                    BinaryOp::Ne => Instruction::Neq { ty: t },
                    BinaryOp::Lt => Instruction::Less { ty: t },
                    BinaryOp::Le => Instruction::Lte { ty: t },
                    BinaryOp::Gt => Instruction::Great { ty: t },
                    _ => Instruction::Gte { ty: t },
                };
                self.current.write(inst);
                Val::prim(Prim::Bool)
            }
        }
    }

    /// The wider numeric type of the two operands. Char and bool operands
    /// take part promoted to int.
    fn unify_numeric(&mut self, left: &Expr, right: &Expr, what: &str) -> Prim {
        let rank_of = |compiler: &Self, e: &Expr| match compiler.infer(e) {
            Type::Prim(p) => promoted_rank(p),
            _ => None,
        };
        match (rank_of(self, left), rank_of(self, right)) {
            (Some(l), Some(r)) => {
                let winner = if l >= r { self.infer(left) } else { self.infer(right) };
                match winner {
                    Type::Prim(Prim::Float) => Prim::Float,
                    Type::Prim(Prim::Double) => Prim::Double,
                    _ => Prim::Int,
                }
            }
            _ => {
                let l = self.infer(left);
                let r = self.infer(right);
                self.error(CompileError::Type(format!(
                    "{what} needs numeric operands, found {l} and {r}"
                )));
                Prim::Int
            }
        }
    }

    fn int_operand(&mut self, expr: &Expr, what: &str) {
        let val = self.expr(expr);
        if val.ty != Type::Prim(Prim::Int) {
            self.error(CompileError::Type(format!(
                "{what} needs int operands, found {}",
                val.ty
            )));
        }
    }

    fn logical(&mut self, op: LogicalOp, left: &Expr, right: &Expr) -> Val {
        let lval = self.expr(left);
        if lval.ty != Type::Prim(Prim::Bool) {
            self.error(CompileError::Type(format!(
                "logical operator needs bool operands, found {}",
                lval.ty
            )));
        }
        match op {
            // a and b: a false short-circuits with false still on the stack.
            LogicalOp::And => {
                let end = self.current.new_label();
                self.current.write(Instruction::Jump { label: end, mode: JumpMode::IfFalse });
                self.current.write(Instruction::Pop { widths: vec![1] });
                let rval = self.expr(right);
                if rval.ty != Type::Prim(Prim::Bool) {
                    self.error(CompileError::Type(format!(
                        "logical operator needs bool operands, found {}",
                        rval.ty
                    )));
                }
                self.current.write(Instruction::Label(end));
            }
            // a or b: a true short-circuits, a false falls through to b.
            LogicalOp::Or => {
                let rhs = self.current.new_label();
                let end = self.current.new_label();
                self.current.write(Instruction::Jump { label: rhs, mode: JumpMode::IfFalse });
                self.current.write(Instruction::Jump { label: end, mode: JumpMode::Always });
                self.current.write(Instruction::Label(rhs));
                self.current.write(Instruction::Pop { widths: vec![1] });
                let rval = self.expr(right);
                if rval.ty != Type::Prim(Prim::Bool) {
                    self.error(CompileError::Type(format!(
                        "logical operator needs bool operands, found {}",
                        rval.ty
                    )));
                }
                self.current.write(Instruction::Label(end));
            }
        }
        Val::prim(Prim::Bool)
    }

    fn assign(&mut self, target: &Expr, value: &Expr) -> Val {
        match target {
            Expr::Variable(name) => {
                let ty = if let Some(local) = self.resolve_local(name) {
                    local.ty
                } else if let Some(global) = self.lookup_global(name) {
                    let (kind, gty) = (global.kind, global.ty);
                    if kind != GlobalKind::Var {
                        return self.error_val(CompileError::Type(format!(
                            "cannot assign to function '{name}'"
                        )));
                    }
                    gty
                } else {
                    return self.error_val(CompileError::UndefinedVariable {
                        name: name.clone(),
                    });
                };
                let Type::Prim(p) = ty else {
                    return self.error_val(CompileError::Type(format!(
                        "cannot assign whole arrays; assign '{name}' element-wise"
                    )));
                };
                let val = self.expr_as(value, p);
                self.variable_set(name);
                val
            }
            Expr::Index { base, index } => {
                let Expr::Variable(name) = base.as_ref() else {
                    return self.error_val(CompileError::Type(
                        "only named arrays can be indexed".into(),
                    ));
                };
                let Some((elem, inst)) = self.indexed_access(name, true) else {
                    return self.error_val(CompileError::Type(format!(
                        "'{name}' is not an array"
                    )));
                };
                let val = self.expr_as(value, elem);
                self.expr_as(index, Prim::Int);
                self.current.write(inst);
                val
            }
            _ => self.error_val(CompileError::Type("invalid assignment target".into())),
        }
    }

    fn call(&mut self, callee: &str, args: &[Expr]) -> Val {
        if let Some(sig) = self.functions.iter().find(|s| s.name == callee).cloned() {
            if args.len() != sig.params.len() {
                return self.error_val(CompileError::ArgCount {
                    name: callee.to_string(),
                    expected: sig.params.len(),
                    got: args.len(),
                });
            }
            for (arg, param) in args.iter().zip(&sig.params) {
                match param {
                    Type::Prim(p) => {
                        self.expr_as(arg, *p);
                    }
                    Type::Array { .. } => {
                        let val = self.expr(arg);
                        if val.ty != *param {
                            self.error(CompileError::Type(format!(
                                "argument to '{callee}' must be {param}, found {}",
                                val.ty
                            )));
                        }
                    }
                }
            }
            self.current.write(Instruction::GetGlobal {
                name: callee.to_string(),
                size: 1,
                offset: false,
            });
            self.current.write(Instruction::Call {
                args: sig.params.iter().map(|t| t.size()).collect(),
                native: false,
            });
            return Val::prim(sig.ret);
        }

        if let Some(native) = self.natives.iter().find(|n| n.name == callee) {
            if args.len() != native.args.len() {
                return self.error_val(CompileError::ArgCount {
                    name: callee.to_string(),
                    expected: native.args.len(),
                    got: args.len(),
                });
            }
            for (arg, &param) in args.iter().zip(native.args) {
                self.expr_as(arg, prim_of_tag(param));
            }
            self.current.write(Instruction::GetGlobal {
                name: callee.to_string(),
                size: 1,
                offset: false,
            });
            self.current.write(Instruction::Call {
                args: vec![1; native.args.len()],
                native: true,
            });
            // NATIVE_CALL always replaces the arguments with one result
            // slot, even for a void native; the statement pop discards it.
            return match native.ret {
                Some(t) => Val::prim(prim_of_tag(t)),
                None => Val { ty: Type::Prim(Prim::Void), width: 1 },
            };
        }

        self.error_val(CompileError::UndefinedFunction { name: callee.to_string() })
    }
}

/// Folds a literal initializer (optionally negated) into a `Data` of the
/// declared type, so it lands in the initial globals snapshot instead of
/// the entry chunk.
fn fold_literal(expr: &Expr, target: Prim) -> Option<Data> {
    match expr {
        Expr::IntLit(v) => match target {
            Prim::Int => Some(Data::Int(*v)),
            Prim::Float => Some(Data::Float(*v as f32)),
            Prim::Double => Some(Data::Double(*v as f64)),
            _ => None,
        },
        Expr::FloatLit(v) => match target {
            Prim::Float => Some(Data::Float(*v)),
            Prim::Double => Some(Data::Double(*v as f64)),
            _ => None,
        },
        Expr::DoubleLit(v) => match target {
            Prim::Double => Some(Data::Double(*v)),
            _ => None,
        },
        Expr::BoolLit(v) => match target {
            Prim::Bool => Some(Data::Bool(*v)),
            _ => None,
        },
        Expr::CharLit(v) => match target {
            Prim::Char => Some(Data::Char(*v)),
            _ => None,
        },
        Expr::Unary { op: UnaryOp::Neg, expr } => match fold_literal(expr, target)? {
            Data::Int(v) => Some(Data::Int(-v)),
            Data::Float(v) => Some(Data::Float(-v)),
            Data::Double(v) => Some(Data::Double(-v)),
            _ => None,
        },
        _ => None,
    }
}
