//! AST-to-bytecode compiler for the Kestrel language.
//!
//! The compiler performs a single-pass walk of the [`Program`] AST and emits
//! one [`FunctionPrototype`] per function; the module body is itself a
//! function whose prototype is returned.
//!
//! # Scope model
//!
//! Locals live in frame slots: slot 0 is `this`, parameters follow, and each
//! declaration takes the next slot at the point it is made. Declarations only
//! happen at statement level, where the operand stack holds nothing but
//! locals, so a declaration's initializer lands exactly in its slot. When a
//! scope ends, its locals are popped.
//!
//! Free names are resolved by walking enclosing frames once, at compile time:
//! a local of the parent becomes an `OuterLocal` capture and the parent slot
//! is marked escaping; a capture of the parent becomes an `OuterCapture`.
//! Names that resolve nowhere are read from the VM root table.
//!
//! # Module-level code
//!
//! A module that exports anything reserves a hidden local in slot 1 holding
//! its export table; `export` declarations copy their value into it.

use std::collections::HashSet;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::arith::IncrOp;
use crate::ast::*;
use crate::bytecode::{
    CaptureDesc, CaptureKind, Constant, FunctionPrototype, LocalInfo, OpCode,
};
use crate::error::ErrorCode;
use crate::structs::{check_constructor_signature, check_default_flag, ConstructorSignature, MemberFlags};
use crate::token::Span;
use crate::value::TypeMask;

/// Locals and captures are addressed by a u8 operand; slot 0 is `this`.
pub const MAX_LOCALS: usize = 255;

const EXPORTS_LOCAL: &str = "<exports>";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// A compile-time error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{}:{}] {message}", span.line, span.col)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    /// Set when the failure maps onto a runtime error code.
    pub code: Option<ErrorCode>,
}

impl CompileError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code: None,
        }
    }

    fn coded(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            code: Some(code),
        }
    }
}

type CResult<T> = Result<T, CompileError>;

/// Knobs that change what the compiler records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub source_name: String,
    /// Record line tables and local live ranges.
    pub debug_info: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            source_name: "main".into(),
            debug_info: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local variable tracker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: u32,
    mask: TypeMask,
    is_const: bool,
    /// Nested closures capturing this slot.
    captured: u32,
    /// Index into `proto.locals`, when recorded.
    info: Option<usize>,
}

struct LoopCtx {
    /// `locals.len()` outside the loop.
    locals: usize,
    /// Known `continue` target, or `None` while it is still ahead.
    continue_target: Option<usize>,
    continue_patches: Vec<usize>,
    break_patches: Vec<usize>,
}

/// Where a name lives.
enum Place {
    Local { slot: u8, mask: TypeMask, is_const: bool },
    Capture { index: u8, mask: TypeMask, is_const: bool },
    Global,
}

struct Frame {
    proto: FunctionPrototype,
    locals: Vec<Local>,
    depth: u32,
    loops: Vec<LoopCtx>,
    /// Mask and const flag of each capture's original variable.
    capture_meta: Vec<(TypeMask, bool)>,
    /// Current operand stack height, `this` included.
    height: u32,
}

impl Frame {
    fn new(name: &str, source_name: &str) -> Self {
        Self {
            proto: FunctionPrototype::new(name, source_name),
            locals: Vec::new(),
            depth: 0,
            loops: Vec::new(),
            capture_meta: Vec::new(),
            height: 1,
        }
    }

    fn resolve_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|l| l.name == name)
    }

    fn slots(&self) -> u32 {
        1 + self.locals.len() as u32
    }
}

fn mask_of(types: &[String]) -> TypeMask {
    types
        .iter()
        .filter_map(|t| TypeMask::from_type_name(t))
        .fold(TypeMask::ANY, TypeMask::union)
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler
// ─────────────────────────────────────────────────────────────────────────────

/// The Kestrel bytecode compiler.
///
/// Create one with [`Compiler::new`], then call [`Compiler::compile_program`].
pub struct Compiler {
    options: CompileOptions,
    /// Stack of active function frames (innermost last).
    frames: Vec<Frame>,
    exported: HashSet<String>,
    errors: Vec<CompileError>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        let module = Frame::new("<module>", &options.source_name);
        Compiler {
            options,
            frames: vec![module],
            exported: HashSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn compile_program(mut self, program: &Program) -> Result<FunctionPrototype, Vec<CompileError>> {
        if program.body.iter().any(is_exported) {
            self.emit_op_u16(OpCode::NewTable, 0);
            if let Err(err) = self.declare_local(EXPORTS_LOCAL, TypeMask::ANY, true, program.span) {
                self.errors.push(err);
            }
            self.frame_mut().proto.export_slot = Some(1);
        }
        self.block_body(&program.body);
        self.emit_op(OpCode::Null);
        self.emit_op(OpCode::Return);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        match self.frames.pop() {
            Some(frame) => Ok(self.finish(frame)),
            None => Err(vec![CompileError::new("no module frame", program.span)]),
        }
    }

    // ── Frame helpers ────────────────────────────────────────────────────────

    fn frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn is_module_level(&self) -> bool {
        self.frames.len() == 1 && self.frame().depth == 0
    }

    /// Close the live ranges of whatever is still declared and hand back the
    /// prototype.
    fn finish(&self, mut frame: Frame) -> FunctionPrototype {
        let end = frame.proto.chunk.current_offset() as u32;
        for local in frame.locals.drain(..) {
            if let Some(i) = local.info {
                frame.proto.locals[i].end = end;
                frame.proto.locals[i].captured = local.captured;
            }
        }
        frame.proto.stack_size = frame.proto.stack_size.max(1);
        frame.proto
    }

    // ── Emit helpers ─────────────────────────────────────────────────────────

    fn adjust(&mut self, delta: i32) {
        let frame = self.frame_mut();
        frame.height = (frame.height as i32 + delta).max(0) as u32;
        frame.proto.stack_size = frame.proto.stack_size.max(frame.height);
    }

    fn mark(&mut self, span: Span) {
        if self.options.debug_info {
            self.frame_mut().proto.chunk.mark(span.line, span.col);
        }
    }

    fn emit_op(&mut self, op: OpCode) {
        self.frame_mut().proto.chunk.emit_op(op);
        self.adjust(stack_effect(op, 0));
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.frame_mut().proto.chunk.emit_op_u8(op, operand);
        self.adjust(stack_effect(op, operand as i32));
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.frame_mut().proto.chunk.emit_op_u16(op, operand);
        self.adjust(stack_effect(op, operand as i32));
    }

    fn emit_check_type(&mut self, mask: TypeMask) {
        if !mask.is_unrestricted() {
            let chunk = &mut self.frame_mut().proto.chunk;
            chunk.emit_op(OpCode::CheckType);
            chunk.emit_u32(mask.bits());
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let patch = self.frame_mut().proto.chunk.emit_jump(op);
        self.adjust(stack_effect(op, 0));
        patch
    }

    fn patch_jump(&mut self, patch: usize, span: Span) -> CResult<()> {
        self.frame_mut()
            .proto
            .chunk
            .patch_jump(patch)
            .ok_or_else(|| CompileError::new("function body too large", span))
    }

    /// Jump to an already-known offset.
    fn emit_jump_to(&mut self, op: OpCode, target: usize, span: Span) -> CResult<()> {
        let target =
            u16::try_from(target).map_err(|_| CompileError::new("function body too large", span))?;
        self.frame_mut().proto.chunk.emit_op_u16(op, target);
        Ok(())
    }

    fn constant(&mut self, c: Constant, span: Span) -> CResult<u16> {
        self.frame_mut()
            .proto
            .chunk
            .add_constant(c)
            .ok_or_else(|| CompileError::new("too many constants in one function", span))
    }

    fn name_constant(&mut self, name: &str, span: Span) -> CResult<u16> {
        self.constant(Constant::Str(name.to_string()), span)
    }

    fn emit_constant(&mut self, c: Constant, span: Span) -> CResult<()> {
        let idx = self.constant(c, span)?;
        self.emit_op_u16(OpCode::Const, idx);
        Ok(())
    }

    /// Drop `n` values without touching the tracked height (used on paths
    /// that jump away).
    fn emit_discard(&mut self, n: usize) {
        let chunk = &mut self.frame_mut().proto.chunk;
        match n {
            0 => {}
            1 => chunk.emit_op(OpCode::Pop),
            n => chunk.emit_op_u8(OpCode::PopN, n.min(u8::MAX as usize) as u8),
        }
    }

    // ── Scope management ─────────────────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.frame_mut().depth += 1;
    }

    fn end_scope(&mut self) {
        let end = self.frame().proto.chunk.current_offset() as u32;
        let frame = self.frame_mut();
        let depth = frame.depth;
        frame.depth -= 1;
        let mut popped = 0;
        while frame.locals.last().is_some_and(|l| l.depth >= depth) {
            if let Some(local) = frame.locals.pop() {
                if let Some(i) = local.info {
                    frame.proto.locals[i].end = end;
                    frame.proto.locals[i].captured = local.captured;
                }
                popped += 1;
            }
        }
        match popped {
            0 => {}
            1 => self.emit_op(OpCode::Pop),
            n => self.emit_op_u8(OpCode::PopN, n as u8),
        }
    }

    /// Register the value just pushed as a local in the next slot.
    fn declare_local(&mut self, name: &str, mask: TypeMask, is_const: bool, span: Span) -> CResult<u8> {
        let debug_info = self.options.debug_info;
        let frame = self.frame_mut();
        if frame
            .locals
            .iter()
            .any(|l| l.depth == frame.depth && l.name == name)
        {
            return Err(CompileError::coded(
                ErrorCode::AlreadyExists,
                format!("`{name}` is already declared in this scope"),
                span,
            ));
        }
        if frame.locals.len() >= MAX_LOCALS {
            return Err(CompileError::coded(
                ErrorCode::TooManyLocals,
                format!("too many locals in `{}`", frame.proto.name),
                span,
            ));
        }
        let slot = frame.locals.len() as u32 + 1;
        let start = frame.proto.chunk.current_offset() as u32;
        let info = if debug_info {
            frame.proto.locals.push(LocalInfo {
                name: name.to_string(),
                slot,
                start,
                end: start,
                mask,
                is_const,
                captured: 0,
            });
            Some(frame.proto.locals.len() - 1)
        } else {
            None
        };
        frame.locals.push(Local {
            name: name.to_string(),
            depth: frame.depth,
            mask,
            is_const,
            captured: 0,
            info,
        });
        Ok(slot as u8)
    }

    fn record_types(&mut self, types: &[String]) {
        let restricted = &mut self.frame_mut().proto.restricted_types;
        for t in types {
            if !restricted.contains(t) {
                restricted.push(t.clone());
            }
        }
    }

    // ── Name resolution ──────────────────────────────────────────────────────

    fn resolve(&mut self, name: &str, span: Span) -> CResult<Place> {
        let fi = self.frames.len() - 1;
        if let Some(li) = self.frames[fi].resolve_local(name) {
            let local = &self.frames[fi].locals[li];
            return Ok(Place::Local {
                slot: (li + 1) as u8,
                mask: local.mask,
                is_const: local.is_const,
            });
        }
        if let Some(ci) = self.resolve_capture(fi, name, span)? {
            let (mask, is_const) = self.frames[fi].capture_meta[ci];
            return Ok(Place::Capture {
                index: ci as u8,
                mask,
                is_const,
            });
        }
        Ok(Place::Global)
    }

    fn resolve_capture(&mut self, fi: usize, name: &str, span: Span) -> CResult<Option<usize>> {
        if fi == 0 {
            return Ok(None);
        }
        let parent = fi - 1;
        let (kind, index, meta, parent_local) = if let Some(li) = self.frames[parent].resolve_local(name) {
            let local = &self.frames[parent].locals[li];
            (CaptureKind::OuterLocal, li as u32 + 1, (local.mask, local.is_const), Some(li))
        } else if let Some(ci) = self.resolve_capture(parent, name, span)? {
            (CaptureKind::OuterCapture, ci as u32, self.frames[parent].capture_meta[ci], None)
        } else {
            return Ok(None);
        };

        let frame = &mut self.frames[fi];
        if let Some(existing) = frame
            .proto
            .captures
            .iter()
            .position(|c| c.kind == kind && c.index == index)
        {
            return Ok(Some(existing));
        }
        if frame.proto.captures.len() >= MAX_LOCALS {
            return Err(CompileError::coded(
                ErrorCode::TooManyLocals,
                format!("too many captured variables in `{}`", frame.proto.name),
                span,
            ));
        }
        frame.proto.captures.push(CaptureDesc {
            name: name.to_string(),
            index,
            kind,
        });
        frame.capture_meta.push(meta);
        let ci = frame.proto.captures.len() - 1;

        if let Some(li) = parent_local {
            let parent = &mut self.frames[parent];
            if parent.locals[li].captured == 0 {
                parent.proto.capture_count += 1;
            }
            parent.locals[li].captured += 1;
        }
        Ok(Some(ci))
    }

    fn load_name(&mut self, name: &str, span: Span) -> CResult<()> {
        match self.resolve(name, span)? {
            Place::Local { slot, .. } => self.emit_op_u8(OpCode::LoadLocal, slot),
            Place::Capture { index, .. } => self.emit_op_u8(OpCode::LoadCapture, index),
            Place::Global => {
                let idx = self.name_constant(name, span)?;
                self.emit_op_u16(OpCode::LoadGlobal, idx);
            }
        }
        Ok(())
    }

    /// Store the top value into `name`, leaving it on the stack.
    fn store_name(&mut self, name: &str, span: Span) -> CResult<()> {
        match self.resolve(name, span)? {
            Place::Local { is_const: true, .. } | Place::Capture { is_const: true, .. } => {
                Err(CompileError::coded(
                    ErrorCode::CantModifyConst,
                    format!("cannot assign to const `{name}`"),
                    span,
                ))
            }
            Place::Local { slot, mask, .. } => {
                self.emit_check_type(mask);
                self.emit_op(OpCode::Dup);
                self.emit_op_u8(OpCode::StoreLocal, slot);
                Ok(())
            }
            Place::Capture { index, mask, .. } => {
                self.emit_check_type(mask);
                self.emit_op(OpCode::Dup);
                self.emit_op_u8(OpCode::StoreCapture, index);
                Ok(())
            }
            Place::Global => Err(CompileError::coded(
                ErrorCode::Inaccessible,
                format!("cannot assign to undeclared `{name}`"),
                span,
            )),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn block_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            if let Err(err) = self.statement(stmt) {
                self.errors.push(err);
            }
            let frame = self.frame_mut();
            frame.height = frame.slots();
        }
    }

    fn statement(&mut self, stmt: &Stmt) -> CResult<()> {
        self.mark(stmt.span());
        match stmt {
            Stmt::Var(decl) => self.var_decl(decl),
            Stmt::Function { decl, exported } => {
                let name = decl.name.clone().unwrap_or_default();
                self.check_export(*exported, &name, decl.span)?;
                self.emit_op(OpCode::Null);
                let slot = self.declare_local(&name, TypeMask::ANY, false, decl.span)?;
                self.function(decl, &name)?;
                self.emit_op_u8(OpCode::StoreLocal, slot);
                self.export_slot(*exported, &name, slot, decl.span)
            }
            Stmt::Struct { decl, exported } => {
                let name = decl.name.clone().unwrap_or_default();
                self.check_export(*exported, &name, decl.span)?;
                self.emit_op(OpCode::Null);
                let slot = self.declare_local(&name, TypeMask::ANY, false, decl.span)?;
                self.struct_decl(decl)?;
                self.emit_op_u8(OpCode::StoreLocal, slot);
                self.export_slot(*exported, &name, slot, decl.span)
            }
            Stmt::Expr(expr) => {
                self.expression(expr)?;
                self.emit_op(OpCode::Pop);
                Ok(())
            }
            Stmt::Return(value, span) => {
                match value {
                    Some(expr) => self.expression(expr)?,
                    None => self.emit_op(OpCode::Null),
                }
                self.mark(*span);
                self.emit_op(OpCode::Return);
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                span,
            } => {
                self.expression(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.scoped(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let end_jump = self.emit_jump(OpCode::Jump);
                        self.patch_jump(else_jump, *span)?;
                        self.scoped(else_branch)?;
                        self.patch_jump(end_jump, *span)
                    }
                    None => self.patch_jump(else_jump, *span),
                }
            }
            Stmt::While { cond, body, span } => {
                let start = self.frame().proto.chunk.current_offset();
                self.expression(cond)?;
                let exit = self.emit_jump(OpCode::JumpIfFalse);
                self.push_loop(Some(start));
                self.scoped(body)?;
                self.emit_jump_to(OpCode::Loop, start, *span)?;
                self.patch_jump(exit, *span)?;
                self.pop_loop(*span)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                span,
            } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.statement(init)?;
                    let frame = self.frame_mut();
                    frame.height = frame.slots();
                }
                let start = self.frame().proto.chunk.current_offset();
                let exit = match cond {
                    Some(cond) => {
                        self.expression(cond)?;
                        Some(self.emit_jump(OpCode::JumpIfFalse))
                    }
                    None => None,
                };
                self.push_loop(None);
                self.scoped(body)?;
                self.patch_continues(*span)?;
                if let Some(step) = step {
                    self.expression(step)?;
                    self.emit_op(OpCode::Pop);
                }
                self.emit_jump_to(OpCode::Loop, start, *span)?;
                if let Some(exit) = exit {
                    self.patch_jump(exit, *span)?;
                }
                self.pop_loop(*span)?;
                self.end_scope();
                Ok(())
            }
            Stmt::Break(span) => {
                let locals = self.frame().locals.len();
                let Some(ctx) = self.frame().loops.last() else {
                    return Err(CompileError::new("`break` outside of a loop", *span));
                };
                let extra = locals - ctx.locals;
                self.emit_discard(extra);
                let patch = self.frame_mut().proto.chunk.emit_jump(OpCode::Jump);
                if let Some(ctx) = self.frame_mut().loops.last_mut() {
                    ctx.break_patches.push(patch);
                }
                Ok(())
            }
            Stmt::Continue(span) => {
                let locals = self.frame().locals.len();
                let Some(ctx) = self.frame().loops.last() else {
                    return Err(CompileError::new("`continue` outside of a loop", *span));
                };
                let extra = locals - ctx.locals;
                let target = ctx.continue_target;
                self.emit_discard(extra);
                match target {
                    Some(target) => self.emit_jump_to(OpCode::Loop, target, *span)?,
                    None => {
                        let patch = self.frame_mut().proto.chunk.emit_jump(OpCode::Jump);
                        if let Some(ctx) = self.frame_mut().loops.last_mut() {
                            ctx.continue_patches.push(patch);
                        }
                    }
                }
                Ok(())
            }
            Stmt::Block(body, _) => {
                self.begin_scope();
                self.block_body(body);
                self.end_scope();
                Ok(())
            }
        }
    }

    /// Compile a branch or loop body in its own scope.
    fn scoped(&mut self, stmt: &Stmt) -> CResult<()> {
        self.begin_scope();
        let result = self.statement(stmt);
        let frame = self.frame_mut();
        frame.height = frame.slots();
        self.end_scope();
        result
    }

    fn push_loop(&mut self, continue_target: Option<usize>) {
        let locals = self.frame().locals.len();
        self.frame_mut().loops.push(LoopCtx {
            locals,
            continue_target,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });
    }

    fn patch_continues(&mut self, span: Span) -> CResult<()> {
        let patches = match self.frame_mut().loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continue_patches),
            None => Vec::new(),
        };
        for patch in patches {
            self.patch_jump(patch, span)?;
        }
        Ok(())
    }

    fn pop_loop(&mut self, span: Span) -> CResult<()> {
        if let Some(ctx) = self.frame_mut().loops.pop() {
            for patch in ctx.break_patches {
                self.patch_jump(patch, span)?;
            }
        }
        Ok(())
    }

    fn var_decl(&mut self, decl: &VarDecl) -> CResult<()> {
        self.check_export(decl.exported, &decl.name, decl.span)?;
        let mask = mask_of(&decl.types);
        self.record_types(&decl.types);
        match &decl.init {
            Some(init) => {
                self.expression(init)?;
                self.emit_check_type(mask);
            }
            None => self.emit_op(OpCode::Null),
        }
        let slot = self.declare_local(&decl.name, mask, decl.is_const, decl.span)?;
        self.export_slot(decl.exported, &decl.name, slot, decl.span)
    }

    fn check_export(&mut self, exported: bool, name: &str, span: Span) -> CResult<()> {
        if !exported {
            return Ok(());
        }
        if !self.is_module_level() {
            return Err(CompileError::new("`export` is only allowed at module level", span));
        }
        if !self.exported.insert(name.to_string()) {
            return Err(CompileError::coded(
                ErrorCode::AlreadyExists,
                format!("`{name}` is already exported"),
                span,
            ));
        }
        Ok(())
    }

    fn export_slot(&mut self, exported: bool, name: &str, slot: u8, span: Span) -> CResult<()> {
        if exported {
            let idx = self.name_constant(name, span)?;
            self.emit_op_u8(OpCode::LoadLocal, slot);
            self.emit_op_u16(OpCode::Export, idx);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions
    // ─────────────────────────────────────────────────────────────────────────

    /// Compile `decl` as a nested prototype and emit the `Closure` that binds
    /// it. Default values are evaluated here, in the enclosing function.
    fn function(&mut self, decl: &FunctionDecl, name: &str) -> CResult<()> {
        let mut defaults = 0;
        for param in &decl.params {
            if let Some(default) = &param.default {
                self.expression(default)?;
                defaults += 1;
            }
        }

        let source_name = self.options.source_name.clone();
        self.frames.push(Frame::new(name, &source_name));
        let result = self.function_body(decl);
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(CompileError::new("frame underflow", decl.span)),
        };
        result?;
        let proto = self.finish(frame);
        debug!(function = %proto.name, captures = proto.captures.len(), "compiled function");

        let functions = &mut self.frame_mut().proto.functions;
        let idx = u16::try_from(functions.len())
            .map_err(|_| CompileError::new("too many nested functions", decl.span))?;
        functions.push(Rc::new(proto));
        self.frame_mut().proto.chunk.emit_op_u16(OpCode::Closure, idx);
        self.adjust(1 - defaults);
        Ok(())
    }

    fn function_body(&mut self, decl: &FunctionDecl) -> CResult<()> {
        self.mark(decl.span);
        let mut checks = Vec::new();
        for param in &decl.params {
            let mask = mask_of(&param.types);
            self.record_types(&param.types);
            // Parameters are placed by the caller.
            let frame = self.frame_mut();
            frame.height += 1;
            frame.proto.stack_size = frame.proto.stack_size.max(frame.height);
            frame.proto.parameter_names.push(param.name.clone());
            if param.default.is_some() {
                frame.proto.default_count += 1;
            }
            let slot = self.declare_param(&param.name, mask, param.span)?;
            if !mask.is_unrestricted() {
                checks.push((slot, mask));
            }
        }
        for (slot, mask) in checks {
            let chunk = &mut self.frame_mut().proto.chunk;
            chunk.emit_op_u8(OpCode::CheckParam, slot);
            chunk.emit_u32(mask.bits());
        }
        self.block_body(&decl.body);
        self.emit_op(OpCode::Null);
        self.emit_op(OpCode::Return);
        Ok(())
    }

    /// Parameters are always recorded: constructor resolution reads their
    /// masks back from the prototype.
    fn declare_param(&mut self, name: &str, mask: TypeMask, span: Span) -> CResult<u8> {
        let slot = self.declare_local(name, mask, false, span)?;
        let frame = self.frame_mut();
        if let Some(local) = frame.locals.last_mut() {
            if local.info.is_none() {
                frame.proto.locals.push(LocalInfo {
                    name: name.to_string(),
                    slot: slot as u32,
                    start: 0,
                    end: 0,
                    mask,
                    is_const: false,
                    captured: 0,
                });
                local.info = Some(frame.proto.locals.len() - 1);
            }
        }
        Ok(slot)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Structs
    // ─────────────────────────────────────────────────────────────────────────

    /// Emit `NewStruct` and one declaration instruction per item, leaving the
    /// schema on the stack.
    fn struct_decl(&mut self, decl: &StructDecl) -> CResult<()> {
        let name = decl.name.as_deref().unwrap_or("<anonymous>");
        let idx = self.name_constant(name, decl.span)?;
        self.emit_op_u16(OpCode::NewStruct, idx);

        let mut names = HashSet::new();
        let mut signatures = Vec::new();
        let mut has_default = false;

        for item in &decl.items {
            self.mark(item.span);
            let flags = MemberFlags {
                is_static: item.is_static,
                is_private: item.is_private,
                is_const: item.is_const,
            };
            match &item.kind {
                StructItemKind::Member { types, init } => {
                    self.unique_member(&mut names, &item.name, item.span)?;
                    let mask = mask_of(types);
                    self.record_types(types);
                    match init {
                        Some(init) => self.expression(init)?,
                        None => self.emit_op(OpCode::Null),
                    }
                    let name_idx = self.name_constant(&item.name, item.span)?;
                    let chunk = &mut self.frame_mut().proto.chunk;
                    chunk.emit_op_u16(OpCode::StructMember, name_idx);
                    chunk.emit_byte(flags.to_byte());
                    chunk.emit_u32(mask.bits());
                    self.adjust(-1);
                }
                StructItemKind::Method(method) => {
                    self.unique_member(&mut names, &item.name, item.span)?;
                    self.function(method, &item.name)?;
                    let name_idx = self.name_constant(&item.name, item.span)?;
                    self.frame_mut()
                        .proto
                        .chunk
                        .emit_op_u16_u8(OpCode::StructMethod, name_idx, flags.to_byte());
                    self.adjust(-1);
                }
                StructItemKind::Constructor(ctor) if ctor.params.is_empty() && ctor.body.is_empty() => {
                    self.default_constructor(&signatures, &mut has_default, item.span)?;
                }
                StructItemKind::Constructor(ctor) => {
                    let signature = ConstructorSignature::new(
                        ctor.params.iter().map(|p| mask_of(&p.types)).collect(),
                        ctor.params.iter().filter(|p| p.default.is_some()).count(),
                    );
                    check_constructor_signature(&signatures, has_default, &signature)
                        .map_err(|code| constructor_error(code, name, item.span))?;
                    signatures.push(signature);
                    self.function(ctor, "constructor")?;
                    self.emit_op(OpCode::StructConstructor);
                }
                StructItemKind::DefaultConstructor => {
                    self.default_constructor(&signatures, &mut has_default, item.span)?;
                }
            }
        }
        debug!(name, items = decl.items.len(), "lowered struct");
        Ok(())
    }

    fn default_constructor(
        &mut self,
        signatures: &[ConstructorSignature],
        has_default: &mut bool,
        span: Span,
    ) -> CResult<()> {
        check_default_flag(signatures, *has_default)
            .map_err(|code| constructor_error(code, "struct", span))?;
        *has_default = true;
        self.emit_op(OpCode::StructDefaultConstructor);
        Ok(())
    }

    fn unique_member(&self, names: &mut HashSet<String>, name: &str, span: Span) -> CResult<()> {
        if names.insert(name.to_string()) {
            Ok(())
        } else {
            Err(CompileError::coded(
                ErrorCode::AlreadyExists,
                format!("struct member `{name}` is declared twice"),
                span,
            ))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expressions
    // ─────────────────────────────────────────────────────────────────────────

    fn expression(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Null(_) => self.emit_op(OpCode::Null),
            Expr::Bool(true, _) => self.emit_op(OpCode::True),
            Expr::Bool(false, _) => self.emit_op(OpCode::False),
            Expr::Int(0, _) => self.emit_op(OpCode::Int0),
            Expr::Int(1, _) => self.emit_op(OpCode::Int1),
            Expr::Int(n, span) => self.emit_constant(Constant::Int(*n), *span)?,
            Expr::Float(f, span) => self.emit_constant(Constant::Float(*f), *span)?,
            Expr::Str(s, span) => self.emit_constant(Constant::Str(s.clone()), *span)?,
            Expr::Ident(name, span) => self.load_name(name, *span)?,
            Expr::This(_) => self.emit_op_u8(OpCode::LoadLocal, 0),
            Expr::Array(items, span) => {
                for item in items {
                    self.expression(item)?;
                }
                let n = u16::try_from(items.len())
                    .map_err(|_| CompileError::new("array literal too long", *span))?;
                self.emit_op_u16(OpCode::NewArray, n);
            }
            Expr::Table(entries, span) => {
                for (key, value) in entries {
                    self.expression(key)?;
                    self.expression(value)?;
                }
                let n = u16::try_from(entries.len())
                    .map_err(|_| CompileError::new("table literal too long", *span))?;
                self.emit_op_u16(OpCode::NewTable, n);
            }
            Expr::Unary { op, operand, span } => {
                self.expression(operand)?;
                self.mark(*span);
                self.emit_op(match op {
                    UnOp::Neg => OpCode::Neg,
                    UnOp::Not => OpCode::Not,
                    UnOp::BitNot => OpCode::BitNot,
                });
            }
            Expr::Binary { op, lhs, rhs, span } => {
                self.expression(lhs)?;
                self.expression(rhs)?;
                self.mark(*span);
                self.emit_op(binary_opcode(*op));
            }
            Expr::Logical {
                is_and,
                lhs,
                rhs,
                span,
            } => {
                self.expression(lhs)?;
                let jump = self.emit_jump(if *is_and { OpCode::And } else { OpCode::Or });
                self.expression(rhs)?;
                self.patch_jump(jump, *span)?;
            }
            Expr::Assign {
                op,
                target,
                value,
                span,
            } => self.assign(*op, target, value, *span)?,
            Expr::Incr { op, target, span } => self.incr(*op, target, *span)?,
            Expr::Call { callee, args, span } => {
                self.expression(callee)?;
                self.emit_op(OpCode::Null);
                let argc = self.arguments(args, *span)?;
                self.mark(*span);
                self.emit_op_u8(OpCode::Call, argc);
            }
            Expr::MethodCall {
                object,
                name,
                args,
                span,
            } => {
                self.expression(object)?;
                let argc = self.arguments(args, *span)?;
                let idx = self.name_constant(name, *span)?;
                self.mark(*span);
                self.frame_mut()
                    .proto
                    .chunk
                    .emit_op_u16_u8(OpCode::CallMethod, idx, argc);
                self.adjust(-(argc as i32));
            }
            Expr::Field { object, name, span } => {
                self.expression(object)?;
                let idx = self.name_constant(name, *span)?;
                self.mark(*span);
                self.emit_op_u16(OpCode::GetField, idx);
            }
            Expr::Index {
                object,
                index,
                span,
            } => {
                self.expression(object)?;
                self.expression(index)?;
                self.mark(*span);
                self.emit_op(OpCode::GetIndex);
            }
            Expr::Function(decl) => {
                let name = decl.name.as_deref().unwrap_or("<anonymous>");
                self.function(decl, name)?;
            }
            Expr::Struct(decl) => self.struct_decl(decl)?,
        }
        Ok(())
    }

    fn arguments(&mut self, args: &[Expr], span: Span) -> CResult<u8> {
        let argc = u8::try_from(args.len())
            .map_err(|_| CompileError::new("too many call arguments", span))?;
        for arg in args {
            self.expression(arg)?;
        }
        Ok(argc)
    }

    fn assign(&mut self, op: Option<BinOp>, target: &Expr, value: &Expr, span: Span) -> CResult<()> {
        match target {
            Expr::Ident(name, name_span) => {
                if let Some(op) = op {
                    self.load_name(name, *name_span)?;
                    self.expression(value)?;
                    self.mark(span);
                    self.emit_op(binary_opcode(op));
                } else {
                    self.expression(value)?;
                }
                self.store_name(name, *name_span)
            }
            Expr::Field { object, name, .. } => {
                let idx = self.name_constant(name, span)?;
                self.expression(object)?;
                if let Some(op) = op {
                    self.emit_op(OpCode::Dup);
                    self.emit_op_u16(OpCode::GetField, idx);
                    self.expression(value)?;
                    self.mark(span);
                    self.emit_op(binary_opcode(op));
                } else {
                    self.expression(value)?;
                }
                self.mark(span);
                self.emit_op_u16(OpCode::SetField, idx);
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                if let Some(op) = op {
                    self.emit_op(OpCode::Dup2);
                    self.emit_op(OpCode::GetIndex);
                    self.expression(value)?;
                    self.mark(span);
                    self.emit_op(binary_opcode(op));
                } else {
                    self.expression(value)?;
                }
                self.mark(span);
                self.emit_op(OpCode::SetIndex);
                Ok(())
            }
            _ => Err(CompileError::new("invalid assignment target", span)),
        }
    }

    fn incr(&mut self, op: IncrOp, target: &Expr, span: Span) -> CResult<()> {
        let step = op.to_byte();
        match target {
            Expr::Ident(name, name_span) => {
                self.load_name(name, *name_span)?;
                self.mark(span);
                if op.is_prefix() {
                    self.emit_op_u8(OpCode::Step, step);
                    self.store_name(name, *name_span)
                } else {
                    self.emit_op(OpCode::Dup);
                    self.emit_op_u8(OpCode::Step, step);
                    self.store_name(name, *name_span)?;
                    self.emit_op(OpCode::Pop);
                    Ok(())
                }
            }
            Expr::Field { object, name, .. } => {
                let idx = self.name_constant(name, span)?;
                self.expression(object)?;
                self.emit_op(OpCode::Dup);
                self.emit_op_u16(OpCode::GetField, idx);
                self.mark(span);
                if op.is_prefix() {
                    self.emit_op_u8(OpCode::Step, step);
                    self.emit_op_u16(OpCode::SetField, idx);
                } else {
                    self.emit_op(OpCode::Dup);
                    self.emit_op_u8(OpCode::Insert, 2);
                    self.emit_op_u8(OpCode::Step, step);
                    self.emit_op_u16(OpCode::SetField, idx);
                    self.emit_op(OpCode::Pop);
                }
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit_op(OpCode::Dup2);
                self.emit_op(OpCode::GetIndex);
                self.mark(span);
                if op.is_prefix() {
                    self.emit_op_u8(OpCode::Step, step);
                    self.emit_op(OpCode::SetIndex);
                } else {
                    self.emit_op(OpCode::Dup);
                    self.emit_op_u8(OpCode::Insert, 3);
                    self.emit_op_u8(OpCode::Step, step);
                    self.emit_op(OpCode::SetIndex);
                    self.emit_op(OpCode::Pop);
                }
                Ok(())
            }
            _ => Err(CompileError::new("`++`/`--` needs an assignable operand", span)),
        }
    }
}

fn is_exported(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Var(decl) => decl.exported,
        Stmt::Function { exported, .. } | Stmt::Struct { exported, .. } => *exported,
        _ => false,
    }
}

fn constructor_error(code: ErrorCode, name: &str, span: Span) -> CompileError {
    let message = match code {
        ErrorCode::AmbiguousConstructors => {
            format!("`{name}` declares two constructors with the same signature")
        }
        ErrorCode::DuplicatedDefaultConstructor => {
            format!("`{name}` declares more than one default constructor")
        }
        other => format!("invalid constructor in `{name}`: {other}"),
    };
    CompileError::coded(code, message, span)
}

fn binary_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::Mod => OpCode::Mod,
        BinOp::Exp => OpCode::Exp,
        BinOp::BitOr => OpCode::BitOr,
        BinOp::BitAnd => OpCode::BitAnd,
        BinOp::BitXor => OpCode::BitXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        BinOp::Eq => OpCode::Eq,
        BinOp::Ne => OpCode::Ne,
        BinOp::Lt => OpCode::Lt,
        BinOp::Le => OpCode::Le,
        BinOp::Gt => OpCode::Gt,
        BinOp::Ge => OpCode::Ge,
    }
}

/// Net change in stack height after `op` runs (falling through, for jumps).
fn stack_effect(op: OpCode, operand: i32) -> i32 {
    use OpCode::*;
    match op {
        Const | Null | True | False | Int0 | Int1 | Dup | LoadLocal | LoadCapture | LoadGlobal
        | NewStruct => 1,
        Dup2 => 2,
        Pop | StoreLocal | StoreCapture | Export | Add | Sub | Mul | Div | Mod | Exp | BitOr
        | BitAnd | BitXor | Shl | Shr | Eq | Ne | Lt | Le | Gt | Ge | And | Or | JumpIfFalse
        | SetField | GetIndex | StructConstructor | Return => -1,
        SetIndex => -2,
        PopN => -operand,
        Call => -(operand + 1),
        NewArray => 1 - operand,
        NewTable => 1 - 2 * operand,
        _ => 0,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Compile a parsed [`Program`] into its module prototype.
#[instrument(skip_all, fields(source = %options.source_name))]
pub fn compile(program: &Program, options: &CompileOptions) -> Result<FunctionPrototype, Vec<CompileError>> {
    let proto = Compiler::new(options.clone()).compile_program(program)?;
    debug!(
        bytes = proto.chunk.code.len(),
        functions = proto.functions.len(),
        "compiled module"
    );
    Ok(proto)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn program(src: &str) -> Program {
        let (tokens, lex_errs) = lex(src);
        assert!(lex_errs.is_empty(), "lex errors: {lex_errs:?}");
        parse(tokens).unwrap_or_else(|e| panic!("parse errors: {e:?}"))
    }

    fn compile_src(src: &str) -> FunctionPrototype {
        compile(&program(src), &CompileOptions::default())
            .unwrap_or_else(|e| panic!("compile errors: {e:?}"))
    }

    fn compile_err(src: &str) -> CompileError {
        compile(&program(src), &CompileOptions::default())
            .expect_err("expected a compile error")
            .remove(0)
    }

    fn ops(proto: &FunctionPrototype) -> Vec<OpCode> {
        let code = &proto.chunk.code;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let op = OpCode::try_from(code[offset]).expect("valid opcode");
            out.push(op);
            offset += op.size();
        }
        out
    }

    #[test]
    fn test_compile_return_expression() {
        let proto = compile_src("return 1 + 2;");
        assert_eq!(
            ops(&proto),
            vec![
                OpCode::Int1,
                OpCode::Const,
                OpCode::Add,
                OpCode::Return,
                OpCode::Null,
                OpCode::Return
            ]
        );
        assert!(proto.validate().is_ok());
    }

    #[test]
    fn test_locals_take_consecutive_slots() {
        let proto = compile_src("var a = 1; var b = 2; return b;");
        let code = &proto.chunk.code;
        let load = code
            .iter()
            .position(|&b| b == OpCode::LoadLocal as u8)
            .expect("a LoadLocal");
        assert_eq!(code[load + 1], 2);
        assert_eq!(proto.locals.iter().map(|l| l.slot).collect::<Vec<_>>(), vec![1, 2]);
        assert!(proto.stack_size >= 3);
    }

    #[test]
    fn test_duplicate_local_in_scope() {
        let err = compile_err("var a = 1; var a = 2;");
        assert_eq!(err.code, Some(ErrorCode::AlreadyExists));
        // Shadowing in an inner block is fine.
        compile_src("var a = 1; { var a = 2; }");
    }

    #[test]
    fn test_capture_resolution() {
        let proto = compile_src(
            "var x = 1;
             function f() {
                 function g() { return x; }
                 return g;
             }",
        );
        assert_eq!(proto.capture_count, 1);
        assert_eq!(proto.locals[0].name, "x");
        assert_eq!(proto.locals[0].captured, 1);

        let f = &proto.functions[0];
        assert_eq!(
            f.captures,
            vec![CaptureDesc {
                name: "x".into(),
                index: 1,
                kind: CaptureKind::OuterLocal
            }]
        );
        let g = &f.functions[0];
        assert_eq!(
            g.captures,
            vec![CaptureDesc {
                name: "x".into(),
                index: 0,
                kind: CaptureKind::OuterCapture
            }]
        );
    }

    #[test]
    fn test_captures_are_deduplicated() {
        let proto = compile_src("var x = 1; var f = function() { return x + x; };");
        assert_eq!(proto.functions[0].captures.len(), 1);
        assert_eq!(proto.locals[0].captured, 1);
    }

    #[test]
    fn test_unresolved_names_are_globals() {
        let proto = compile_src("print(1);");
        assert!(ops(&proto).contains(&OpCode::LoadGlobal));
        let err = compile_err("undeclared = 1;");
        assert_eq!(err.code, Some(ErrorCode::Inaccessible));
    }

    #[test]
    fn test_const_assignment_rejected() {
        let err = compile_err("const c = 1; c = 2;");
        assert_eq!(err.code, Some(ErrorCode::CantModifyConst));
    }

    #[test]
    fn test_typed_local_emits_check() {
        let proto = compile_src("int n = 1; n = 2;");
        assert_eq!(ops(&proto).iter().filter(|&&op| op == OpCode::CheckType).count(), 2);
        assert_eq!(proto.restricted_types, vec!["int"]);
    }

    #[test]
    fn test_parameter_masks_and_defaults() {
        let proto = compile_src("function f(int a, b = 2) { return a; }");
        let f = &proto.functions[0];
        assert_eq!(f.parameter_names, vec!["a", "b"]);
        assert_eq!(f.default_count, 1);
        assert_eq!(f.parameter_mask(0), TypeMask::INTEGER);
        assert_eq!(f.parameter_mask(1), TypeMask::ANY);
        assert_eq!(ops(f)[0], OpCode::CheckParam);
    }

    #[test]
    fn test_struct_lowering() {
        let proto = compile_src(
            "struct P {
                constructor(a = 0, b = 0) { this.a = a; this.b = b; }
                var a = 0;
                var b = 0;
                static const var origin = 0;
                function sum() { return this.a + this.b; }
             };
             return P(1);",
        );
        let ops = ops(&proto);
        assert!(ops.contains(&OpCode::NewStruct));
        assert_eq!(ops.iter().filter(|&&op| op == OpCode::StructMember).count(), 3);
        assert!(ops.contains(&OpCode::StructMethod));
        assert!(ops.contains(&OpCode::StructConstructor));
        assert_eq!(proto.functions.len(), 2);
    }

    #[test]
    fn test_empty_constructor_is_default() {
        let proto = compile_src("struct S { constructor() {} var x = 1; }");
        let ops = ops(&proto);
        assert!(ops.contains(&OpCode::StructDefaultConstructor));
        assert!(!ops.contains(&OpCode::StructConstructor));
    }

    #[test]
    fn test_constructor_signature_errors() {
        let err = compile_err("struct S { constructor(int a) {} constructor(int b) {} }");
        assert_eq!(err.code, Some(ErrorCode::AmbiguousConstructors));

        let err = compile_err("struct S { constructor() = default; constructor(a = 1) {} }");
        assert_eq!(err.code, Some(ErrorCode::DuplicatedDefaultConstructor));

        let err = compile_err("struct S { var m = 1; function m() {} }");
        assert_eq!(err.code, Some(ErrorCode::AlreadyExists));
    }

    #[test]
    fn test_exports_reserve_slot() {
        let proto = compile_src("export var a = 1; export function f() {}");
        assert_eq!(proto.export_slot, Some(1));
        assert_eq!(ops(&proto).iter().filter(|&&op| op == OpCode::Export).count(), 2);

        let err = compile_err("export var a = 1; export const a = 2;");
        assert_eq!(err.code, Some(ErrorCode::AlreadyExists));
        assert!(compile_src("var a = 1;").export_slot.is_none());
    }

    #[test]
    fn test_too_many_locals() {
        let src: String = (0..256).map(|i| format!("var v{i} = {i};")).collect();
        let err = compile_err(&src);
        assert_eq!(err.code, Some(ErrorCode::TooManyLocals));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = compile_err("break;");
        assert!(err.message.contains("outside of a loop"));
        compile_src("while (true) { var x = 1; if (x) break; else continue; }");
        compile_src("for (var i = 0; i < 3; i++) { continue; }");
    }

    #[test]
    fn test_line_table_follows_debug_info() {
        let prog = program("var a = 1;\nreturn a;");
        let proto = compile(&prog, &CompileOptions::default()).unwrap();
        assert_eq!(proto.chunk.position_at(0), Some((1, 1)));
        let last = proto.chunk.code.len() - 1;
        assert_eq!(proto.chunk.position_at(last).map(|p| p.0), Some(2));

        let options = CompileOptions {
            debug_info: false,
            ..CompileOptions::default()
        };
        let proto = compile(&prog, &options).unwrap();
        assert!(proto.chunk.lines.is_empty());
        assert!(proto.locals.is_empty());
    }
}
