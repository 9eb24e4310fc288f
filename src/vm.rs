//! The Kestrel virtual machine.
//!
//! The VM is a **stack-based interpreter** that executes the bytecode of a
//! [`FunctionPrototype`]. It keeps a stack of [`CallFrame`]s over one shared
//! [`ExecutionStack`].
//!
//! # Execution model
//!
//! - A call is laid out as `callee this arg0 … argN-1`. The callee's frame
//!   window starts at the `this` slot; parameters follow and declared locals
//!   are pushed after them.
//! - On `Call`, a new frame is pushed; on `Return`, everything from the callee
//!   slot up is dropped and the return value takes its place.
//! - Locals captured by nested closures are moved into shared
//!   [`CaptureCell`]s the first time a closure binds them. The slot keeps the
//!   cell, and `LoadLocal`/`StoreLocal` read and write through it.
//!
//! # Memory
//!
//! Every value is reference counted. Popping a stack slot is the release
//! point; there is no collector, so reference cycles leak unless one edge is
//! a weak reference.
//!
//! # Errors
//!
//! Instructions fail with an [`ErrorCode`]. The loop turns the first failure
//! into a [`RuntimeError`] carrying the source position of every active
//! frame, unwinds to the frame it was entered at, and hands the error back.

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, instrument, trace, warn};

use crate::arith::{self, ArithOp, Comparison, Dispatch, IncrOp};
use crate::builtins;
use crate::bytecode::{CaptureKind, Constant, FunctionPrototype, OpCode};
use crate::config::VmConfig;
use crate::engine::Engine;
use crate::error::{ErrorCode, OpResult};
use crate::heap::Ref;
use crate::native::{NativeCall, NativeFn};
use crate::object::{
    delegate_of, lookup_meta, CaptureCell, ClosureObject, MetaMethod, TableObject,
};
use crate::stack::ExecutionStack;
use crate::structs::{MemberFlags, StructObject};
use crate::value::{TypeMask, Value};

/// Longest delegate chain followed for plain key lookups.
const MAX_DELEGATE_CHAIN: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime error
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime error raised by the VM.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    /// Position of the failing instruction; `0` without debug info.
    pub line: u32,
    pub column: u32,
    /// `name:line:column` for every active frame, innermost first.
    pub stack_trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.stack_trace {
            write!(f, "\n  at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

pub type VmResult<T> = Result<T, RuntimeError>;

/// An instruction failure before it is turned into a [`RuntimeError`].
#[derive(Debug)]
struct Fault {
    code: ErrorCode,
    detail: Option<String>,
}

impl From<ErrorCode> for Fault {
    fn from(code: ErrorCode) -> Self {
        Fault { code, detail: None }
    }
}

fn fault(code: ErrorCode, detail: impl Into<String>) -> Fault {
    Fault {
        code,
        detail: Some(detail.into()),
    }
}

type Step<T = ()> = Result<T, Fault>;

/// The result of running a module body.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    /// What the module body returned.
    pub value: Value,
    /// The sealed export table, when the module exports anything.
    pub exports: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// CallFrame
// ─────────────────────────────────────────────────────────────────────────────

/// One active call on the call stack.
struct CallFrame {
    closure: Ref<ClosureObject>,
    /// Offset of the next instruction.
    ip: usize,
    /// Offset of the instruction being executed, for error positions.
    op_start: usize,
    /// Absolute stack index of the `this` slot.
    base: usize,
    /// Stack base to restore on return.
    caller_base: usize,
}

impl CallFrame {
    fn proto(&self) -> &FunctionPrototype {
        &self.closure.proto
    }

    fn position(&self) -> (u32, u32) {
        self.proto().chunk.position_at(self.op_start).unwrap_or((0, 0))
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy)]
struct Instr {
    op: OpCode,
    operands: [u32; 3],
}

impl Instr {
    fn a(&self) -> u32 {
        self.operands[0]
    }

    fn b(&self) -> u32 {
        self.operands[1]
    }

    fn c(&self) -> u32 {
        self.operands[2]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vm
// ─────────────────────────────────────────────────────────────────────────────

pub struct Vm {
    engine: Engine,
    config: VmConfig,
    stack: ExecutionStack,
    frames: Vec<CallFrame>,
    /// Root table: builtins and host globals.
    globals: Ref<TableObject>,
    /// Full error raised by a nested run, kept while its code propagates.
    pending_error: Option<RuntimeError>,
    exports: Option<Value>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("frames", &self.frames.len())
            .field("stack", &self.stack.get_absolute_top())
            .finish()
    }
}

impl Vm {
    pub fn new(engine: Engine, config: VmConfig) -> Self {
        let stack = if config.fixed_stack {
            ExecutionStack::fixed(config.stack_size)
        } else {
            ExecutionStack::new(config.stack_size)
        };
        let globals = Ref::new(&engine, TableObject::new());
        debug!(
            stack_size = config.stack_size,
            fixed = config.fixed_stack,
            "created vm"
        );
        let mut vm = Vm {
            engine,
            config,
            stack,
            frames: Vec::new(),
            globals,
            pending_error: None,
            exports: None,
        };
        if let Err(code) = builtins::register_all(&mut vm) {
            warn!(%code, "failed to register builtins");
        }
        vm
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    /// The root table as a value.
    pub fn globals(&self) -> Value {
        Value::Table(self.globals.clone())
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> OpResult<()> {
        self.globals.set(Value::string(&self.engine, name), value)
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get_str(name)
    }

    pub fn register_native(&mut self, name: &str, func: NativeFn) -> OpResult<()> {
        self.set_global(name, Value::NativeFunction(func))
    }

    /// Register any callable (typically from [`crate::native::wrap_fn`]).
    pub fn register_closure(&mut self, name: &str, closure: Value) -> OpResult<()> {
        if !closure.is_callable() {
            return Err(ErrorCode::InvalidType);
        }
        self.set_global(name, closure)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a module body and return what it returned.
    #[instrument(skip_all, fields(module = %proto.source_name))]
    pub fn run(&mut self, proto: &FunctionPrototype) -> VmResult<Value> {
        self.run_module(proto).map(|out| out.value)
    }

    /// Run a module body, also collecting its export table.
    pub fn run_module(&mut self, proto: &FunctionPrototype) -> VmResult<ModuleOutput> {
        self.exports = None;
        let closure = Ref::new(
            &self.engine,
            ClosureObject {
                proto: Rc::new(proto.clone()),
                captures: Vec::new(),
                defaults: Vec::new(),
            },
        );
        debug!(source = %proto.source_name, "running module");
        let value = self.call(&Value::Closure(closure), Value::Null, &[])?;
        Ok(ModuleOutput {
            value,
            exports: self.exports.take(),
        })
    }

    /// Call any callable with an explicit receiver.
    pub fn call(&mut self, callee: &Value, this: Value, args: &[Value]) -> VmResult<Value> {
        self.pending_error = None;
        self.invoke(callee, this, args)
            .map_err(|fault| self.raise(fault))
    }

    /// Re-entrant call for natives. The full error stays available through
    /// [`Vm::take_error`] while its code propagates.
    pub fn call_value(&mut self, callee: &Value, this: Value, args: &[Value]) -> OpResult<Value> {
        self.invoke(callee, this, args).map_err(|fault| {
            let code = fault.code;
            let err = self.raise(fault);
            self.pending_error = Some(err);
            code
        })
    }

    /// Call a meta-method, dropping trailing arguments the closure does not
    /// declare.
    pub fn call_meta(&mut self, method: &Value, this: Value, args: &[Value]) -> OpResult<Value> {
        self.call_value(method, this, meta_args(method, args))
    }

    /// The error behind the last failed [`Vm::call_value`], if any.
    pub fn take_error(&mut self) -> Option<RuntimeError> {
        self.pending_error.take()
    }

    /// `tostring` semantics: `__tostring` on the delegate, else the display
    /// form.
    pub fn to_display(&mut self, value: &Value) -> OpResult<String> {
        if let Some(delegate) = delegate_of(value) {
            if let Some(method) = lookup_meta(&delegate, MetaMethod::Tostring) {
                let out = self.call_meta(&method, value.clone(), &[delegate])?;
                return Ok(out.to_string());
            }
        }
        Ok(value.to_string())
    }

    /// `typeof` semantics: `__typeof` on the delegate, else the type name.
    pub fn type_name_of(&mut self, value: &Value) -> OpResult<String> {
        if let Some(delegate) = delegate_of(value) {
            if let Some(method) = lookup_meta(&delegate, MetaMethod::Typeof) {
                let out = self.call_meta(&method, value.clone(), &[delegate])?;
                return Ok(out.to_string());
            }
        }
        Ok(value.type_name().to_string())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Push a call, run it to completion and pop its result.
    fn invoke(&mut self, callee: &Value, this: Value, args: &[Value]) -> Step<Value> {
        let saved_base = self.stack.get_stack_base();
        let callee_idx = self.stack.get_absolute_top();
        let depth = self.frames.len();

        let result = self.invoke_at(callee_idx, depth, callee, this, args);
        if result.is_err() {
            self.stack.truncate(callee_idx);
        }
        self.stack.set_stack_base(saved_base.min(self.stack.get_absolute_top()))?;
        result
    }

    fn invoke_at(
        &mut self,
        callee_idx: usize,
        depth: usize,
        callee: &Value,
        this: Value,
        args: &[Value],
    ) -> Step<Value> {
        self.stack.push(callee.clone())?;
        self.stack.push(this)?;
        for arg in args {
            self.stack.push(arg.clone())?;
        }
        self.call_at(callee_idx, args.len())?;
        if self.frames.len() > depth {
            if let Err(err) = self.execute(depth) {
                let code = err.code;
                self.pending_error = Some(err);
                return Err(code.into());
            }
        }
        let result = self.stack.absolute(callee_idx)?.clone();
        self.stack.truncate(callee_idx);
        Ok(result)
    }

    /// Start the call whose callee sits at `callee_idx`, followed by `this`
    /// and `argc` arguments. Script callees get a new frame; everything else
    /// completes immediately and leaves its result in the callee slot.
    fn call_at(&mut self, callee_idx: usize, argc: usize) -> Step {
        let callee = self.stack.absolute(callee_idx)?.clone();
        match callee {
            Value::Closure(closure) => self.enter_closure(closure, callee_idx, argc),
            Value::NativeFunction(func) => self.invoke_native(callee_idx, argc, &func, &[]),
            Value::NativeClosure(native) => {
                let func = native.func();
                let bound = native.bound().to_vec();
                self.invoke_native(callee_idx, argc, &*func, &bound)
            }
            Value::Struct(schema) => self.construct(schema, callee_idx, argc),
            Value::Table(_) | Value::UserData(_) | Value::StructInstance(_) => {
                let method = delegate_of(&callee)
                    .and_then(|d| lookup_meta(&d, MetaMethod::Call))
                    .filter(|m| {
                        matches!(
                            m,
                            Value::Closure(_) | Value::NativeClosure(_) | Value::NativeFunction(_)
                        )
                    })
                    .ok_or_else(|| {
                        fault(
                            ErrorCode::CallError,
                            format!("a {} value without `__call` is not callable", callee.type_name()),
                        )
                    })?;
                *self.stack.absolute_mut(callee_idx)? = method;
                *self.stack.absolute_mut(callee_idx + 1)? = callee;
                self.call_at(callee_idx, argc)
            }
            other => Err(fault(
                ErrorCode::CallError,
                format!("a {} value is not callable", other.type_name()),
            )),
        }
    }

    fn enter_closure(&mut self, closure: Ref<ClosureObject>, callee_idx: usize, argc: usize) -> Step {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(fault(ErrorCode::StackError, "call depth exceeded"));
        }
        let arity = closure.arity();
        if argc > arity || argc < closure.min_arity() {
            return Err(fault(
                ErrorCode::InvalidParameterCount,
                format!(
                    "`{}` expects {} argument(s), got {argc}",
                    closure.proto.name, arity
                ),
            ));
        }
        let first_default = arity - closure.defaults.len();
        for i in argc..arity {
            let value = closure
                .defaults
                .get(i - first_default)
                .cloned()
                .unwrap_or(Value::Null);
            self.stack.push(value)?;
        }

        let base = callee_idx + 1;
        let caller_base = self.stack.get_stack_base();
        self.stack.set_stack_base(base)?;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            op_start: 0,
            base,
            caller_base,
        });
        Ok(())
    }

    fn invoke_native(
        &mut self,
        callee_idx: usize,
        argc: usize,
        func: &dyn Fn(&mut NativeCall<'_>) -> OpResult<Option<Value>>,
        bound: &[Value],
    ) -> Step {
        let saved_base = self.stack.get_stack_base();
        let base = callee_idx + 1;
        self.stack.set_stack_base(base)?;
        let result = {
            let mut call = NativeCall::new(self, base, argc, bound);
            func(&mut call)
        };
        self.stack.truncate(callee_idx);
        self.stack.set_stack_base(saved_base.min(callee_idx))?;
        match result {
            Ok(value) => {
                self.pending_error = None;
                self.stack.push(value.unwrap_or(Value::Null))?;
                Ok(())
            }
            Err(code) => Err(code.into()),
        }
    }

    /// Instantiate `schema`: resolve a constructor, run it against the fresh
    /// instance, then seal const members.
    fn construct(&mut self, schema: Ref<StructObject>, callee_idx: usize, argc: usize) -> Step {
        let start = callee_idx + 2;
        let args: SmallVec<[Value; 4]> = self
            .stack
            .view_range(start..start + argc)?
            .iter()
            .cloned()
            .collect();
        let ctor = schema.resolve_constructor(&args).map_err(|code| {
            fault(
                code,
                format!("no constructor of `{}` accepts these {argc} argument(s)", schema.name()),
            )
        })?;
        debug!(schema = %schema.name(), argc, has_body = ctor.is_some(), "creating instance");

        let instance = StructObject::instantiate(&schema);
        // The instance may have escaped the constructor, so it is sealed
        // whether or not the body completed.
        let outcome = match ctor {
            Some(ctor) => self.invoke(&ctor, Value::StructInstance(instance.clone()), &args).map(drop),
            None => Ok(()),
        };
        instance.mark_initialized();
        outcome?;
        self.stack.truncate(callee_idx);
        self.stack.push(Value::StructInstance(instance))?;
        Ok(())
    }

    fn meta_call(&mut self, method: &Value, this: Value, args: &[Value]) -> Step<Value> {
        self.invoke(method, this, meta_args(method, args))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Main dispatch loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Run until the frame stack shrinks back to `stop_depth`.
    fn execute(&mut self, stop_depth: usize) -> VmResult<()> {
        while self.frames.len() > stop_depth {
            if let Err(fault) = self.step() {
                let err = self.raise(fault);
                self.unwind(stop_depth);
                return Err(err);
            }
        }
        Ok(())
    }

    fn unwind(&mut self, stop_depth: usize) {
        if let Some(frame) = self.frames.get(stop_depth) {
            let callee_idx = frame.base - 1;
            let caller_base = frame.caller_base;
            self.frames.truncate(stop_depth);
            self.stack.truncate(callee_idx);
            self.stack.restore_base(caller_base);
        }
    }

    fn raise(&mut self, fault: Fault) -> RuntimeError {
        match self.pending_error.take() {
            Some(err) if err.code == fault.code && fault.detail.is_none() => err,
            _ => {
                let err = self.build_error(&fault);
                warn!(code = %err.code, line = err.line, column = err.column, "{}", err.message);
                err
            }
        }
    }

    fn build_error(&self, fault: &Fault) -> RuntimeError {
        let message = match (&fault.detail, fault.code) {
            (Some(detail), code) => format!("{code}: {detail}"),
            (None, ErrorCode::StackError) => "stack is full".to_string(),
            (None, code) => code.to_string(),
        };
        let stack_trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let (line, column) = frame.position();
                format!("{}:{line}:{column}", frame.proto().name)
            })
            .collect();
        let (line, column) = self.frames.last().map(CallFrame::position).unwrap_or((0, 0));
        RuntimeError {
            code: fault.code,
            message,
            line,
            column,
            stack_trace,
        }
    }

    fn fetch(&mut self) -> Step<Instr> {
        let frame = self.frames.last_mut().ok_or(ErrorCode::StackError)?;
        let start = frame.ip;
        let code = &frame.closure.proto.chunk.code;
        let byte = *code.get(start).ok_or(ErrorCode::MemoryError)?;
        let op = OpCode::try_from(byte)
            .map_err(|b| fault(ErrorCode::MemoryError, format!("invalid opcode {b:#04x}")))?;
        let mut operands = [0u32; 3];
        let mut at = start + 1;
        for (slot, operand) in operands.iter_mut().zip(op.operands()) {
            let width = operand.width();
            let bytes = code.get(at..at + width).ok_or(ErrorCode::MemoryError)?;
            *slot = bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            at += width;
        }
        frame.op_start = start;
        frame.ip = at;
        Ok(Instr { op, operands })
    }

    fn step(&mut self) -> Step {
        let instr = self.fetch()?;
        trace!(op = ?instr.op, depth = self.frames.len(), top = self.stack.get_absolute_top());

        match instr.op {
            // ── Constants ────────────────────────────────────────────────────
            OpCode::Const => {
                let value = match self.proto()?.chunk.constants.get(instr.a() as usize) {
                    Some(Constant::Null) => Value::Null,
                    Some(Constant::Bool(b)) => Value::Bool(*b),
                    Some(Constant::Int(n)) => Value::Integer(*n),
                    Some(Constant::Float(f)) => Value::Float(*f),
                    Some(Constant::Str(s)) => Value::string(&self.engine, s),
                    None => return Err(ErrorCode::MemoryError.into()),
                };
                self.push(value)?;
            }
            OpCode::Null => self.push(Value::Null)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Int0 => self.push(Value::Integer(0))?,
            OpCode::Int1 => self.push(Value::Integer(1))?,

            // ── Stack ────────────────────────────────────────────────────────
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::PopN => self.stack.pop_n(instr.a() as usize)?,
            OpCode::Dup => {
                let top = self.stack.top()?.clone();
                self.push(top)?;
            }
            OpCode::Dup2 => {
                let a = self.stack.get(-2)?.clone();
                let b = self.stack.get(-1)?.clone();
                self.push(a)?;
                self.push(b)?;
            }
            OpCode::Insert => {
                let value = self.pop()?;
                self.stack.insert_below(instr.a() as usize, value)?;
            }

            // ── Locals and captures ──────────────────────────────────────────
            OpCode::LoadLocal => {
                let index = self.frame_base()? + instr.a() as usize;
                let value = match self.stack.absolute(index)? {
                    Value::Capture(cell) => cell.get(),
                    other => other.clone(),
                };
                self.push(value)?;
            }
            OpCode::StoreLocal => {
                let value = self.pop()?;
                let index = self.frame_base()? + instr.a() as usize;
                let old = match self.stack.absolute_mut(index)? {
                    Value::Capture(cell) => {
                        cell.set(value);
                        None
                    }
                    slot => Some(std::mem::replace(slot, value)),
                };
                drop(old);
            }
            OpCode::LoadCapture => {
                let cell = self.capture(instr.a())?;
                self.push(cell.get())?;
            }
            OpCode::StoreCapture => {
                let value = self.pop()?;
                self.capture(instr.a())?.set(value);
            }
            OpCode::LoadGlobal => {
                let name = self.name(instr.a())?;
                let value = self
                    .globals
                    .get_str(&name)
                    .ok_or_else(|| fault(ErrorCode::Inaccessible, format!("`{name}` is not defined")))?;
                self.push(value)?;
            }
            OpCode::CheckType => {
                let mask = TypeMask::from_bits(instr.a());
                let value = self.stack.top()?;
                if !mask.accepts(value) {
                    return Err(fault(
                        ErrorCode::InvalidTypeAssignment,
                        format!("a {} value does not match the declared type", value.type_name()),
                    ));
                }
            }
            OpCode::CheckParam => {
                let slot = instr.a() as usize;
                let mask = TypeMask::from_bits(instr.b());
                let value = self.stack.absolute(self.frame_base()? + slot)?;
                if !mask.accepts(value) {
                    let type_name = value.type_name();
                    let proto = self.proto()?;
                    let name = slot
                        .checked_sub(1)
                        .and_then(|i| proto.parameter_names.get(i))
                        .map(String::as_str)
                        .unwrap_or("?");
                    return Err(fault(
                        ErrorCode::InvalidParameters,
                        format!("parameter `{name}` does not accept a {type_name} value"),
                    ));
                }
            }
            OpCode::Export => {
                let name = self.name(instr.a())?;
                let value = self.pop()?;
                let slot = self
                    .proto()?
                    .export_slot
                    .ok_or_else(|| fault(ErrorCode::InvalidOperation, "module has no export table"))?;
                let table = self.stack.absolute(self.frame_base()? + slot as usize)?.clone();
                let Value::Table(table) = table else {
                    return Err(ErrorCode::InvalidType.into());
                };
                if table.get_str(&name).is_some() {
                    return Err(fault(ErrorCode::AlreadyExists, format!("`{name}` is already exported")));
                }
                table.set(Value::string(&self.engine, &name), value)?;
            }

            // ── Arithmetic ───────────────────────────────────────────────────
            OpCode::Add => self.binary_op(ArithOp::Add)?,
            OpCode::Sub => self.binary_op(ArithOp::Sub)?,
            OpCode::Mul => self.binary_op(ArithOp::Mul)?,
            OpCode::Div => self.binary_op(ArithOp::Div)?,
            OpCode::Mod => self.binary_op(ArithOp::Mod)?,
            OpCode::Exp => self.binary_op(ArithOp::Exp)?,
            OpCode::BitOr => self.binary_op(ArithOp::BitOr)?,
            OpCode::BitAnd => self.binary_op(ArithOp::BitAnd)?,
            OpCode::BitXor => self.binary_op(ArithOp::BitXor)?,
            OpCode::Shl => self.binary_op(ArithOp::Shl)?,
            OpCode::Shr => self.binary_op(ArithOp::Shr)?,
            OpCode::Neg => {
                let value = self.pop()?;
                let result = match arith::negate(&value).map_err(|c| unary_fault(c, "-", &value))? {
                    Dispatch::Value(v) => v,
                    Dispatch::Meta { method, delegate, .. } => self.meta_call(&method, value, &[delegate])?,
                };
                self.push(result)?;
            }
            OpCode::BitNot => {
                let value = self.pop()?;
                let result = arith::bit_not(&value).map_err(|c| unary_fault(c, "~", &value))?;
                self.push(result)?;
            }
            OpCode::Step => {
                let op = IncrOp::from_byte(instr.a() as u8).ok_or(ErrorCode::MemoryError)?;
                let value = self.pop()?;
                let symbol = if op.delta() > 0 { "++" } else { "--" };
                let result = match arith::step(op, &value).map_err(|c| unary_fault(c, symbol, &value))? {
                    Dispatch::Value(v) => v,
                    Dispatch::Meta { method, delegate, .. } => self.meta_call(&method, value, &[delegate])?,
                };
                self.push(result)?;
            }

            // ── Comparison ───────────────────────────────────────────────────
            OpCode::Eq => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::Bool(lhs == rhs))?;
            }
            OpCode::Ne => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::Bool(lhs != rhs))?;
            }
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => self.compare_op(instr.op)?,

            // ── Logic ────────────────────────────────────────────────────────
            OpCode::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            OpCode::And => {
                if self.stack.top()?.is_truthy() {
                    self.pop()?;
                } else {
                    self.jump(instr.a())?;
                }
            }
            OpCode::Or => {
                if self.stack.top()?.is_truthy() {
                    self.jump(instr.a())?;
                } else {
                    self.pop()?;
                }
            }

            // ── Jumps ────────────────────────────────────────────────────────
            OpCode::Jump | OpCode::Loop => self.jump(instr.a())?,
            OpCode::JumpIfFalse => {
                if !self.pop()?.is_truthy() {
                    self.jump(instr.a())?;
                }
            }

            // ── Calls ────────────────────────────────────────────────────────
            OpCode::Call => {
                let argc = instr.a() as usize;
                let callee_idx = self
                    .stack
                    .get_absolute_top()
                    .checked_sub(argc + 2)
                    .ok_or(ErrorCode::StackError)?;
                self.call_at(callee_idx, argc)?;
            }
            OpCode::CallMethod => {
                let name = self.name(instr.a())?;
                let argc = instr.b() as usize;
                let receiver_idx = self
                    .stack
                    .get_absolute_top()
                    .checked_sub(argc + 1)
                    .ok_or(ErrorCode::StackError)?;
                let receiver = self.stack.absolute(receiver_idx)?.clone();
                let method = self.resolve_method(&receiver, &name)?;
                self.stack.insert_below(argc + 1, method)?;
                self.call_at(receiver_idx, argc)?;
            }
            OpCode::Return => self.return_from_frame()?,

            // ── Closures ─────────────────────────────────────────────────────
            OpCode::Closure => self.bind_closure(instr.a() as usize)?,

            // ── Collections ──────────────────────────────────────────────────
            OpCode::NewArray => {
                let items = self.take_top(instr.a() as usize)?;
                self.push(Value::array(&self.engine, items))?;
            }
            OpCode::NewTable => {
                let flat = self.take_top(2 * instr.a() as usize)?;
                let table = TableObject::new();
                let mut iter = flat.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    table
                        .set(key, value)
                        .map_err(|c| fault(c, "table keys cannot be null"))?;
                }
                self.push(Value::Table(Ref::new(&self.engine, table)))?;
            }

            // ── Field / index ────────────────────────────────────────────────
            OpCode::GetField => {
                let name = self.name(instr.a())?;
                let object = self.pop()?;
                let key = Value::string(&self.engine, &name);
                let value = self.get_member(&object, key)?;
                self.push(value)?;
            }
            OpCode::SetField => {
                let name = self.name(instr.a())?;
                let value = self.pop()?;
                let object = self.pop()?;
                let key = Value::string(&self.engine, &name);
                self.set_member(&object, key, value.clone())?;
                self.push(value)?;
            }
            OpCode::GetIndex => {
                let key = self.pop()?;
                let object = self.pop()?;
                let value = self.get_member(&object, key)?;
                self.push(value)?;
            }
            OpCode::SetIndex => {
                let value = self.pop()?;
                let key = self.pop()?;
                let object = self.pop()?;
                self.set_member(&object, key, value.clone())?;
                self.push(value)?;
            }

            // ── Struct declarations ──────────────────────────────────────────
            OpCode::NewStruct => {
                let name = self.name(instr.a())?;
                let schema = Ref::new(&self.engine, StructObject::new(&name));
                self.push(Value::Struct(schema))?;
            }
            OpCode::StructMember => {
                let name = self.name(instr.a())?;
                let flags = MemberFlags::from_byte(instr.b() as u8);
                let mask = TypeMask::from_bits(instr.c());
                let value = self.pop()?;
                let schema = self.schema_on_top()?;
                let added = if flags.is_static {
                    schema.add_static(&name, value, mask, flags.is_private, flags.is_const)
                } else {
                    schema.add_member(&name, value, mask, flags.is_private, flags.is_const)
                };
                added.map_err(|c| fault(c, format!("cannot declare member `{name}` of `{}`", schema.name())))?;
            }
            OpCode::StructMethod => {
                let name = self.name(instr.a())?;
                let flags = MemberFlags::from_byte(instr.b() as u8);
                let closure = self.pop()?;
                let schema = self.schema_on_top()?;
                schema
                    .add_method(&name, closure, flags)
                    .map_err(|c| fault(c, format!("cannot declare method `{name}` of `{}`", schema.name())))?;
            }
            OpCode::StructConstructor => {
                let closure = self.pop()?;
                let schema = self.schema_on_top()?;
                schema
                    .add_constructor(closure)
                    .map_err(|c| fault(c, format!("invalid constructor for `{}`", schema.name())))?;
            }
            OpCode::StructDefaultConstructor => {
                let schema = self.schema_on_top()?;
                schema
                    .set_default_constructor()
                    .map_err(|c| fault(c, format!("invalid default constructor for `{}`", schema.name())))?;
            }

            OpCode::Nop => {}
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Instruction helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn return_from_frame(&mut self) -> Step {
        let result = self.pop()?;
        let frame = self.frames.pop().ok_or(ErrorCode::StackError)?;
        if let Some(slot) = frame.proto().export_slot {
            if let Ok(Value::Table(table)) = self.stack.absolute(frame.base + slot as usize) {
                table.seal();
                self.exports = Some(Value::Table(table.clone()));
            }
        }
        let callee_idx = frame.base - 1;
        self.stack.truncate(callee_idx);
        self.stack.set_stack_base(frame.caller_base.min(callee_idx))?;
        self.push(result)
    }

    fn bind_closure(&mut self, index: usize) -> Step {
        let proto = self.proto()?;
        let child = proto
            .functions
            .get(index)
            .cloned()
            .ok_or_else(|| fault(ErrorCode::MemoryError, format!("missing function prototype {index}")))?;
        let defaults = self.take_top(child.default_count as usize)?;

        let base = self.frame_base()?;
        let mut captures = Vec::with_capacity(child.captures.len());
        for desc in &child.captures {
            let cell = match desc.kind {
                CaptureKind::OuterLocal => self.capture_slot(base + desc.index as usize)?,
                CaptureKind::OuterCapture => self.capture(desc.index)?,
            };
            captures.push(cell);
        }
        debug!(function = %child.name, captures = captures.len(), "bound closure");
        let closure = ClosureObject {
            proto: child,
            captures,
            defaults,
        };
        self.push(Value::Closure(Ref::new(&self.engine, closure)))
    }

    /// Move the value in an escaping slot into a capture cell, once.
    fn capture_slot(&mut self, index: usize) -> Step<Ref<CaptureCell>> {
        let engine = self.engine.clone();
        let slot = self.stack.absolute_mut(index)?;
        if let Value::Capture(cell) = slot {
            return Ok(cell.clone());
        }
        let cell = Ref::new(&engine, CaptureCell::new(std::mem::replace(slot, Value::Null)));
        *slot = Value::Capture(cell.clone());
        Ok(cell)
    }

    fn binary_op(&mut self, op: ArithOp) -> Step {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let dispatch = arith::binary(&self.engine, op, &lhs, &rhs).map_err(|code| {
            let detail = match code {
                ErrorCode::DivisionByZero => "division by zero".to_string(),
                ErrorCode::OutOfMemory => format!("`{}` result exceeds {} bytes", op.symbol(), arith::MAX_STRING_LEN),
                _ => format!(
                    "cannot apply `{}` to {} and {}",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                ),
            };
            fault(code, detail)
        })?;
        let result = match dispatch {
            Dispatch::Value(v) => v,
            Dispatch::Meta {
                method,
                delegate,
                reversed: false,
            } => self.meta_call(&method, lhs, &[rhs, delegate])?,
            Dispatch::Meta {
                method,
                delegate,
                reversed: true,
            } => self.meta_call(&method, rhs, &[lhs, delegate])?,
        };
        self.push(result)
    }

    fn compare_op(&mut self, op: OpCode) -> Step {
        use std::cmp::Ordering;

        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let comparison = arith::compare(&lhs, &rhs).map_err(|code| {
            fault(
                code,
                format!("cannot compare {} with {}", lhs.type_name(), rhs.type_name()),
            )
        })?;
        let ordering = match comparison {
            Comparison::Ordered(o) => Some(o),
            Comparison::Unordered => None,
            Comparison::Meta { method, delegate } => {
                let out = self.meta_call(&method, lhs, &[rhs, delegate])?;
                let n = out
                    .get_integer()
                    .map_err(|_| fault(ErrorCode::InvalidType, "`__compare` must return an integer"))?;
                Some(n.cmp(&0))
            }
        };
        let result = match (op, ordering) {
            (_, None) => false,
            (OpCode::Lt, Some(o)) => o == Ordering::Less,
            (OpCode::Le, Some(o)) => o != Ordering::Greater,
            (OpCode::Gt, Some(o)) => o == Ordering::Greater,
            (_, Some(o)) => o != Ordering::Less,
        };
        self.push(Value::Bool(result))
    }

    /// Find `name` for `receiver.name(...)`.
    fn resolve_method(&mut self, receiver: &Value, name: &str) -> Step<Value> {
        let found = match receiver {
            Value::Table(table) => table
                .get_str(name)
                .or_else(|| {
                    let key = Value::string(&self.engine, name);
                    table.delegate().and_then(|d| delegate_lookup(&d, &key))
                })
                .or_else(|| builtins::type_method(receiver, name).map(Value::NativeFunction)),
            Value::StructInstance(instance) => {
                let private = self.can_access_private(instance.schema());
                Some(instance.get(name, private).map_err(|c| member_fault(c, name, receiver))?)
            }
            Value::Struct(schema) => {
                let private = self.can_access_private(schema);
                Some(schema.get_static(name, private).map_err(|c| member_fault(c, name, receiver))?)
            }
            Value::UserData(data) => {
                let key = Value::string(&self.engine, name);
                data.delegate().and_then(|d| delegate_lookup(&d, &key))
            }
            _ => builtins::type_method(receiver, name).map(Value::NativeFunction),
        };
        found.ok_or_else(|| {
            fault(
                ErrorCode::NotFound,
                format!("no method `{name}` on a {} value", receiver.type_name()),
            )
        })
    }

    /// `object.key` / `object[key]`.
    fn get_member(&mut self, object: &Value, key: Value) -> Step<Value> {
        match object {
            Value::Table(table) => {
                if let Some(value) = table.get(&key) {
                    return Ok(value);
                }
                let Some(delegate) = table.delegate() else {
                    return Ok(Value::Null);
                };
                if let Some(getter) = lookup_meta(&delegate, MetaMethod::Get) {
                    return self.meta_call(&getter, object.clone(), &[key, delegate]);
                }
                Ok(delegate_lookup(&delegate, &key).unwrap_or(Value::Null))
            }
            Value::Array(array) => {
                let index = index_of(&key)?;
                array.get(index).ok_or_else(|| {
                    fault(
                        ErrorCode::OutOfBounds,
                        format!("index {index} is out of bounds for length {}", array.len()),
                    )
                })
            }
            Value::StructInstance(instance) => {
                let name = key_name(&key)?;
                let private = self.can_access_private(instance.schema());
                instance
                    .get(&name, private)
                    .map_err(|c| member_fault(c, &name, object))
            }
            Value::Struct(schema) => {
                let name = key_name(&key)?;
                let private = self.can_access_private(schema);
                schema
                    .get_static(&name, private)
                    .map_err(|c| member_fault(c, &name, object))
            }
            Value::UserData(data) => {
                let Some(delegate) = data.delegate() else {
                    return Ok(Value::Null);
                };
                if let Some(getter) = lookup_meta(&delegate, MetaMethod::Get) {
                    return self.meta_call(&getter, object.clone(), &[key, delegate]);
                }
                Ok(delegate_lookup(&delegate, &key).unwrap_or(Value::Null))
            }
            other if other.is_string() => {
                let index = index_of(&key)?;
                let text = other.get_string()?;
                let ch = text.chars().nth(index).ok_or_else(|| {
                    fault(
                        ErrorCode::OutOfBounds,
                        format!("index {index} is out of bounds for a string of {} characters", text.chars().count()),
                    )
                })?;
                let mut buf = [0u8; 4];
                Ok(Value::string(&self.engine, ch.encode_utf8(&mut buf)))
            }
            other => Err(fault(
                ErrorCode::InvalidOperation,
                format!("cannot read `{key}` from a {} value", other.type_name()),
            )),
        }
    }

    /// `object.key = value` / `object[key] = value`.
    fn set_member(&mut self, object: &Value, key: Value, value: Value) -> Step {
        match object {
            Value::Table(table) => {
                if !table.contains(&key) {
                    let setter = table
                        .delegate()
                        .and_then(|d| lookup_meta(&d, MetaMethod::Set).map(|m| (m, d)));
                    if let Some((setter, delegate)) = setter {
                        self.meta_call(&setter, object.clone(), &[key, value, delegate])?;
                        return Ok(());
                    }
                }
                table.set(key, value).map_err(|code| match code {
                    ErrorCode::CantModifyExportTable => fault(code, "export tables are read-only"),
                    code => fault(code, "table keys cannot be null"),
                })
            }
            Value::Array(array) => {
                let index = index_of(&key)?;
                let len = array.len();
                array.set(index, value).map_err(|c| {
                    fault(c, format!("index {index} is out of bounds for length {len}"))
                })
            }
            Value::StructInstance(instance) => {
                let name = key_name(&key)?;
                let private = self.can_access_private(instance.schema());
                instance
                    .set(&name, value, private)
                    .map_err(|c| member_fault(c, &name, object))
            }
            Value::Struct(schema) => {
                let name = key_name(&key)?;
                let private = self.can_access_private(schema);
                schema
                    .set_static(&name, value, private)
                    .map_err(|c| member_fault(c, &name, object))
            }
            Value::UserData(data) => {
                let setter = data
                    .delegate()
                    .and_then(|d| lookup_meta(&d, MetaMethod::Set).map(|m| (m, d)))
                    .ok_or_else(|| fault(ErrorCode::InvalidOperation, "user data without `__set` is read-only"))?;
                let (setter, delegate) = setter;
                self.meta_call(&setter, object.clone(), &[key, value, delegate])?;
                Ok(())
            }
            other => Err(fault(
                ErrorCode::InvalidOperation,
                format!("cannot assign `{key}` on a {} value", other.type_name()),
            )),
        }
    }

    /// Private members are reachable from code whose `this` belongs to the
    /// same schema.
    fn can_access_private(&self, schema: &Ref<StructObject>) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };
        let this = match self.stack.absolute(frame.base) {
            Ok(Value::Capture(cell)) => cell.get(),
            Ok(value) => value.clone(),
            Err(_) => return false,
        };
        match this {
            Value::StructInstance(instance) => Ref::ptr_eq(instance.schema(), schema),
            Value::Struct(own) => Ref::ptr_eq(&own, schema),
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame and stack access
    // ─────────────────────────────────────────────────────────────────────────

    fn frame(&self) -> Step<&CallFrame> {
        self.frames.last().ok_or_else(|| ErrorCode::StackError.into())
    }

    fn frame_base(&self) -> Step<usize> {
        Ok(self.frame()?.base)
    }

    fn proto(&self) -> Step<Rc<FunctionPrototype>> {
        Ok(self.frame()?.closure.proto.clone())
    }

    fn name(&self, index: u32) -> Step<String> {
        let frame = self.frame()?;
        let index = u16::try_from(index).map_err(|_| ErrorCode::MemoryError)?;
        frame
            .proto()
            .chunk
            .str_at(index)
            .map(str::to_string)
            .ok_or_else(|| fault(ErrorCode::MemoryError, format!("constant {index} is not a name")))
    }

    fn capture(&self, index: u32) -> Step<Ref<CaptureCell>> {
        self.frame()?
            .closure
            .captures
            .get(index as usize)
            .cloned()
            .ok_or_else(|| fault(ErrorCode::MemoryError, format!("missing capture {index}")))
    }

    fn jump(&mut self, target: u32) -> Step {
        let frame = self.frames.last_mut().ok_or(ErrorCode::StackError)?;
        frame.ip = target as usize;
        Ok(())
    }

    fn schema_on_top(&self) -> Step<Ref<StructObject>> {
        match self.stack.top()? {
            Value::Struct(schema) => Ok(schema.clone()),
            _ => Err(ErrorCode::InvalidType.into()),
        }
    }

    fn push(&mut self, value: Value) -> Step {
        self.stack.push(value).map_err(Fault::from)
    }

    fn pop(&mut self) -> Step<Value> {
        self.stack.pop().map_err(Fault::from)
    }

    /// Pop the top `n` values, oldest first.
    fn take_top(&mut self, n: usize) -> Step<Vec<Value>> {
        let top = self.stack.get_absolute_top();
        let start = top.checked_sub(n).ok_or(ErrorCode::StackError)?;
        let items = self.stack.view_range(start..top)?.iter().cloned().collect();
        self.stack.pop_n(n)?;
        Ok(items)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Free helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Meta-methods may declare fewer parameters than the VM passes.
fn meta_args<'a>(method: &Value, args: &'a [Value]) -> &'a [Value] {
    match method {
        Value::Closure(c) => &args[..args.len().min(c.arity())],
        _ => args,
    }
}

/// Plain key lookup through a delegate chain.
fn delegate_lookup(delegate: &Value, key: &Value) -> Option<Value> {
    let mut current = delegate.clone();
    for _ in 0..MAX_DELEGATE_CHAIN {
        match &current {
            Value::Table(table) => {
                if let Some(found) = table.get(key) {
                    return Some(found);
                }
                current = table.delegate()?;
            }
            Value::Struct(schema) => {
                let name = key.str_ref()?;
                return schema.find_method(&name);
            }
            _ => return None,
        }
    }
    None
}

fn index_of(key: &Value) -> Step<usize> {
    let index = key
        .get_integer()
        .map_err(|_| fault(ErrorCode::InvalidType, format!("a {} value is not an index", key.type_name())))?;
    usize::try_from(index)
        .map_err(|_| fault(ErrorCode::OutOfBounds, format!("negative index {index}")))
}

fn key_name(key: &Value) -> Step<String> {
    key.str_ref()
        .map(|s| s.to_string())
        .ok_or_else(|| fault(ErrorCode::InvalidType, "member names must be strings"))
}

fn member_fault(code: ErrorCode, name: &str, object: &Value) -> Fault {
    let owner = match object {
        Value::StructInstance(instance) => instance.schema().name().to_string(),
        Value::Struct(schema) => schema.name().to_string(),
        other => other.type_name().to_string(),
    };
    let detail = match code {
        ErrorCode::Inaccessible => format!("field `{name}` doesn't exist on `{owner}`"),
        ErrorCode::InaccessiblePrivate => format!("`{name}` is private to `{owner}`"),
        ErrorCode::CantModifyConstMember => format!("`{owner}.{name}` is const"),
        ErrorCode::CantModifyStaticConst => format!("static `{owner}.{name}` is const"),
        ErrorCode::InvalidTypeAssignment => format!("`{owner}.{name}` does not accept this type"),
        _ => format!("`{owner}.{name}`"),
    };
    fault(code, detail)
}

fn unary_fault(code: ErrorCode, symbol: &str, value: &Value) -> Fault {
    fault(
        code,
        format!("cannot apply `{symbol}` to {}", value.type_name()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::lexer::lex;
    use crate::native::wrap_fn;
    use crate::parser::parse;

    fn compile_src(src: &str) -> FunctionPrototype {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "lex errors: {errors:?}");
        let program = parse(tokens).expect("parse");
        compile(&program, &CompileOptions::default()).expect("compile")
    }

    fn try_run(src: &str) -> VmResult<Value> {
        let mut vm = Vm::new(Engine::new(), VmConfig::default());
        vm.run(&compile_src(src))
    }

    fn run(src: &str) -> Value {
        try_run(src).expect("run")
    }

    fn run_err(src: &str) -> RuntimeError {
        try_run(src).expect_err("expected a runtime error")
    }

    #[test]
    fn test_arithmetic_and_locals() {
        assert_eq!(run("var a = 2; var b = 3; return a * b + 1;"), Value::Integer(7));
        assert_eq!(run("return 7 / 2.0;"), Value::Float(3.5));
        assert_eq!(run("var x = 1; x += 4; x *= 2; return x;"), Value::Integer(10));
    }

    #[test]
    fn test_struct_constructor_with_defaults() {
        let value = run(
            "struct P { constructor(a=0,b=0){this.a=a;this.b=b;} var a=0; var b=0; }; return P(1);",
        );
        let instance = value.as_instance().expect("instance");
        assert_eq!(instance.get("a", true), Ok(Value::Integer(1)));
        assert_eq!(instance.get("b", true), Ok(Value::Integer(0)));
        assert!(instance.is_initialized());
    }

    #[test]
    fn test_string_replace_method() {
        let value = run(r#"return "Alexandre".replace("x","Peter");"#);
        assert_eq!(value.to_string(), "AlePeterandre");
    }

    #[test]
    fn test_const_member_writable_only_during_construction() {
        let src = "struct S { const var k = 1; constructor(v) { this.k = v; } function update(v) { this.k = v; } };
                   var s = S(5);";
        assert_eq!(run(&format!("{src} return s.k;")), Value::Integer(5));
        let err = run_err(&format!("{src} s.update(6); return s.k;"));
        assert_eq!(err.code, ErrorCode::CantModifyConstMember);
    }

    #[test]
    fn test_failed_constructor_still_seals_instance() {
        let engine = Engine::new();
        let mut vm = Vm::new(engine.clone(), VmConfig::default());
        let escaped = Value::table(&engine);
        vm.set_global("g", escaped.clone()).unwrap();

        let src = "struct S { const var k = 1; constructor(v) { g.s = this; assert(false); } }; return S(1);";
        assert!(vm.run(&compile_src(src)).is_err());

        let leaked = escaped.as_table().unwrap().get_str("s").expect("instance stored before failure");
        let instance = leaked.as_instance().expect("instance");
        assert!(instance.is_initialized());
        assert_eq!(instance.set("k", Value::Integer(2), true), Err(ErrorCode::CantModifyConstMember));
        assert_eq!(instance.get("k", true), Ok(Value::Integer(1)));

        assert_eq!(vm.run(&compile_src("return g.s.k;")), Ok(Value::Integer(1)));
    }

    #[test]
    fn test_constructor_overloads() {
        let src = r#"struct V {
            constructor(int x) { this.kind = "int"; }
            constructor(string s) { this.kind = "string"; }
            var kind = null;
        };"#;
        assert_eq!(run(&format!("{src} return V(\"a\").kind;")).to_string(), "string");
        assert_eq!(run(&format!("{src} return V(3).kind;")).to_string(), "int");
        assert_eq!(run_err(&format!("{src} return V(1.5);")).code, ErrorCode::InvalidOperation);
        assert_eq!(run_err(&format!("{src} return V(1, 2);")).code, ErrorCode::InvalidParameterCount);
    }

    #[test]
    fn test_struct_without_constructors_rejects_arguments() {
        let err = run_err("struct E { var x = 1; }; return E(1);");
        assert_eq!(err.code, ErrorCode::InvalidParameterCount);
        assert!(run("struct E { var x = 1; }; return E();").as_instance().is_some());
    }

    #[test]
    fn test_private_members() {
        let src = "struct A { private var secret = 7; function reveal() { return this.secret; } };";
        assert_eq!(run(&format!("{src} return A().reveal();")), Value::Integer(7));
        assert_eq!(run_err(&format!("{src} return A().secret;")).code, ErrorCode::InaccessiblePrivate);
    }

    #[test]
    fn test_missing_field_is_inaccessible() {
        let err = run_err("struct A { var x = 1; }; var a = A(); a.y = 2;");
        assert_eq!(err.code, ErrorCode::Inaccessible);
        assert!(err.message.contains("doesn't exist"));
    }

    #[test]
    fn test_static_members() {
        let src = "struct C { static var count = 0; static const var LIMIT = 3; };";
        assert_eq!(run(&format!("{src} C.count = C.count + 2; return C.count;")), Value::Integer(2));
        assert_eq!(run_err(&format!("{src} C.LIMIT = 4;")).code, ErrorCode::CantModifyStaticConst);
    }

    #[test]
    fn test_closure_captures_survive_frame() {
        let value = run(
            "function counter() { var n = 0; return function() { n = n + 1; return n; }; }
             var c = counter(); c(); c(); return c();",
        );
        assert_eq!(value, Value::Integer(3));
    }

    #[test]
    fn test_nested_capture_chain() {
        let value = run(
            "function outer() { var x = 10; function mid() { return function() { return x + 1; }; } return mid()(); }
             return outer();",
        );
        assert_eq!(value, Value::Integer(11));
    }

    #[test]
    fn test_recursion() {
        let value = run(
            "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } return fib(10);",
        );
        assert_eq!(value, Value::Integer(55));
    }

    #[test]
    fn test_default_and_count_checks() {
        assert_eq!(run("function f(a, b = 5) { return a + b; } return f(1);"), Value::Integer(6));
        assert_eq!(run_err("function f(a) { return a; } return f();").code, ErrorCode::InvalidParameterCount);
        assert_eq!(run_err("function f(int a) { return a; } return f(\"s\");").code, ErrorCode::InvalidParameters);
    }

    #[test]
    fn test_typed_local_assignment() {
        assert_eq!(run_err("int x = 1; x = \"no\";").code, ErrorCode::InvalidTypeAssignment);
        assert_eq!(run("var<int, float> x = 1; x = 2.5; return x;"), Value::Float(2.5));
    }

    #[test]
    fn test_loops() {
        let value = run("var s = 0; for (var i = 0; i < 5; i++) { if (i == 3) continue; s += i; } return s;");
        assert_eq!(value, Value::Integer(7));
        let value = run("var i = 0; while (true) { i++; if (i >= 4) break; } return i;");
        assert_eq!(value, Value::Integer(4));
    }

    #[test]
    fn test_tables_arrays_and_increments() {
        assert_eq!(run("var t = { a = 1 }; t.a++; ++t.a; return t.a;"), Value::Integer(3));
        assert_eq!(run("var a = [1, 2, 3]; a[1] += 10; return a[1];"), Value::Integer(12));
        assert_eq!(run("var a = [5]; var old = a[0]++; return old * 10 + a[0];"), Value::Integer(56));
        assert_eq!(run("var t = {}; return t.missing;"), Value::Null);
        assert_eq!(run_err("var a = [1]; return a[3];").code, ErrorCode::OutOfBounds);
    }

    #[test]
    fn test_table_method_gets_receiver() {
        let value = run("var t = { n = 4, f = function(x) { return this.n * x; } }; return t.f(2);");
        assert_eq!(value, Value::Integer(8));
    }

    #[test]
    fn test_meta_methods() {
        let add = run(
            "var mt = { __add = function(rhs) { return 100 + rhs; } };
             var t = {}; set_delegate(t, mt); return t + 5;",
        );
        assert_eq!(add, Value::Integer(105));

        let reversed = run(
            "var mt = { __add = function(other) { return other * 10; } };
             var t = {}; set_delegate(t, mt); return 4 + t;",
        );
        assert_eq!(reversed, Value::Integer(40));

        let get = run(
            r#"var d = { __get = function(key) { return key + "!"; } };
               var t = {}; set_delegate(t, d); return t.missing;"#,
        );
        assert_eq!(get.to_string(), "missing!");

        let call = run(
            "var d = { __call = function(x) { return x * 3; } };
             var t = {}; set_delegate(t, d); return t(7);",
        );
        assert_eq!(call, Value::Integer(21));
    }

    #[test]
    fn test_iterator_walk() {
        let value = run(
            "var a = [1, 2, 3]; var it = a.begin(); var sum = 0;
             while (it.valid()) { sum += it.get(); it++; } return sum;",
        );
        assert_eq!(value, Value::Integer(6));
    }

    #[test]
    fn test_module_exports_are_sealed() {
        let proto = compile_src("export var x = 42; export function f() { return x; } return 1;");
        let mut vm = Vm::new(Engine::new(), VmConfig::default());
        let out = vm.run_module(&proto).expect("run");
        assert_eq!(out.value, Value::Integer(1));
        let exports = out.exports.expect("exports");
        let table = exports.as_table().expect("table");
        assert_eq!(table.get_str("x"), Some(Value::Integer(42)));
        let f = table.get_str("f").expect("f");
        assert_eq!(vm.call(&f, Value::Null, &[]), Ok(Value::Integer(42)));
        let key = Value::string(vm.engine(), "y");
        assert_eq!(table.set(key, Value::Integer(1)), Err(ErrorCode::CantModifyExportTable));
    }

    #[test]
    fn test_weak_reference_expires() {
        assert_eq!(run("var t = {}; var w = weak(t); t = null; return w.is_expired();"), Value::Bool(true));
        assert_eq!(run("var t = {}; var w = weak(t); return w.get() == t;"), Value::Bool(true));
    }

    #[test]
    fn test_host_closure() {
        let engine = Engine::new();
        let mut vm = Vm::new(engine.clone(), VmConfig::default());
        vm.register_closure("add", wrap_fn(&engine, "add", |a: i64, b: i64| a + b))
            .unwrap();
        assert_eq!(vm.run(&compile_src("return add(2, 3);")), Ok(Value::Integer(5)));
        let err = vm.run(&compile_src("return add(2);")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameterCount);
    }

    #[test]
    fn test_oversized_string_repeat_fails_cleanly() {
        let err = run_err(r#"return "ab" * 1000000000000;"#);
        assert_eq!(err.code, ErrorCode::OutOfMemory);
        assert_eq!(run(r#"return "ab" * 3;"#).to_string(), "ababab");
    }

    #[test]
    fn test_undefined_global() {
        let err = run_err("return nope;");
        assert_eq!(err.code, ErrorCode::Inaccessible);
        assert!(err.message.contains("`nope`"));
    }

    #[test]
    fn test_fixed_stack_overflow() {
        let config = VmConfig {
            stack_size: 16,
            fixed_stack: true,
            ..VmConfig::default()
        };
        let mut vm = Vm::new(Engine::new(), config);
        let err = vm
            .run(&compile_src("function f(n) { return f(n + 1); } return f(0);"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StackError);
        assert_eq!(err.message, "stack is full");
        assert_eq!(vm.stack().get_absolute_top(), 0);
    }

    #[test]
    fn test_call_depth_limit() {
        let config = VmConfig {
            max_call_depth: 32,
            ..VmConfig::default()
        };
        let mut vm = Vm::new(Engine::new(), config);
        let err = vm
            .run(&compile_src("function f() { return f(); } return f();"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StackError);
        assert_eq!(err.stack_trace.len(), 32);
    }

    #[test]
    fn test_runtime_error_trace() {
        let err = run_err("function boom() {\n  return 1 + null;\n}\nreturn boom();");
        assert_eq!(err.code, ErrorCode::InvalidOperation);
        assert_eq!(err.line, 2);
        assert_eq!(err.stack_trace.len(), 2);
        assert!(err.stack_trace[0].starts_with("boom:2:"));
        assert!(err.stack_trace[1].starts_with("<module>:4:"));
        let rendered = err.to_string();
        assert!(rendered.contains("\n  at boom:2:"));
    }

    #[test]
    fn test_vm_recovers_after_error() {
        let mut vm = Vm::new(Engine::new(), VmConfig::default());
        assert!(vm.run(&compile_src("return 1 + null;")).is_err());
        assert_eq!(vm.stack().get_absolute_top(), 0);
        assert_eq!(vm.run(&compile_src("return 2;")), Ok(Value::Integer(2)));
    }

    #[test]
    fn test_values_released_after_run() {
        let engine = Engine::new();
        {
            let mut vm = Vm::new(engine.clone(), VmConfig::default());
            let before = engine.live_objects();
            vm.run(&compile_src("var t = { a = [1, 2, 3] }; var s = \"a fairly long string value\"; return null;"))
                .unwrap();
            assert_eq!(engine.live_objects(), before);
        }
    }
}
