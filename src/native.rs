//! Native call protocol.
//!
//! A host function sees its call through a [`NativeCall`]: the receiver
//! (`this`), the argument window as a [`StackView`], the engine, and the VM
//! itself for re-entrant calls. It returns `Ok(Some(v))` to produce a value,
//! `Ok(None)` to produce nothing (the caller sees `null`), or an error code
//! that propagates as a runtime error.
//!
//! Typed host callbacks bind their arguments through [`FromArgs`], filled
//! positionally from the argument window; [`wrap_fn`] turns a plain Rust
//! closure into a native closure value.

use std::cell::Ref as CellRef;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::{ErrorCode, OpResult};
use crate::heap::Ref;
use crate::object::{NativeClosureFn, NativeClosureObject};
use crate::stack::StackView;
use crate::value::{FromValue, IntoValue, Value};
use crate::vm::Vm;

/// Plain native function pointer.
pub type NativeFn = fn(&mut NativeCall<'_>) -> OpResult<Option<Value>>;

/// View of one native invocation.
pub struct NativeCall<'a> {
    vm: &'a mut Vm,
    /// Absolute stack index of the `this` slot.
    base: usize,
    argc: usize,
    bound: &'a [Value],
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(vm: &'a mut Vm, base: usize, argc: usize, bound: &'a [Value]) -> Self {
        Self {
            vm,
            base,
            argc,
            bound,
        }
    }

    pub fn this(&self) -> OpResult<&Value> {
        self.vm.stack().absolute(self.base)
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    /// Argument `index`, `invalid_parameter_count` past the end.
    pub fn arg(&self, index: usize) -> OpResult<&Value> {
        if index >= self.argc {
            return Err(ErrorCode::InvalidParameterCount);
        }
        self.vm.stack().absolute(self.base + 1 + index)
    }

    /// Argument `index`, or `null` when not supplied.
    pub fn arg_or_null(&self, index: usize) -> Value {
        self.arg(index).cloned().unwrap_or(Value::Null)
    }

    pub fn args(&self) -> OpResult<StackView<'_>> {
        let start = self.base + 1;
        self.vm.stack().view_range(start..start + self.argc)
    }

    /// Values bound into the native closure being called.
    pub fn bound(&self) -> &[Value] {
        self.bound
    }

    pub fn engine(&self) -> &Engine {
        self.vm.engine()
    }

    pub fn vm(&mut self) -> &mut Vm {
        &mut *self.vm
    }

    /// Call a script or native callable from inside a native.
    pub fn call_value(&mut self, callee: &Value, this: Value, args: &[Value]) -> OpResult<Value> {
        self.vm.call_value(callee, this, args)
    }

    /// The receiver's host payload, checked against `T`.
    pub fn receiver<T: 'static>(&self) -> OpResult<CellRef<'_, T>> {
        match self.this()? {
            Value::UserData(u) if u.is::<T>() => u.borrow::<T>(),
            _ => Err(ErrorCode::InvalidType),
        }
    }

    /// Fill a typed argument tuple positionally.
    pub fn args_as<A: FromArgs>(&self) -> OpResult<A> {
        if self.argc != A::ARITY {
            return Err(ErrorCode::InvalidParameterCount);
        }
        let args = self.args()?;
        A::from_args(args.as_slice())
    }

    /// Convert a host value using the call's engine.
    pub fn value<T: IntoValue>(&self, value: T) -> Value {
        value.into_value(self.engine())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed arguments
// ─────────────────────────────────────────────────────────────────────────────

/// A tuple of host types filled from an argument window.
pub trait FromArgs: Sized {
    const ARITY: usize;

    /// `args.len()` must equal `ARITY`. The first slot that does not convert
    /// is `invalid_type`.
    fn from_args(args: &[Value]) -> OpResult<Self>;
}

fn slot<T: FromValue>(args: &[Value], index: usize) -> OpResult<T> {
    let value = args.get(index).ok_or(ErrorCode::InvalidParameterCount)?;
    T::from_value(value).map_err(|_| ErrorCode::InvalidType)
}

impl FromArgs for () {
    const ARITY: usize = 0;

    fn from_args(_args: &[Value]) -> OpResult<Self> {
        Ok(())
    }
}

impl<A: FromValue> FromArgs for (A,) {
    const ARITY: usize = 1;

    fn from_args(args: &[Value]) -> OpResult<Self> {
        Ok((slot(args, 0)?,))
    }
}

impl<A: FromValue, B: FromValue> FromArgs for (A, B) {
    const ARITY: usize = 2;

    fn from_args(args: &[Value]) -> OpResult<Self> {
        Ok((slot(args, 0)?, slot(args, 1)?))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue> FromArgs for (A, B, C) {
    const ARITY: usize = 3;

    fn from_args(args: &[Value]) -> OpResult<Self> {
        Ok((slot(args, 0)?, slot(args, 1)?, slot(args, 2)?))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue, D: FromValue> FromArgs for (A, B, C, D) {
    const ARITY: usize = 4;

    fn from_args(args: &[Value]) -> OpResult<Self> {
        Ok((slot(args, 0)?, slot(args, 1)?, slot(args, 2)?, slot(args, 3)?))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host function wrapping
// ─────────────────────────────────────────────────────────────────────────────

/// A Rust callable taking the unpacked tuple `Args`.
pub trait HostFn<Args>: 'static {
    type Output: IntoValue;

    fn invoke(&self, args: Args) -> Self::Output;
}

impl<F, R> HostFn<()> for F
where
    F: Fn() -> R + 'static,
    R: IntoValue,
{
    type Output = R;

    fn invoke(&self, _args: ()) -> R {
        self()
    }
}

impl<F, A, R> HostFn<(A,)> for F
where
    F: Fn(A) -> R + 'static,
    R: IntoValue,
{
    type Output = R;

    fn invoke(&self, (a,): (A,)) -> R {
        self(a)
    }
}

impl<F, A, B, R> HostFn<(A, B)> for F
where
    F: Fn(A, B) -> R + 'static,
    R: IntoValue,
{
    type Output = R;

    fn invoke(&self, (a, b): (A, B)) -> R {
        self(a, b)
    }
}

impl<F, A, B, C, R> HostFn<(A, B, C)> for F
where
    F: Fn(A, B, C) -> R + 'static,
    R: IntoValue,
{
    type Output = R;

    fn invoke(&self, (a, b, c): (A, B, C)) -> R {
        self(a, b, c)
    }
}

impl<F, A, B, C, D, R> HostFn<(A, B, C, D)> for F
where
    F: Fn(A, B, C, D) -> R + 'static,
    R: IntoValue,
{
    type Output = R;

    fn invoke(&self, (a, b, c, d): (A, B, C, D)) -> R {
        self(a, b, c, d)
    }
}

/// Wrap a typed Rust closure as a native closure value.
///
/// ```ignore
/// let add = wrap_fn(&engine, "add", |a: i64, b: i64| a + b);
/// ```
pub fn wrap_fn<Args, F>(engine: &Engine, name: &str, f: F) -> Value
where
    Args: FromArgs + 'static,
    F: HostFn<Args>,
{
    let func: NativeClosureFn = Rc::new(move |call: &mut NativeCall<'_>| {
        let args = call.args_as::<Args>()?;
        let out = f.invoke(args);
        Ok(Some(out.into_value(call.engine())))
    });
    Value::NativeClosure(Ref::new(engine, NativeClosureObject::new(name, func)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args_fills_positionally() {
        let engine = Engine::new();
        let args = [Value::Integer(3), Value::string(&engine, "hi")];
        let (n, s): (i64, String) = FromArgs::from_args(&args).unwrap();
        assert_eq!(n, 3);
        assert_eq!(s, "hi");
    }

    #[test]
    fn test_from_args_rejects_first_bad_slot() {
        let args = [Value::Integer(3), Value::Bool(true)];
        let res: OpResult<(i64, String)> = FromArgs::from_args(&args);
        assert_eq!(res.err(), Some(ErrorCode::InvalidType));
    }

    #[test]
    fn test_arity_constants() {
        assert_eq!(<() as FromArgs>::ARITY, 0);
        assert_eq!(<(i64, f64, bool) as FromArgs>::ARITY, 3);
    }
}
