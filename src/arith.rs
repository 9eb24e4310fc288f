//! Operator dispatch.
//!
//! Each operand is mapped to an [`ExposedKind`] and the ordered pair selects
//! a handler. Booleans are promoted to integers (or floats, when paired with
//! a float) and re-dispatched, so every numeric operator has exactly one
//! integer and one float implementation.
//!
//! Strings overload the arithmetic operators:
//!
//! | Expression | Result |
//! |---|---|
//! | `s + t` | concatenation |
//! | `s - t` | `s` with every occurrence of `t` removed |
//! | `s - n` | `n` characters trimmed from the end (from the start if `n < 0`) |
//! | `s * n` | `s` repeated `n` times, `n > 0` |
//! | `s / t` | array of the non-empty fragments of `s` split on `t` |
//! | `s % t` | longest common prefix |
//! | `s << n`, `s >> n` | drop `n` leading / trailing characters |
//!
//! Tables, struct instances and user data have no built-in arithmetic; when
//! they carry a delegate defining the matching meta-method the caller gets a
//! [`Dispatch::Meta`] redirect to execute. The left operand is tried first,
//! then the right.

use std::cmp::Ordering;

use crate::engine::Engine;
use crate::error::{ErrorCode, OpResult};
use crate::object::{delegate_of, lookup_meta, MetaMethod};
use crate::value::{exact_integer, Extension, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Exp => "**",
            ArithOp::BitOr => "|",
            ArithOp::BitAnd => "&",
            ArithOp::BitXor => "^",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        }
    }

    pub fn meta(self) -> Option<MetaMethod> {
        Some(match self {
            ArithOp::Add => MetaMethod::Add,
            ArithOp::Sub => MetaMethod::Sub,
            ArithOp::Mul => MetaMethod::Mul,
            ArithOp::Div => MetaMethod::Div,
            ArithOp::Mod => MetaMethod::Mod,
            ArithOp::Exp => MetaMethod::Exp,
            ArithOp::Shl => MetaMethod::Lshift,
            ArithOp::Shr => MetaMethod::Rshift,
            ArithOp::BitOr | ArithOp::BitAnd | ArithOp::BitXor => return None,
        })
    }

    fn requires_integers(self) -> bool {
        matches!(
            self,
            ArithOp::BitOr | ArithOp::BitAnd | ArithOp::BitXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// The kinds operator dispatch distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExposedKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Table,
    Array,
    Instance,
    UserData,
    Extension,
    Other,
}

pub fn exposed_kind(value: &Value) -> ExposedKind {
    match value {
        Value::Null => ExposedKind::Null,
        Value::Bool(_) => ExposedKind::Bool,
        Value::Integer(_) => ExposedKind::Integer,
        Value::Float(_) => ExposedKind::Float,
        Value::SmallString(_) | Value::LongString(_) | Value::MutableString(_) => {
            ExposedKind::String
        }
        Value::Table(_) => ExposedKind::Table,
        Value::Array(_) => ExposedKind::Array,
        Value::StructInstance(_) => ExposedKind::Instance,
        Value::UserData(_) => ExposedKind::UserData,
        Value::Extension(_) => ExposedKind::Extension,
        _ => ExposedKind::Other,
    }
}

/// Outcome of dispatch: a value, or a meta-method the caller must invoke.
///
/// The handler runs with `this` bound to the operand whose delegate supplied
/// it and arguments `(other, delegate)`. `reversed` is set when that operand
/// was the right-hand one.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Value(Value),
    Meta {
        method: Value,
        delegate: Value,
        reversed: bool,
    },
}

impl Dispatch {
    /// The value, treating a pending redirect as unsupported.
    pub fn into_value(self) -> OpResult<Value> {
        match self {
            Dispatch::Value(v) => Ok(v),
            Dispatch::Meta { .. } => Err(ErrorCode::InvalidOperation),
        }
    }
}

fn redirect(target: &Value, meta: Option<MetaMethod>, reversed: bool) -> OpResult<Dispatch> {
    let meta = meta.ok_or(ErrorCode::InvalidOperation)?;
    let delegate = delegate_of(target).ok_or(ErrorCode::InvalidOperation)?;
    let method = lookup_meta(&delegate, meta).ok_or(ErrorCode::InvalidOperation)?;
    Ok(Dispatch::Meta {
        method,
        delegate,
        reversed,
    })
}

/// Upper bound, in bytes, on a string built by repetition.
pub const MAX_STRING_LEN: usize = 1 << 30;

// ─────────────────────────────────────────────────────────────────────────────
// Binary operators
// ─────────────────────────────────────────────────────────────────────────────

pub fn binary(engine: &Engine, op: ArithOp, lhs: &Value, rhs: &Value) -> OpResult<Dispatch> {
    use ExposedKind as K;

    match (exposed_kind(lhs), exposed_kind(rhs)) {
        (K::Integer, K::Integer) => {
            let (a, b) = (lhs.get_integer()?, rhs.get_integer()?);
            integer_op(op, a, b).map(Dispatch::Value)
        }
        (K::Integer | K::Float, K::Integer | K::Float) => {
            let (a, b) = (lhs.get_float()?, rhs.get_float()?);
            float_op(op, a, b).map(Dispatch::Value)
        }

        // ── Bool promotion ──
        (K::Bool, K::Float) => binary(engine, op, &promote(lhs, true), rhs),
        (K::Float, K::Bool) => binary(engine, op, lhs, &promote(rhs, true)),
        (K::Bool, K::Bool | K::Integer) | (K::Integer, K::Bool) => {
            binary(engine, op, &promote(lhs, false), &promote(rhs, false))
        }

        // ── Strings ──
        (K::String, K::String) => {
            let (a, b) = (lhs.get_string()?, rhs.get_string()?);
            string_string(engine, op, &a, &b).map(Dispatch::Value)
        }
        (K::String, K::Integer | K::Float) => {
            let n = match rhs.get_integer() {
                Ok(n) => n,
                Err(_) => return Err(ErrorCode::InvalidOperation),
            };
            let a = lhs.get_string()?;
            string_number(engine, op, &a, n).map(Dispatch::Value)
        }

        // ── Containers ──
        (K::Array, K::Array) if op == ArithOp::Add => {
            let mut items = lhs.as_array().map(|a| a.snapshot()).unwrap_or_default();
            items.extend(rhs.as_array().map(|a| a.snapshot()).unwrap_or_default());
            Ok(Dispatch::Value(Value::array(engine, items)))
        }
        (K::Extension, K::Integer) => {
            let Value::Extension(ext) = lhs else {
                return Err(ErrorCode::InvalidOperation);
            };
            let n = rhs.get_integer()?;
            let moved = match op {
                ArithOp::Add => ext.advanced(n)?,
                ArithOp::Sub => ext.advanced(n.checked_neg().ok_or(ErrorCode::InvalidOperation)?)?,
                _ => return Err(ErrorCode::InvalidOperation),
            };
            Ok(Dispatch::Value(Value::Extension(moved)))
        }
        (K::Extension, K::Extension) if op == ArithOp::Sub => match (lhs, rhs) {
            (
                Value::Extension(Extension::ArrayIterator { array: a, index: i }),
                Value::Extension(Extension::ArrayIterator { array: b, index: j }),
            ) if crate::heap::Ref::ptr_eq(a, b) => Ok(Dispatch::Value(Value::Integer(i - j))),
            _ => Err(ErrorCode::InvalidOperation),
        },
        // Left operand's handler first, then the right operand's.
        (K::Table | K::Instance | K::UserData, _) | (_, K::Table | K::Instance | K::UserData) => {
            redirect(lhs, op.meta(), false).or_else(|_| redirect(rhs, op.meta(), true))
        }

        _ => Err(ErrorCode::InvalidOperation),
    }
}

fn promote(value: &Value, to_float: bool) -> Value {
    match value {
        Value::Bool(b) if to_float => Value::Float(if *b { 1.0 } else { 0.0 }),
        Value::Bool(b) => Value::Integer(*b as i64),
        other => other.clone(),
    }
}

/// The integer handler. Overflow wraps (two's complement).
pub fn integer_op(op: ArithOp, a: i64, b: i64) -> OpResult<Value> {
    let v = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(ErrorCode::DivisionByZero);
            }
            a.wrapping_div(b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(ErrorCode::DivisionByZero);
            }
            a.wrapping_rem(b)
        }
        ArithOp::Exp => match u32::try_from(b) {
            Ok(e) => a.wrapping_pow(e),
            Err(_) => return Ok(Value::Float((a as f64).powf(b as f64))),
        },
        ArithOp::BitOr => a | b,
        ArithOp::BitAnd => a & b,
        ArithOp::BitXor => a ^ b,
        ArithOp::Shl | ArithOp::Shr => {
            let shift = u32::try_from(b).map_err(|_| ErrorCode::InvalidArgument)?;
            match (op, shift) {
                (ArithOp::Shl, s) if s >= 64 => 0,
                (ArithOp::Shl, s) => a << s,
                (_, s) if s >= 64 => a >> 63,
                (_, s) => a >> s,
            }
        }
    };
    Ok(Value::Integer(v))
}

/// The float handler. Bitwise and shift operators need exact integers.
pub fn float_op(op: ArithOp, a: f64, b: f64) -> OpResult<Value> {
    if op.requires_integers() {
        let (Some(x), Some(y)) = (exact_integer(a), exact_integer(b)) else {
            return Err(ErrorCode::InvalidOperation);
        };
        return integer_op(op, x, y);
    }
    let v = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
        ArithOp::Exp => a.powf(b),
        _ => return Err(ErrorCode::InvalidOperation),
    };
    Ok(Value::Float(v))
}

// ─────────────────────────────────────────────────────────────────────────────
// String operators
// ─────────────────────────────────────────────────────────────────────────────

fn string_string(engine: &Engine, op: ArithOp, a: &str, b: &str) -> OpResult<Value> {
    match op {
        ArithOp::Add => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Ok(Value::string(engine, &s))
        }
        ArithOp::Sub => Ok(Value::string(engine, &remove_all(a, b))),
        ArithOp::Div => {
            let parts = split_non_empty(a, b)
                .into_iter()
                .map(|p| Value::string(engine, p))
                .collect();
            Ok(Value::array(engine, parts))
        }
        ArithOp::Mod => Ok(Value::string(engine, common_prefix(a, b))),
        _ => Err(ErrorCode::InvalidOperation),
    }
}

fn string_number(engine: &Engine, op: ArithOp, a: &str, n: i64) -> OpResult<Value> {
    match op {
        ArithOp::Sub => Ok(Value::string(engine, trim_chars(a, n))),
        ArithOp::Mul => {
            if n <= 0 {
                return Err(ErrorCode::InvalidOperation);
            }
            let count = usize::try_from(n).map_err(|_| ErrorCode::OutOfMemory)?;
            match a.len().checked_mul(count) {
                Some(len) if len <= MAX_STRING_LEN => Ok(Value::string(engine, &a.repeat(count))),
                _ => Err(ErrorCode::OutOfMemory),
            }
        }
        ArithOp::Shl | ArithOp::Shr => {
            let count = usize::try_from(n).map_err(|_| ErrorCode::InvalidArgument)?;
            let s = if op == ArithOp::Shl {
                drop_leading(a, count)
            } else {
                drop_trailing(a, count)
            };
            Ok(Value::string(engine, s))
        }
        _ => Err(ErrorCode::InvalidOperation),
    }
}

/// `a` with every occurrence of `b` removed. Removal is repeated from the
/// same position, so `"aabb" - "ab"` is `""`.
pub fn remove_all(a: &str, b: &str) -> String {
    if b.is_empty() {
        return a.to_string();
    }
    let mut s = a.to_string();
    let mut from = 0;
    while let Some(i) = s[from..].find(b) {
        let at = from + i;
        s.replace_range(at..at + b.len(), "");
        from = at;
    }
    s
}

/// Non-empty fragments of `a` split on `sep`. An empty separator splits
/// into characters.
pub fn split_non_empty<'a>(a: &'a str, sep: &str) -> Vec<&'a str> {
    if sep.is_empty() {
        return a
            .char_indices()
            .map(|(i, c)| &a[i..i + c.len_utf8()])
            .collect();
    }
    a.split(sep).filter(|p| !p.is_empty()).collect()
}

/// Longest common prefix, on character boundaries.
pub fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()));
    &a[..end]
}

/// Trim `n` characters from the end, or `-n` from the start when negative.
/// Out-of-range amounts leave the string unchanged.
pub fn trim_chars(a: &str, n: i64) -> &str {
    let len = a.chars().count();
    let Ok(count) = usize::try_from(n.unsigned_abs()) else {
        return a;
    };
    if count > len {
        return a;
    }
    if n >= 0 {
        drop_trailing(a, count)
    } else {
        drop_leading(a, count)
    }
}

pub fn drop_leading(a: &str, n: usize) -> &str {
    match a.char_indices().nth(n) {
        Some((i, _)) => &a[i..],
        None => "",
    }
}

pub fn drop_trailing(a: &str, n: usize) -> &str {
    let len = a.chars().count();
    if n >= len {
        return "";
    }
    match a.char_indices().nth(len - n) {
        Some((i, _)) => &a[..i],
        None => a,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unary operators
// ─────────────────────────────────────────────────────────────────────────────

/// Increment and decrement forms. Prefix forms yield the updated value,
/// postfix forms the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrOp {
    Incr,
    Decr,
    PreIncr,
    PreDecr,
}

impl IncrOp {
    pub fn is_prefix(self) -> bool {
        matches!(self, IncrOp::PreIncr | IncrOp::PreDecr)
    }

    pub fn delta(self) -> i64 {
        match self {
            IncrOp::Incr | IncrOp::PreIncr => 1,
            IncrOp::Decr | IncrOp::PreDecr => -1,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<IncrOp> {
        [IncrOp::Incr, IncrOp::Decr, IncrOp::PreIncr, IncrOp::PreDecr]
            .get(b as usize)
            .copied()
    }
}

/// The updated value for `++`/`--` on `value`.
pub fn step(op: IncrOp, value: &Value) -> OpResult<Dispatch> {
    let delta = op.delta();
    let v = match value {
        Value::Integer(i) => Value::Integer(i.wrapping_add(delta)),
        Value::Float(f) => Value::Float(f + delta as f64),
        Value::Bool(b) => Value::Integer(*b as i64 + delta),
        Value::Extension(ext) => Value::Extension(ext.advanced(delta)?),
        Value::Table(_) | Value::StructInstance(_) | Value::UserData(_) => {
            let meta = if delta > 0 { MetaMethod::Incr } else { MetaMethod::Decr };
            return redirect(value, Some(meta), false);
        }
        _ => return Err(ErrorCode::InvalidOperation),
    };
    Ok(Dispatch::Value(v))
}

pub fn negate(value: &Value) -> OpResult<Dispatch> {
    match value {
        Value::Integer(i) => Ok(Dispatch::Value(Value::Integer(i.wrapping_neg()))),
        Value::Float(f) => Ok(Dispatch::Value(Value::Float(-f))),
        Value::Bool(b) => Ok(Dispatch::Value(Value::Integer(-(*b as i64)))),
        Value::Table(_) | Value::StructInstance(_) | Value::UserData(_) => {
            redirect(value, Some(MetaMethod::Unm), false)
        }
        _ => Err(ErrorCode::InvalidOperation),
    }
}

pub fn bit_not(value: &Value) -> OpResult<Value> {
    match value {
        Value::Integer(i) => Ok(Value::Integer(!i)),
        Value::Float(f) => exact_integer(*f)
            .map(|i| Value::Integer(!i))
            .ok_or(ErrorCode::InvalidOperation),
        Value::Bool(b) => Ok(Value::Integer(!(*b as i64))),
        _ => Err(ErrorCode::InvalidOperation),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Comparison
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Comparison {
    Ordered(Ordering),
    /// NaN involved; every relational operator is false.
    Unordered,
    Meta { method: Value, delegate: Value },
}

pub fn compare(lhs: &Value, rhs: &Value) -> OpResult<Comparison> {
    use ExposedKind as K;

    match (exposed_kind(lhs), exposed_kind(rhs)) {
        (K::Integer, K::Integer) => Ok(Comparison::Ordered(lhs.get_integer()?.cmp(&rhs.get_integer()?))),
        (K::Integer | K::Float | K::Bool, K::Integer | K::Float | K::Bool) => {
            let a = promote(lhs, true).get_float()?;
            let b = promote(rhs, true).get_float()?;
            Ok(a.partial_cmp(&b).map_or(Comparison::Unordered, Comparison::Ordered))
        }
        (K::String, K::String) => {
            let (a, b) = (lhs.get_string()?, rhs.get_string()?);
            Ok(Comparison::Ordered((*a).cmp(&*b)))
        }
        (K::Extension, K::Extension) => match (lhs, rhs) {
            (
                Value::Extension(Extension::ArrayIterator { index: i, .. }),
                Value::Extension(Extension::ArrayIterator { index: j, .. }),
            ) => Ok(Comparison::Ordered(i.cmp(j))),
            (
                Value::Extension(Extension::TableIterator { index: i, .. }),
                Value::Extension(Extension::TableIterator { index: j, .. }),
            ) => Ok(Comparison::Ordered(i.cmp(j))),
            _ => Err(ErrorCode::InvalidOperation),
        },
        (K::Table | K::Instance | K::UserData, _) => {
            match redirect(lhs, Some(MetaMethod::Compare), false)? {
                Dispatch::Meta { method, delegate, .. } => Ok(Comparison::Meta { method, delegate }),
                Dispatch::Value(_) => Err(ErrorCode::InvalidOperation),
            }
        }
        _ => Err(ErrorCode::InvalidOperation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(engine: &Engine, op: ArithOp, a: Value, b: Value) -> OpResult<Value> {
        binary(engine, op, &a, &b)?.into_value()
    }

    fn s(engine: &Engine, text: &str) -> Value {
        Value::string(engine, text)
    }

    #[test]
    fn test_integer_arithmetic_matches_native() {
        let e = Engine::new();
        for (a, b) in [(7_i64, 3_i64), (-9, 4), (i64::MAX, 1), (0, -5)] {
            assert_eq!(eval(&e, ArithOp::Add, a.into(), b.into()), Ok(Value::Integer(a.wrapping_add(b))));
            assert_eq!(eval(&e, ArithOp::Sub, a.into(), b.into()), Ok(Value::Integer(a.wrapping_sub(b))));
            assert_eq!(eval(&e, ArithOp::Mul, a.into(), b.into()), Ok(Value::Integer(a.wrapping_mul(b))));
        }
        assert_eq!(eval(&e, ArithOp::Div, Value::Integer(7), Value::Integer(0)), Err(ErrorCode::DivisionByZero));
        assert_eq!(eval(&e, ArithOp::Exp, Value::Integer(2), Value::Integer(10)), Ok(Value::Integer(1024)));
    }

    #[test]
    fn test_promotion_is_commutative() {
        let e = Engine::new();
        for (i, f) in [(3_i64, 0.1_f64), (-7, 2.5), (1 << 40, 1e-9)] {
            for op in [ArithOp::Add, ArithOp::Mul] {
                let a = eval(&e, op, Value::Integer(i), Value::Float(f)).unwrap();
                let b = eval(&e, op, Value::Float(f), Value::Integer(i)).unwrap();
                let (Value::Float(a), Value::Float(b)) = (a, b) else { panic!("expected floats") };
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn test_bool_promotion() {
        let e = Engine::new();
        assert_eq!(eval(&e, ArithOp::Add, true.into(), Value::Integer(2)), Ok(Value::Integer(3)));
        assert_eq!(eval(&e, ArithOp::Add, true.into(), 0.5.into()), Ok(Value::Float(1.5)));
        assert_eq!(eval(&e, ArithOp::Add, true.into(), true.into()), Ok(Value::Integer(2)));
    }

    #[test]
    fn test_fractional_float_in_bitwise_is_invalid() {
        let e = Engine::new();
        assert_eq!(eval(&e, ArithOp::BitOr, Value::Integer(1), 2.5.into()), Err(ErrorCode::InvalidOperation));
        assert_eq!(eval(&e, ArithOp::Shl, Value::Integer(1), 2.0.into()), Ok(Value::Integer(4)));
        assert_eq!(eval(&e, ArithOp::Shl, Value::Integer(1), Value::Integer(-1)), Err(ErrorCode::InvalidArgument));
    }

    #[test]
    fn test_string_laws() {
        let e = Engine::new();
        assert_eq!(eval(&e, ArithOp::Add, s(&e, "abc"), s(&e, "def")), Ok(s(&e, "abcdef")));
        assert_eq!(eval(&e, ArithOp::Sub, s(&e, "abcabc"), s(&e, "bc")), Ok(s(&e, "aa")));
        let repeated = eval(&e, ArithOp::Mul, s(&e, "abc"), Value::Integer(3)).unwrap();
        assert_eq!(repeated.get_string().unwrap().len(), 9);
        let parts = eval(&e, ArithOp::Div, s(&e, "a,b,,c"), s(&e, ",")).unwrap();
        assert_eq!(parts.as_array().unwrap().len(), 3);
        assert_eq!(eval(&e, ArithOp::Mod, s(&e, "abc"), s(&e, "abd")), Ok(s(&e, "ab")));
        assert_eq!(eval(&e, ArithOp::Mod, s(&e, "ab"), s(&e, "abcd")), Ok(s(&e, "ab")));
    }

    #[test]
    fn test_string_number_operators() {
        let e = Engine::new();
        assert_eq!(eval(&e, ArithOp::Sub, s(&e, "abcdef"), Value::Integer(2)), Ok(s(&e, "abcd")));
        assert_eq!(eval(&e, ArithOp::Sub, s(&e, "abcdef"), Value::Integer(-2)), Ok(s(&e, "cdef")));
        assert_eq!(eval(&e, ArithOp::Sub, s(&e, "abc"), Value::Integer(10)), Ok(s(&e, "abc")));
        assert_eq!(eval(&e, ArithOp::Shl, s(&e, "abcdef"), Value::Integer(2)), Ok(s(&e, "cdef")));
        assert_eq!(eval(&e, ArithOp::Shr, s(&e, "abcdef"), Value::Integer(2)), Ok(s(&e, "abcd")));
        assert_eq!(eval(&e, ArithOp::Shr, s(&e, "ab"), Value::Integer(5)), Ok(s(&e, "")));
        assert_eq!(eval(&e, ArithOp::Shl, s(&e, "ab"), Value::Integer(-1)), Err(ErrorCode::InvalidArgument));
        assert_eq!(eval(&e, ArithOp::Mul, s(&e, "ab"), Value::Integer(0)), Err(ErrorCode::InvalidOperation));
        assert_eq!(eval(&e, ArithOp::Add, s(&e, "ab"), Value::Integer(1)), Err(ErrorCode::InvalidOperation));
        assert_eq!(eval(&e, ArithOp::Sub, s(&e, "ab"), 0.5.into()), Err(ErrorCode::InvalidOperation));
    }

    #[test]
    fn test_string_repeat_is_bounded() {
        let e = Engine::new();
        assert_eq!(eval(&e, ArithOp::Mul, s(&e, "ab"), Value::Integer(i64::MAX)), Err(ErrorCode::OutOfMemory));
        assert_eq!(
            eval(&e, ArithOp::Mul, s(&e, "ab"), Value::Integer(1_000_000_000_000)),
            Err(ErrorCode::OutOfMemory)
        );
        let edge = eval(&e, ArithOp::Mul, s(&e, "a"), Value::Integer(1 << 10)).unwrap();
        assert_eq!(edge.get_string().unwrap().len(), 1024);
    }

    #[test]
    fn test_table_without_delegate_is_invalid() {
        let e = Engine::new();
        let t = Value::table(&e);
        assert_eq!(binary(&e, ArithOp::Add, &t, &Value::Integer(1)).err(), Some(ErrorCode::InvalidOperation));
    }

    #[test]
    fn test_table_with_delegate_redirects() {
        let e = Engine::new();
        let delegate = Value::table(&e);
        delegate
            .as_table()
            .unwrap()
            .set(s(&e, "__add"), Value::Integer(99))
            .unwrap();
        let t = Value::table(&e);
        t.as_table().unwrap().set_delegate(Some(delegate.clone()));
        match binary(&e, ArithOp::Add, &t, &Value::Integer(1)).unwrap() {
            Dispatch::Meta {
                method,
                delegate: d,
                reversed,
            } => {
                assert_eq!(method, Value::Integer(99));
                assert!(d.same_object(&delegate));
                assert!(!reversed);
            }
            Dispatch::Value(_) => panic!("expected redirect"),
        }
        assert_eq!(binary(&e, ArithOp::Mul, &t, &Value::Integer(1)).err(), Some(ErrorCode::InvalidOperation));
    }

    #[test]
    fn test_right_operand_delegate_is_consulted() {
        let e = Engine::new();
        let delegate = Value::table(&e);
        delegate
            .as_table()
            .unwrap()
            .set(s(&e, "__add"), Value::Integer(7))
            .unwrap();
        let t = Value::table(&e);
        t.as_table().unwrap().set_delegate(Some(delegate.clone()));

        let Dispatch::Meta { method, reversed, .. } = binary(&e, ArithOp::Add, &Value::Integer(1), &t).unwrap() else {
            panic!("expected redirect");
        };
        assert_eq!(method, Value::Integer(7));
        assert!(reversed);

        let plain = Value::table(&e);
        let Dispatch::Meta { reversed, .. } = binary(&e, ArithOp::Add, &plain, &t).unwrap() else {
            panic!("expected redirect");
        };
        assert!(reversed);
        assert_eq!(binary(&e, ArithOp::Sub, &Value::Integer(1), &t).err(), Some(ErrorCode::InvalidOperation));
    }

    #[test]
    fn test_iterator_stepping() {
        let e = Engine::new();
        let arr = Value::array(&e, vec![Value::Integer(10), Value::Integer(20)]);
        let it = Value::Extension(Extension::ArrayIterator {
            array: arr.as_array().unwrap().clone(),
            index: 0,
        });
        let Dispatch::Value(next) = step(IncrOp::Incr, &it).unwrap() else { panic!() };
        let Value::Extension(ext) = &next else { panic!() };
        assert_eq!(ext.get(), Ok(Value::Integer(20)));
        let back = eval(&e, ArithOp::Sub, next.clone(), Value::Integer(1)).unwrap();
        assert_eq!(back, it);

        let table = Value::table(&e);
        let tit = Value::Extension(Extension::TableIterator {
            table: table.as_table().unwrap().clone(),
            index: 0,
        });
        assert_eq!(step(IncrOp::Decr, &tit).err(), Some(ErrorCode::InvalidOperation));
    }

    #[test]
    fn test_compare() {
        assert!(matches!(compare(&Value::Integer(1), &2.5.into()), Ok(Comparison::Ordered(Ordering::Less))));
        assert!(matches!(compare(&f64::NAN.into(), &Value::Integer(1)), Ok(Comparison::Unordered)));
        let e = Engine::new();
        assert!(matches!(
            compare(&s(&e, "b"), &s(&e, "a")),
            Ok(Comparison::Ordered(Ordering::Greater))
        ));
        assert_eq!(compare(&Value::Null, &Value::Integer(1)).err(), Some(ErrorCode::InvalidOperation));
    }
}
