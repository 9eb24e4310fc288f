//! Runtime values for the Kestrel VM.
//!
//! [`Value`] is a closed tagged union. Scalars and short strings are stored
//! inline and never touch the heap; everything else is an owning [`Ref`] to a
//! reference-counted heap object, so cloning a `Value` retains and dropping
//! it releases.
//!
//! # Variants
//!
//! | Variant | Storage | Notes |
//! |---------|---------|-------|
//! | `Null`, `Bool`, `Integer`, `Float` | inline | |
//! | `SmallString` | inline | at most [`SMALL_STRING_CAPACITY`] bytes |
//! | `RawPointer`, `NativeFunction`, `Error` | inline | |
//! | `LongString` | `Ref<StringObject>` | immutable |
//! | `MutableString` | `Ref<MutableStringObject>` | |
//! | `Closure`, `NativeClosure` | `Ref<..>` | callables |
//! | `Struct`, `StructInstance` | `Ref<..>` | schema / instance |
//! | `Table`, `Array` | `Ref<..>` | containers |
//! | `UserData`, `WeakRef`, `Capture` | `Ref<..>` | |
//! | `Extension` | iterator cursor over a container | |
//!
//! Strings compare and hash by content whatever their representation, so a
//! table can be probed with a borrowed `&str` through [`StrKey`].

use std::cell::Ref as CellRef;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitOr, Deref};

use indexmap::{Equivalent, IndexMap};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{ErrorCode, OpResult};
use crate::heap::{weak_indirection, Ref, WeakRefObject};
use crate::native::NativeFn;
use crate::object::{
    ArrayObject, CaptureCell, ClosureObject, MutableStringObject, NativeClosureObject,
    StringObject, TableObject, UserDataObject,
};
use crate::structs::{StructInstanceObject, StructObject};

/// Longest string stored inline.
pub const SMALL_STRING_CAPACITY: usize = 15;

// ─────────────────────────────────────────────────────────────────────────────
// ValueType
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminant of a [`Value`]. Everything from `LongString` on is
/// reference-counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    Null,
    Bool,
    Integer,
    Float,
    SmallString,
    RawPointer,
    NativeFunction,
    Error,
    LongString,
    MutableString,
    Closure,
    NativeClosure,
    Struct,
    StructInstance,
    Table,
    Array,
    UserData,
    WeakRef,
    Capture,
    Extension,
}

impl ValueType {
    pub fn is_ref_counted(self) -> bool {
        self >= ValueType::LongString
    }

    /// Script-facing name, as returned by `typeof`.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::SmallString | ValueType::LongString => "string",
            ValueType::MutableString => "mutable_string",
            ValueType::RawPointer => "raw_pointer",
            ValueType::NativeFunction => "native_function",
            ValueType::Error => "error",
            ValueType::Closure => "function",
            ValueType::NativeClosure => "native_closure",
            ValueType::Struct => "struct",
            ValueType::StructInstance => "struct_instance",
            ValueType::Table => "table",
            ValueType::Array => "array",
            ValueType::UserData => "user_data",
            ValueType::WeakRef => "weak_ref",
            ValueType::Capture => "capture",
            ValueType::Extension => "extension",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TypeMask
// ─────────────────────────────────────────────────────────────────────────────

/// One bit per [`ValueType`]. The empty mask means "unrestricted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypeMask(u32);

impl TypeMask {
    pub const ANY: TypeMask = TypeMask(0);
    pub const NULL: TypeMask = TypeMask::of(ValueType::Null);
    pub const BOOL: TypeMask = TypeMask::of(ValueType::Bool);
    pub const INTEGER: TypeMask = TypeMask::of(ValueType::Integer);
    pub const FLOAT: TypeMask = TypeMask::of(ValueType::Float);
    pub const NUMBER: TypeMask = TypeMask::INTEGER.union(TypeMask::FLOAT);
    pub const STRING: TypeMask = TypeMask::of(ValueType::SmallString)
        .union(TypeMask::of(ValueType::LongString))
        .union(TypeMask::of(ValueType::MutableString));
    pub const TABLE: TypeMask = TypeMask::of(ValueType::Table);
    pub const ARRAY: TypeMask = TypeMask::of(ValueType::Array);
    pub const STRUCT: TypeMask = TypeMask::of(ValueType::Struct);
    pub const INSTANCE: TypeMask = TypeMask::of(ValueType::StructInstance);
    pub const FUNCTION: TypeMask = TypeMask::of(ValueType::Closure)
        .union(TypeMask::of(ValueType::NativeClosure))
        .union(TypeMask::of(ValueType::NativeFunction));
    pub const USER_DATA: TypeMask = TypeMask::of(ValueType::UserData);

    pub const fn of(t: ValueType) -> TypeMask {
        TypeMask(1 << t as u32)
    }

    pub const fn union(self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 | other.0)
    }

    pub const fn from_bits(bits: u32) -> TypeMask {
        TypeMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_unrestricted(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, t: ValueType) -> bool {
        self.0 & TypeMask::of(t).0 != 0
    }

    pub fn accepts(self, value: &Value) -> bool {
        self.is_unrestricted() || self.contains(value.value_type())
    }

    /// Mask for a type name used in declarations (`int x`, `var<int, float>`).
    pub fn from_type_name(name: &str) -> Option<TypeMask> {
        Some(match name {
            "var" | "any" => TypeMask::ANY,
            "null" => TypeMask::NULL,
            "bool" => TypeMask::BOOL,
            "int" | "integer" => TypeMask::INTEGER,
            "float" => TypeMask::FLOAT,
            "number" => TypeMask::NUMBER,
            "string" => TypeMask::STRING,
            "table" => TypeMask::TABLE,
            "array" => TypeMask::ARRAY,
            "struct" => TypeMask::STRUCT.union(TypeMask::INSTANCE),
            "function" => TypeMask::FUNCTION,
            "user_data" => TypeMask::USER_DATA,
            _ => return None,
        })
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        self.union(rhs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Small strings
// ─────────────────────────────────────────────────────────────────────────────

/// Inline UTF-8 string of at most [`SMALL_STRING_CAPACITY`] bytes.
#[derive(Clone, Copy)]
pub struct SmallStr {
    len: u8,
    bytes: [u8; SMALL_STRING_CAPACITY],
}

impl SmallStr {
    pub fn new(s: &str) -> Option<SmallStr> {
        if s.len() > SMALL_STRING_CAPACITY {
            return None;
        }
        let mut bytes = [0u8; SMALL_STRING_CAPACITY];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Some(SmallStr {
            len: s.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: the bytes were copied from a `&str` in `new`.
        unsafe { std::str::from_utf8_unchecked(&self.bytes[..self.len as usize]) }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extensions
// ─────────────────────────────────────────────────────────────────────────────

/// Position-aware cursor values.
#[derive(Clone)]
pub enum Extension {
    /// Random-access cursor; supports `++`, `--` and `± n`.
    ArrayIterator { array: Ref<ArrayObject>, index: i64 },
    /// Forward-only cursor in insertion order.
    TableIterator { table: Ref<TableObject>, index: usize },
}

impl Extension {
    /// Whether the cursor currently points at an element.
    pub fn is_valid(&self) -> bool {
        match self {
            Extension::ArrayIterator { array, index } => {
                *index >= 0 && (*index as usize) < array.len()
            }
            Extension::TableIterator { table, index } => *index < table.len(),
        }
    }

    /// Element under the cursor.
    pub fn get(&self) -> OpResult<Value> {
        match self {
            Extension::ArrayIterator { array, index } => {
                let i = usize::try_from(*index).map_err(|_| ErrorCode::OutOfBounds)?;
                array.get(i).ok_or(ErrorCode::OutOfBounds)
            }
            Extension::TableIterator { table, index } => table
                .entry_at(*index)
                .map(|(_, v)| v)
                .ok_or(ErrorCode::OutOfBounds),
        }
    }

    /// Key under the cursor: the index for arrays, the entry key for tables.
    pub fn key(&self) -> OpResult<Value> {
        match self {
            Extension::ArrayIterator { index, .. } => Ok(Value::Integer(*index)),
            Extension::TableIterator { table, index } => table
                .entry_at(*index)
                .map(|(k, _)| k)
                .ok_or(ErrorCode::OutOfBounds),
        }
    }

    /// Move the cursor by `delta`. Table cursors only move forward.
    pub fn advanced(&self, delta: i64) -> OpResult<Extension> {
        match self {
            Extension::ArrayIterator { array, index } => Ok(Extension::ArrayIterator {
                array: array.clone(),
                index: index.wrapping_add(delta),
            }),
            Extension::TableIterator { table, index } => {
                let step = usize::try_from(delta).map_err(|_| ErrorCode::InvalidOperation)?;
                Ok(Extension::TableIterator {
                    table: table.clone(),
                    index: index.saturating_add(step),
                })
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// A runtime value in the Kestrel VM.
#[derive(Clone)]
pub enum Value {
    // ── Never reference-counted ──
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    SmallString(SmallStr),
    RawPointer(*mut c_void),
    NativeFunction(NativeFn),
    Error(ErrorCode),

    // ── Reference-counted ──
    LongString(Ref<StringObject>),
    MutableString(Ref<MutableStringObject>),
    Closure(Ref<ClosureObject>),
    NativeClosure(Ref<NativeClosureObject>),
    Struct(Ref<StructObject>),
    StructInstance(Ref<StructInstanceObject>),
    Table(Ref<TableObject>),
    Array(Ref<ArrayObject>),
    UserData(Ref<UserDataObject>),
    WeakRef(Ref<WeakRefObject>),
    Capture(Ref<CaptureCell>),
    Extension(Extension),
}

/// Run `$body` with `$r` bound to the inner `Ref` of any heap variant.
macro_rules! with_heap_ref {
    ($value:expr, $r:ident => $body:expr, _ => $fallback:expr) => {
        match $value {
            Value::LongString($r) => $body,
            Value::MutableString($r) => $body,
            Value::Closure($r) => $body,
            Value::NativeClosure($r) => $body,
            Value::Struct($r) => $body,
            Value::StructInstance($r) => $body,
            Value::Table($r) => $body,
            Value::Array($r) => $body,
            Value::UserData($r) => $body,
            Value::WeakRef($r) => $body,
            Value::Capture($r) => $body,
            _ => $fallback,
        }
    };
}

/// Borrowed string contents of a string value.
pub enum StrRef<'a> {
    Borrowed(&'a str),
    Cell(CellRef<'a, String>),
}

impl Deref for StrRef<'_> {
    type Target = str;

    fn deref(&self) -> &str {
        match self {
            StrRef::Borrowed(s) => s,
            StrRef::Cell(s) => s.as_str(),
        }
    }
}

impl Value {
    // ── Construction ──

    /// A string value; short strings stay inline.
    pub fn string(engine: &Engine, s: &str) -> Value {
        match SmallStr::new(s) {
            Some(small) => Value::SmallString(small),
            None => Value::LongString(Ref::new(engine, StringObject::new(s))),
        }
    }

    pub fn mutable_string(engine: &Engine, s: impl Into<String>) -> Value {
        Value::MutableString(Ref::new(engine, MutableStringObject::new(s.into())))
    }

    pub fn table(engine: &Engine) -> Value {
        Value::Table(Ref::new(engine, TableObject::new()))
    }

    pub fn table_from(engine: &Engine, entries: IndexMap<Value, Value>) -> Value {
        Value::Table(Ref::new(engine, TableObject::with_entries(entries)))
    }

    pub fn array(engine: &Engine, items: Vec<Value>) -> Value {
        Value::Array(Ref::new(engine, ArrayObject::new(items)))
    }

    /// Wrap host data; the identity tag is `T`'s `TypeId`.
    pub fn user_data<T: 'static>(engine: &Engine, name: &str, data: T) -> Value {
        Value::UserData(Ref::new(engine, UserDataObject::new(name, data)))
    }

    // ── Inspection ──

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::SmallString(_) => ValueType::SmallString,
            Value::RawPointer(_) => ValueType::RawPointer,
            Value::NativeFunction(_) => ValueType::NativeFunction,
            Value::Error(_) => ValueType::Error,
            Value::LongString(_) => ValueType::LongString,
            Value::MutableString(_) => ValueType::MutableString,
            Value::Closure(_) => ValueType::Closure,
            Value::NativeClosure(_) => ValueType::NativeClosure,
            Value::Struct(_) => ValueType::Struct,
            Value::StructInstance(_) => ValueType::StructInstance,
            Value::Table(_) => ValueType::Table,
            Value::Array(_) => ValueType::Array,
            Value::UserData(_) => ValueType::UserData,
            Value::WeakRef(_) => ValueType::WeakRef,
            Value::Capture(_) => ValueType::Capture,
            Value::Extension(_) => ValueType::Extension,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Extension(Extension::ArrayIterator { .. }) => "array_iterator",
            Value::Extension(Extension::TableIterator { .. }) => "table_iterator",
            other => other.value_type().name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self,
            Value::SmallString(_) | Value::LongString(_) | Value::MutableString(_)
        )
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_) | Value::NativeClosure(_) | Value::NativeFunction(_) | Value::Struct(_)
        )
    }

    /// `null`, `false`, numeric zero and error values are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Error(_) => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    /// Strong count of the referenced heap object, if any.
    pub fn strong_count(&self) -> Option<usize> {
        with_heap_ref!(self, r => Some(Ref::strong_count(r)), _ => None)
    }

    /// Whether two values refer to the same heap object.
    pub fn same_object(&self, other: &Value) -> bool {
        let a = with_heap_ref!(self, r => Some(Ref::as_ptr(r)), _ => None);
        let b = with_heap_ref!(other, r => Some(Ref::as_ptr(r)), _ => None);
        matches!((a, b), (Some(a), Some(b)) if a == b)
    }

    // ── Checked accessors ──

    /// Integers, and floats holding an exact integer.
    pub fn get_integer(&self) -> OpResult<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            Value::Float(f) => exact_integer(*f).ok_or(ErrorCode::InvalidType),
            _ => Err(ErrorCode::InvalidType),
        }
    }

    pub fn get_float(&self) -> OpResult<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            _ => Err(ErrorCode::InvalidType),
        }
    }

    pub fn get_bool(&self) -> OpResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(ErrorCode::InvalidType),
        }
    }

    pub fn get_string(&self) -> OpResult<StrRef<'_>> {
        self.str_ref().ok_or(ErrorCode::InvalidType)
    }

    pub fn str_ref(&self) -> Option<StrRef<'_>> {
        match self {
            Value::SmallString(s) => Some(StrRef::Borrowed(s.as_str())),
            Value::LongString(s) => Some(StrRef::Borrowed(s.as_str())),
            Value::MutableString(s) => Some(StrRef::Cell(s.borrow())),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Ref<TableObject>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Ref<ArrayObject>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Ref<StructObject>> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Ref<StructInstanceObject>> {
        match self {
            Value::StructInstance(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Ref<ClosureObject>> {
        match self {
            Value::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_user_data(&self) -> Option<&Ref<UserDataObject>> {
        match self {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }

    /// Host conversion; see [`FromValue`].
    pub fn get_value<T: FromValue>(&self) -> OpResult<T> {
        T::from_value(self)
    }

    /// Host conversion falling back to `default`.
    pub fn value_or<T: FromValue>(&self, default: T) -> T {
        T::from_value(self).unwrap_or(default)
    }

    pub fn from_host<T: IntoValue>(engine: &Engine, value: T) -> Value {
        value.into_value(engine)
    }

    // ── Weak references ──

    /// A weak reference to this heap value. Scalars cannot be referenced.
    pub fn downgrade(&self) -> OpResult<Value> {
        match self {
            Value::WeakRef(w) => Ok(Value::WeakRef(w.clone())),
            _ => with_heap_ref!(
                self,
                r => Ok(Value::WeakRef(weak_indirection(r, self))),
                _ => Err(ErrorCode::InvalidType)
            ),
        }
    }

    // ── Cloning ──

    /// Structural clone: strings, tables, arrays, struct instances and native
    /// closures are copied; closures, struct schemas and user data are shared.
    /// Shared substructure and cycles are preserved.
    pub fn deep_clone(&self) -> Value {
        let mut seen = HashMap::new();
        self.clone_with(&mut seen)
    }

    pub(crate) fn clone_with(&self, seen: &mut HashMap<*const (), Value>) -> Value {
        let key = with_heap_ref!(self, r => Ref::as_ptr(r), _ => return self.clone());
        if let Some(done) = seen.get(&key) {
            return done.clone();
        }
        match self {
            Value::LongString(s) => {
                let copy = Value::LongString(Ref::new(Ref::engine(s), StringObject::new(s.as_str())));
                seen.insert(key, copy.clone());
                copy
            }
            Value::MutableString(s) => {
                let text = s.borrow().clone();
                let copy = Value::mutable_string(Ref::engine(s), text);
                seen.insert(key, copy.clone());
                copy
            }
            Value::Table(t) => {
                let copy = Ref::new(Ref::engine(t), TableObject::new());
                seen.insert(key, Value::Table(copy.clone()));
                t.copy_entries_into(&copy, seen);
                Value::Table(copy)
            }
            Value::Array(a) => {
                let copy = Ref::new(Ref::engine(a), ArrayObject::new(Vec::new()));
                seen.insert(key, Value::Array(copy.clone()));
                let items: Vec<Value> = a.snapshot().iter().map(|v| v.clone_with(seen)).collect();
                copy.replace(items);
                Value::Array(copy)
            }
            Value::StructInstance(inst) => {
                let copy = inst.clone_shell();
                seen.insert(key, Value::StructInstance(copy.clone()));
                inst.clone_slots_into(&copy, seen);
                Value::StructInstance(copy)
            }
            Value::NativeClosure(n) => {
                let bound = n.bound().iter().map(|v| v.clone_with(seen)).collect();
                let copy = Value::NativeClosure(Ref::new(Ref::engine(n), n.with_bound(bound)));
                seen.insert(key, copy.clone());
                copy
            }
            _ => self.clone(),
        }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        const MAX_DEPTH: usize = 8;
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{n}")
                }
            }
            Value::SmallString(_) | Value::LongString(_) | Value::MutableString(_) => {
                let s = self.str_ref().map(|s| s.to_string()).unwrap_or_default();
                if depth == 0 {
                    f.write_str(&s)
                } else {
                    write!(f, "{s:?}")
                }
            }
            Value::RawPointer(p) => write!(f, "{p:p}"),
            Value::NativeFunction(_) => f.write_str("<native function>"),
            Value::Error(code) => write!(f, "error({code})"),
            Value::Closure(c) => write!(f, "<function {}>", c.proto.name),
            Value::NativeClosure(n) => write!(f, "<native {}>", n.name()),
            Value::Struct(s) => write!(f, "<struct {}>", s.name()),
            Value::UserData(u) => write!(f, "<user_data {}>", u.name()),
            Value::WeakRef(w) => {
                if w.is_expired() {
                    f.write_str("<weak_ref expired>")
                } else {
                    f.write_str("<weak_ref>")
                }
            }
            Value::Capture(c) => c.get().fmt_depth(f, depth),
            Value::Extension(e) => match e {
                Extension::ArrayIterator { index, .. } => write!(f, "<array_iterator {index}>"),
                Extension::TableIterator { index, .. } => write!(f, "<table_iterator {index}>"),
            },
            Value::Table(_) | Value::Array(_) | Value::StructInstance(_) if depth >= MAX_DEPTH => {
                f.write_str("...")
            }
            Value::Table(t) => {
                f.write_str("{")?;
                for (i, (k, v)) in t.entries().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    k.fmt_depth(f, depth + 1)?;
                    f.write_str(": ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("}")
            }
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, v) in a.snapshot().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str("]")
            }
            Value::StructInstance(inst) => {
                write!(f, "{} {{", inst.schema().name())?;
                for (i, (k, v)) in inst.fields().iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {k}: ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                f.write_str(" }")
            }
        }
    }
}

/// `f` as an `i64` when it holds an exact integer in range.
pub fn exact_integer(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_name())?;
        self.fmt_depth(f, 1)?;
        f.write_str(")")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Equality and hashing
// ─────────────────────────────────────────────────────────────────────────────

const NUMBER_HASH_TAG: u8 = 0xA1;
const STRING_HASH_TAG: u8 = 0xA2;

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(i), Value::Float(f)) | (Value::Float(f), Value::Integer(i)) => {
                exact_integer(*f) == Some(*i)
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::RawPointer(a), Value::RawPointer(b)) => a == b,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => *a as usize == *b as usize,
            (Value::Extension(a), Value::Extension(b)) => match (a, b) {
                (
                    Extension::ArrayIterator { array: x, index: i },
                    Extension::ArrayIterator { array: y, index: j },
                ) => Ref::ptr_eq(x, y) && i == j,
                (
                    Extension::TableIterator { table: x, index: i },
                    Extension::TableIterator { table: y, index: j },
                ) => Ref::ptr_eq(x, y) && i == j,
                _ => false,
            },
            _ if self.is_string() && other.is_string() => match (self.str_ref(), other.str_ref()) {
                (Some(a), Some(b)) => *a == *b,
                _ => false,
            },
            _ => self.value_type() == other.value_type() && self.same_object(other),
        }
    }
}

// NaN keys are never equal to themselves and so cannot be looked up again.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Integer(i) => {
                state.write_u8(NUMBER_HASH_TAG);
                i.hash(state);
            }
            Value::Float(f) => match exact_integer(*f) {
                Some(i) => {
                    state.write_u8(NUMBER_HASH_TAG);
                    i.hash(state);
                }
                None => {
                    state.write_u8(ValueType::Float as u8);
                    f.to_bits().hash(state);
                }
            },
            Value::SmallString(_) | Value::LongString(_) | Value::MutableString(_) => {
                state.write_u8(STRING_HASH_TAG);
                if let Some(s) = self.str_ref() {
                    (*s).hash(state);
                }
            }
            Value::Null => state.write_u8(ValueType::Null as u8),
            Value::Bool(b) => {
                state.write_u8(ValueType::Bool as u8);
                b.hash(state);
            }
            Value::Error(code) => {
                state.write_u8(ValueType::Error as u8);
                code.hash(state);
            }
            Value::RawPointer(p) => (*p as usize).hash(state),
            Value::NativeFunction(func) => (*func as usize).hash(state),
            Value::Extension(e) => match e {
                Extension::ArrayIterator { array, index } => {
                    (Ref::as_ptr(array) as usize).hash(state);
                    index.hash(state);
                }
                Extension::TableIterator { table, index } => {
                    (Ref::as_ptr(table) as usize).hash(state);
                    index.hash(state);
                }
            },
            _ => {
                state.write_u8(self.value_type() as u8);
                let addr = with_heap_ref!(self, r => Ref::as_ptr(r) as usize, _ => 0);
                addr.hash(state);
            }
        }
    }
}

/// Borrowed string key for allocation-free table lookups.
#[derive(Debug, Clone, Copy)]
pub struct StrKey<'a>(pub &'a str);

impl Hash for StrKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(STRING_HASH_TAG);
        self.0.hash(state);
    }
}

impl Equivalent<Value> for StrKey<'_> {
    fn equivalent(&self, key: &Value) -> bool {
        key.str_ref().is_some_and(|s| *s == *self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inline conversions
// ─────────────────────────────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<ErrorCode> for Value {
    fn from(code: ErrorCode) -> Value {
        Value::Error(code)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host conversions
// ─────────────────────────────────────────────────────────────────────────────

/// Checked conversion from a [`Value`] into a host type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> OpResult<Self>;
}

/// Conversion from a host type into a [`Value`].
pub trait IntoValue {
    fn into_value(self, engine: &Engine) -> Value;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> OpResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> OpResult<Self> {
        value.get_bool()
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> OpResult<Self> {
        value.get_integer()
    }
}

macro_rules! from_value_int {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            fn from_value(value: &Value) -> OpResult<Self> {
                <$t>::try_from(value.get_integer()?).map_err(|_| ErrorCode::InvalidType)
            }
        })*
    };
}

from_value_int!(i32, u32, u8, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> OpResult<Self> {
        value.get_float()
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> OpResult<Self> {
        value.get_float().map(|f| f as f32)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> OpResult<Self> {
        value.get_string().map(|s| s.to_string())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> OpResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> OpResult<Self> {
        let array = value.as_array().ok_or(ErrorCode::InvalidType)?;
        array.snapshot().iter().map(T::from_value).collect()
    }
}

impl<T: FromValue> FromValue for IndexMap<String, T> {
    fn from_value(value: &Value) -> OpResult<Self> {
        let table = value.as_table().ok_or(ErrorCode::InvalidType)?;
        table
            .entries()
            .iter()
            .map(|(k, v)| Ok((String::from_value(k)?, T::from_value(v)?)))
            .collect()
    }
}

impl<T: FromValue> FromValue for HashMap<String, T> {
    fn from_value(value: &Value) -> OpResult<Self> {
        IndexMap::<String, T>::from_value(value).map(|m| m.into_iter().collect())
    }
}

impl IntoValue for Value {
    fn into_value(self, _engine: &Engine) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self, _engine: &Engine) -> Value {
        Value::Null
    }
}

impl IntoValue for bool {
    fn into_value(self, _engine: &Engine) -> Value {
        Value::Bool(self)
    }
}

macro_rules! into_value_int {
    ($($t:ty),*) => {
        $(impl IntoValue for $t {
            fn into_value(self, _engine: &Engine) -> Value {
                Value::Integer(self as i64)
            }
        })*
    };
}

into_value_int!(i64, i32, u32, u8, usize);

impl IntoValue for f64 {
    fn into_value(self, _engine: &Engine) -> Value {
        Value::Float(self)
    }
}

impl IntoValue for f32 {
    fn into_value(self, _engine: &Engine) -> Value {
        Value::Float(self as f64)
    }
}

impl IntoValue for ErrorCode {
    fn into_value(self, _engine: &Engine) -> Value {
        Value::Error(self)
    }
}

impl IntoValue for &str {
    fn into_value(self, engine: &Engine) -> Value {
        Value::string(engine, self)
    }
}

impl IntoValue for String {
    fn into_value(self, engine: &Engine) -> Value {
        Value::string(engine, &self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self, engine: &Engine) -> Value {
        match self {
            Some(v) => v.into_value(engine),
            None => Value::Null,
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self, engine: &Engine) -> Value {
        let items = self.into_iter().map(|v| v.into_value(engine)).collect();
        Value::array(engine, items)
    }
}

impl<T: IntoValue> IntoValue for IndexMap<String, T> {
    fn into_value(self, engine: &Engine) -> Value {
        let entries = self
            .into_iter()
            .map(|(k, v)| (Value::string(engine, &k), v.into_value(engine)))
            .collect();
        Value::table_from(engine, entries)
    }
}

impl<T: IntoValue> IntoValue for HashMap<String, T> {
    fn into_value(self, engine: &Engine) -> Value {
        self.into_iter().collect::<IndexMap<String, T>>().into_value(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryTag;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash + ?Sized>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_small_strings_stay_inline() {
        let engine = Engine::new();
        let short = Value::string(&engine, "hello");
        let long = Value::string(&engine, "a considerably longer string");
        assert_eq!(short.value_type(), ValueType::SmallString);
        assert_eq!(long.value_type(), ValueType::LongString);
        assert_eq!(engine.stats(MemoryTag::String).live_objects, 1);
        assert!(!short.value_type().is_ref_counted());
        assert!(long.value_type().is_ref_counted());
    }

    #[test]
    fn test_string_equality_ignores_representation() {
        let engine = Engine::new();
        let a = Value::string(&engine, "same text, long enough to spill");
        let b = Value::mutable_string(&engine, "same text, long enough to spill");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(hash_of(&a), hash_of(&StrKey("same text, long enough to spill")));
    }

    #[test]
    fn test_numeric_equality_and_hash() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_ne!(Value::Integer(3), Value::Float(3.5));
        assert_eq!(hash_of(&Value::Integer(3)), hash_of(&Value::Float(3.0)));
        assert_eq!(hash_of(&Value::Float(-0.0)), hash_of(&Value::Float(0.0)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(Value::Integer(7).is_truthy());
        assert!(Value::SmallString(SmallStr::new("").unwrap()).is_truthy());
    }

    #[test]
    fn test_type_mask() {
        let engine = Engine::new();
        let mask = TypeMask::INTEGER | TypeMask::FLOAT;
        assert!(mask.accepts(&Value::Integer(1)));
        assert!(mask.accepts(&Value::Float(1.5)));
        assert!(!mask.accepts(&Value::Null));
        assert!(TypeMask::STRING.accepts(&Value::string(&engine, "x")));
        assert!(TypeMask::STRING.accepts(&Value::mutable_string(&engine, "x")));
        assert!(TypeMask::ANY.accepts(&Value::Null));
        assert_eq!(TypeMask::from_type_name("int"), Some(TypeMask::INTEGER));
        assert_eq!(TypeMask::from_type_name("widget"), None);
    }

    #[test]
    fn test_accessors_reject_wrong_types() {
        let engine = Engine::new();
        let table = Value::table(&engine);
        assert_eq!(table.get_float(), Err(ErrorCode::InvalidType));
        assert_eq!(Value::Float(2.0).get_integer(), Ok(2));
        assert_eq!(Value::Float(2.5).get_integer(), Err(ErrorCode::InvalidType));
        assert_eq!(&*Value::string(&engine, "abc").get_string().unwrap(), "abc");
    }

    #[test]
    fn test_clone_retains_and_drop_releases() {
        let engine = Engine::new();
        let table = Value::table(&engine);
        assert_eq!(table.strong_count(), Some(1));
        let copy = table.clone();
        assert_eq!(table.strong_count(), Some(2));
        drop(copy);
        assert_eq!(table.strong_count(), Some(1));
        drop(table);
        assert_eq!(engine.stats(MemoryTag::Table).live_objects, 0);
    }

    #[test]
    fn test_weak_reference_expires() {
        let engine = Engine::new();
        let table = Value::table(&engine);
        let weak = table.downgrade().unwrap();
        let again = table.downgrade().unwrap();
        assert!(weak.same_object(&again));
        assert_eq!(table.strong_count(), Some(1));
        let Value::WeakRef(w) = &weak else { panic!("expected weak ref") };
        assert!(w.upgrade().is_some_and(|v| v.same_object(&table)));
        drop(table);
        assert!(w.is_expired());
        assert!(w.upgrade().is_none());
        assert_eq!(engine.stats(MemoryTag::Table).live_objects, 0);
    }

    #[test]
    fn test_scalars_cannot_be_downgraded() {
        assert_eq!(Value::Integer(1).downgrade().err(), Some(ErrorCode::InvalidType));
    }

    #[test]
    fn test_host_conversions() {
        let engine = Engine::new();
        let v = vec![1_i64, 2, 3].into_value(&engine);
        assert_eq!(v.get_value::<Vec<i64>>(), Ok(vec![1, 2, 3]));
        assert_eq!(v.get_value::<Vec<String>>(), Err(ErrorCode::InvalidType));

        let mut map = IndexMap::new();
        map.insert("a".to_string(), 1.5_f64);
        let t = map.clone().into_value(&engine);
        assert_eq!(t.get_value::<IndexMap<String, f64>>(), Ok(map));
        assert_eq!(Value::Null.value_or(9_i64), 9);
        assert_eq!(Value::Null.get_value::<Option<i64>>(), Ok(None));
    }

    #[test]
    fn test_deep_clone_copies_containers() {
        let engine = Engine::new();
        let inner = Value::array(&engine, vec![Value::Integer(1)]);
        let outer = Value::array(&engine, vec![inner.clone(), inner.clone()]);
        let copy = outer.deep_clone();
        assert!(!copy.same_object(&outer));
        let items = copy.as_array().unwrap().snapshot();
        assert!(!items[0].same_object(&inner));
        // shared substructure stays shared in the copy
        assert!(items[0].same_object(&items[1]));
    }

    #[test]
    fn test_display() {
        let engine = Engine::new();
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        let arr = Value::array(&engine, vec![Value::Integer(1), Value::string(&engine, "x")]);
        assert_eq!(arr.to_string(), "[1, \"x\"]");
        assert_eq!(Value::Error(ErrorCode::InvalidType).to_string(), "error(invalid_type)");
    }
}
