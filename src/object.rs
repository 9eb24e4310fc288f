//! Heap object payloads.
//!
//! Each type here implements [`HeapObject`] and lives behind a
//! [`Ref`](crate::heap::Ref). Interior state uses `RefCell`; borrows are kept
//! short and never held across a call back into the VM.

use std::any::{Any, TypeId};
use std::cell::{Cell, Ref as CellRef, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::FunctionPrototype;
use crate::engine::MemoryTag;
use crate::error::{ErrorCode, OpResult};
use crate::heap::{HeapObject, Ref};
use crate::native::NativeCall;
use crate::value::{StrKey, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Strings
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable heap string, used once a string no longer fits inline.
pub struct StringObject {
    text: Box<str>,
}

impl HeapObject for StringObject {
    const TAG: MemoryTag = MemoryTag::String;
}

impl StringObject {
    pub fn new(text: &str) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

pub struct MutableStringObject {
    text: RefCell<String>,
}

impl HeapObject for MutableStringObject {
    const TAG: MemoryTag = MemoryTag::MutableString;
}

impl MutableStringObject {
    pub fn new(text: String) -> Self {
        Self {
            text: RefCell::new(text),
        }
    }

    pub fn borrow(&self) -> CellRef<'_, String> {
        self.text.borrow()
    }

    pub fn push_str(&self, s: &str) {
        self.text.borrow_mut().push_str(s);
    }

    pub fn set(&self, s: String) {
        *self.text.borrow_mut() = s;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table
// ─────────────────────────────────────────────────────────────────────────────

/// Insertion-ordered hash table with an optional delegate.
pub struct TableObject {
    map: RefCell<IndexMap<Value, Value>>,
    delegate: RefCell<Option<Value>>,
    sealed: Cell<bool>,
}

impl HeapObject for TableObject {
    const TAG: MemoryTag = MemoryTag::Table;
}

impl Default for TableObject {
    fn default() -> Self {
        Self::new()
    }
}

impl TableObject {
    pub fn new() -> Self {
        Self::with_entries(IndexMap::new())
    }

    pub fn with_entries(entries: IndexMap<Value, Value>) -> Self {
        Self {
            map: RefCell::new(entries),
            delegate: RefCell::new(None),
            sealed: Cell::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.map.borrow().get(key).cloned()
    }

    /// Lookup by borrowed string, without allocating a key.
    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.map.borrow().get(&StrKey(key)).cloned()
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.map.borrow().contains_key(key)
    }

    /// Insert or overwrite. Sealed tables reject every write.
    pub fn set(&self, key: Value, value: Value) -> OpResult<()> {
        if self.sealed.get() {
            return Err(ErrorCode::CantModifyExportTable);
        }
        if key.is_null() {
            return Err(ErrorCode::InvalidArgument);
        }
        // The previous value is dropped after the borrow ends.
        let previous = self.map.borrow_mut().insert(key, value);
        drop(previous);
        Ok(())
    }

    pub fn remove(&self, key: &Value) -> OpResult<Option<Value>> {
        if self.sealed.get() {
            return Err(ErrorCode::CantModifyExportTable);
        }
        let removed = self.map.borrow_mut().shift_remove(key);
        Ok(removed)
    }

    pub fn clear(&self) -> OpResult<()> {
        if self.sealed.get() {
            return Err(ErrorCode::CantModifyExportTable);
        }
        let old = std::mem::take(&mut *self.map.borrow_mut());
        drop(old);
        Ok(())
    }

    /// Copy of every entry, in insertion order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.map
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn entry_at(&self, index: usize) -> Option<(Value, Value)> {
        self.map
            .borrow()
            .get_index(index)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn delegate(&self) -> Option<Value> {
        self.delegate.borrow().clone()
    }

    pub fn set_delegate(&self, delegate: Option<Value>) {
        let old = std::mem::replace(&mut *self.delegate.borrow_mut(), delegate);
        drop(old);
    }

    /// Reject all further writes.
    pub fn seal(&self) {
        self.sealed.set(true);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get()
    }

    pub(crate) fn copy_entries_into(&self, target: &TableObject, seen: &mut HashMap<*const (), Value>) {
        let entries = self.entries();
        let mut map = IndexMap::with_capacity(entries.len());
        for (k, v) in entries {
            map.insert(k.clone_with(seen), v.clone_with(seen));
        }
        *target.map.borrow_mut() = map;
        target.set_delegate(self.delegate());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Array
// ─────────────────────────────────────────────────────────────────────────────

pub struct ArrayObject {
    items: RefCell<Vec<Value>>,
}

impl HeapObject for ArrayObject {
    const TAG: MemoryTag = MemoryTag::Array;
}

impl ArrayObject {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: RefCell::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> OpResult<()> {
        let old = {
            let mut items = self.items.borrow_mut();
            let slot = items.get_mut(index).ok_or(ErrorCode::OutOfBounds)?;
            std::mem::replace(slot, value)
        };
        drop(old);
        Ok(())
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    pub fn pop(&self) -> Option<Value> {
        self.items.borrow_mut().pop()
    }

    pub fn insert(&self, index: usize, value: Value) -> OpResult<()> {
        let mut items = self.items.borrow_mut();
        if index > items.len() {
            return Err(ErrorCode::OutOfBounds);
        }
        items.insert(index, value);
        Ok(())
    }

    pub fn erase(&self, index: usize) -> OpResult<Value> {
        let mut items = self.items.borrow_mut();
        if index >= items.len() {
            return Err(ErrorCode::OutOfBounds);
        }
        Ok(items.remove(index))
    }

    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.items.borrow_mut());
        drop(old);
    }

    /// Copy of the items.
    pub fn snapshot(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub fn replace(&self, items: Vec<Value>) {
        let old = std::mem::replace(&mut *self.items.borrow_mut(), items);
        drop(old);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Callables
// ─────────────────────────────────────────────────────────────────────────────

/// A prototype bound to its resolved captures and default arguments.
pub struct ClosureObject {
    pub proto: Rc<FunctionPrototype>,
    pub captures: Vec<Ref<CaptureCell>>,
    /// Values for the trailing `proto.default_count` parameters.
    pub defaults: Vec<Value>,
}

impl HeapObject for ClosureObject {
    const TAG: MemoryTag = MemoryTag::Closure;
}

impl ClosureObject {
    /// Declared parameter count, `this` excluded.
    pub fn arity(&self) -> usize {
        self.proto.parameter_names.len()
    }

    /// Smallest accepted argument count.
    pub fn min_arity(&self) -> usize {
        self.arity().saturating_sub(self.defaults.len())
    }
}

pub type NativeClosureFn = Rc<dyn Fn(&mut NativeCall<'_>) -> OpResult<Option<Value>>>;

/// A host closure plus values bound to it at creation time.
pub struct NativeClosureObject {
    name: String,
    func: NativeClosureFn,
    bound: Vec<Value>,
}

impl HeapObject for NativeClosureObject {
    const TAG: MemoryTag = MemoryTag::NativeClosure;
}

impl NativeClosureObject {
    pub fn new(name: &str, func: NativeClosureFn) -> Self {
        Self {
            name: name.to_string(),
            func,
            bound: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn func(&self) -> NativeClosureFn {
        self.func.clone()
    }

    pub fn bound(&self) -> &[Value] {
        &self.bound
    }

    pub fn with_bound(&self, bound: Vec<Value>) -> Self {
        Self {
            name: self.name.clone(),
            func: self.func.clone(),
            bound,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// User data
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque host data tagged with the `TypeId` of its payload.
pub struct UserDataObject {
    name: String,
    type_id: TypeId,
    data: RefCell<Box<dyn Any>>,
    delegate: RefCell<Option<Value>>,
}

impl HeapObject for UserDataObject {
    const TAG: MemoryTag = MemoryTag::UserData;
}

impl UserDataObject {
    pub fn new<T: 'static>(name: &str, data: T) -> Self {
        Self {
            name: name.to_string(),
            type_id: TypeId::of::<T>(),
            data: RefCell::new(Box::new(data)),
            delegate: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn borrow<T: 'static>(&self) -> OpResult<CellRef<'_, T>> {
        CellRef::filter_map(self.data.borrow(), |d| d.downcast_ref::<T>())
            .map_err(|_| ErrorCode::InvalidType)
    }

    pub fn borrow_mut<T: 'static>(&self) -> OpResult<RefMut<'_, T>> {
        RefMut::filter_map(self.data.borrow_mut(), |d| d.downcast_mut::<T>())
            .map_err(|_| ErrorCode::InvalidType)
    }

    pub fn delegate(&self) -> Option<Value> {
        self.delegate.borrow().clone()
    }

    pub fn set_delegate(&self, delegate: Option<Value>) {
        let old = std::mem::replace(&mut *self.delegate.borrow_mut(), delegate);
        drop(old);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture cells
// ─────────────────────────────────────────────────────────────────────────────

/// Shared storage for a local that outlives its frame.
pub struct CaptureCell {
    value: RefCell<Value>,
}

impl HeapObject for CaptureCell {
    const TAG: MemoryTag = MemoryTag::Capture;
}

impl CaptureCell {
    pub fn new(value: Value) -> Self {
        Self {
            value: RefCell::new(value),
        }
    }

    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        let old = std::mem::replace(&mut *self.value.borrow_mut(), value);
        drop(old);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Meta-methods
// ─────────────────────────────────────────────────────────────────────────────

/// Operator-overload slots looked up on a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaMethod {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    Lshift,
    Rshift,
    Unm,
    Incr,
    Decr,
    Typeof,
    Tostring,
    Get,
    Set,
    Call,
    Compare,
    Cloned,
}

impl MetaMethod {
    pub fn name(self) -> &'static str {
        match self {
            MetaMethod::Add => "__add",
            MetaMethod::Sub => "__sub",
            MetaMethod::Mul => "__mul",
            MetaMethod::Div => "__div",
            MetaMethod::Mod => "__mod",
            MetaMethod::Exp => "__exp",
            MetaMethod::Lshift => "__lshift",
            MetaMethod::Rshift => "__rshift",
            MetaMethod::Unm => "__unm",
            MetaMethod::Incr => "__incr",
            MetaMethod::Decr => "__decr",
            MetaMethod::Typeof => "__typeof",
            MetaMethod::Tostring => "__tostring",
            MetaMethod::Get => "__get",
            MetaMethod::Set => "__set",
            MetaMethod::Call => "__call",
            MetaMethod::Compare => "__compare",
            MetaMethod::Cloned => "__cloned",
        }
    }
}

impl fmt::Display for MetaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The delegate consulted for meta-methods of `value`, if any. Struct
/// instances delegate to their schema.
pub fn delegate_of(value: &Value) -> Option<Value> {
    match value {
        Value::Table(t) => t.delegate(),
        Value::UserData(u) => u.delegate(),
        Value::StructInstance(i) => Some(Value::Struct(i.schema().clone())),
        _ => None,
    }
}

/// Find `meta` on `delegate`, following table delegate chains.
pub fn lookup_meta(delegate: &Value, meta: MetaMethod) -> Option<Value> {
    const MAX_CHAIN: usize = 32;
    let mut current = delegate.clone();
    for _ in 0..MAX_CHAIN {
        match &current {
            Value::Table(t) => {
                if let Some(found) = t.get_str(meta.name()) {
                    return Some(found);
                }
                current = t.delegate()?;
            }
            Value::Struct(s) => return s.find_method(meta.name()),
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn test_table_str_lookup() {
        let engine = Engine::new();
        let table = TableObject::new();
        table.set(Value::string(&engine, "name"), Value::Integer(5)).unwrap();
        table
            .set(Value::string(&engine, "a key that does not fit inline"), Value::Bool(true))
            .unwrap();
        assert_eq!(table.get_str("name"), Some(Value::Integer(5)));
        assert_eq!(table.get_str("a key that does not fit inline"), Some(Value::Bool(true)));
        assert_eq!(table.get_str("missing"), None);
    }

    #[test]
    fn test_table_preserves_insertion_order() {
        let engine = Engine::new();
        let table = TableObject::new();
        for key in ["z", "a", "m"] {
            table.set(Value::string(&engine, key), Value::Null).unwrap();
        }
        let keys: Vec<String> = table.entries().iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["z", "a", "m"]);
        assert_eq!(table.entry_at(1).map(|(k, _)| k.to_string()), Some("a".to_string()));
    }

    #[test]
    fn test_sealed_table_rejects_writes() {
        let table = TableObject::new();
        table.set(Value::Integer(1), Value::Integer(2)).unwrap();
        table.seal();
        assert_eq!(
            table.set(Value::Integer(3), Value::Null),
            Err(ErrorCode::CantModifyExportTable)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_null_key_rejected() {
        let table = TableObject::new();
        assert_eq!(table.set(Value::Null, Value::Integer(1)), Err(ErrorCode::InvalidArgument));
    }

    #[test]
    fn test_array_bounds() {
        let array = ArrayObject::new(vec![Value::Integer(1)]);
        assert_eq!(array.set(3, Value::Null), Err(ErrorCode::OutOfBounds));
        array.insert(1, Value::Integer(2)).unwrap();
        assert_eq!(array.erase(0), Ok(Value::Integer(1)));
        assert_eq!(array.snapshot(), vec![Value::Integer(2)]);
    }

    #[test]
    fn test_user_data_identity() {
        struct Point(i32);
        let ud = UserDataObject::new("point", Point(4));
        assert!(ud.is::<Point>());
        assert!(!ud.is::<String>());
        assert_eq!(ud.borrow::<Point>().unwrap().0, 4);
        ud.borrow_mut::<Point>().unwrap().0 = 9;
        assert_eq!(ud.borrow::<Point>().unwrap().0, 9);
        assert!(ud.borrow::<String>().is_err());
    }

    #[test]
    fn test_meta_lookup_follows_delegates() {
        let engine = Engine::new();
        let base = Value::table(&engine);
        base.as_table()
            .unwrap()
            .set(Value::string(&engine, "__add"), Value::Integer(1))
            .unwrap();
        let mid = Value::table(&engine);
        mid.as_table().unwrap().set_delegate(Some(base));
        assert_eq!(lookup_meta(&mid, MetaMethod::Add), Some(Value::Integer(1)));
        assert_eq!(lookup_meta(&mid, MetaMethod::Sub), None);
    }
}
