//! Struct schemas and instances.
//!
//! A [`StructObject`] is the declared shape of a value type: ordered members
//! with defaults and type masks, statics, methods and a constructor overload
//! set. A [`StructInstanceObject`] is a flat slot array cloned from the
//! schema defaults, one slot per non-static member in declaration order.
//!
//! # Lifecycle
//!
//! An instance starts uninitialized. While its constructor runs, const
//! members may still be written. The VM then marks it initialized, even when
//! the constructor failed, and from that point const writes are rejected.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use tracing::debug;

use crate::engine::MemoryTag;
use crate::error::{ErrorCode, OpResult};
use crate::heap::{HeapObject, Ref};
use crate::object::ClosureObject;
use crate::value::{TypeMask, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StructMember {
    pub name: String,
    pub default: Value,
    pub mask: TypeMask,
    pub is_private: bool,
    pub is_const: bool,
}

#[derive(Clone)]
pub struct StructStatic {
    pub name: String,
    pub value: Value,
    pub mask: TypeMask,
    pub is_private: bool,
    pub is_const: bool,
}

#[derive(Clone)]
pub struct StructMethod {
    pub name: String,
    pub closure: Value,
    pub is_static: bool,
    pub is_private: bool,
    pub is_const: bool,
}

/// Declaration flags carried by a member opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    pub is_static: bool,
    pub is_private: bool,
    pub is_const: bool,
}

impl MemberFlags {
    const STATIC: u8 = 0b001;
    const PRIVATE: u8 = 0b010;
    const CONST: u8 = 0b100;

    pub fn to_byte(self) -> u8 {
        (self.is_static as u8 * Self::STATIC)
            | (self.is_private as u8 * Self::PRIVATE)
            | (self.is_const as u8 * Self::CONST)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            is_static: b & Self::STATIC != 0,
            is_private: b & Self::PRIVATE != 0,
            is_const: b & Self::CONST != 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Constructor signatures
// ─────────────────────────────────────────────────────────────────────────────

/// Parameter masks of a constructor, `this` excluded, plus how many trailing
/// parameters have defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructorSignature {
    pub masks: Vec<TypeMask>,
    pub defaults: usize,
}

impl ConstructorSignature {
    pub fn new(masks: Vec<TypeMask>, defaults: usize) -> Self {
        Self { masks, defaults }
    }

    pub fn of_closure(closure: &ClosureObject) -> Self {
        let masks = (0..closure.arity())
            .map(|i| closure.proto.parameter_mask(i))
            .collect();
        Self::new(masks, closure.defaults.len())
    }

    pub fn arity(&self) -> usize {
        self.masks.len()
    }

    /// Callable with no user arguments.
    pub fn is_default_eligible(&self) -> bool {
        self.arity() == 0 || self.defaults >= self.arity()
    }

    pub fn accepts_count(&self, n: usize) -> bool {
        n <= self.arity() && n + self.defaults >= self.arity()
    }

    pub fn accepts_args(&self, args: &[Value]) -> bool {
        args.iter().zip(&self.masks).all(|(a, m)| m.accepts(a))
    }

    /// Number of supplied arguments matched by an explicit restriction.
    fn specificity(&self, args: &[Value]) -> usize {
        self.masks
            .iter()
            .take(args.len())
            .filter(|m| !m.is_unrestricted())
            .count()
    }
}

/// Validate adding `new` next to `existing` constructors.
///
/// A second default-eligible constructor (or one next to an explicit
/// `= default`) is `DuplicatedDefaultConstructor`; the same arity with the
/// same masks is `AmbiguousConstructors`.
pub fn check_constructor_signature(
    existing: &[ConstructorSignature],
    has_default_flag: bool,
    new: &ConstructorSignature,
) -> OpResult<()> {
    if new.is_default_eligible()
        && (has_default_flag || existing.iter().any(ConstructorSignature::is_default_eligible))
    {
        return Err(ErrorCode::DuplicatedDefaultConstructor);
    }
    if existing
        .iter()
        .any(|s| s.arity() == new.arity() && s.masks == new.masks)
    {
        return Err(ErrorCode::AmbiguousConstructors);
    }
    Ok(())
}

/// Validate an explicit `constructor() = default;` declaration.
pub fn check_default_flag(existing: &[ConstructorSignature], has_default_flag: bool) -> OpResult<()> {
    if has_default_flag || existing.iter().any(ConstructorSignature::is_default_eligible) {
        return Err(ErrorCode::DuplicatedDefaultConstructor);
    }
    Ok(())
}

#[derive(Clone)]
pub struct Constructor {
    pub closure: Value,
    pub signature: ConstructorSignature,
}

/// Either nothing, one constructor, or an overload set.
#[derive(Clone, Default)]
pub enum Constructors {
    #[default]
    None,
    Single(Constructor),
    Overloads(Vec<Constructor>),
}

impl Constructors {
    pub fn as_slice(&self) -> &[Constructor] {
        match self {
            Constructors::None => &[],
            Constructors::Single(c) => std::slice::from_ref(c),
            Constructors::Overloads(list) => list,
        }
    }

    fn push(&mut self, ctor: Constructor) {
        *self = match std::mem::take(self) {
            Constructors::None => Constructors::Single(ctor),
            Constructors::Single(first) => Constructors::Overloads(vec![first, ctor]),
            Constructors::Overloads(mut list) => {
                list.push(ctor);
                Constructors::Overloads(list)
            }
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StructObject
// ─────────────────────────────────────────────────────────────────────────────

/// A struct schema.
pub struct StructObject {
    name: String,
    members: RefCell<Vec<StructMember>>,
    statics: RefCell<Vec<StructStatic>>,
    methods: RefCell<Vec<StructMethod>>,
    constructors: RefCell<Constructors>,
    has_default_constructor: Cell<bool>,
}

impl HeapObject for StructObject {
    const TAG: MemoryTag = MemoryTag::Struct;
}

impl StructObject {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: RefCell::new(Vec::new()),
            statics: RefCell::new(Vec::new()),
            methods: RefCell::new(Vec::new()),
            constructors: RefCell::new(Constructors::None),
            has_default_constructor: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn name_taken(&self, name: &str) -> bool {
        self.members.borrow().iter().any(|m| m.name == name)
            || self.statics.borrow().iter().any(|s| s.name == name)
            || self.methods.borrow().iter().any(|m| m.name == name)
    }

    pub fn add_member(
        &self,
        name: &str,
        default: Value,
        mask: TypeMask,
        is_private: bool,
        is_const: bool,
    ) -> OpResult<()> {
        if self.name_taken(name) {
            return Err(ErrorCode::AlreadyExists);
        }
        if !default.is_null() && !mask.accepts(&default) {
            return Err(ErrorCode::InvalidTypeAssignment);
        }
        self.members.borrow_mut().push(StructMember {
            name: name.to_string(),
            default,
            mask,
            is_private,
            is_const,
        });
        Ok(())
    }

    pub fn add_static(
        &self,
        name: &str,
        value: Value,
        mask: TypeMask,
        is_private: bool,
        is_const: bool,
    ) -> OpResult<()> {
        if self.name_taken(name) {
            return Err(ErrorCode::AlreadyExists);
        }
        if !value.is_null() && !mask.accepts(&value) {
            return Err(ErrorCode::InvalidTypeAssignment);
        }
        self.statics.borrow_mut().push(StructStatic {
            name: name.to_string(),
            value,
            mask,
            is_private,
            is_const,
        });
        Ok(())
    }

    pub fn add_method(&self, name: &str, closure: Value, flags: MemberFlags) -> OpResult<()> {
        if self.name_taken(name) {
            return Err(ErrorCode::AlreadyExists);
        }
        if !closure.is_callable() {
            return Err(ErrorCode::InvalidType);
        }
        self.methods.borrow_mut().push(StructMethod {
            name: name.to_string(),
            closure,
            is_static: flags.is_static,
            is_private: flags.is_private,
            is_const: flags.is_const,
        });
        Ok(())
    }

    /// Register a constructor closure, enforcing the overload rules.
    pub fn add_constructor(&self, closure: Value) -> OpResult<()> {
        let signature = match &closure {
            Value::Closure(c) => ConstructorSignature::of_closure(c),
            _ => return Err(ErrorCode::InvalidType),
        };
        let existing: Vec<ConstructorSignature> = self
            .constructors
            .borrow()
            .as_slice()
            .iter()
            .map(|c| c.signature.clone())
            .collect();
        check_constructor_signature(&existing, self.has_default_constructor.get(), &signature)?;
        self.constructors
            .borrow_mut()
            .push(Constructor { closure, signature });
        Ok(())
    }

    /// Mark the schema as having a body-less default constructor.
    pub fn set_default_constructor(&self) -> OpResult<()> {
        let existing: Vec<ConstructorSignature> = self
            .constructors
            .borrow()
            .as_slice()
            .iter()
            .map(|c| c.signature.clone())
            .collect();
        check_default_flag(&existing, self.has_default_constructor.get())?;
        self.has_default_constructor.set(true);
        Ok(())
    }

    pub fn has_default_constructor(&self) -> bool {
        self.has_default_constructor.get()
    }

    pub fn constructor_count(&self) -> usize {
        self.constructors.borrow().as_slice().len()
    }

    /// Pick the constructor for a call with user arguments `args`.
    ///
    /// `Ok(None)` means no body runs and members keep their defaults.
    pub fn resolve_constructor(&self, args: &[Value]) -> OpResult<Option<Value>> {
        let n = args.len();
        if self.has_default_constructor.get() && n == 0 {
            return Ok(None);
        }

        let constructors = self.constructors.borrow();
        match &*constructors {
            Constructors::None => {
                if n > 0 {
                    return Err(ErrorCode::InvalidParameterCount);
                }
                Ok(None)
            }
            Constructors::Single(ctor) => {
                if !ctor.signature.accepts_count(n) {
                    return Err(ErrorCode::InvalidParameterCount);
                }
                if !ctor.signature.accepts_args(args) {
                    return Err(ErrorCode::InvalidParameters);
                }
                Ok(Some(ctor.closure.clone()))
            }
            Constructors::Overloads(list) => {
                let by_count: Vec<&Constructor> =
                    list.iter().filter(|c| c.signature.accepts_count(n)).collect();
                if by_count.is_empty() {
                    return Err(ErrorCode::InvalidParameterCount);
                }
                let by_mask: Vec<&Constructor> = by_count
                    .into_iter()
                    .filter(|c| c.signature.accepts_args(args))
                    .collect();
                match by_mask.as_slice() {
                    [] => Err(ErrorCode::InvalidOperation),
                    [only] => Ok(Some(only.closure.clone())),
                    many => {
                        let best = many
                            .iter()
                            .map(|c| c.signature.specificity(args))
                            .max()
                            .unwrap_or(0);
                        let mut top = many.iter().filter(|c| c.signature.specificity(args) == best);
                        match (top.next(), top.next()) {
                            (Some(only), None) => Ok(Some(only.closure.clone())),
                            _ => {
                                debug!(schema = %self.name, "ambiguous constructor call");
                                Err(ErrorCode::InvalidOperation)
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.borrow().iter().position(|m| m.name == name)
    }

    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.borrow().iter().map(|m| m.name.clone()).collect()
    }

    pub fn find_method(&self, name: &str) -> Option<Value> {
        self.methods
            .borrow()
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.closure.clone())
    }

    /// Read a static or a method through the schema.
    pub fn get_static(&self, name: &str, can_access_private: bool) -> OpResult<Value> {
        if let Some(s) = self.statics.borrow().iter().find(|s| s.name == name) {
            if s.is_private && !can_access_private {
                return Err(ErrorCode::InaccessiblePrivate);
            }
            return Ok(s.value.clone());
        }
        if let Some(m) = self.methods.borrow().iter().find(|m| m.name == name) {
            if m.is_private && !can_access_private {
                return Err(ErrorCode::InaccessiblePrivate);
            }
            return Ok(m.closure.clone());
        }
        Err(ErrorCode::Inaccessible)
    }

    pub fn set_static(&self, name: &str, value: Value, can_access_private: bool) -> OpResult<()> {
        let old = {
            let mut statics = self.statics.borrow_mut();
            let Some(s) = statics.iter_mut().find(|s| s.name == name) else {
                return Err(ErrorCode::Inaccessible);
            };
            if s.is_private && !can_access_private {
                return Err(ErrorCode::InaccessiblePrivate);
            }
            if s.is_const {
                return Err(ErrorCode::CantModifyStaticConst);
            }
            if !s.mask.accepts(&value) {
                return Err(ErrorCode::InvalidTypeAssignment);
            }
            std::mem::replace(&mut s.value, value)
        };
        drop(old);
        Ok(())
    }

    /// A fresh, uninitialized instance with every slot cloned from the
    /// member defaults.
    pub fn instantiate(schema: &Ref<StructObject>) -> Ref<StructInstanceObject> {
        let mut seen = HashMap::new();
        let slots = schema
            .members
            .borrow()
            .iter()
            .map(|m| m.default.clone_with(&mut seen))
            .collect();
        Ref::new(
            Ref::engine(schema),
            StructInstanceObject {
                schema: schema.clone(),
                slots: RefCell::new(slots),
                initialized: Cell::new(false),
            },
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StructInstanceObject
// ─────────────────────────────────────────────────────────────────────────────

pub struct StructInstanceObject {
    schema: Ref<StructObject>,
    slots: RefCell<Vec<Value>>,
    initialized: Cell<bool>,
}

impl HeapObject for StructInstanceObject {
    const TAG: MemoryTag = MemoryTag::StructInstance;
}

impl StructInstanceObject {
    pub fn schema(&self) -> &Ref<StructObject> {
        &self.schema
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub fn mark_initialized(&self) {
        self.initialized.set(true);
    }

    /// Member, then static, then method lookup.
    pub fn get(&self, name: &str, can_access_private: bool) -> OpResult<Value> {
        let member = {
            let members = self.schema.members.borrow();
            members
                .iter()
                .position(|m| m.name == name)
                .map(|i| (i, members[i].is_private))
        };
        match member {
            Some((_, true)) if !can_access_private => Err(ErrorCode::InaccessiblePrivate),
            Some((i, _)) => self.slots.borrow().get(i).cloned().ok_or(ErrorCode::OutOfBounds),
            None => self.schema.get_static(name, can_access_private),
        }
    }

    pub fn set(&self, name: &str, value: Value, can_access_private: bool) -> OpResult<()> {
        let member = {
            let members = self.schema.members.borrow();
            members
                .iter()
                .position(|m| m.name == name)
                .map(|i| (i, members[i].is_private, members[i].is_const, members[i].mask))
        };
        let Some((index, is_private, is_const, mask)) = member else {
            return self.schema.set_static(name, value, can_access_private);
        };
        if is_private && !can_access_private {
            return Err(ErrorCode::InaccessiblePrivate);
        }
        if is_const && self.initialized.get() {
            return Err(ErrorCode::CantModifyConstMember);
        }
        if !mask.accepts(&value) {
            return Err(ErrorCode::InvalidTypeAssignment);
        }
        let old = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.get_mut(index).ok_or(ErrorCode::OutOfBounds)?;
            std::mem::replace(slot, value)
        };
        drop(old);
        Ok(())
    }

    /// `(name, value)` for every member, in declaration order.
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.schema
            .member_names()
            .into_iter()
            .zip(self.slots.borrow().iter().cloned())
            .collect()
    }

    pub(crate) fn clone_shell(&self) -> Ref<StructInstanceObject> {
        Ref::new(
            Ref::engine(&self.schema),
            StructInstanceObject {
                schema: self.schema.clone(),
                slots: RefCell::new(Vec::new()),
                initialized: Cell::new(self.initialized.get()),
            },
        )
    }

    pub(crate) fn clone_slots_into(
        &self,
        target: &StructInstanceObject,
        seen: &mut HashMap<*const (), Value>,
    ) {
        let copied: Vec<Value> = self
            .slots
            .borrow()
            .clone()
            .iter()
            .map(|v| v.clone_with(seen))
            .collect();
        *target.slots.borrow_mut() = copied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn sig(masks: &[TypeMask], defaults: usize) -> ConstructorSignature {
        ConstructorSignature::new(masks.to_vec(), defaults)
    }

    fn point_schema(engine: &Engine) -> Ref<StructObject> {
        let schema = Ref::new(engine, StructObject::new("Point"));
        schema.add_member("x", Value::Integer(0), TypeMask::NUMBER, false, false).unwrap();
        schema.add_member("id", Value::Integer(7), TypeMask::ANY, false, true).unwrap();
        schema.add_member("secret", Value::Null, TypeMask::ANY, true, false).unwrap();
        schema.add_static("ORIGIN", Value::Integer(0), TypeMask::ANY, false, true).unwrap();
        schema.add_static("count", Value::Integer(0), TypeMask::INTEGER, false, false).unwrap();
        schema
    }

    #[test]
    fn test_identical_signatures_are_ambiguous() {
        let existing = [sig(&[TypeMask::INTEGER], 0)];
        assert_eq!(
            check_constructor_signature(&existing, false, &sig(&[TypeMask::INTEGER], 0)),
            Err(ErrorCode::AmbiguousConstructors)
        );
        assert_eq!(
            check_constructor_signature(&existing, false, &sig(&[TypeMask::STRING], 0)),
            Ok(())
        );
    }

    #[test]
    fn test_second_default_eligible_is_duplicate() {
        let existing = [sig(&[TypeMask::ANY, TypeMask::ANY], 2)];
        assert_eq!(
            check_constructor_signature(&existing, false, &sig(&[], 0)),
            Err(ErrorCode::DuplicatedDefaultConstructor)
        );
        assert_eq!(check_default_flag(&existing, false), Err(ErrorCode::DuplicatedDefaultConstructor));
        assert_eq!(
            check_constructor_signature(&[], true, &sig(&[TypeMask::ANY], 1)),
            Err(ErrorCode::DuplicatedDefaultConstructor)
        );
    }

    #[test]
    fn test_accepts_count_with_defaults() {
        let s = sig(&[TypeMask::ANY, TypeMask::ANY, TypeMask::ANY], 2);
        assert!(!s.accepts_count(0));
        assert!(s.accepts_count(1));
        assert!(s.accepts_count(3));
        assert!(!s.accepts_count(4));
    }

    #[test]
    fn test_no_constructors_accepts_only_empty_call() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        assert!(matches!(schema.resolve_constructor(&[]), Ok(None)));
        assert_eq!(
            schema.resolve_constructor(&[Value::Integer(1)]).err(),
            Some(ErrorCode::InvalidParameterCount)
        );
    }

    #[test]
    fn test_default_flag_short_circuits() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        schema.set_default_constructor().unwrap();
        assert!(matches!(schema.resolve_constructor(&[]), Ok(None)));
        assert_eq!(schema.set_default_constructor(), Err(ErrorCode::DuplicatedDefaultConstructor));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        assert_eq!(
            schema.add_member("x", Value::Null, TypeMask::ANY, false, false),
            Err(ErrorCode::AlreadyExists)
        );
        assert_eq!(
            schema.add_static("x", Value::Null, TypeMask::ANY, false, false),
            Err(ErrorCode::AlreadyExists)
        );
    }

    #[test]
    fn test_const_member_writable_until_initialized() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        let inst = StructObject::instantiate(&schema);
        assert_eq!(inst.set("id", Value::Integer(1), false), Ok(()));
        inst.mark_initialized();
        assert_eq!(
            inst.set("id", Value::Integer(2), false),
            Err(ErrorCode::CantModifyConstMember)
        );
        assert_eq!(inst.get("id", false), Ok(Value::Integer(1)));
    }

    #[test]
    fn test_set_errors() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        let inst = StructObject::instantiate(&schema);
        inst.mark_initialized();
        assert_eq!(
            inst.set("x", Value::string(&engine, "no"), false),
            Err(ErrorCode::InvalidTypeAssignment)
        );
        assert_eq!(inst.set("nope", Value::Null, false), Err(ErrorCode::Inaccessible));
        assert_eq!(inst.set("secret", Value::Null, false), Err(ErrorCode::InaccessiblePrivate));
        assert_eq!(inst.set("secret", Value::Integer(3), true), Ok(()));
        assert_eq!(
            inst.set("ORIGIN", Value::Integer(1), false),
            Err(ErrorCode::CantModifyStaticConst)
        );
        assert_eq!(inst.get("secret", false), Err(ErrorCode::InaccessiblePrivate));
    }

    #[test]
    fn test_statics_shared_through_instances() {
        let engine = Engine::new();
        let schema = point_schema(&engine);
        let a = StructObject::instantiate(&schema);
        let b = StructObject::instantiate(&schema);
        a.set("count", Value::Integer(5), false).unwrap();
        assert_eq!(b.get("count", false), Ok(Value::Integer(5)));
        assert_eq!(schema.get_static("count", false), Ok(Value::Integer(5)));
    }

    #[test]
    fn test_instances_get_independent_container_defaults() {
        let engine = Engine::new();
        let schema = Ref::new(&engine, StructObject::new("Holder"));
        let items = Value::array(&engine, vec![Value::Integer(1)]);
        schema.add_member("items", items, TypeMask::ANY, false, false).unwrap();
        let a = StructObject::instantiate(&schema);
        let b = StructObject::instantiate(&schema);
        let a_items = a.get("items", false).unwrap();
        a_items.as_array().unwrap().push(Value::Integer(2));
        let b_items = b.get("items", false).unwrap();
        assert_eq!(b_items.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_member_flags_byte() {
        let flags = MemberFlags { is_static: true, is_private: false, is_const: true };
        assert_eq!(MemberFlags::from_byte(flags.to_byte()), flags);
    }
}
