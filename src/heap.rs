//! Reference-counted heap objects.
//!
//! # Architecture
//!
//! Every heap value lives in an [`RcBox`]: a [`Header`] followed by the
//! payload. The header carries
//!
//! 1. the owning [`Engine`] (storage is returned to it on destruction),
//! 2. the strong count, initialised to 1 by [`Ref::new`],
//! 3. an optional, lazily created [`WeakRefObject`] indirection.
//!
//! # `Ref<T>`
//!
//! [`Ref<T>`] is the owning handle. Cloning retains, dropping releases; when
//! the count reaches zero the weak indirection is cleared first, then the
//! payload's destructor runs (cascading the release into child values), and
//! finally the storage goes back through the engine allocator.
//!
//! There is no cycle collector. A cycle of strong references leaks; break it
//! with a weak reference.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::engine::{Engine, MemoryTag};
use crate::value::Value;

// ─────────────────────────────────────────────────────────────────────────────
// HeapObject trait
// ─────────────────────────────────────────────────────────────────────────────

/// A payload type that can live behind a [`Ref`].
pub trait HeapObject: 'static {
    /// Accounting category for allocations of this type.
    const TAG: MemoryTag;
}

// ─────────────────────────────────────────────────────────────────────────────
// RcBox: the on-heap header + payload
// ─────────────────────────────────────────────────────────────────────────────

pub struct Header {
    engine: Engine,
    strong: Cell<usize>,
    weak: RefCell<Option<Ref<WeakRefObject>>>,
}

struct RcBox<T: HeapObject> {
    header: Header,
    value: T,
}

// ─────────────────────────────────────────────────────────────────────────────
// Ref<T>
// ─────────────────────────────────────────────────────────────────────────────

/// Owning, reference-counted handle to a heap object of type `T`.
pub struct Ref<T: HeapObject> {
    ptr: NonNull<RcBox<T>>,
    _marker: PhantomData<RcBox<T>>,
}

impl<T: HeapObject> Ref<T> {
    /// Construct `value` in storage obtained from `engine`. The new object
    /// starts with a strong count of 1.
    pub fn new(engine: &Engine, value: T) -> Self {
        let layout = Layout::new::<RcBox<T>>();
        let raw = engine.allocate(layout, T::TAG).cast::<RcBox<T>>();
        let header = Header {
            engine: engine.clone(),
            strong: Cell::new(1),
            weak: RefCell::new(None),
        };
        // SAFETY: `raw` is freshly allocated with the layout of `RcBox<T>`.
        unsafe { raw.as_ptr().write(RcBox { header, value }) };
        Self {
            ptr: raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn rc_box(&self) -> &RcBox<T> {
        // SAFETY: a live `Ref` keeps the strong count above zero, so the box
        // has not been destroyed.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn header(this: &Self) -> &Header {
        &this.rc_box().header
    }

    pub fn strong_count(this: &Self) -> usize {
        this.rc_box().header.strong.get()
    }

    /// Increment the strong count. Must be balanced by [`Ref::release`].
    pub fn retain(this: &Self) {
        let strong = &this.rc_box().header.strong;
        strong.set(strong.get() + 1);
    }

    /// Decrement the strong count, destroying the object when it reaches
    /// zero. Returns whether the object was destroyed.
    ///
    /// # Safety
    ///
    /// Each call must be balanced by an earlier [`Ref::retain`] or by giving
    /// up this handle without running its destructor (`mem::forget`).
    pub unsafe fn release(this: &Self) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { Self::release_raw(this.ptr) }
    }

    unsafe fn release_raw(ptr: NonNull<RcBox<T>>) -> bool {
        // SAFETY: the caller owns one strong reference, so the box is live.
        let strong = unsafe { &ptr.as_ref().header.strong };
        let count = strong.get() - 1;
        strong.set(count);
        if count > 0 {
            return false;
        }
        // SAFETY: the count just reached zero; nothing else can observe the box.
        unsafe { Self::destroy(ptr) };
        true
    }

    unsafe fn destroy(ptr: NonNull<RcBox<T>>) {
        let raw = ptr.as_ptr();
        // SAFETY: the box is live until the deallocation below; the engine
        // handle is moved out exactly once and the header is not dropped again.
        unsafe {
            let weak = (*raw).header.weak.borrow_mut().take();
            if let Some(weak) = weak {
                weak.expire();
            }
            let engine = std::ptr::read(&(*raw).header.engine);
            std::ptr::drop_in_place(&mut (*raw).value);
            engine.deallocate(ptr.cast(), Layout::new::<RcBox<T>>(), T::TAG);
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Address of the allocation, used for identity hashing.
    pub fn as_ptr(this: &Self) -> *const () {
        this.ptr.as_ptr() as *const ()
    }

    pub fn engine(this: &Self) -> &Engine {
        &this.rc_box().header.engine
    }
}

impl<T: HeapObject> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref::retain(self);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: HeapObject> Drop for Ref<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one strong reference.
        unsafe {
            Self::release_raw(self.ptr);
        }
    }
}

impl<T: HeapObject> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.rc_box().value
    }
}

impl<T: HeapObject + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Weak references
// ─────────────────────────────────────────────────────────────────────────────

/// The weak indirection shared by every weak handle to one object.
///
/// `target` holds an unretained alias of the referent. It is cleared by the
/// referent's destructor, so a weak handle never dangles and never keeps the
/// referent alive.
pub struct WeakRefObject {
    target: RefCell<Option<ManuallyDrop<Value>>>,
}

impl HeapObject for WeakRefObject {
    const TAG: MemoryTag = MemoryTag::WeakRef;
}

impl fmt::Debug for WeakRefObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_expired() {
            f.write_str("WeakRef(expired)")
        } else {
            f.write_str("WeakRef(alive)")
        }
    }
}

impl WeakRefObject {
    /// A strong copy of the referent, or `None` once it was destroyed.
    pub fn upgrade(&self) -> Option<Value> {
        self.target.borrow().as_ref().map(|v| Value::clone(v))
    }

    pub fn is_expired(&self) -> bool {
        self.target.borrow().is_none()
    }

    fn expire(&self) {
        // Dropping the `ManuallyDrop` leaves the alias unreleased.
        let _ = self.target.borrow_mut().take();
    }
}

/// Return the weak indirection of the object behind `this`, creating it on
/// first use. `alias` must be the value that wraps `this`.
pub(crate) fn weak_indirection<T: HeapObject>(this: &Ref<T>, alias: &Value) -> Ref<WeakRefObject> {
    let header = Ref::header(this);
    if let Some(existing) = header.weak.borrow().as_ref() {
        return existing.clone();
    }
    // SAFETY: the bitwise copy is never dropped; it is cleared by `expire`
    // before the referent's storage is released.
    let unretained = ManuallyDrop::new(unsafe { std::ptr::read(alias) });
    let weak = Ref::new(
        &header.engine,
        WeakRefObject {
            target: RefCell::new(Some(unretained)),
        },
    );
    *header.weak.borrow_mut() = Some(weak.clone());
    weak
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct Probe {
        drops: Rc<Cell<usize>>,
    }

    impl HeapObject for Probe {
        const TAG: MemoryTag = MemoryTag::Other;
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn probe(engine: &Engine) -> (Ref<Probe>, Rc<Cell<usize>>) {
        let drops = Rc::new(Cell::new(0));
        let r = Ref::new(engine, Probe { drops: drops.clone() });
        (r, drops)
    }

    #[test]
    fn test_new_starts_at_one() {
        let engine = Engine::new();
        let (r, _) = probe(&engine);
        assert_eq!(Ref::strong_count(&r), 1);
        assert_eq!(engine.stats(MemoryTag::Other).live_objects, 1);
    }

    #[test]
    fn test_retain_release_balanced() {
        let engine = Engine::new();
        let (r, drops) = probe(&engine);
        Ref::retain(&r);
        assert_eq!(Ref::strong_count(&r), 2);
        let destroyed = unsafe { Ref::release(&r) };
        assert!(!destroyed);
        assert_eq!(Ref::strong_count(&r), 1);
        assert_eq!(drops.get(), 0);
    }

    #[test]
    fn test_destroyed_exactly_once() {
        let engine = Engine::new();
        let (r, drops) = probe(&engine);
        let a = r.clone();
        let b = r.clone();
        assert_eq!(Ref::strong_count(&r), 3);
        drop(a);
        drop(r);
        assert_eq!(drops.get(), 0);
        drop(b);
        assert_eq!(drops.get(), 1);
        assert_eq!(engine.stats(MemoryTag::Other).live_objects, 0);
    }

    #[test]
    fn test_manual_release_destroys() {
        let engine = Engine::new();
        let (r, drops) = probe(&engine);
        let destroyed = unsafe { Ref::release(&r) };
        assert!(destroyed);
        std::mem::forget(r);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_ptr_eq() {
        let engine = Engine::new();
        let (a, _) = probe(&engine);
        let (b, _) = probe(&engine);
        assert!(Ref::ptr_eq(&a, &a.clone()));
        assert!(!Ref::ptr_eq(&a, &b));
    }
}
