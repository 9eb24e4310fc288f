//! The allocation authority shared by VM instances.
//!
//! Every heap object is allocated through an [`Engine`] and tagged with a
//! [`MemoryTag`] so that live objects and bytes can be accounted per
//! category. The engine also carries the embedding hooks: a user pointer
//! with its release hook, the host output stream and an initializer that runs
//! once the engine is built.
//!
//! An `Engine` is a cheap handle (`Rc`) and is threaded explicitly through
//! every constructor; there is no global allocator state.

use std::alloc::Layout;
use std::any::Any;
use std::cell::{Ref as CellRef, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::ptr::NonNull;
use std::rc::Rc;

use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Memory tags
// ─────────────────────────────────────────────────────────────────────────────

/// Allocation category, used for accounting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryTag {
    String,
    MutableString,
    Table,
    Array,
    Closure,
    NativeClosure,
    Struct,
    StructInstance,
    UserData,
    WeakRef,
    Capture,
    Prototype,
    Other,
}

impl MemoryTag {
    pub const COUNT: usize = 13;

    pub fn name(self) -> &'static str {
        match self {
            MemoryTag::String => "string",
            MemoryTag::MutableString => "mutable_string",
            MemoryTag::Table => "table",
            MemoryTag::Array => "array",
            MemoryTag::Closure => "closure",
            MemoryTag::NativeClosure => "native_closure",
            MemoryTag::Struct => "struct",
            MemoryTag::StructInstance => "struct_instance",
            MemoryTag::UserData => "user_data",
            MemoryTag::WeakRef => "weak_ref",
            MemoryTag::Capture => "capture",
            MemoryTag::Prototype => "prototype",
            MemoryTag::Other => "other",
        }
    }
}

/// Per-tag allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub total_allocations: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Allocators
// ─────────────────────────────────────────────────────────────────────────────

/// Raw storage provider behind an [`Engine`].
pub trait Allocator {
    /// Returns `None` when the request cannot be satisfied.
    fn allocate(&self, layout: Layout, tag: MemoryTag) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same layout
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, tag: MemoryTag);

    /// Resize a block. The default moves the contents into a fresh block.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::deallocate`] for `ptr` and `old`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
        tag: MemoryTag,
    ) -> Option<NonNull<u8>> {
        let new_layout = Layout::from_size_align(new_size, old.align()).ok()?;
        let fresh = self.allocate(new_layout, tag)?;
        // SAFETY: both blocks are valid for the copied length and do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old.size().min(new_size));
            self.deallocate(ptr, old, tag);
        }
        Some(fresh)
    }
}

/// Allocator backed by the global Rust allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, layout: Layout, _tag: MemoryTag) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return Some(NonNull::dangling());
        }
        // SAFETY: the layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, _tag: MemoryTag) {
        if layout.size() != 0 {
            // SAFETY: forwarded from the caller.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Host allocation callback: `(size, align, tag) -> pointer or null`.
pub type AllocateFn = fn(usize, usize, MemoryTag) -> *mut u8;
/// Host deallocation callback: `(pointer, size, align, tag)`.
pub type DeallocateFn = fn(*mut u8, usize, usize, MemoryTag);

/// Allocator that forwards to a pair of host callbacks.
#[derive(Clone, Copy)]
pub struct CallbackAllocator {
    pub allocate: AllocateFn,
    pub deallocate: DeallocateFn,
}

impl fmt::Debug for CallbackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackAllocator")
    }
}

impl Allocator for CallbackAllocator {
    fn allocate(&self, layout: Layout, tag: MemoryTag) -> Option<NonNull<u8>> {
        NonNull::new((self.allocate)(layout.size(), layout.align(), tag))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, tag: MemoryTag) {
        (self.deallocate)(ptr.as_ptr(), layout.size(), layout.align(), tag)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

type ReleaseHook = Box<dyn FnOnce(Box<dyn Any>)>;
type Initializer = Box<dyn FnOnce(&Engine)>;

struct EngineInner {
    allocator: Box<dyn Allocator>,
    stats: RefCell<[TagStats; MemoryTag::COUNT]>,
    user_pointer: RefCell<Option<Box<dyn Any>>>,
    release_hook: RefCell<Option<ReleaseHook>>,
    stream: RefCell<Box<dyn Write>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let user = self.user_pointer.get_mut().take();
        let hook = self.release_hook.get_mut().take();
        if let (Some(user), Some(hook)) = (user, hook) {
            hook(user);
        }
    }
}

/// Shared handle to the allocation authority.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("live_objects", &self.live_objects())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine on the system allocator writing to stdout.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Allocate storage for `layout`. Exhaustion is a hard fault.
    pub fn allocate(&self, layout: Layout, tag: MemoryTag) -> NonNull<u8> {
        let Some(ptr) = self.inner.allocator.allocate(layout, tag) else {
            std::alloc::handle_alloc_error(layout)
        };
        let mut stats = self.inner.stats.borrow_mut();
        let entry = &mut stats[tag as usize];
        entry.live_objects += 1;
        entry.live_bytes += layout.size();
        entry.total_allocations += 1;
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Engine::allocate`] on this engine with the same
    /// layout and tag, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, tag: MemoryTag) {
        {
            let mut stats = self.inner.stats.borrow_mut();
            let entry = &mut stats[tag as usize];
            entry.live_objects = entry.live_objects.saturating_sub(1);
            entry.live_bytes = entry.live_bytes.saturating_sub(layout.size());
        }
        // SAFETY: forwarded from the caller.
        unsafe { self.inner.allocator.deallocate(ptr, layout, tag) }
    }

    /// # Safety
    ///
    /// Same contract as [`Engine::deallocate`] for `ptr` and `old`.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
        tag: MemoryTag,
    ) -> NonNull<u8> {
        // SAFETY: forwarded from the caller.
        let fresh = unsafe { self.inner.allocator.reallocate(ptr, old, new_size, tag) };
        let Some(fresh) = fresh else {
            std::alloc::handle_alloc_error(old)
        };
        let mut stats = self.inner.stats.borrow_mut();
        let entry = &mut stats[tag as usize];
        entry.live_bytes = entry.live_bytes.saturating_sub(old.size()) + new_size;
        fresh
    }

    pub fn stats(&self, tag: MemoryTag) -> TagStats {
        self.inner.stats.borrow()[tag as usize]
    }

    /// Live heap objects across every tag.
    pub fn live_objects(&self) -> usize {
        self.inner.stats.borrow().iter().map(|s| s.live_objects).sum()
    }

    pub fn live_bytes(&self) -> usize {
        self.inner.stats.borrow().iter().map(|s| s.live_bytes).sum()
    }

    /// Borrow the user pointer if it holds a `T`.
    pub fn user_pointer<T: Any>(&self) -> Option<CellRef<'_, T>> {
        CellRef::filter_map(self.inner.user_pointer.borrow(), |p| {
            p.as_ref().and_then(|b| (**b).downcast_ref::<T>())
        })
        .ok()
    }

    pub fn set_user_pointer(&self, user: Box<dyn Any>) {
        *self.inner.user_pointer.borrow_mut() = Some(user);
    }

    /// Write to the host stream.
    pub fn write_stream(&self, text: &str) -> io::Result<()> {
        let mut stream = self.inner.stream.borrow_mut();
        stream.write_all(text.as_bytes())?;
        stream.flush()
    }

    pub fn set_stream(&self, stream: Box<dyn Write>) {
        *self.inner.stream.borrow_mut() = stream;
    }

    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures an [`Engine`] before it is shared.
#[derive(Default)]
pub struct EngineBuilder {
    allocator: Option<Box<dyn Allocator>>,
    user_pointer: Option<Box<dyn Any>>,
    release_hook: Option<ReleaseHook>,
    stream: Option<Box<dyn Write>>,
    initializer: Option<Initializer>,
}

impl EngineBuilder {
    pub fn allocator(mut self, allocator: impl Allocator + 'static) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Install a host allocate/deallocate callback pair.
    pub fn callbacks(self, allocate: AllocateFn, deallocate: DeallocateFn) -> Self {
        self.allocator(CallbackAllocator { allocate, deallocate })
    }

    pub fn user_pointer(mut self, user: impl Any) -> Self {
        self.user_pointer = Some(Box::new(user));
        self
    }

    /// Called with the user pointer when the last engine handle drops.
    pub fn release_hook(mut self, hook: impl FnOnce(Box<dyn Any>) + 'static) -> Self {
        self.release_hook = Some(Box::new(hook));
        self
    }

    pub fn stream(mut self, stream: impl Write + 'static) -> Self {
        self.stream = Some(Box::new(stream));
        self
    }

    /// Runs once, right after the engine is built.
    pub fn initializer(mut self, init: impl FnOnce(&Engine) + 'static) -> Self {
        self.initializer = Some(Box::new(init));
        self
    }

    pub fn build(self) -> Engine {
        let engine = Engine {
            inner: Rc::new(EngineInner {
                allocator: self.allocator.unwrap_or_else(|| Box::new(SystemAllocator)),
                stats: RefCell::new([TagStats::default(); MemoryTag::COUNT]),
                user_pointer: RefCell::new(self.user_pointer),
                release_hook: RefCell::new(self.release_hook),
                stream: RefCell::new(self.stream.unwrap_or_else(|| Box::new(io::stdout()))),
            }),
        };
        debug!("engine created");
        if let Some(init) = self.initializer {
            init(&engine);
        }
        engine
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture stream
// ─────────────────────────────────────────────────────────────────────────────

/// An in-memory stream whose contents stay readable after it is handed to
/// an engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    buffer: Rc<RefCell<Vec<u8>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.borrow()).into_owned()
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static CALLBACK_ALLOCS: Cell<usize> = const { Cell::new(0) };
    }

    fn counting_alloc(size: usize, align: usize, _tag: MemoryTag) -> *mut u8 {
        CALLBACK_ALLOCS.with(|c| c.set(c.get() + 1));
        let layout = Layout::from_size_align(size, align).unwrap();
        unsafe { std::alloc::alloc(layout) }
    }

    fn counting_dealloc(ptr: *mut u8, size: usize, align: usize, _tag: MemoryTag) {
        CALLBACK_ALLOCS.with(|c| c.set(c.get() - 1));
        let layout = Layout::from_size_align(size, align).unwrap();
        unsafe { std::alloc::dealloc(ptr, layout) }
    }

    #[test]
    fn test_stats_track_allocations() {
        let engine = Engine::new();
        let layout = Layout::new::<[u64; 4]>();
        let ptr = engine.allocate(layout, MemoryTag::Table);
        assert_eq!(engine.stats(MemoryTag::Table).live_objects, 1);
        assert_eq!(engine.stats(MemoryTag::Table).live_bytes, 32);
        unsafe { engine.deallocate(ptr, layout, MemoryTag::Table) };
        let stats = engine.stats(MemoryTag::Table);
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.total_allocations, 1);
    }

    #[test]
    fn test_callback_allocator() {
        let engine = Engine::builder().callbacks(counting_alloc, counting_dealloc).build();
        let layout = Layout::new::<u64>();
        let ptr = engine.allocate(layout, MemoryTag::Other);
        assert_eq!(CALLBACK_ALLOCS.with(|c| c.get()), 1);
        let ptr = unsafe { engine.reallocate(ptr, layout, 64, MemoryTag::Other) };
        assert_eq!(engine.stats(MemoryTag::Other).live_bytes, 64);
        unsafe {
            engine.deallocate(ptr, Layout::from_size_align(64, 8).unwrap(), MemoryTag::Other)
        };
        assert_eq!(CALLBACK_ALLOCS.with(|c| c.get()), 0);
    }

    #[test]
    fn test_user_pointer_and_release_hook() {
        let released = Rc::new(Cell::new(0));
        let seen = released.clone();
        let engine = Engine::builder()
            .user_pointer(42_i32)
            .release_hook(move |user| {
                if let Ok(v) = user.downcast::<i32>() {
                    seen.set(*v);
                }
            })
            .build();
        assert_eq!(*engine.user_pointer::<i32>().unwrap(), 42);
        assert!(engine.user_pointer::<String>().is_none());
        let other = engine.clone();
        drop(engine);
        assert_eq!(released.get(), 0);
        drop(other);
        assert_eq!(released.get(), 42);
    }

    #[test]
    fn test_initializer_and_stream() {
        let stream = MemoryStream::new();
        let engine = Engine::builder()
            .stream(stream.clone())
            .initializer(|e| {
                e.write_stream("ready\n").unwrap();
            })
            .build();
        engine.write_stream("hello").unwrap();
        assert_eq!(stream.contents(), "ready\nhello");
    }
}
