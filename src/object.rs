//! Object header, reference counting, and two-phase dispose.
//!
//! Every allocation is a single contiguous block: a fixed [`ObjectHeader`]
//! immediately followed by the payload. `Obj` is a thin handle around the
//! payload pointer; the header is recovered by pointer arithmetic, the way
//! the original keeps a C struct header directly before its payload.

use crate::dispatch::{self, RawImpl};
use crate::klass::{self, KlassHandle};
use crate::method::{self, MethodHandle};
use crate::runtime;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

const MAGIC: u32 = 0xF0B1_EC7A;

const DISPOSING: u8 = 1 << 0;
const DISPOSED: u8 = 1 << 1;

#[repr(C)]
struct ObjectHeader {
    magic: u32,
    refcount: AtomicU32,
    flags: AtomicU8,
    klass: KlassHandle,
}

const HEADER_ALIGN: usize = 8;
const HEADER_SIZE: usize = {
    let raw = std::mem::size_of::<ObjectHeader>();
    (raw + HEADER_ALIGN - 1) / HEADER_ALIGN * HEADER_ALIGN
};

/// A handle to a live (or disposing) object's payload. Copy, like a raw
/// pointer — `Obj` carries no ownership on its own; `ref_obj`/`release`
/// manage the refcount explicitly, matching the manual-lifetime contract
/// the rest of the runtime is built on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Obj(*mut u8);

unsafe impl Send for Obj {}
unsafe impl Sync for Obj {}

impl Obj {
    fn header(&self) -> &ObjectHeader {
        // SAFETY: the header always immediately precedes the payload for
        // any `Obj` obtained through `alloc`.
        unsafe { &*(self.0.sub(HEADER_SIZE) as *const ObjectHeader) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0
    }

    /// # Safety
    /// `ptr` must point at the payload of a live allocation created by
    /// [`alloc`].
    pub unsafe fn from_payload_ptr(ptr: *mut u8) -> Self {
        Obj(ptr)
    }

    pub fn klass(&self) -> KlassHandle {
        self.header().klass
    }

    pub fn is_disposing(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & DISPOSING != 0
    }

    pub fn is_disposed(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & DISPOSED != 0
    }

    pub(crate) fn debug_check_magic(&self) {
        dbg_assert!(
            self.header().magic == MAGIC,
            "object header magic mismatch (corrupt pointer or use-after-free)"
        );
    }
}

fn dispose_method_slot() -> &'static AtomicU32 {
    static SLOT: AtomicU32 = AtomicU32::new(0);
    &SLOT
}

/// Interned handle of the universal `dispose` method. Every built-in and
/// user klass that needs teardown installs an impl against this handle.
pub fn dispose_method() -> MethodHandle {
    let slot = dispose_method_slot();
    let h = slot.load(Ordering::Acquire);
    if h != 0 {
        return h;
    }
    method::intern_method(slot, "fobjDispose");
    slot.load(Ordering::Acquire)
}

/// Allocate a new object of `klass_h`.
///
/// `extra_size` is only permitted (and added to the payload size) when the
/// klass is variable-sized; `init` bytes, if given, are copied into the
/// start of the payload. The new object starts with refcount 1 and is
/// autoreleased into the current thread's pool before being returned.
pub fn alloc(klass_h: KlassHandle, init: Option<&[u8]>, extra_size: usize) -> Obj {
    runtime::assert_initialized();
    let rec = klass::klass(klass_h).unwrap_or_else(|| crate::macros::fail("alloc: unknown klass"));

    rt_assert!(
        extra_size == 0 || rec.is_variable_sized(),
        "extra_size is only permitted for variable-sized klasses"
    );

    let payload_size = rec.fixed_size() + extra_size;
    let total = HEADER_SIZE + payload_size;
    let layout = Layout::from_size_align(total, HEADER_ALIGN)
        .unwrap_or_else(|_| crate::macros::fail("alloc: invalid layout"));

    // SAFETY: `layout` has non-zero size (header alone is non-zero) and a
    // valid alignment.
    let base = unsafe { alloc_zeroed(layout) };
    if base.is_null() {
        crate::macros::fail("alloc: out of memory");
    }

    // SAFETY: `base` is a fresh, zeroed, `HEADER_ALIGN`-aligned allocation
    // of at least `HEADER_SIZE + payload_size` bytes.
    unsafe {
        let header = base as *mut ObjectHeader;
        header.write(ObjectHeader {
            magic: MAGIC,
            refcount: AtomicU32::new(1),
            flags: AtomicU8::new(0),
            klass: klass_h,
        });
    }

    let payload = unsafe { base.add(HEADER_SIZE) };
    if let Some(bytes) = init {
        rt_assert!(bytes.len() <= payload_size, "alloc: init data larger than payload");
        // SAFETY: `payload` has at least `payload_size >= bytes.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload, bytes.len()) };
    }

    let obj = Obj(payload);
    crate::autorelease::autorelease(obj);
    obj
}

pub fn ref_obj(obj: Obj) {
    obj.header().refcount.fetch_add(1, Ordering::Relaxed);
}

/// Immediate decrement. If this was the last reference and the object was
/// not already disposing, runs the dispose chain.
pub fn release(obj: Obj) {
    let prev = obj.header().refcount.fetch_sub(1, Ordering::Release);
    rt_assert!(prev >= 1, "release: refcount underflow");
    if prev != 1 {
        return;
    }
    std::sync::atomic::fence(Ordering::Acquire);

    let already_disposing = obj.header().flags.load(Ordering::Acquire) & DISPOSING != 0;
    if already_disposing {
        // A resurrecting reference taken during dispose has now dropped
        // back to zero; the chain already ran once, just free.
        free_object(obj);
    } else {
        do_dispose(obj);
    }
}

/// Deferred release: hands the reference to the current autorelease pool.
pub fn unref(obj: Obj) {
    crate::autorelease::autorelease(obj);
}

/// `slot := val`: ref the new value, release the old. Safe for
/// self-assignment because the new value is ref'd before the old one is
/// released.
pub fn assign(slot: &mut Option<Obj>, val: Option<Obj>) {
    if let Some(v) = val {
        ref_obj(v);
    }
    let old = std::mem::replace(slot, val);
    if let Some(o) = old {
        release(o);
    }
}

/// `slot := val`, returning the previous value autoreleased rather than
/// released immediately.
pub fn swap(slot: &mut Option<Obj>, val: Option<Obj>) -> Option<Obj> {
    if let Some(v) = val {
        ref_obj(v);
    }
    let old = slot.take();
    *slot = val;
    if let Some(o) = old {
        unref(o);
    }
    old
}

fn do_dispose(obj: Obj) {
    let prev_flags = obj.header().flags.fetch_or(DISPOSING, Ordering::AcqRel);
    if prev_flags & DISPOSING != 0 {
        return;
    }

    let mut k = obj.klass();
    while k != 0 {
        if let Some(rec) = klass::klass(k) {
            if let Some(raw) = rec.dispose_impl() {
                // SAFETY: every dispose impl installed via `dispatch::install_impl`
                // under the `dispose` method handle has this signature.
                let f: fn(Obj) = unsafe { raw.cast() };
                f(obj);
            }
            k = rec.parent;
        } else {
            break;
        }
    }

    obj.header().flags.fetch_or(DISPOSED, Ordering::AcqRel);

    if obj.header().refcount.load(Ordering::Acquire) == 0 {
        free_object(obj);
    }
}

fn free_object(obj: Obj) {
    let rec = klass::klass(obj.klass());
    let payload_size = rec.map(|r| r.fixed_size()).unwrap_or(0);
    let total = HEADER_SIZE + payload_size;
    let base = unsafe { obj.0.sub(HEADER_SIZE) };
    // Scribble the header so use-after-free shows up as a magic mismatch
    // rather than silently dispatching into freed memory.
    unsafe {
        std::ptr::write_bytes(base, 0, HEADER_SIZE);
        let layout = Layout::from_size_align_unchecked(total, HEADER_ALIGN);
        dealloc(base, layout);
    }
}

/// Register `method` as the dispose hook for `klass`; called by built-in
/// and user klasses that need teardown.
pub fn install_dispose(klass_h: KlassHandle, f: fn(Obj)) {
    dispatch::install_impl(klass_h, dispose_method(), RawImpl::of(f));
}

/// Allocate payload sized exactly for `T`, writing `make()`'s result
/// directly into place rather than bit-copying a temporary byte buffer.
///
/// Built-in scalar klasses (`Int`, `Bool`, ...) are plain-old-data and go
/// through the byte-copy `init` parameter of [`alloc`] instead; this entry
/// point exists for payloads that own non-POD Rust values (`String`,
/// `Vec`, `Box`) with their own validity invariants that zero-then-memcpy
/// would violate. `klass_h`'s registered size must equal `size_of::<T>()`,
/// and its dispose chain must call [`drop_payload::<T>`] before the
/// generic free runs.
pub fn alloc_typed<T>(klass_h: KlassHandle, make: impl FnOnce() -> T) -> Obj {
    let rec =
        klass::klass(klass_h).unwrap_or_else(|| crate::macros::fail("alloc_typed: unknown klass"));
    rt_assert!(
        rec.fixed_size() == std::mem::size_of::<T>(),
        "alloc_typed: klass size does not match size_of::<T>()"
    );
    let obj = alloc(klass_h, None, 0);
    // SAFETY: the payload was just zero-allocated and is exactly
    // `size_of::<T>()` bytes (checked above); `write` does not read or
    // drop the destination, so the earlier zero-fill is simply overwritten.
    unsafe {
        (obj.as_ptr() as *mut T).write(make());
    }
    obj
}

/// # Safety
/// `obj` must have been created by [`alloc_typed::<T>`] with the same `T`.
pub unsafe fn payload_ref<T>(obj: Obj) -> &'static T {
    unsafe { &*(obj.as_ptr() as *const T) }
}

/// # Safety
/// `obj` must have been created by [`alloc_typed::<T>`] with the same `T`,
/// and the caller must not alias this with another live reference.
pub unsafe fn payload_mut<T>(obj: Obj) -> &'static mut T {
    unsafe { &mut *(obj.as_ptr() as *mut T) }
}

/// Drops the in-place `T` value without freeing the backing allocation —
/// call this from a klass's dispose hook before the generic free runs.
///
/// # Safety
/// `obj` must have been created by [`alloc_typed::<T>`] with the same `T`,
/// and must not be accessed as a `T` again afterwards.
pub unsafe fn drop_payload<T>(obj: Obj) {
    unsafe { std::ptr::drop_in_place(obj.as_ptr() as *mut T) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering as O;

    static DISPOSE_COUNT: AtomicU32 = AtomicU32::new(0);

    fn count_dispose(_o: Obj) {
        DISPOSE_COUNT.fetch_add(1, O::SeqCst);
    }

    #[test]
    fn ref_then_release_is_noop_for_dispose() {
        runtime::init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        klass::intern_klass(&SLOT, 8, 0, "object::tests::Plain", &[]);
        let k = SLOT.load(O::Acquire);
        // Keep the object out of the pool's pending release entirely by
        // taking ownership (ref) before the pool that autoreleased it ever
        // drains, so the manual release() calls below are the only ones
        // that matter for this test's bookkeeping.
        let _pool = crate::autorelease::push_pool();
        let obj = alloc(k, None, 0); // rc=1, pool owns the pending release
        ref_obj(obj);
        ref_obj(obj);
        assert_eq!(obj.header().refcount.load(O::Acquire), 3);
        release(obj);
        release(obj);
        assert_eq!(obj.header().refcount.load(O::Acquire), 1);
        // Let the pool's drop release the last (original alloc) reference.
    }

    #[test]
    fn dispose_runs_exactly_once_child_to_root() {
        runtime::init();
        static PARENT: AtomicU32 = AtomicU32::new(0);
        static CHILD: AtomicU32 = AtomicU32::new(0);
        klass::intern_klass(&PARENT, 8, 0, "object::tests::DisposeParent", &[]);
        let parent = PARENT.load(O::Acquire);
        install_dispose(parent, count_dispose);
        klass::intern_klass(&CHILD, 8, parent, "object::tests::DisposeChild", &[]);
        let child = CHILD.load(O::Acquire);
        install_dispose(child, count_dispose);

        DISPOSE_COUNT.store(0, O::SeqCst);
        let _pool = crate::autorelease::push_pool();
        let obj = alloc(child, None, 0); // rc=1, owned by `_pool`
        ref_obj(obj); // take ownership so our manual release below is ours
        release(obj); // drops our extra ref only; pool's ref still pending
        assert_eq!(DISPOSE_COUNT.load(O::SeqCst), 0);
        drop(_pool); // drains the pool's ref -> rc hits 0 -> dispose chain
        assert_eq!(DISPOSE_COUNT.load(O::SeqCst), 2);
    }
}
