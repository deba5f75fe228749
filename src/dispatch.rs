//! Implementation table and dispatch core.
//!
//! The impl table is an append-only array of `(klass, method, impl_fn)`
//! tuples woven into two intrusive singly-linked lists: one per
//! `(klass, method % 16)` partition, one per method across all klasses that
//! implement it. Dispatch walks the parent chain, scanning the partition
//! list at each ancestor klass.

use crate::klass::{self, KlassHandle, PARTITIONS};
use crate::method::{self, MethodHandle};
use crate::object::Obj;
use crate::runtime;
use crate::slab::Slab;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

pub type ImplIndex = u32;

pub const MAX_IMPLS: usize = 32768;

/// Type-erased function pointer. Call sites know the real signature for
/// the method they're dispatching and cast back via [`RawImpl::cast`];
/// this mirrors the original's `void *impl` and is the idiomatic way to
/// store a heterogeneous table of function pointers without a trait object
/// per entry (there is no receiver to make dynamic-dispatch-friendly: the
/// "self" is the raw object pointer, not a Rust value implementing a
/// common trait).
#[derive(Clone, Copy)]
pub struct RawImpl(*const ());

unsafe impl Send for RawImpl {}
unsafe impl Sync for RawImpl {}

impl RawImpl {
    pub fn of<F: Copy>(f: F) -> Self {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "impl functions must be a single function pointer"
        );
        let mut raw: *const () = std::ptr::null();
        // SAFETY: size checked above; `F` is a bare fn pointer type.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &f as *const F as *const u8,
                &mut raw as *mut *const () as *mut u8,
                std::mem::size_of::<F>(),
            );
        }
        RawImpl(raw)
    }

    /// # Safety
    /// Caller must cast back to the exact function pointer type that was
    /// passed to [`RawImpl::of`] for this entry.
    pub unsafe fn cast<F: Copy>(self) -> F {
        let raw = self.0;
        let mut out = std::mem::MaybeUninit::<F>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(
                &raw as *const *const () as *const u8,
                out.as_mut_ptr() as *mut u8,
                std::mem::size_of::<F>(),
            );
            out.assume_init()
        }
    }
}

pub struct ImplRecord {
    pub method: MethodHandle,
    pub klass: KlassHandle,
    next_for_method: ImplIndex,
    next_for_klass: ImplIndex,
    pub func: RawImpl,
}

fn impls() -> &'static Slab<ImplRecord> {
    static SLAB: OnceLock<Slab<ImplRecord>> = OnceLock::new();
    SLAB.get_or_init(|| Slab::new(MAX_IMPLS))
}

pub(crate) fn impl_record(handle: ImplIndex) -> Option<&'static ImplRecord> {
    impls().get(handle)
}

fn partition_of(method_h: MethodHandle) -> usize {
    (method_h as usize) % PARTITIONS
}

/// Install `impl_fn` as the behavior of `(klass, method)`.
///
/// Idempotent for the exact same `(klass, method, impl_fn)` tuple;
/// installing a different function for an already-installed
/// `(klass, method)` pair is a contract violation caught in debug builds.
pub fn install_impl(klass_h: KlassHandle, method_h: MethodHandle, impl_fn: RawImpl) {
    let _guard = runtime::REGISTRY_LOCK.lock();
    runtime::assert_registerable();

    rt_assert!(klass::klass(klass_h).is_some(), "install_impl: unknown klass handle");
    rt_assert!(method::method(method_h).is_some(), "install_impl: unknown method handle");

    let partition = partition_of(method_h);
    let mut cur = klass::partition_head(klass_h, partition);
    while cur != 0 {
        let rec = impl_record(cur).expect("partition chain must resolve to a published slot");
        if rec.method == method_h {
            dbg_assert!(
                rec.func.0 == impl_fn.0,
                "conflicting impl installed for the same (klass, method) pair"
            );
            return;
        }
        cur = rec.next_for_klass;
    }

    let method_head = method::method(method_h).unwrap().first_impl();

    let record = ImplRecord {
        method: method_h,
        klass: klass_h,
        next_for_method: method_head,
        next_for_klass: klass::partition_head(klass_h, partition),
        func: impl_fn,
    };

    // SAFETY: REGISTRY_LOCK is held.
    let handle = unsafe { impls().push_under_lock(record) }
        .unwrap_or_else(|| crate::macros::fail("impl table exhausted (32768 impls)"));
    // SAFETY: `handle` was just initialized above, under the same lock.
    unsafe { impls().publish(handle) };

    klass::bump_partition_head(klass_h, partition, handle);
    method::set_first_impl(method_h, handle);
    klass::note_method_installed(klass_h);
    method::note_klass_installed(method_h);

    if method_h == crate::object::dispose_method() {
        klass::set_dispose_impl(klass_h, handle);
    }
}

/// Lock-free lookup of the impl installed for exactly `(klass, method)` —
/// no parent-chain walk. Used internally by [`dispatch`].
fn lookup_exact(klass_h: KlassHandle, method_h: MethodHandle) -> Option<RawImpl> {
    let partition = partition_of(method_h);
    let mut cur = klass::partition_head(klass_h, partition);
    while cur != 0 {
        let rec = impl_record(cur)?;
        if rec.method == method_h {
            return Some(rec.func);
        }
        cur = rec.next_for_klass;
    }
    None
}

/// Parent-chain walk: returns the first ancestor (starting at `klass`
/// itself) that implements `method`.
pub fn lookup(klass_h: KlassHandle, method_h: MethodHandle) -> Option<RawImpl> {
    let mut cur = klass_h;
    while cur != 0 {
        if let Some(f) = lookup_exact(cur, method_h) {
            return Some(f);
        }
        cur = klass::klass(cur)?.parent;
    }
    None
}

pub fn implements(klass_h: KlassHandle, method_h: MethodHandle) -> bool {
    lookup(klass_h, method_h).is_some()
}

/// Bound dispatch: resolves `(self_obj, method)` to the object and the impl
/// that should run, honoring an optional super-call marker.
///
/// `for_child_klass`, when non-zero, names the klass whose override is
/// being bypassed (a super-call): the walk begins at that klass's parent
/// rather than at `self_obj`'s real klass. When `validate` is set, a null
/// object or an unresolved method is a fatal contract violation instead of
/// a quiet `None`.
pub fn dispatch(
    self_obj: Option<Obj>,
    method_h: MethodHandle,
    for_child_klass: KlassHandle,
    validate: bool,
) -> Option<(Obj, RawImpl)> {
    let obj = match self_obj {
        Some(o) => o,
        None => {
            rt_assert!(!validate, "dispatch on a null object");
            return None;
        }
    };

    obj.debug_check_magic();
    rt_assert!(!obj.is_disposed(), "dispatch on a disposed object");

    let start = if for_child_klass != 0 {
        dbg_assert!(
            klass::is_ancestor(for_child_klass, obj.klass()),
            "for_child_klass is not on the object's ancestor chain"
        );
        klass::klass(for_child_klass)
            .map(|k| k.parent)
            .unwrap_or(0)
    } else {
        obj.klass()
    };

    match lookup(start, method_h) {
        Some(f) => Some((obj, f)),
        None => {
            rt_assert!(!validate, "method not implemented");
            None
        }
    }
}
