//! Method registry: interns method descriptors by name.
//!
//! Identical intern protocol to the klass registry but with no size/parent
//! fields and no partition list — a method only needs a handle, a name, and
//! the head of its cross-klass impl list (used by `implements`-style scans
//! and kept for symmetry with the original's per-method list).

use crate::dispatch::ImplIndex;
use crate::hash::{self, BUCKETS};
use crate::runtime;
use crate::slab::Slab;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

pub type MethodHandle = u32;

pub const MAX_METHODS: usize = 1024;

const ZERO: AtomicU32 = AtomicU32::new(0);

pub struct MethodRecord {
    pub name: &'static str,
    name_hash: u32,
    hash_chain_next: MethodHandle,
    klass_count: AtomicU32,
    first: AtomicU32,
}

impl MethodRecord {
    pub(crate) fn first_impl(&self) -> ImplIndex {
        self.first.load(Ordering::Acquire)
    }
}

static METHOD_BUCKETS: [AtomicU32; BUCKETS] = [ZERO; BUCKETS];

fn methods() -> &'static Slab<MethodRecord> {
    static SLAB: OnceLock<Slab<MethodRecord>> = OnceLock::new();
    SLAB.get_or_init(|| Slab::new(MAX_METHODS))
}

pub fn method(handle: MethodHandle) -> Option<&'static MethodRecord> {
    methods().get(handle)
}

pub fn method_name(handle: MethodHandle) -> Option<&'static str> {
    method(handle).map(|m| m.name)
}

pub(crate) fn set_first_impl(method_h: MethodHandle, new_head: ImplIndex) {
    let rec = method(method_h).expect("method must exist before installing an impl on it");
    rec.first.store(new_head, Ordering::Release);
}

pub(crate) fn note_klass_installed(method_h: MethodHandle) {
    let rec = method(method_h).expect("method must exist");
    rec.klass_count.fetch_add(1, Ordering::Relaxed);
}

/// Register a method by name, returning `true` if it already existed.
///
/// The `INITIALIZED` requirement only applies on the path that allocates a
/// new handle; re-resolving an already-registered method works whether the
/// runtime is `INITIALIZED` or `FROZEN`.
pub fn intern_method(handle_slot: &'static AtomicU32, name: &'static str) -> bool {
    let existing = handle_slot.load(Ordering::Acquire);
    if existing != 0 {
        return true;
    }

    let _guard = runtime::REGISTRY_LOCK.lock();

    let existing = handle_slot.load(Ordering::Acquire);
    if existing != 0 {
        return true;
    }

    runtime::assert_registerable();

    let name_hash = hash::hash_name(name);
    let bucket = hash::bucket_of(name_hash);

    let mut cur = METHOD_BUCKETS[bucket].load(Ordering::Relaxed);
    while cur != 0 {
        let rec = method(cur).expect("bucket chain must resolve to a published slot");
        if rec.name_hash == name_hash && rec.name == name {
            handle_slot.store(cur, Ordering::Release);
            return true;
        }
        cur = rec.hash_chain_next;
    }

    let record = MethodRecord {
        name,
        name_hash,
        hash_chain_next: cur,
        klass_count: AtomicU32::new(0),
        first: AtomicU32::new(0),
    };

    // SAFETY: REGISTRY_LOCK is held, serializing all appenders.
    let handle = unsafe { methods().push_under_lock(record) }
        .unwrap_or_else(|| crate::macros::fail("method table exhausted (1024 methods)"));
    // SAFETY: `handle` was just initialized above, under the same lock.
    unsafe { methods().publish(handle) };

    METHOD_BUCKETS[bucket].store(handle, Ordering::Release);
    handle_slot.store(handle, Ordering::Release);

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn register_and_lookup_name() {
        runtime::init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        let existed = intern_method(&SLOT, "method::tests::frob");
        assert!(!existed);
        let handle = SLOT.load(Ordering::Acquire);
        assert_eq!(method_name(handle), Some("method::tests::frob"));
    }

    #[test]
    fn reregistration_returns_same_handle() {
        runtime::init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        intern_method(&SLOT, "method::tests::twiddle");
        let first = SLOT.load(Ordering::Acquire);
        intern_method(&SLOT, "method::tests::twiddle");
        assert_eq!(SLOT.load(Ordering::Acquire), first);
    }
}
