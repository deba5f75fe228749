//! Klass registry: interns klass descriptors by name, and stores per-klass
//! method-partition list heads used by dispatch.

use crate::dispatch::{self, ImplIndex, RawImpl};
use crate::hash::{self, BUCKETS};
use crate::method::MethodHandle;
use crate::runtime;
use crate::slab::Slab;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

pub type KlassHandle = u32;

pub const MAX_KLASSES: usize = 1024;
pub const PARTITIONS: usize = 16;

const ZERO: AtomicU32 = AtomicU32::new(0);

pub struct KlassRecord {
    pub name: &'static str,
    name_hash: u32,
    hash_chain_next: KlassHandle,
    /// Negative encodes a variable-sized tail: fixed prefix is `-1 - size`.
    size: i32,
    pub parent: KlassHandle,
    method_count: AtomicU32,
    dispose_impl: AtomicU32,
    partitions: [AtomicU32; PARTITIONS],
}

impl KlassRecord {
    /// Fixed prefix size in bytes (excludes any variable-length tail).
    pub fn fixed_size(&self) -> usize {
        if self.size < 0 {
            (-1 - self.size) as usize
        } else {
            self.size as usize
        }
    }

    pub fn is_variable_sized(&self) -> bool {
        self.size < 0
    }

    pub(crate) fn partition_head(&self, partition: usize) -> ImplIndex {
        self.partitions[partition].load(Ordering::Acquire)
    }

    pub(crate) fn dispose_impl(&self) -> Option<RawImpl> {
        let idx = self.dispose_impl.load(Ordering::Acquire);
        if idx == 0 {
            None
        } else {
            dispatch::impl_record(idx).map(|r| r.func)
        }
    }
}

static KLASS_BUCKETS: [AtomicU32; BUCKETS] = [ZERO; BUCKETS];

fn klasses() -> &'static Slab<KlassRecord> {
    static SLAB: OnceLock<Slab<KlassRecord>> = OnceLock::new();
    SLAB.get_or_init(|| Slab::new(MAX_KLASSES))
}

pub fn klass(handle: KlassHandle) -> Option<&'static KlassRecord> {
    klasses().get(handle)
}

pub fn klass_name(handle: KlassHandle) -> Option<&'static str> {
    klass(handle).map(|k| k.name)
}

pub(crate) fn partition_head(handle: KlassHandle, partition: usize) -> ImplIndex {
    klass(handle)
        .map(|k| k.partition_head(partition))
        .unwrap_or(0)
}

pub(crate) fn bump_partition_head(klass_h: KlassHandle, partition: usize, new_head: ImplIndex) {
    let rec = klass(klass_h).expect("klass must exist before installing an impl on it");
    rec.partitions[partition].store(new_head, Ordering::Release);
}

pub(crate) fn set_dispose_impl(klass_h: KlassHandle, impl_idx: ImplIndex) {
    let rec = klass(klass_h).expect("klass must exist before caching its dispose impl");
    rec.dispose_impl.store(impl_idx, Ordering::Release);
}

pub(crate) fn note_method_installed(klass_h: KlassHandle) {
    let rec = klass(klass_h).expect("klass must exist");
    rec.method_count.fetch_add(1, Ordering::Relaxed);
}

/// Register a klass by name, returning `true` if it already existed.
///
/// `handle_slot` is a caller-owned, process-lifetime cell that memoizes the
/// handle so repeated declarations of the same klass (e.g. from several
/// call sites) are cheap after the first.
pub fn intern_klass(
    handle_slot: &'static AtomicU32,
    size: i32,
    parent: KlassHandle,
    name: &'static str,
    methods: &[(MethodHandle, RawImpl)],
) -> bool {
    let existing = handle_slot.load(Ordering::Acquire);
    if existing != 0 {
        let rec = klass(existing).expect("published klass handle must resolve");
        rt_assert!(
            rec.size == size && rec.parent == parent,
            "klass '{name}' re-registered with mismatched size/parent"
        );
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

    let mut cur = KLASS_BUCKETS[bucket].load(Ordering::Relaxed);
    while cur != 0 {
        let rec = klass(cur).expect("bucket chain must resolve to a published slot");
        if rec.name_hash == name_hash && rec.name == name {
            rt_assert!(
                rec.size == size && rec.parent == parent,
                "klass '{name}' re-registered with mismatched size/parent"
            );
            handle_slot.store(cur, Ordering::Release);
            return true;
        }
        cur = rec.hash_chain_next;
    }

    if parent != 0 {
        rt_assert!(klass(parent).is_some(), "parent klass of '{name}' is not registered");
    }

    let record = KlassRecord {
        name,
        name_hash,
        hash_chain_next: cur,
        size,
        parent,
        method_count: AtomicU32::new(0),
        dispose_impl: AtomicU32::new(0),
        partitions: [ZERO; PARTITIONS],
    };

    // SAFETY: REGISTRY_LOCK is held, serializing all appenders.
    let handle = unsafe { klasses().push_under_lock(record) }
        .unwrap_or_else(|| crate::macros::fail("klass table exhausted (1024 klasses)"));
    // SAFETY: `handle` was just initialized above, under the same lock.
    unsafe { klasses().publish(handle) };

    KLASS_BUCKETS[bucket].store(handle, Ordering::Release);
    handle_slot.store(handle, Ordering::Release);

    for &(method, imp) in methods {
        dispatch::install_impl(handle, method, imp);
    }

    false
}

/// Real (most-derived) klass handle of an object, used by `fobjBase`'s
/// default `fobjKlass` method.
pub fn ancestors(mut handle: KlassHandle) -> impl Iterator<Item = KlassHandle> {
    std::iter::from_fn(move || {
        if handle == 0 {
            None
        } else {
            let cur = handle;
            handle = klass(cur).map(|k| k.parent).unwrap_or(0);
            Some(cur)
        }
    })
}

pub fn is_ancestor(candidate: KlassHandle, of: KlassHandle) -> bool {
    ancestors(of).any(|k| k == candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::sync::atomic::AtomicU32;

    fn ensure_init() {
        runtime::init();
    }

    #[test]
    fn register_and_lookup_name() {
        ensure_init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        let existed = intern_klass(&SLOT, 16, 0, "klass::tests::Widget", &[]);
        assert!(!existed);
        let handle = SLOT.load(Ordering::Acquire);
        assert_eq!(klass_name(handle), Some("klass::tests::Widget"));
    }

    #[test]
    fn reregistration_returns_same_handle() {
        ensure_init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        intern_klass(&SLOT, 8, 0, "klass::tests::Gadget", &[]);
        let first = SLOT.load(Ordering::Acquire);
        let existed = intern_klass(&SLOT, 8, 0, "klass::tests::Gadget", &[]);
        assert!(existed);
        assert_eq!(SLOT.load(Ordering::Acquire), first);
    }

    #[test]
    fn variable_sized_fixed_prefix() {
        ensure_init();
        static SLOT: AtomicU32 = AtomicU32::new(0);
        intern_klass(&SLOT, -9, 0, "klass::tests::Tailed", &[]);
        let handle = SLOT.load(Ordering::Acquire);
        let rec = klass(handle).unwrap();
        assert!(rec.is_variable_sized());
        assert_eq!(rec.fixed_size(), 8);
    }
}
