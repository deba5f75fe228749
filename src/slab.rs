//! Fixed-capacity, append-only table with lock-free reads.
//!
//! Klasses, methods, and impls are all "interned once, read forever" under
//! the same publication discipline: a writer holding the registry lock fully
//! populates a slot, then release-stores an updated count; a reader
//! acquire-loads the count and only ever indexes slots below it. A slot
//! below the published count is therefore always fully initialized from the
//! reader's point of view, with no lock needed on the read path.
//!
//! Handles are 1-based; handle `0` means "none" and slot `0` is never
//! populated, matching the klass/method/impl handle spaces in the rest of
//! the crate.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct Slab<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    count: AtomicU32,
}

unsafe impl<T: Send> Send for Slab<T> {}
unsafe impl<T: Send + Sync> Sync for Slab<T> {}

impl<T> Slab<T> {
    /// `capacity` is the number of 1-based handles the slab can hold
    /// (handle `capacity` is the last valid one; slot `0` is wasted so
    /// handles can double as indices).
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity + 1);
        for _ in 0..=capacity {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            slots: slots.into_boxed_slice(),
            count: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of published slots (the highest valid handle).
    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Lock-free read. Returns `None` for handle `0` or an unpublished slot.
    pub fn get(&self, handle: u32) -> Option<&T> {
        if handle == 0 || handle > self.len() {
            return None;
        }
        // SAFETY: `handle <= len()` (acquire-loaded above), and a writer
        // only ever increments `count` with Release ordering after fully
        // initializing the slot at that index, so the acquire load here
        // synchronizes-with that store and the slot is visible as init.
        unsafe { Some(&*(self.slots[handle as usize].get() as *const T)) }
    }

    /// Must be called with the registry lock held. Writes `val` into the
    /// next slot and returns its 1-based handle, but does NOT publish it —
    /// callers publish explicitly via [`Slab::publish`] once any
    /// handle-dependent fixups (e.g. linking into a hash bucket) are done,
    /// so a half-linked record is never visible to a concurrent reader.
    ///
    /// # Safety
    /// Caller must hold the external write lock serializing all appenders.
    pub unsafe fn push_under_lock(&self, val: T) -> Option<u32> {
        let next = self.count.load(Ordering::Relaxed) as usize + 1;
        if next > self.capacity() {
            return None;
        }
        unsafe {
            (*self.slots[next].get()).write(val);
        }
        Some(next as u32)
    }

    /// Publish up to and including `handle` as visible to lock-free readers.
    ///
    /// # Safety
    /// Caller must hold the write lock and `handle` must already be
    /// initialized via [`Slab::push_under_lock`].
    pub unsafe fn publish(&self, handle: u32) {
        self.count.store(handle, Ordering::Release);
    }
}
