//! Global state machine and the single lock guarding klass/method/impl
//! table mutation.
//!
//! `NOT_INITIALIZED -> INITIALIZED -> FROZEN` is one-way; `init()` and
//! `freeze()` are the only transitions. Every registration asserts
//! `INITIALIZED`; every dispatch/allocation asserts the state is not
//! `NOT_INITIALIZED`.

use crate::sync::SpinMutex;
use std::sync::atomic::{AtomicU8, Ordering};

const NOT_INITIALIZED: u8 = 0;
const INITIALIZED: u8 = 1;
const FROZEN: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(NOT_INITIALIZED);

/// Guards every mutation of the klass/method/impl tables. Readers never
/// take this lock; see [`crate::slab::Slab`] for the lock-free read side.
pub(crate) static REGISTRY_LOCK: SpinMutex<()> = SpinMutex::new(());

/// Bring the runtime from `NOT_INITIALIZED` to `INITIALIZED`.
///
/// Must be called exactly once per process before any other operation.
/// Registers the built-in klasses (`Str`, `Int`, `UInt`, `Float`, `Bool`,
/// `Err`) and the `Bool` singletons.
pub fn init() {
    let _guard = REGISTRY_LOCK.lock();
    let prev = STATE.compare_exchange(
        NOT_INITIALIZED,
        INITIALIZED,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    drop(_guard);
    match prev {
        Ok(_) => crate::values::register_builtins(),
        Err(FROZEN) | Err(INITIALIZED) => {
            // Calling init() more than once is a caller bug everywhere
            // else in this runtime except here, where it is cheap and
            // common enough (tests, multiple embedders in one process)
            // to tolerate as a no-op rather than abort.
        }
        Err(_) => unreachable!(),
    }
}

/// One-way transition to `FROZEN`: no further klass/method creation is
/// permitted, but allocation and dispatch remain allowed.
pub fn freeze() {
    assert_initialized();
    STATE.store(FROZEN, Ordering::Release);
}

fn state() -> u8 {
    STATE.load(Ordering::Acquire)
}

pub(crate) fn is_frozen() -> bool {
    state() == FROZEN
}

/// Asserts the runtime is past `NOT_INITIALIZED`. Dispatch and allocation
/// require this.
pub(crate) fn assert_initialized() {
    rt_assert!(
        state() != NOT_INITIALIZED,
        "dynobj::init() must be called before using the runtime"
    );
}

/// Asserts the runtime is exactly `INITIALIZED` (not yet frozen). New
/// klass/method registration requires this.
pub(crate) fn assert_registerable() {
    rt_assert!(
        state() == INITIALIZED,
        "klass/method registration is only permitted while the runtime is \
         INITIALIZED (it is NOT_INITIALIZED or FROZEN)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        assert_ne!(state(), NOT_INITIALIZED);
    }
}
