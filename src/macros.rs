//! Contract-violation assertions.
//!
//! Programming errors (bad handles, double-dispose, table overflow, ...) are
//! not recoverable: they abort through these macros rather than returning a
//! `Result`. `rt_assert!` always checks; `dbg_assert!` compiles to nothing
//! when `debug_assertions` is off, mirroring the teacher's feature-gated
//! `stat_inc!`/`stat_add!` pattern but keyed on the build profile instead of
//! a Cargo feature.

/// Always-checked contract assertion. Aborts via panic on failure.
#[macro_export]
macro_rules! rt_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::macros::fail(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::macros::fail(&format!($($arg)+));
        }
    };
}

/// Debug-only contract assertion. Compiles to nothing in release builds.
#[macro_export]
macro_rules! dbg_assert {
    ($cond:expr) => {
        #[cfg(debug_assertions)]
        {
            $crate::rt_assert!($cond);
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            $crate::rt_assert!($cond, $($arg)+);
        }
    };
}

/// Cold panic helper so call sites stay inlineable; all assertion failures
/// fall through here.
#[cold]
#[inline(never)]
pub fn fail(msg: &str) -> ! {
    panic!("dynobj: {msg}");
}
