//! dynobj: a minimal dynamic object runtime.
//!
//! A klass/method registry, single-inheritance virtual dispatch, refcounted
//! objects with two-phase dispose, and per-thread autorelease pools — the
//! machinery underneath a small dynamically-typed object system, without a
//! compiler or VM attached to it.
//!
//! # Usage
//!
//! ```ignore
//! dynobj::init();
//! let s = dynobj::values::newstr(b"hello");
//! ```

#[macro_use]
pub mod macros;

pub mod autorelease;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod hash;
pub mod klass;
pub mod method;
pub mod object;
pub mod runtime;
pub mod slab;
pub mod sync;
pub mod values;

pub use runtime::{freeze, init};
