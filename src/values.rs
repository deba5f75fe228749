//! Built-in value klasses: `Str`, `Int`, `UInt`, `Float`, `Bool`, plus the
//! implicit `fobjBase` root they (and `Err`) all descend from.
//!
//! `fobjBase` installs the default `fobjKlass`/`fobjRepr` behavior every
//! other klass inherits unless it overrides `fobjRepr` itself: `fobjKlass`
//! returns the object's real (most-derived) klass handle, and `fobjRepr`
//! falls back to `"$KlassName@0xpointer"`.

use crate::dispatch::{self, RawImpl};
use crate::format::{self, Arg};
use crate::klass::{self, KlassHandle};
use crate::method::{self, MethodHandle};
use crate::object::{self, Obj};
use std::sync::atomic::{AtomicU32, Ordering};

static BASE_SLOT: AtomicU32 = AtomicU32::new(0);
static STR_SLOT: AtomicU32 = AtomicU32::new(0);
static INT_SLOT: AtomicU32 = AtomicU32::new(0);
static UINT_SLOT: AtomicU32 = AtomicU32::new(0);
static FLOAT_SLOT: AtomicU32 = AtomicU32::new(0);
static BOOL_SLOT: AtomicU32 = AtomicU32::new(0);

static REPR_METHOD: AtomicU32 = AtomicU32::new(0);
static FORMAT_METHOD: AtomicU32 = AtomicU32::new(0);
static KLASS_OF_METHOD: AtomicU32 = AtomicU32::new(0);

pub fn base_klass() -> KlassHandle {
    BASE_SLOT.load(Ordering::Acquire)
}
pub fn str_klass() -> KlassHandle {
    STR_SLOT.load(Ordering::Acquire)
}
pub fn int_klass() -> KlassHandle {
    INT_SLOT.load(Ordering::Acquire)
}
pub fn uint_klass() -> KlassHandle {
    UINT_SLOT.load(Ordering::Acquire)
}
pub fn float_klass() -> KlassHandle {
    FLOAT_SLOT.load(Ordering::Acquire)
}
pub fn bool_klass() -> KlassHandle {
    BOOL_SLOT.load(Ordering::Acquire)
}

pub fn repr_method() -> MethodHandle {
    REPR_METHOD.load(Ordering::Acquire)
}
pub fn format_method() -> MethodHandle {
    FORMAT_METHOD.load(Ordering::Acquire)
}

type ReprFn = fn(Obj) -> String;
type FormatFn = fn(Obj, &str) -> String;
type KlassOfFn = fn(Obj) -> KlassHandle;

fn base_repr(obj: Obj) -> String {
    let name = klass::klass_name(obj.klass()).unwrap_or("?");
    format!("{name}@{:p}", obj.as_ptr())
}

fn base_klass_of(obj: Obj) -> KlassHandle {
    obj.klass()
}

/// Registers the built-in klasses and their method implementations. Called
/// once by [`crate::runtime::init`].
pub fn register_builtins() {
    method::intern_method(&REPR_METHOD, "fobjRepr");
    method::intern_method(&FORMAT_METHOD, "fobjFormat");
    method::intern_method(&KLASS_OF_METHOD, "fobjKlass");
    let repr_m = repr_method();
    let format_m = format_method();
    let klass_of_m = KLASS_OF_METHOD.load(Ordering::Acquire);

    klass::intern_klass(&BASE_SLOT, 0, 0, "fobjBase", &[]);
    let base = base_klass();
    dispatch::install_impl(base, repr_m, RawImpl::of(base_repr as ReprFn));
    dispatch::install_impl(base, klass_of_m, RawImpl::of(base_klass_of as KlassOfFn));

    register_str(base);
    register_int(base);
    register_uint(base);
    register_float(base);
    register_bool(base);
    crate::error::register(base);
}

// ---- Str ----------------------------------------------------------------

#[repr(C)]
struct StrHeader {
    len: u32,
    external: *mut u8,
}

fn str_bytes(obj: Obj) -> &'static [u8] {
    // SAFETY: every `Str` payload starts with a `StrHeader` followed by
    // `len` inline bytes when `external` is null, matching `alloc`'s
    // variable-sized-klass convention.
    unsafe {
        let hdr = &*(obj.as_ptr() as *const StrHeader);
        if hdr.external.is_null() {
            let inline = obj.as_ptr().add(std::mem::size_of::<StrHeader>());
            std::slice::from_raw_parts(inline, hdr.len as usize)
        } else {
            std::slice::from_raw_parts(hdr.external, hdr.len as usize)
        }
    }
}

fn str_dispose(obj: Obj) {
    // SAFETY: `external`, when non-null, was allocated by `Vec<u8>` and
    // never aliased elsewhere.
    unsafe {
        let hdr = &*(obj.as_ptr() as *const StrHeader);
        if !hdr.external.is_null() {
            let _ = Vec::from_raw_parts(hdr.external, hdr.len as usize, hdr.len as usize);
        }
    }
}

fn str_repr(obj: Obj) -> String {
    let mut out = String::from("$S(");
    format::escape_quoted(&mut out, str_bytes(obj));
    out.push(')');
    out
}

fn str_format(obj: Obj, spec: &str) -> String {
    let mut out = String::new();
    let s = std::str::from_utf8(str_bytes(obj)).unwrap_or("<invalid utf8>");
    format::format_arg(&mut out, &Arg::S(s), spec);
    out
}

fn register_str(base: KlassHandle) {
    // Variable-sized: fixed prefix is the `StrHeader`, -1 - size encodes it.
    let fixed = std::mem::size_of::<StrHeader>() as i32;
    klass::intern_klass(&STR_SLOT, -1 - fixed, base, "Str", &[]);
    let k = str_klass();
    dispatch::install_impl(k, repr_method(), RawImpl::of(str_repr as ReprFn));
    dispatch::install_impl(k, format_method(), RawImpl::of(str_format as FormatFn));
    object::install_dispose(k, str_dispose);
}

fn alloc_str_inline(bytes: &[u8]) -> Obj {
    let hdr = StrHeader {
        len: bytes.len() as u32,
        external: std::ptr::null_mut(),
    };
    let mut init = Vec::with_capacity(std::mem::size_of::<StrHeader>() + bytes.len());
    init.extend_from_slice(unsafe {
        std::slice::from_raw_parts(&hdr as *const StrHeader as *const u8, std::mem::size_of::<StrHeader>())
    });
    init.extend_from_slice(bytes);
    object::alloc(str_klass(), Some(&init), bytes.len())
}

/// `newstr`: copy `bytes` into a fresh, inline `Str`.
pub fn newstr(bytes: &[u8]) -> Obj {
    alloc_str_inline(bytes)
}

/// `tostr`/`sprintf`-style construction: adopt ownership of an already
/// heap-allocated buffer (the external storage form) rather than copying.
pub fn adopt_str(owned: Vec<u8>) -> Obj {
    let mut owned = owned;
    owned.shrink_to_fit();
    let len = owned.len() as u32;
    let ptr = owned.as_mut_ptr();
    std::mem::forget(owned);
    let hdr = StrHeader { len, external: ptr };
    let init = unsafe {
        std::slice::from_raw_parts(&hdr as *const StrHeader as *const u8, std::mem::size_of::<StrHeader>())
    };
    object::alloc(str_klass(), Some(init), 0)
}

pub fn str_as_str(obj: Obj) -> &'static str {
    std::str::from_utf8(str_bytes(obj)).unwrap_or("")
}

/// `strcat(a, slice)`: always allocates a fresh `Str`; an empty slice
/// returns the original object (ref-cycled through autorelease).
pub fn strcat(a: Obj, slice: &[u8]) -> Obj {
    if slice.is_empty() {
        object::ref_obj(a);
        crate::autorelease::autorelease(a);
        return a;
    }
    let mut combined = Vec::with_capacity(str_bytes(a).len() + slice.len());
    combined.extend_from_slice(str_bytes(a));
    combined.extend_from_slice(slice);
    adopt_str(combined)
}

/// Builds a `Str` via the positional `%`-style formatter, then adopts the
/// buffer's storage rather than copying it again.
pub fn sprintf(fmt: &str, args: &[Arg]) -> Obj {
    adopt_str(format::sprintf_render(fmt, args).into_bytes())
}

/// `strcatf`: `sprintf`, then `strcat` onto `a`.
pub fn strcatf(a: Obj, fmt: &str, args: &[Arg]) -> Obj {
    strcat(a, format::sprintf_render(fmt, args).as_bytes())
}

/// `tostr(obj, spec)`: renders `obj` via its `fobjFormat` (falling back to
/// `fobjRepr`) and wraps the result in a fresh `Str`.
pub fn tostr(obj: Option<Obj>, spec: &str) -> Obj {
    let mut out = String::new();
    format::format_arg(&mut out, &Arg::O(obj), spec);
    newstr(out.as_bytes())
}

// ---- Int / UInt -----------------------------------------------------------

fn register_int(base: KlassHandle) {
    klass::intern_klass(&INT_SLOT, std::mem::size_of::<i64>() as i32, base, "Int", &[]);
    let k = int_klass();
    dispatch::install_impl(k, repr_method(), RawImpl::of(int_repr as ReprFn));
    dispatch::install_impl(k, format_method(), RawImpl::of(int_format as FormatFn));
}

fn int_value(obj: Obj) -> i64 {
    unsafe { *(obj.as_ptr() as *const i64) }
}

fn int_repr(obj: Obj) -> String {
    let mut out = String::new();
    format::repr_arg(&mut out, &Arg::I(int_value(obj)));
    out
}

fn int_format(obj: Obj, spec: &str) -> String {
    let mut out = String::new();
    format::format_arg(&mut out, &Arg::I(int_value(obj)), spec);
    out
}

pub fn new_int(v: i64) -> Obj {
    object::alloc(int_klass(), Some(&v.to_ne_bytes()), 0)
}

fn register_uint(base: KlassHandle) {
    klass::intern_klass(&UINT_SLOT, std::mem::size_of::<u64>() as i32, base, "UInt", &[]);
    let k = uint_klass();
    dispatch::install_impl(k, repr_method(), RawImpl::of(uint_repr as ReprFn));
    dispatch::install_impl(k, format_method(), RawImpl::of(uint_format as FormatFn));
}

fn uint_value(obj: Obj) -> u64 {
    unsafe { *(obj.as_ptr() as *const u64) }
}

fn uint_repr(obj: Obj) -> String {
    let mut out = String::new();
    format::repr_arg(&mut out, &Arg::U(uint_value(obj)));
    out
}

fn uint_format(obj: Obj, spec: &str) -> String {
    let mut out = String::new();
    format::format_arg(&mut out, &Arg::U(uint_value(obj)), spec);
    out
}

pub fn new_uint(v: u64) -> Obj {
    object::alloc(uint_klass(), Some(&v.to_ne_bytes()), 0)
}

// ---- Float ----------------------------------------------------------------

fn register_float(base: KlassHandle) {
    klass::intern_klass(&FLOAT_SLOT, std::mem::size_of::<f64>() as i32, base, "Float", &[]);
    let k = float_klass();
    dispatch::install_impl(k, repr_method(), RawImpl::of(float_repr as ReprFn));
    dispatch::install_impl(k, format_method(), RawImpl::of(float_format as FormatFn));
}

fn float_value(obj: Obj) -> f64 {
    unsafe { *(obj.as_ptr() as *const f64) }
}

fn float_repr(obj: Obj) -> String {
    let mut out = String::new();
    format::repr_arg(&mut out, &Arg::F(float_value(obj)));
    out
}

fn float_format(obj: Obj, spec: &str) -> String {
    let mut out = String::new();
    format::format_arg(&mut out, &Arg::F(float_value(obj)), spec);
    out
}

pub fn new_float(v: f64) -> Obj {
    object::alloc(float_klass(), Some(&v.to_ne_bytes()), 0)
}

// ---- Bool -------------------------------------------------------------

static BOOL_TRUE: std::sync::OnceLock<Obj> = std::sync::OnceLock::new();
static BOOL_FALSE: std::sync::OnceLock<Obj> = std::sync::OnceLock::new();

fn register_bool(base: KlassHandle) {
    klass::intern_klass(&BOOL_SLOT, std::mem::size_of::<u8>() as i32, base, "Bool", &[]);
    let k = bool_klass();
    dispatch::install_impl(k, repr_method(), RawImpl::of(bool_repr as ReprFn));
    dispatch::install_impl(k, format_method(), RawImpl::of(bool_format as FormatFn));

    // Two process-wide singletons, each with an extra ref so ordinary
    // release traffic never disposes them.
    let t = object::alloc(k, Some(&[1u8]), 0);
    object::ref_obj(t);
    let _ = BOOL_TRUE.set(t);
    let f = object::alloc(k, Some(&[0u8]), 0);
    object::ref_obj(f);
    let _ = BOOL_FALSE.set(f);
}

fn bool_value(obj: Obj) -> bool {
    unsafe { *(obj.as_ptr() as *const u8) != 0 }
}

fn bool_repr(obj: Obj) -> String {
    let mut out = String::new();
    format::repr_arg(&mut out, &Arg::B(bool_value(obj)));
    out
}

fn bool_format(obj: Obj, spec: &str) -> String {
    let mut out = String::new();
    format::format_arg(&mut out, &Arg::B(bool_value(obj)), spec);
    out
}

/// The process-wide `true`/`false` singletons created at init.
pub fn bool_singleton(value: bool) -> Obj {
    *(if value { &BOOL_TRUE } else { &BOOL_FALSE })
        .get()
        .expect("dynobj::init() must run before bool_singleton")
}

// ---- shared repr/format dispatch helpers (used by the formatter) ---------

pub fn repr_dispatch(obj: Obj) -> String {
    match dispatch::lookup(obj.klass(), repr_method()) {
        Some(f) => {
            let f: ReprFn = unsafe { f.cast() };
            f(obj)
        }
        None => base_repr(obj),
    }
}

pub fn format_dispatch(obj: Obj, spec: &str) -> Option<String> {
    dispatch::lookup(obj.klass(), format_method()).map(|f| {
        let f: FormatFn = unsafe { f.cast() };
        f(obj, spec)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn str_repr_round_trips_plain_ascii() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let s = newstr(b"hello");
        assert_eq!(repr_dispatch(s), "$S(\"hello\")");
    }

    #[test]
    fn int_repr_parses_back() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let i = new_int(-42);
        assert_eq!(repr_dispatch(i), "$I(-42)");
    }

    #[test]
    fn bool_singletons_are_stable() {
        runtime::init();
        let t1 = bool_singleton(true);
        let t2 = bool_singleton(true);
        assert_eq!(t1.as_ptr(), t2.as_ptr());
        assert_eq!(bool_repr(t1), "$B(true)");
    }

    #[test]
    fn strcat_empty_slice_returns_original() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let s = newstr(b"foo");
        let cat = strcat(s, b"");
        assert_eq!(cat.as_ptr(), s.as_ptr());
    }

    #[test]
    fn strcat_allocates_fresh_str() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let s = newstr(b"foo");
        let cat = strcat(s, b" bar");
        assert_eq!(str_as_str(cat), "foo bar");
    }

    #[test]
    fn sprintf_yields_str_with_formatted_bytes() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let s = sprintf("%d", &[Arg::I(42)]);
        assert_eq!(str_as_str(s), "42");
    }

    #[test]
    fn tostr_falls_back_to_repr_for_scalars() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let i = new_int(7);
        let s = tostr(Some(i), "");
        assert_eq!(str_as_str(s), "7");
    }
}
