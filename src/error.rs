//! `Err`: a typed, keyed, sourced error value with an optional sibling
//! chain for multi-error composition.
//!
//! `Err`'s `repr`/`format`/`dispose` are registered in the method table
//! like any other klass so `dispatch`/`implements` work on it uniformly,
//! but `make_err`/`err_combine`/`err_getkv` are plain functions over the
//! concrete payload rather than virtual dispatch — they operate on a typed
//! struct, not a polymorphic interface, matching how the original wires
//! `Err` construction directly rather than through the generic mechanism.

use crate::dispatch::{self, RawImpl};
use crate::format::{self, Arg};
use crate::klass::{self, KlassHandle};
use crate::object::{self, Obj};
use crate::values;
use std::fmt::Write as _;
use std::sync::atomic::AtomicU32;

const MSG_SUFFIX_KEY: &str = "__msgSuffix";

/// Source position, normally filled in by a `src_pos!()`-style macro at
/// the call site; passed explicitly here since this crate has no
/// equivalent of the original's source-position-capture collaborator.
#[derive(Clone, Copy)]
pub struct SrcPos {
    pub file: &'static str,
    pub func: &'static str,
    pub line: u32,
}

/// An owned counterpart to [`Arg`] for values that must outlive the
/// caller's stack frame once stored on an `Err`.
pub enum OwnedArg {
    I(i64),
    U(u64),
    F(f64),
    S(String),
    B(bool),
    O(Option<Obj>),
}

impl OwnedArg {
    fn as_arg(&self) -> Arg<'_> {
        match self {
            OwnedArg::I(v) => Arg::I(*v),
            OwnedArg::U(v) => Arg::U(*v),
            OwnedArg::F(v) => Arg::F(*v),
            OwnedArg::S(s) => Arg::S(s),
            OwnedArg::B(v) => Arg::B(*v),
            OwnedArg::O(o) => Arg::O(*o),
        }
    }

    fn deep_copy(arg: &Arg) -> OwnedArg {
        match arg {
            Arg::I(v) => OwnedArg::I(*v),
            Arg::U(v) => OwnedArg::U(*v),
            Arg::F(v) => OwnedArg::F(*v),
            Arg::S(s) => OwnedArg::S((*s).to_owned()),
            Arg::B(v) => OwnedArg::B(*v),
            Arg::O(o) => {
                if let Some(obj) = o {
                    object::ref_obj(*obj);
                }
                OwnedArg::O(*o)
            }
        }
    }
}

struct ErrPayload {
    type_tag: String,
    message: String,
    src: SrcPos,
    kvs: Vec<(String, OwnedArg)>,
    sibling: Option<Obj>,
}

static ERR_SLOT: AtomicU32 = AtomicU32::new(0);

pub fn err_klass() -> KlassHandle {
    ERR_SLOT.load(std::sync::atomic::Ordering::Acquire)
}

fn err_payload(obj: Obj) -> &'static ErrPayload {
    // SAFETY: every live `Err` object was created by `make_err`, which
    // always goes through `object::alloc_typed::<ErrPayload>`.
    unsafe { object::payload_ref(obj) }
}

fn err_dispose(obj: Obj) {
    // SAFETY: drops the in-place payload before the generic free reclaims
    // the raw bytes; releases whatever it owned on the way down.
    let payload = unsafe { object::payload_mut::<ErrPayload>(obj) };
    for (_, v) in &payload.kvs {
        if let OwnedArg::O(Some(o)) = v {
            object::release(*o);
        }
    }
    if let Some(sib) = payload.sibling.take() {
        object::release(sib);
    }
    unsafe { object::drop_payload::<ErrPayload>(obj) };
}

fn err_repr(obj: Obj) -> String {
    let p = err_payload(obj);
    let mut out = format!("$err({}, ", p.type_tag);
    format::escape_quoted(&mut out, p.message.as_bytes());
    for (k, v) in &p.kvs {
        out.push_str(", (");
        out.push_str(k);
        out.push_str(", ");
        format::repr_arg(&mut out, &v.as_arg());
        out.push(')');
    }
    out.push(')');
    out
}

/// Custom mini-language: `$T $M $F $f $l $K $$`.
fn err_format(obj: Obj, spec: &str) -> String {
    let p = err_payload(obj);
    if spec.is_empty() {
        return format!("{}: {} ({}@{}:{})", p.type_tag, p.message, p.src.func, p.src.file, p.src.line);
    }
    let mut out = String::with_capacity(spec.len());
    let bytes = spec.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'T' => out.push_str(&p.type_tag),
                b'M' => out.push_str(&p.message),
                b'F' => out.push_str(p.src.func),
                b'f' => out.push_str(p.src.file),
                b'l' => {
                    let _ = write!(out, "{}", p.src.line);
                }
                b'K' => {
                    out.push('{');
                    for (idx, (k, v)) in p.kvs.iter().enumerate() {
                        if idx > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(k);
                        out.push_str(": ");
                        format::format_arg(&mut out, &v.as_arg(), "");
                    }
                    out.push('}');
                }
                b'$' => out.push('$'),
                other => {
                    out.push('$');
                    // Raw byte copy: see the comment in `format::escape_quoted`.
                    unsafe { out.as_mut_vec() }.push(other);
                }
            }
            i += 2;
        } else {
            // Raw byte copy: see the comment in `format::escape_quoted`.
            unsafe { out.as_mut_vec() }.push(bytes[i]);
            i += 1;
        }
    }
    out
}

pub(crate) fn register(base: KlassHandle) {
    klass::intern_klass(
        &ERR_SLOT,
        std::mem::size_of::<ErrPayload>() as i32,
        base,
        "Err",
        &[],
    );
    let k = err_klass();
    dispatch::install_impl(k, values::repr_method(), RawImpl::of(err_repr as fn(Obj) -> String));
    dispatch::install_impl(
        k,
        values::format_method(),
        RawImpl::of(err_format as fn(Obj, &str) -> String),
    );
    object::install_dispose(k, err_dispose);
}

/// Build an `Err`. `type_tag` defaults to `"RT"` when empty. Any kv entry
/// keyed `__msgSuffix` is appended to the rendered message verbatim and
/// dropped from the stored kv list rather than being a substitutable ident.
pub fn make_err(type_tag: &str, src: SrcPos, msg_template: &str, kvs: &[(&str, Arg)]) -> Obj {
    let type_tag = if type_tag.is_empty() { "RT" } else { type_tag };

    let mut suffix: Option<String> = None;
    let mut compacted: Vec<(String, OwnedArg)> = Vec::with_capacity(kvs.len());
    for (k, v) in kvs {
        if *k == MSG_SUFFIX_KEY {
            suffix = Some(match v {
                Arg::S(s) => (*s).to_owned(),
                other => {
                    let mut s = String::new();
                    format::format_arg(&mut s, other, "");
                    s
                }
            });
        } else {
            compacted.push(((*k).to_owned(), OwnedArg::deep_copy(v)));
        }
    }

    let mut message = format::render(
        msg_template,
        |ident| compacted.iter().find(|(k, _)| k == ident).map(|(_, v)| v.as_arg()),
        format::MissingIdent::Fatal,
    );
    if let Some(suffix) = suffix {
        message.push_str(&suffix);
    }

    object::alloc_typed(err_klass(), move || ErrPayload {
        type_tag: type_tag.to_owned(),
        message,
        src,
        kvs: compacted,
        sibling: None,
    })
}

fn sibling_chain_contains(err: Obj, needle: Obj) -> bool {
    let mut cur = err_payload(err).sibling;
    while let Some(o) = cur {
        if o.as_ptr() == needle.as_ptr() {
            return true;
        }
        cur = err_payload(o).sibling;
    }
    false
}

fn sibling_tail(mut err: Obj) -> Obj {
    while let Some(next) = err_payload(err).sibling {
        err = next;
    }
    err
}

/// Combine two errors into a sibling chain. `None` short-circuits to the
/// other argument. Refuses to link an error into its own chain (the
/// original leaves this cycle case unguarded).
pub fn err_combine(first: Option<Obj>, second: Option<Obj>) -> Option<Obj> {
    let (first, second) = match (first, second) {
        (None, s) => return s,
        (f, None) => return f,
        (Some(f), Some(s)) => (f, s),
    };

    if first.as_ptr() == second.as_ptr() || sibling_chain_contains(first, second) {
        return Some(first);
    }

    // SAFETY: both are live `Err` objects (the typed payload is only ever
    // reached through this module), and no other reference observes the
    // sibling field concurrently — this runtime's objects are not
    // internally synchronized, matching the shared-resource policy that
    // callers coordinate mutation externally.
    let old_sibling_of_first = unsafe { object::payload_mut::<ErrPayload>(first) }
        .sibling
        .take();

    if let Some(detached) = old_sibling_of_first {
        let tail = sibling_tail(second);
        unsafe { object::payload_mut::<ErrPayload>(tail) }.sibling = Some(detached);
    }

    object::ref_obj(second);
    unsafe { object::payload_mut::<ErrPayload>(first) }.sibling = Some(second);
    Some(first)
}

/// Look up a key in `err`'s kv list, returning `default` when absent.
pub fn err_getkv<'a>(err: Obj, key: &str, default: Arg<'a>) -> Arg<'a> {
    let p = err_payload(err);
    match p.kvs.iter().find(|(k, _)| k == key) {
        Some((_, v)) => {
            // Borrowed from `err`'s own payload, which outlives this call
            // for the lifetime the caller is allowed to use it under (the
            // object's own refcount, same discipline as every other
            // payload accessor in this crate).
            match v {
                OwnedArg::S(s) => Arg::S(s),
                OwnedArg::I(i) => Arg::I(*i),
                OwnedArg::U(u) => Arg::U(*u),
                OwnedArg::F(f) => Arg::F(*f),
                OwnedArg::B(b) => Arg::B(*b),
                OwnedArg::O(o) => Arg::O(*o),
            }
        }
        None => default,
    }
}

pub fn err_type(err: Obj) -> &'static str {
    &err_payload(err).type_tag
}

pub fn err_message(err: Obj) -> &'static str {
    &err_payload(err).message
}

pub fn err_sibling(err: Obj) -> Option<Obj> {
    err_payload(err).sibling
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    fn here() -> SrcPos {
        SrcPos {
            file: "error.rs",
            func: "test",
            line: 1,
        }
    }

    #[test]
    fn make_err_renders_template_with_quoting() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let err = make_err(
            "IO",
            here(),
            "cannot open {path:q}: {code}",
            &[("path", Arg::S("/tmp/x")), ("code", Arg::I(2))],
        );
        assert_eq!(err_message(err), "cannot open \"/tmp/x\": 2");
        assert_eq!(err_type(err), "IO");
    }

    #[test]
    fn msg_suffix_is_appended_and_not_stored() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let err = make_err(
            "RT",
            here(),
            "base",
            &[("__msgSuffix", Arg::S(" (extra)"))],
        );
        assert_eq!(err_message(err), "base (extra)");
        assert!(matches!(err_getkv(err, "__msgSuffix", Arg::B(false)), Arg::B(false)));
    }

    #[test]
    fn combine_links_second_as_direct_sibling() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let a = make_err("A", here(), "a", &[]);
        let b = make_err("B", here(), "b", &[]);
        let combined = err_combine(Some(a), Some(b)).unwrap();
        assert_eq!(combined.as_ptr(), a.as_ptr());
        let sib = err_sibling(combined).unwrap();
        assert_eq!(err_type(sib), "B");
    }

    #[test]
    fn combine_null_short_circuits() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let e = make_err("A", here(), "a", &[]);
        assert_eq!(err_combine(None, Some(e)).unwrap().as_ptr(), e.as_ptr());
        assert_eq!(err_combine(Some(e), None).unwrap().as_ptr(), e.as_ptr());
    }

    #[test]
    fn default_format_is_type_message_func_file_line() {
        runtime::init();
        let _pool = crate::autorelease::push_pool();
        let err = make_err("RT", here(), "oops", &[]);
        assert_eq!(err_format(err, ""), "RT: oops (test@error.rs:1)");
    }
}
