//! Templated `{ident[:spec]}` substitution, the string escape table, and the
//! `printkv` entry point.
//!
//! Two call sites share this engine: error-message interpolation against a
//! fixed key/value list (fatal on a missing ident), and `printkv` against a
//! sorted slice of pairs found by binary search (logs a warning on a miss
//! instead).

use crate::object::Obj;
use crate::values;
use std::fmt::Write as _;

const MAX_IDENT_LEN: usize = 31;
const MAX_SPEC_LEN: usize = 31;

/// A tagged value passed to the formatter, mirroring the external
/// tagged-union contract (`i|u|f|s|b|o`).
#[derive(Clone, Copy)]
pub enum Arg<'a> {
    I(i64),
    U(u64),
    F(f64),
    S(&'a str),
    B(bool),
    O(Option<Obj>),
}

/// Render `value` with the given printf-like `spec` into `out`.
///
/// Integer conversions accept a trailing `d i u o x X` after stripping any
/// `l`, `ll`, or `z` length modifier (kept only for source compatibility
/// with format strings ported from elsewhere — Rust has no such
/// modifiers of its own). Bool accepts the extra conversion letters
/// `B b P Y y`, each rewritten internally to `s` with the chosen word
/// substituted.
pub fn format_arg(out: &mut String, value: &Arg, spec: &str) {
    match value {
        Arg::I(v) => format_int(out, *v as i128, spec, true),
        Arg::U(v) => format_int(out, *v as i128, spec, false),
        Arg::F(v) => format_float(out, *v, spec),
        Arg::S(s) => {
            if spec == "q" {
                escape_quoted(out, s.as_bytes());
            } else {
                out.push_str(s);
            }
        }
        Arg::B(b) => format_bool(out, *b, spec),
        Arg::O(obj) => format_object(out, *obj, spec),
    }
}

/// `fobjRepr`-style rendering: source-like literal form.
pub fn repr_arg(out: &mut String, value: &Arg) {
    match value {
        Arg::I(v) => {
            let _ = write!(out, "$I({v})");
        }
        Arg::U(v) => {
            let _ = write!(out, "$U({v})");
        }
        Arg::F(v) => {
            let _ = write!(out, "$F({v})");
        }
        Arg::S(s) => {
            out.push_str("$S(");
            escape_quoted(out, s.as_bytes());
            out.push(')');
        }
        Arg::B(b) => {
            let _ = write!(out, "$B({})", if *b { "true" } else { "false" });
        }
        Arg::O(obj) => format_object_repr(out, *obj),
    }
}

fn format_object(out: &mut String, obj: Option<Obj>, spec: &str) {
    match obj {
        None => out.push_str("NULL"),
        Some(o) => match values::format_dispatch(o, spec) {
            Some(s) => out.push_str(&s),
            None => format_object_repr(out, Some(o)),
        },
    }
}

fn format_object_repr(out: &mut String, obj: Option<Obj>) {
    match obj {
        None => out.push_str("NULL"),
        Some(o) => out.push_str(&values::repr_dispatch(o)),
    }
}

fn strip_length_modifiers(spec: &str) -> (&str, char) {
    let bytes = spec.as_bytes();
    if bytes.is_empty() {
        return (spec, 'd');
    }
    let conv = *bytes.last().unwrap() as char;
    let mut prefix_end = bytes.len() - 1;
    for suffix in ["ll", "l", "z"] {
        let sl = suffix.len();
        if prefix_end >= sl && &spec[prefix_end - sl..prefix_end] == suffix {
            prefix_end -= sl;
            break;
        }
    }
    (&spec[..prefix_end], conv)
}

/// Flags/width/precision parsed out of a printf-style spec prefix (the part
/// before the conversion letter, length modifiers already stripped).
#[derive(Default)]
struct NumSpec {
    left: bool,
    plus: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

fn parse_num_spec(prefix: &str) -> NumSpec {
    let bytes = prefix.as_bytes();
    let mut i = 0;
    let mut s = NumSpec::default();
    while i < bytes.len() {
        match bytes[i] {
            b'-' => s.left = true,
            b'+' => s.plus = true,
            b'0' => s.zero = true,
            b' ' | b'#' => {}
            _ => break,
        }
        i += 1;
    }
    let width_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    s.width = prefix[width_start..i].parse().unwrap_or(0);
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let prec_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        s.precision = Some(prefix[prec_start..i].parse().unwrap_or(0));
    }
    s
}

/// Pad `sign` + `digits` out to `spec.width`, honoring `-` (left-align) and
/// `0` (zero-pad between the sign and the digits) the way C printf does.
fn pad_numeric(out: &mut String, sign: &str, digits: &str, spec: &NumSpec) {
    let len = sign.len() + digits.len();
    if len >= spec.width {
        out.push_str(sign);
        out.push_str(digits);
        return;
    }
    let pad = spec.width - len;
    if spec.left {
        out.push_str(sign);
        out.push_str(digits);
        for _ in 0..pad {
            out.push(' ');
        }
    } else if spec.zero {
        out.push_str(sign);
        for _ in 0..pad {
            out.push('0');
        }
        out.push_str(digits);
    } else {
        for _ in 0..pad {
            out.push(' ');
        }
        out.push_str(sign);
        out.push_str(digits);
    }
}

fn format_int(out: &mut String, v: i128, spec: &str, signed: bool) {
    let (prefix, conv) = strip_length_modifiers(spec);
    let n = parse_num_spec(prefix);

    let (sign, mut digits) = match conv {
        'o' => (String::new(), format!("{:o}", v as i64 as u64)),
        'x' => (String::new(), format!("{:x}", v as i64 as u64)),
        'X' => (String::new(), format!("{:X}", v as i64 as u64)),
        'u' => (String::new(), format!("{}", v as u64)),
        _ if signed => {
            let iv = v as i64;
            if iv < 0 {
                ("-".to_string(), format!("{}", iv.unsigned_abs()))
            } else if n.plus {
                ("+".to_string(), format!("{iv}"))
            } else {
                (String::new(), format!("{iv}"))
            }
        }
        _ => (String::new(), format!("{}", v as u64)),
    };
    if let Some(prec) = n.precision {
        if digits.len() < prec {
            digits = format!("{}{}", "0".repeat(prec - digits.len()), digits);
        }
    }
    pad_numeric(out, &sign, &digits, &n);
}

fn format_float(out: &mut String, v: f64, spec: &str) {
    let n = parse_num_spec(spec);
    let digits = match n.precision {
        Some(prec) => format!("{v:.prec$}"),
        None => format!("{v}"),
    };
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-".to_string(), rest.to_string()),
        None if n.plus => ("+".to_string(), digits),
        None => (String::new(), digits),
    };
    pad_numeric(out, &sign, &digits, &n);
}

fn format_bool(out: &mut String, b: bool, spec: &str) {
    let conv = spec.chars().last();
    let word = match conv {
        Some('B') => {
            if b {
                "TRUE"
            } else {
                "FALSE"
            }
        }
        Some('b') | None => {
            if b {
                "true"
            } else {
                "false"
            }
        }
        Some('P') => {
            if b {
                "True"
            } else {
                "False"
            }
        }
        Some('Y') => {
            if b {
                "Yes"
            } else {
                "No"
            }
        }
        Some('y') => {
            if b {
                "yes"
            } else {
                "no"
            }
        }
        _ => {
            if b {
                "true"
            } else {
                "false"
            }
        }
    };
    out.push_str(word);
}

/// The shared string escape table, used by both `repr` and format spec `q`.
pub fn escape_quoted(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x07 => out.push_str("\\a"),
            0x08 => out.push_str("\\b"),
            0x0c => out.push_str("\\f"),
            0x0b => out.push_str("\\v"),
            b'\\' => out.push_str("\\\\"),
            b if b < 0x20 => {
                let _ = write!(out, "\\x{b:02x}");
            }
            // Any other byte, including UTF-8 continuation/lead bytes for a
            // multi-byte scalar, is copied through verbatim. Casting a lone
            // byte to `char` would reinterpret it as Latin-1 and corrupt
            // multi-byte sequences; pushing the raw byte instead preserves
            // them since we never skip or reorder bytes.
            b => unsafe { out.as_mut_vec() }.push(b),
        }
    }
    out.push('"');
}

/// What to do when the template references an ident that isn't in the
/// key/value list.
pub enum MissingIdent {
    /// Error-form interpolation: a missing ident is a contract violation.
    Fatal,
    /// `printkv`: log a warning and render the ident literally.
    Warn,
}

/// Expand `{ident[:spec]}` templates in `fmt` against `lookup`.
///
/// `{{` emits a literal `{`. Braces must balance; `ident`/`spec` are each
/// capped at 31 bytes. `lookup` returns `None` for an unknown ident.
pub fn render<'a>(fmt: &str, lookup: impl Fn(&str) -> Option<Arg<'a>>, on_missing: MissingIdent) -> String {
    let mut out = String::with_capacity(fmt.len());
    let bytes = fmt.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push('{');
                i += 2;
            }
            b'{' => {
                let close = bytes[i..]
                    .iter()
                    .position(|&b| b == b'}')
                    .unwrap_or_else(|| crate::macros::fail("format: unbalanced braces"));
                let inner = &fmt[i + 1..i + close];
                let (ident, spec) = match inner.find(':') {
                    Some(p) => (&inner[..p], &inner[p + 1..]),
                    None => (inner, ""),
                };
                rt_assert!(
                    ident.len() <= MAX_IDENT_LEN,
                    "format: ident longer than 31 bytes"
                );
                rt_assert!(
                    spec.len() <= MAX_SPEC_LEN,
                    "format: spec longer than 31 bytes"
                );
                match lookup(ident) {
                    Some(value) => format_arg(&mut out, &value, spec),
                    None => match on_missing {
                        MissingIdent::Fatal => {
                            crate::macros::fail(&format!("format: missing ident '{ident}'"))
                        }
                        MissingIdent::Warn => {
                            log::warn!("printkv: missing ident '{ident}'");
                            out.push('{');
                            out.push_str(inner);
                            out.push('}');
                        }
                    },
                }
                i += close + 1;
            }
            b => {
                // Raw byte copy: see the comment in `escape_quoted` above.
                unsafe { out.as_mut_vec() }.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Renders a C-`printf`-style format string against positional args:
/// each `%[length-modifier]conv` consumes the next `Arg` in order. `%%`
/// emits a literal `%`. This is the plain positional sibling of
/// [`render`]'s named `{ident}` substitution, used by `sprintf`/`strcatf`.
pub fn sprintf_render(fmt: &str, args: &[Arg]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let bytes = fmt.as_bytes();
    let mut i = 0;
    let mut arg_idx = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            // Raw byte copy: see the comment in `escape_quoted` above.
            unsafe { out.as_mut_vec() }.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            out.push('%');
            i += 2;
            continue;
        }
        let start = i + 1;
        let mut j = start;
        while j < bytes.len() && !bytes[j].is_ascii_alphabetic() {
            j += 1;
        }
        rt_assert!(j < bytes.len(), "sprintf: unterminated format directive");
        let spec = &fmt[start..=j];
        let arg = args
            .get(arg_idx)
            .unwrap_or_else(|| crate::macros::fail("sprintf: too few arguments for format string"));
        format_arg(&mut out, arg, spec);
        arg_idx += 1;
        i = j + 1;
    }
    out
}

/// Binary-search a sorted `(key, value)` slice and render `fmt` against it.
/// The slice must already be sorted by key (debug-asserted); a missing
/// ident logs a warning rather than aborting.
pub fn printkv(fmt: &str, sorted_kvs: &[(&str, Arg)]) -> String {
    dbg_assert!(
        sorted_kvs.windows(2).all(|w| w[0].0 <= w[1].0),
        "printkv: kv slice must be sorted by key"
    );
    render(
        fmt,
        |ident| {
            sorted_kvs
                .binary_search_by(|(k, _)| (*k).cmp(ident))
                .ok()
                .map(|idx| sorted_kvs[idx].1)
        },
        MissingIdent::Warn,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_brace_escape() {
        let out = render("a {{ b", |_| None, MissingIdent::Warn);
        assert_eq!(out, "a { b");
    }

    #[test]
    fn substitutes_known_ident() {
        let out = render(
            "hello {name}!",
            |id| if id == "name" { Some(Arg::S("world")) } else { None },
            MissingIdent::Warn,
        );
        assert_eq!(out, "hello world!");
    }

    #[test]
    fn escape_table_round_trip_chars() {
        let mut out = String::new();
        escape_quoted(&mut out, b"a\"b\\c\nd");
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\"");
    }

    #[test]
    fn escape_control_byte() {
        let mut out = String::new();
        escape_quoted(&mut out, &[0x01]);
        assert_eq!(out, "\"\\x01\"");
    }

    #[test]
    fn printkv_sorted_lookup() {
        let kvs: Vec<(&str, Arg)> = vec![("code", Arg::I(2)), ("path", Arg::S("/tmp/x"))];
        let out = printkv("cannot open {path:q}: {code}", &kvs);
        assert_eq!(out, "cannot open \"/tmp/x\": 2");
    }

    #[test]
    fn quoted_spec_escapes_strings() {
        let mut out = String::new();
        format_arg(&mut out, &Arg::S("/tmp/x"), "q");
        assert_eq!(out, "\"/tmp/x\"");
    }

    #[test]
    fn bool_extra_conversions() {
        let mut out = String::new();
        format_bool(&mut out, true, "Y");
        assert_eq!(out, "Yes");
        out.clear();
        format_bool(&mut out, false, "P");
        assert_eq!(out, "False");
    }

    #[test]
    fn sprintf_style_positional_args() {
        let out = sprintf_render("%d", &[Arg::I(42)]);
        assert_eq!(out, "42");
    }

    #[test]
    fn sprintf_literal_percent() {
        let out = sprintf_render("100%%", &[]);
        assert_eq!(out, "100%");
    }

    #[test]
    fn zero_padded_width_preserved() {
        let mut out = String::new();
        format_int(&mut out, 42, "05lld", true);
        assert_eq!(out, "00042");
    }

    #[test]
    fn hex_width_and_negative_sign() {
        let mut out = String::new();
        format_int(&mut out, -7, "4d", true);
        assert_eq!(out, "  -7");
    }

    #[test]
    fn float_precision_applied() {
        let mut out = String::new();
        format_float(&mut out, std::f64::consts::PI, ".2f");
        assert_eq!(out, "3.14");
    }

    #[test]
    fn multi_byte_utf8_survives_escape_quoted() {
        let mut out = String::new();
        escape_quoted(&mut out, "café".as_bytes());
        assert_eq!(out, "\"café\"");
    }

    #[test]
    fn multi_byte_utf8_survives_render() {
        let out = render("héllo {name}", |id| (id == "name").then_some(Arg::S("wörld")), MissingIdent::Warn);
        assert_eq!(out, "héllo wörld");
    }
}
