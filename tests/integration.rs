//! Cross-module scenarios: registration, dispatch with override and
//! super-call, dispose ordering, autorelease pools, and error composition.

use dynobj::autorelease::push_pool;
use dynobj::dispatch::{self, RawImpl};
use dynobj::error::{err_combine, err_getkv, make_err, SrcPos};
use dynobj::format::Arg;
use dynobj::klass;
use dynobj::method;
use dynobj::object::{self, Obj};
use dynobj::values;
use std::sync::atomic::{AtomicU32, Ordering};

fn src() -> SrcPos {
    SrcPos {
        file: "integration.rs",
        func: "test",
        line: 1,
    }
}

#[test]
fn registration_dispatch_override_super_call() {
    dynobj::init();
    let _pool = push_pool();

    static GREET: AtomicU32 = AtomicU32::new(0);
    static ANIMAL: AtomicU32 = AtomicU32::new(0);
    static DOG: AtomicU32 = AtomicU32::new(0);

    method::intern_method(&GREET, "integration::greet");
    let greet = GREET.load(Ordering::Acquire);

    fn animal_greet(_o: Obj) -> &'static str {
        "..."
    }
    fn dog_greet(_o: Obj) -> &'static str {
        "woof"
    }

    klass::intern_klass(&ANIMAL, 0, values::base_klass(), "integration::Animal", &[]);
    let animal = ANIMAL.load(Ordering::Acquire);
    dispatch::install_impl(animal, greet, RawImpl::of(animal_greet as fn(Obj) -> &'static str));

    klass::intern_klass(&DOG, 0, animal, "integration::Dog", &[]);
    let dog = DOG.load(Ordering::Acquire);
    assert!(dispatch::implements(dog, greet));

    dispatch::install_impl(dog, greet, RawImpl::of(dog_greet as fn(Obj) -> &'static str));

    let obj = object::alloc(dog, None, 0);
    let (bound, f) = dispatch::dispatch(Some(obj), greet, 0, true).unwrap();
    let f: fn(Obj) -> &'static str = unsafe { f.cast() };
    assert_eq!(f(bound), "woof");

    // super-call: start the walk at dog's parent instead of dog itself.
    let (bound, f) = dispatch::dispatch(Some(obj), greet, dog, true).unwrap();
    let f: fn(Obj) -> &'static str = unsafe { f.cast() };
    assert_eq!(f(bound), "...");
}

#[test]
fn dispose_is_child_to_root_and_idempotent() {
    dynobj::init();
    static ORDER: AtomicU32 = AtomicU32::new(0);
    static PARENT: AtomicU32 = AtomicU32::new(0);
    static CHILD: AtomicU32 = AtomicU32::new(0);

    fn note_parent(_o: Obj) {
        // runs second
        ORDER.fetch_add(10, Ordering::SeqCst);
    }
    fn note_child(_o: Obj) {
        // runs first
        ORDER.fetch_add(1, Ordering::SeqCst);
    }

    klass::intern_klass(&PARENT, 0, values::base_klass(), "integration::DisposeParent", &[]);
    let parent = PARENT.load(Ordering::Acquire);
    object::install_dispose(parent, note_parent);

    klass::intern_klass(&CHILD, 0, parent, "integration::DisposeChild", &[]);
    let child = CHILD.load(Ordering::Acquire);
    object::install_dispose(child, note_child);

    ORDER.store(0, Ordering::SeqCst);
    {
        let _pool = push_pool();
        let obj = object::alloc(child, None, 0);
        object::ref_obj(obj);
        object::release(obj);
        assert_eq!(ORDER.load(Ordering::SeqCst), 0, "dispose must not run while a ref is held");
    }
    // pool drop released the final ref -> dispose chain ran child then parent.
    assert_eq!(ORDER.load(Ordering::SeqCst), 11);
}

#[test]
fn autorelease_releases_in_reverse_order_on_pool_drop() {
    dynobj::init();
    static COUNT: AtomicU32 = AtomicU32::new(0);
    static K: AtomicU32 = AtomicU32::new(0);

    fn bump(_o: Obj) {
        COUNT.fetch_add(1, Ordering::SeqCst);
    }

    klass::intern_klass(&K, 0, values::base_klass(), "integration::Counted", &[]);
    let k = K.load(Ordering::Acquire);
    object::install_dispose(k, bump);

    COUNT.store(0, Ordering::SeqCst);
    {
        let _pool = push_pool();
        let _a = object::alloc(k, None, 0);
        let _b = object::alloc(k, None, 0);
        let _c = object::alloc(k, None, 0);
        assert_eq!(COUNT.load(Ordering::SeqCst), 0);
    }
    assert_eq!(COUNT.load(Ordering::SeqCst), 3);
}

#[test]
fn make_err_and_combine_scenario() {
    dynobj::init();
    let _pool = push_pool();

    let first = make_err(
        "IO",
        src(),
        "cannot open {path:q}: {code}",
        &[("path", Arg::S("/tmp/x")), ("code", Arg::I(2))],
    );
    let second = make_err("RT", src(), "retry limit exceeded", &[]);

    let combined = err_combine(Some(first), Some(second)).unwrap();
    assert_eq!(combined.as_ptr(), first.as_ptr());

    assert!(matches!(
        err_getkv(first, "code", Arg::I(-1)),
        Arg::I(2)
    ));
    assert!(matches!(
        err_getkv(first, "missing", Arg::B(false)),
        Arg::B(false)
    ));
}

#[test]
fn sprintf_and_strcat_scenario() {
    dynobj::init();
    let _pool = push_pool();

    let forty_two = values::sprintf("%d", &[Arg::I(42)]);
    assert_eq!(values::str_as_str(forty_two), "42");

    let foo = values::newstr(b"foo");
    let cat = values::strcat(foo, b" bar");
    assert_eq!(values::str_as_str(cat), "foo bar");

    let same = values::strcat(foo, b"");
    assert_eq!(same.as_ptr(), foo.as_ptr());
}

#[test]
fn str_int_bool_repr_round_trip() {
    dynobj::init();
    let _pool = push_pool();

    let s = values::newstr(b"hi");
    assert_eq!(values::repr_dispatch(s), "$S(\"hi\")");

    let i = values::new_int(7);
    assert_eq!(values::repr_dispatch(i), "$I(7)");

    let t = values::bool_singleton(true);
    assert_eq!(values::repr_dispatch(t), "$B(true)");
}
