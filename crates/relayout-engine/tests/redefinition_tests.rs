//! End-to-end redefinition through the bundled runtime

mod common;

use common::{init_tracing, ClassBuilder};
use parking_lot::Mutex;
use relayout_bytecode::{access, Opcode};
use relayout_engine::{
    ChangeListener, ChangedType, CurrentDescriptor, EngineError, Patch, RedefineError,
    RewriteKind, TypeIdentifier, Value, Vm, VmError,
};
use std::sync::Arc;

const PUBLIC: u16 = access::PUBLIC;

/// `app/Point { int x; getX; setX }`
fn point_v1() -> ClassBuilder {
    ClassBuilder::new("app/Point", None)
        .field("x", "I", PUBLIC)
        .getter("getX", "app/Point", "x")
        .setter("setX", "app/Point", "x")
}

/// v1 plus `int y; getY; setY`
fn point_v2() -> ClassBuilder {
    point_v1()
        .field("y", "I", PUBLIC)
        .getter("getY", "app/Point", "y")
        .setter("setY", "app/Point", "y")
}

fn user() -> ClassBuilder {
    ClassBuilder::new("app/User", None)
        .call_site("readX", "app/Point", "getX")
        .call_site("readY", "app/Point", "getY")
}

fn call(vm: &Vm, receiver: &Value, name: &str) -> Result<Value, VmError> {
    vm.invoke_virtual(receiver, name, "()I", vec![])
}

fn set(vm: &Vm, receiver: &Value, name: &str, value: i32) {
    vm.invoke_virtual(receiver, name, "(I)V", vec![Value::Int(value)])
        .expect("setter runs");
}

#[test]
fn test_untouched_type_current_equals_baseline() {
    let vm = Vm::default();
    vm.define_class(None, &point_v1().bytes()).unwrap();

    let current = vm
        .engine()
        .registry()
        .get_current(&vm, None, "app/Point")
        .expect("loaded type has a current descriptor");
    assert_eq!(current.layout(), &current.baseline().layout);
    assert!(current.log().is_empty());
    assert!(current.added().is_empty());
}

#[test]
fn test_added_field_and_method() {
    init_tracing();
    let vm = Vm::default();
    let class = vm.define_class(None, &point_v1().bytes()).unwrap();
    let p = vm.new_object(&class);
    let q = vm.new_object(&class);
    set(&vm, &p, "setX", 3);

    let report = vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();
    assert_eq!(report.patches.len(), 3);
    assert_eq!(report.change.added_fields.len(), 1);
    assert_eq!(report.change.added_methods.len(), 2);

    assert_eq!(call(&vm, &p, "getY").unwrap(), Value::Int(0));
    set(&vm, &p, "setY", 7);
    assert_eq!(call(&vm, &p, "getY").unwrap(), Value::Int(7));
    assert_eq!(call(&vm, &p, "getX").unwrap(), Value::Int(3));

    // Every instance starts from the default
    assert_eq!(call(&vm, &q, "getY").unwrap(), Value::Int(0));
    let fresh = vm.new_object(&class);
    assert_eq!(call(&vm, &fresh, "getY").unwrap(), Value::Int(0));
}

#[test]
fn test_existing_call_sites_are_redirected() {
    let vm = Vm::default();
    let class = vm.define_class(None, &point_v1().bytes()).unwrap();
    vm.define_class(None, &user().bytes()).unwrap();
    let p = vm.new_object(&class);

    let before = vm.invoke_static(None, "app/User", "readY", "(Lapp/Point;)I", vec![p.clone()]);
    assert!(matches!(before, Err(VmError::NoSuchMethod(_))));

    let report = vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();
    assert!(report.classes_rewritten >= 2);
    set(&vm, &p, "setY", 5);

    let y = vm
        .invoke_static(None, "app/User", "readY", "(Lapp/Point;)I", vec![p.clone()])
        .unwrap();
    assert_eq!(y, Value::Int(5));
    let x = vm
        .invoke_static(None, "app/User", "readX", "(Lapp/Point;)I", vec![p])
        .unwrap();
    assert_eq!(x, Value::Int(0));
}

#[test]
fn test_classes_loaded_later_see_added_members() {
    let vm = Vm::default();
    let class = vm.define_class(None, &point_v1().bytes()).unwrap();
    vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();

    vm.define_class(None, &user().bytes()).unwrap();
    let sub = vm
        .define_class(
            None,
            &ClassBuilder::new("app/SubPoint", Some("app/Point"))
                .returns_int("getY", 42)
                .bytes(),
        )
        .unwrap();

    let p = vm.new_object(&class);
    set(&vm, &p, "setY", 9);
    let s = vm.new_object(&sub);

    let read = |v: &Value| {
        vm.invoke_static(None, "app/User", "readY", "(Lapp/Point;)I", vec![v.clone()])
            .unwrap()
    };
    assert_eq!(read(&p), Value::Int(9));
    assert_eq!(read(&s), Value::Int(42));
    assert_eq!(call(&vm, &s, "getY").unwrap(), Value::Int(42));
    assert_eq!(call(&vm, &s, "getX").unwrap(), Value::Int(0));
}

#[test]
fn test_added_field_survives_later_redefinitions() {
    let vm = Vm::default();
    let class = vm.define_class(None, &point_v1().bytes()).unwrap();
    let p = vm.new_object(&class);

    vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();
    set(&vm, &p, "setY", 7);

    let v3 = point_v2().returns_int("version", 3);
    let report = vm.redefine(None, "app/Point", &v3.bytes()).unwrap();
    assert_eq!(report.patches.len(), 1);
    assert!(matches!(&report.patches[0], Patch::AddMethod(m) if m.sig.name == "version"));

    assert_eq!(call(&vm, &p, "getY").unwrap(), Value::Int(7));
    assert_eq!(call(&vm, &p, "version").unwrap(), Value::Int(3));

    let current = vm
        .engine()
        .registry()
        .get_current(&vm, None, "app/Point")
        .unwrap();
    let again = CurrentDescriptor::derive(current.baseline().clone(), current.log().to_vec());
    assert_eq!(&again, current.as_ref());
    assert_eq!(current.log().len(), 4);
}

fn shapes(vm: &Vm) {
    vm.define_class(
        None,
        &ClassBuilder::new("app/Base", None)
            .returns_int("describe", 1)
            .bytes(),
    )
    .unwrap();
    for name in ["app/Derived", "app/Other"] {
        vm.define_class(None, &ClassBuilder::new(name, Some("app/Base")).bytes())
            .unwrap();
    }
}

fn derived_v2() -> Vec<u8> {
    ClassBuilder::new("app/Derived", Some("app/Base"))
        .returns_int("describe", 2)
        .bytes()
}

#[test]
fn test_added_override_reached_through_subclass_dispatch() {
    let vm = Vm::default();
    shapes(&vm);
    let instance = |name: &str| vm.new_object(&vm.find_class(None, name).unwrap());
    let (base, derived, other) = (
        instance("app/Base"),
        instance("app/Derived"),
        instance("app/Other"),
    );

    let report = vm.redefine(None, "app/Derived", &derived_v2()).unwrap();
    assert!(report.bodies_replaced >= 1);

    assert_eq!(call(&vm, &base, "describe").unwrap(), Value::Int(1));
    assert_eq!(call(&vm, &derived, "describe").unwrap(), Value::Int(2));
    assert_eq!(call(&vm, &other, "describe").unwrap(), Value::Int(1));

    // Dropping the override again takes its prologue rule with it
    let report = vm
        .redefine(
            None,
            "app/Derived",
            &ClassBuilder::new("app/Derived", Some("app/Base")).bytes(),
        )
        .unwrap();
    assert_eq!(report.change.removed_methods.len(), 1);
    assert_eq!(call(&vm, &derived, "describe").unwrap(), Value::Int(1));
}

#[test]
fn test_redefining_ancestor_keeps_subclass_override() {
    let vm = Vm::default();
    shapes(&vm);
    let instance = |name: &str| vm.new_object(&vm.find_class(None, name).unwrap());
    let (base, derived, other) = (
        instance("app/Base"),
        instance("app/Derived"),
        instance("app/Other"),
    );
    vm.redefine(None, "app/Derived", &derived_v2()).unwrap();
    assert_eq!(call(&vm, &derived, "describe").unwrap(), Value::Int(2));

    let base_v2 = ClassBuilder::new("app/Base", None)
        .returns_int("describe", 5)
        .bytes();
    vm.redefine(None, "app/Base", &base_v2).unwrap();

    assert_eq!(call(&vm, &base, "describe").unwrap(), Value::Int(5));
    assert_eq!(call(&vm, &derived, "describe").unwrap(), Value::Int(2));
    assert_eq!(call(&vm, &other, "describe").unwrap(), Value::Int(5));

    let owned = vm.engine().rules().owned_by(None, "app/Derived");
    assert!(owned.iter().any(|rule| {
        rule.kind == RewriteKind::SubclassDispatch
            && rule.owner == TypeIdentifier::bootstrap("app/Base")
    }));
    assert!(vm.engine().rules().owned_by(None, "app/Base").is_empty());
}

#[test]
fn test_contains_agrees_with_run() {
    let vm = Vm::default();
    shapes(&vm);
    vm.redefine(None, "app/Derived", &derived_v2()).unwrap();

    let dispatch = vm.engine().dispatch();
    for name in ["app/Base", "app/Derived", "app/Other"] {
        let class = vm.find_class(None, name).unwrap();
        let contains = dispatch.contains(&class, "describe", "()I");
        let runs = dispatch
            .run(&class, "describe", "()I", |_, _| Ok::<_, EngineError>(()))
            .is_ok();
        assert_eq!(contains, runs, "{}", name);
        assert_eq!(contains, name == "app/Derived");
    }
}

#[test]
fn test_removed_method() {
    let vm = Vm::default();
    let shape = vm
        .define_class(
            None,
            &ClassBuilder::new("app/Shape", None)
                .returns_int("area", 1)
                .returns_int("sides", 0)
                .bytes(),
        )
        .unwrap();
    let square = vm
        .define_class(
            None,
            &ClassBuilder::new("app/Square", Some("app/Shape"))
                .returns_int("area", 4)
                .bytes(),
        )
        .unwrap();
    let s = vm.new_object(&shape);
    let q = vm.new_object(&square);

    let v2 = ClassBuilder::new("app/Shape", None).returns_int("sides", 0);
    let report = vm.redefine(None, "app/Shape", &v2.bytes()).unwrap();
    assert_eq!(report.change.removed_methods[0].name, "area");

    match call(&vm, &s, "area") {
        Err(VmError::NoSuchMethod(msg)) => assert!(msg.contains("app/Shape.area()I"), "{}", msg),
        other => panic!("expected NoSuchMethod, got {:?}", other),
    }
    assert_eq!(call(&vm, &q, "area").unwrap(), Value::Int(4));

    let reflect = vm.engine().reflect(&vm);
    assert!(reflect.find_method(None, "app/Shape", "area", "()I").is_none());
    let found = reflect
        .find_method(None, "app/Square", "area", "()I")
        .expect("override still visible");
    assert_eq!(found.declaring.name(), "app/Square");
    let inherited = reflect.find_method(None, "app/Square", "sides", "()I").unwrap();
    assert_eq!(inherited.declaring.name(), "app/Shape");

    // Declaring it again restores the physical method
    let v3 = ClassBuilder::new("app/Shape", None)
        .returns_int("area", 10)
        .returns_int("sides", 0);
    let report = vm.redefine(None, "app/Shape", &v3.bytes()).unwrap();
    assert!(matches!(&report.patches[..], [Patch::RestoreMethod(sig)] if sig.name == "area"));
    assert_eq!(call(&vm, &s, "area").unwrap(), Value::Int(10));
}

#[test]
fn test_added_static_members() {
    let vm = Vm::default();
    vm.define_class(
        None,
        &ClassBuilder::new("app/Seq", None).returns_int("id", 0).bytes(),
    )
    .unwrap();
    vm.define_class(
        None,
        &ClassBuilder::new("app/SeqUser", None)
            .method("bump", "()I", PUBLIC | access::STATIC, |w, pool| {
                let next = pool.intern_method("app/Seq", "next", "()I");
                w.emit_invoke_static(next);
                w.emit_opcode(Opcode::ReturnI);
            })
            .bytes(),
    )
    .unwrap();

    let v2 = ClassBuilder::new("app/Seq", None)
        .field("count", "I", PUBLIC | access::STATIC)
        .returns_int("id", 0)
        .method("next", "()I", PUBLIC | access::STATIC, |w, pool| {
            let count = pool.intern_field("app/Seq", "count", "I");
            w.emit_field(Opcode::GetStatic, count);
            w.emit_const_i32(1);
            w.emit_opcode(Opcode::Iadd);
            w.emit_opcode(Opcode::Dup);
            w.emit_field(Opcode::PutStatic, count);
            w.emit_opcode(Opcode::ReturnI);
        });
    vm.redefine(None, "app/Seq", &v2.bytes()).unwrap();

    let bump = || vm.invoke_static(None, "app/SeqUser", "bump", "()I", vec![]).unwrap();
    assert_eq!(bump(), Value::Int(1));
    assert_eq!(bump(), Value::Int(2));
    let direct = vm.invoke_static(None, "app/Seq", "next", "()I", vec![]).unwrap();
    assert_eq!(direct, Value::Int(3));
}

#[test]
fn test_reflection_follows_current_layout() {
    let vm = Vm::default();
    vm.define_class(None, &point_v1().bytes()).unwrap();
    vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();

    let reflect = vm.engine().reflect(&vm);
    let fields = reflect.declared_fields(None, "app/Point");
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["x", "y"]);
    assert!(!fields[0].is_added());
    assert!(fields[1].is_added());

    let get_y = reflect.find_method(None, "app/Point", "getY", "()I").unwrap();
    assert!(get_y.is_added());
    assert!(!get_y.is_static());

    // Drop `x` from the declaration; its physical storage stays behind
    let v3 = ClassBuilder::new("app/Point", None)
        .field("y", "I", PUBLIC)
        .getter("getX", "app/Point", "x")
        .getter("getY", "app/Point", "y")
        .setter("setY", "app/Point", "y");
    let report = vm.redefine(None, "app/Point", &v3.bytes()).unwrap();
    assert_eq!(report.change.removed_fields.len(), 1);
    assert_eq!(report.change.removed_methods.len(), 1);

    let reflect = vm.engine().reflect(&vm);
    assert!(reflect.find_field(None, "app/Point", "x").is_none());
    assert!(reflect.find_field(None, "app/Point", "y").is_some());
    assert!(reflect.declared_fields(None, "app/Missing").is_empty());
}

#[derive(Default)]
struct Recorder {
    before: Mutex<Vec<ChangedType>>,
    after: Mutex<Vec<ChangedType>>,
}

impl ChangeListener for Recorder {
    fn before_change(&self, change: &ChangedType) {
        self.before.lock().push(change.clone());
    }

    fn after_change(&self, change: &ChangedType) {
        self.after.lock().push(change.clone());
    }
}

#[test]
fn test_listeners_hear_committed_changes() {
    let vm = Vm::default();
    let recorder = Arc::new(Recorder::default());
    vm.engine().add_listener(recorder.clone());
    vm.define_class(
        None,
        &ClassBuilder::new("app/Counter", None)
            .returns_int("value", 1)
            .bytes(),
    )
    .unwrap();

    let v2 = ClassBuilder::new("app/Counter", None).returns_int("value", 2);
    let report = vm.redefine(None, "app/Counter", &v2.bytes()).unwrap();
    assert!(report.patches.is_empty());

    let after = recorder.after.lock();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].type_id, TypeIdentifier::bootstrap("app/Counter"));
    assert_eq!(after[0].changed_methods[0].name, "value");
    drop(after);
    assert_eq!(recorder.before.lock().len(), 1);

    let obj = vm.new_object(&vm.find_class(None, "app/Counter").unwrap());
    assert_eq!(call(&vm, &obj, "value").unwrap(), Value::Int(2));

    // Rejected transactions are not announced as committed
    let bad = ClassBuilder::new("app/Counter", Some("app/Point"));
    assert!(vm.redefine(None, "app/Counter", &bad.bytes()).is_err());
    assert_eq!(recorder.after.lock().len(), 1);
}

#[test]
fn test_rejected_redefinitions() {
    let vm = Vm::default();
    vm.define_class(None, &point_v1().bytes()).unwrap();

    let err = vm.redefine(None, "app/Point", &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, RedefineError::ClassFile(_)));

    let other = ClassBuilder::new("app/Other", None).bytes();
    let err = vm.redefine(None, "app/Point", &other).unwrap_err();
    assert!(matches!(err, RedefineError::NameMismatch { found, .. } if found == "app/Other"));

    let reparented = ClassBuilder::new("app/Point", Some("app/Base")).bytes();
    let err = vm.redefine(None, "app/Point", &reparented).unwrap_err();
    assert!(matches!(err, RedefineError::SuperChanged { .. }));

    let missing = ClassBuilder::new("app/Missing", None).bytes();
    let err = vm.redefine(None, "app/Missing", &missing).unwrap_err();
    assert!(matches!(err, RedefineError::UnknownType(_)));

    vm.protect("app/Point");
    let err = vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap_err();
    assert!(matches!(err, RedefineError::NotReplaceable(_)));
}

#[test]
fn test_old_bytes_seed_the_baseline() {
    let vm = Vm::default();
    let class = vm.define_class(None, &point_v1().bytes()).unwrap();
    let report = vm
        .engine()
        .redefine(
            &vm,
            None,
            "app/Point",
            Some(&point_v1().bytes()),
            &point_v2().bytes(),
        )
        .unwrap();
    assert_eq!(report.patches.len(), 3);

    let p = vm.new_object(&class);
    set(&vm, &p, "setY", 11);
    assert_eq!(call(&vm, &p, "getY").unwrap(), Value::Int(11));
}

#[test]
fn test_loaders_are_isolated() {
    let vm = Vm::default();
    let a = vm.new_loader("a");
    let b = vm.new_loader("b");
    let point_a = vm.define_class(Some(&a), &point_v1().bytes()).unwrap();
    let point_b = vm.define_class(Some(&b), &point_v1().bytes()).unwrap();
    assert_ne!(point_a.id(), point_b.id());

    vm.redefine(Some(&a), "app/Point", &point_v2().bytes()).unwrap();

    let pa = vm.new_object(&point_a);
    let pb = vm.new_object(&point_b);
    assert_eq!(call(&vm, &pa, "getY").unwrap(), Value::Int(0));
    let err = call(&vm, &pb, "getY").unwrap_err();
    assert!(matches!(
        err,
        VmError::Engine(EngineError::MissingDispatchTarget { .. })
    ));
}

#[test]
fn test_same_named_type_in_another_loader_keeps_its_call_sites() {
    let vm = Vm::default();
    vm.define_class(None, &point_v1().bytes()).unwrap();
    let plugin = vm.new_loader("plugin");
    let local = vm.define_class(Some(&plugin), &point_v2().bytes()).unwrap();
    vm.define_class(Some(&plugin), &user().bytes()).unwrap();

    // The bootstrap type gains the members the plugin's type already has
    vm.redefine(None, "app/Point", &point_v2().bytes()).unwrap();

    let p = vm.new_object(&local);
    set(&vm, &p, "setY", 7);
    let y = vm
        .invoke_static(Some(&plugin), "app/User", "readY", "(Lapp/Point;)I", vec![p])
        .unwrap();
    assert_eq!(y, Value::Int(7));
    assert_eq!(vm.engine().store().live_instances(), 0);
}

#[test]
fn test_purge_after_loader_is_dropped() {
    let vm = Vm::default();
    {
        let loader = vm.new_loader("plugin");
        let class = vm.define_class(Some(&loader), &point_v1().bytes()).unwrap();
        vm.redefine(Some(&loader), "app/Point", &point_v2().bytes())
            .unwrap();
        let p = vm.new_object(&class);
        set(&vm, &p, "setY", 1);
        assert_eq!(vm.engine().store().live_instances(), 1);
    }

    let stats = vm.engine().purge();
    assert!(stats.metadata > 0);
    assert_eq!(stats.instances, 1);
    assert_eq!(vm.engine().store().live_instances(), 0);
}
