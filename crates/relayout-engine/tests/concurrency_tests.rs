//! Redefinitions racing with each other and with running code

mod common;

use common::{init_tracing, ClassBuilder};
use relayout_bytecode::{access, Opcode};
use relayout_engine::{RedefineError, TransactionState, TypeIdentifier, Value, Vm};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

fn point(version: u32) -> ClassBuilder {
    let mut class = ClassBuilder::new("app/Point", None)
        .field("x", "I", access::PUBLIC)
        .getter("getX", "app/Point", "x");
    if version >= 2 {
        class = class
            .field("y", "I", access::PUBLIC)
            .getter("getY", "app/Point", "y")
            .setter("setY", "app/Point", "y");
    }
    if version >= 3 {
        class = class.returns_int("version", version as i32);
    }
    class
}

#[test]
fn test_same_type_redefinitions_are_serialized() {
    init_tracing();
    let vm = Vm::default();
    let class = vm.define_class(None, &point(1).bytes()).unwrap();
    let v2 = point(2).bytes();
    let barrier = Barrier::new(8);

    let patches: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    vm.redefine(None, "app/Point", &v2).unwrap().patches.len()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    // Exactly one transaction saw the change; the rest diffed to nothing
    assert_eq!(patches, 3);
    let p = vm.new_object(&class);
    vm.invoke_virtual(&p, "setY", "(I)V", vec![Value::Int(4)])
        .unwrap();
    assert_eq!(
        vm.invoke_virtual(&p, "getY", "()I", vec![]).unwrap(),
        Value::Int(4)
    );
    assert_eq!(
        vm.engine()
            .coordinator()
            .state(&TypeIdentifier::bootstrap("app/Point")),
        Some(TransactionState::Committed)
    );
}

#[test]
fn test_failed_transaction_does_not_block_other_types() {
    let vm = Vm::default();
    vm.define_class(
        None,
        &ClassBuilder::new("app/Broken", None)
            .returns_int("ok", 1)
            .bytes(),
    )
    .unwrap();
    let counter = vm
        .define_class(
            None,
            &ClassBuilder::new("app/Counter", None)
                .returns_int("value", 1)
                .bytes(),
        )
        .unwrap();

    // CONST_I32 with its operand cut short
    let broken = ClassBuilder::new("app/Broken", None)
        .returns_int("ok", 1)
        .raw_method(
            "broken",
            "()I",
            access::PUBLIC,
            vec![Opcode::ConstI32.to_u8(), 0x01],
        )
        .bytes();
    let counter_v2 = ClassBuilder::new("app/Counter", None)
        .returns_int("value", 2)
        .returns_int("twice", 4)
        .bytes();
    let barrier = Barrier::new(2);

    let (broken_result, counter_result) = thread::scope(|s| {
        let a = s.spawn(|| {
            barrier.wait();
            vm.redefine(None, "app/Broken", &broken)
        });
        let b = s.spawn(|| {
            barrier.wait();
            vm.redefine(None, "app/Counter", &counter_v2)
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    let err = broken_result.unwrap_err();
    assert!(matches!(err, RedefineError::PartialRedefinition { .. }));
    assert_eq!(err.failures()[0].name, "broken");
    let state = vm
        .engine()
        .coordinator()
        .state(&TypeIdentifier::bootstrap("app/Broken"));
    assert!(matches!(state, Some(TransactionState::Failed(_))));

    // The failed transaction never recorded its layout
    let current = vm
        .engine()
        .registry()
        .get_current(&vm, None, "app/Broken")
        .unwrap();
    assert!(current.log().is_empty());
    // The class itself already runs from the new definition
    let source = vm.find_class(None, "app/Broken").unwrap().source();
    assert!(source.find_method("broken", "()I").is_some());

    let report = counter_result.unwrap();
    assert_eq!(report.patches.len(), 1);
    let c = vm.new_object(&counter);
    assert_eq!(
        vm.invoke_virtual(&c, "value", "()I", vec![]).unwrap(),
        Value::Int(2)
    );
    assert_eq!(
        vm.invoke_virtual(&c, "twice", "()I", vec![]).unwrap(),
        Value::Int(4)
    );
}

#[test]
fn test_running_code_sees_consistent_bodies() {
    let vm = Vm::default();
    let class = vm.define_class(None, &point(1).bytes()).unwrap();
    let p = vm.new_object(&class);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut calls = 0u32;
                    while !done.load(Ordering::Acquire) || calls == 0 {
                        let x = vm.invoke_virtual(&p, "getX", "()I", vec![]).unwrap();
                        assert_eq!(x, Value::Int(0));
                        calls += 1;
                    }
                    calls
                })
            })
            .collect();

        for version in [2, 3, 2, 1, 3] {
            vm.redefine(None, "app/Point", &point(version).bytes())
                .unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    });

    assert_eq!(
        vm.invoke_virtual(&p, "version", "()I", vec![]).unwrap(),
        Value::Int(3)
    );
}

#[test]
fn test_added_method_stays_callable_across_redefinitions() {
    init_tracing();
    let vm = Vm::default();
    let class = vm.define_class(None, &point(1).bytes()).unwrap();
    vm.redefine(None, "app/Point", &point(3).bytes()).unwrap();
    vm.define_class(
        None,
        &ClassBuilder::new("app/Reader", None)
            .call_site("readVersion", "app/Point", "version")
            .bytes(),
    )
    .unwrap();
    let p = vm.new_object(&class);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|i| {
                let (vm, p, done) = (&vm, &p, &done);
                s.spawn(move || {
                    let mut calls = 0u32;
                    while !done.load(Ordering::Acquire) || calls == 0 {
                        let version = if i % 2 == 0 {
                            vm.invoke_virtual(p, "version", "()I", vec![])
                        } else {
                            vm.invoke_static(
                                None,
                                "app/Reader",
                                "readVersion",
                                "(Lapp/Point;)I",
                                vec![p.clone()],
                            )
                        };
                        match version {
                            Ok(Value::Int(n)) => assert!((3..=5).contains(&n), "version {}", n),
                            other => panic!("added method unavailable: {:?}", other),
                        }
                        calls += 1;
                    }
                    calls
                })
            })
            .collect();

        for _ in 0..50 {
            for version in [4, 3, 5, 4] {
                vm.redefine(None, "app/Point", &point(version).bytes())
                    .unwrap();
            }
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    });

    assert_eq!(
        vm.invoke_virtual(&p, "version", "()I", vec![]).unwrap(),
        Value::Int(4)
    );
}
