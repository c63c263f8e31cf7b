//! Integration tests for function bridging
//!
//! Tests cover:
//! - Calling embedded functions from the host
//! - Host closures called from embedded code
//! - Host failures and panics surfacing as embedded runtime errors
//! - Re-entrant calls
//! - Closure lifetime

use std::cell::Cell;
use std::rc::Rc;

use lunabind::{BridgeError, FromValue, Value, Vm};

#[test]
fn test_call_embedded_function() {
    let vm = Vm::new().unwrap();
    let function = vm
        .create_function_from_source("local a, b = ...; return a + b, a * b")
        .unwrap();

    let results = function
        .call(&[Value::float(3.0), Value::float(4.0)])
        .unwrap();
    assert_eq!(results, vec![Value::float(7.0), Value::float(12.0)]);

    let first = function
        .call_first(&[Value::float(1.0), Value::float(1.0)])
        .unwrap();
    assert_eq!(first, Value::float(2.0));
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_call_returns_runtime_error() {
    let vm = Vm::new().unwrap();
    let function = vm
        .create_function_from_source("error('boom', 0)")
        .unwrap();

    match function.call(&[]) {
        Err(BridgeError::Runtime(message)) => assert_eq!(message, "boom"),
        other => panic!("expected runtime error, got {:?}", other),
    }
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_non_string_error_object() {
    let vm = Vm::new().unwrap();
    let err = vm.eval("error({ code = 7 })", &[]).unwrap_err();
    assert!(matches!(err, BridgeError::Runtime(ref m) if m.contains("table")));
}

#[test]
fn test_host_closure_receives_arguments() {
    let vm = Vm::new().unwrap();
    let add = vm
        .create_function(|_vm, args| {
            let sum: f64 = args.iter().filter_map(Value::as_number).sum();
            Ok(vec![Value::float(sum), Value::float(args.len() as f64)])
        })
        .unwrap();
    vm.globals().unwrap().set("add", add).unwrap();

    let results = vm.eval("return add(1, 2, 3)", &[]).unwrap();
    assert_eq!(results, vec![Value::float(6.0), Value::float(3.0)]);
}

#[test]
fn test_host_closure_with_no_results() {
    let vm = Vm::new().unwrap();
    let noop = vm.create_function(|_vm, _args| Ok(vec![])).unwrap();
    let count = vm
        .eval("local f = ...; return select('#', f())", &[Value::Function(noop)])
        .unwrap();
    assert_eq!(count, vec![Value::float(0.0)]);
}

#[test]
fn test_host_error_seen_by_embedded_pcall() {
    let vm = Vm::new().unwrap();
    let fail = vm
        .create_function(|_vm, _args| Err(BridgeError::Runtime("host says no".to_string())))
        .unwrap();

    let results = vm
        .eval(
            "local ok, err = pcall(...); return ok, err",
            &[Value::Function(fail)],
        )
        .unwrap();
    assert_eq!(
        results,
        vec![
            Value::Boolean(false),
            Value::string("host says no")
        ]
    );
}

#[test]
fn test_host_error_aborts_host_initiated_call() {
    let vm = Vm::new().unwrap();
    let reached = Rc::new(Cell::new(false));
    let flag = reached.clone();
    let fail = vm
        .create_function(|_vm, args| {
            let n = f64::from_value(args.into_iter().next().unwrap_or_default())?;
            Ok(vec![Value::float(n)])
        })
        .unwrap();
    let after = vm
        .create_function(move |_vm, _args| {
            flag.set(true);
            Ok(vec![])
        })
        .unwrap();

    let err = vm
        .eval(
            "local fail, after = ...; fail('not a number'); after()",
            &[Value::Function(fail), Value::Function(after)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Runtime(ref m) if m == "Type mismatch: expected number, got string"
    ));
    assert!(!reached.get());
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_host_panic_becomes_runtime_error() {
    let vm = Vm::new().unwrap();
    let explode = vm
        .create_function(|_vm, _args| -> lunabind::BridgeResult<Vec<Value>> { panic!("kaboom") })
        .unwrap();

    let results = vm
        .eval(
            "local ok, err = pcall(...); return ok, err",
            &[Value::Function(explode)],
        )
        .unwrap();
    assert_eq!(results[0], Value::Boolean(false));
    assert_eq!(
        results[1],
        Value::string("Host callback panicked: kaboom")
    );
}

#[test]
fn test_reentrant_calls() {
    let vm = Vm::new().unwrap();
    let double = vm
        .create_function(|vm, args| {
            let inner = vm.eval("local n = ...; return n * 2", &args)?;
            Ok(inner)
        })
        .unwrap();
    vm.globals().unwrap().set("double", double).unwrap();

    let results = vm.eval("return double(double(5))", &[]).unwrap();
    assert_eq!(results, vec![Value::float(20.0)]);
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_host_closure_reads_tables() {
    let vm = Vm::new().unwrap();
    let total = vm
        .create_function(|_vm, args| {
            let table = match args.first() {
                Some(Value::Table(table)) => table.clone(),
                other => {
                    let got = other.map(Value::type_name).unwrap_or("no value");
                    return Err(BridgeError::type_guard("table", got));
                }
            };
            let sum: f64 = table.as_sequence::<f64>()?.into_iter().sum();
            Ok(vec![Value::float(sum)])
        })
        .unwrap();
    vm.globals().unwrap().set("total", total).unwrap();

    let results = vm.eval("return total({ 1, 2, 3, 4 })", &[]).unwrap();
    assert_eq!(results, vec![Value::float(10.0)]);
}

#[test]
fn test_closure_dropped_with_vm() {
    struct DropFlag(Rc<Cell<bool>>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let dropped = Rc::new(Cell::new(false));
    let flag = DropFlag(dropped.clone());
    let vm = Vm::new().unwrap();
    let function = vm
        .create_function(move |_vm, _args| {
            let _keep = &flag;
            Ok(vec![])
        })
        .unwrap();

    assert!(!dropped.get());
    drop(vm);
    assert!(dropped.get());
    assert!(matches!(function.call(&[]), Err(BridgeError::VmClosed)));
}
