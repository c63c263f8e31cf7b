//! Integration tests for VM construction and evaluation
//!
//! Tests cover:
//! - Evaluating source strings and files
//! - Syntax and runtime failures
//! - The process-wide error handler
//! - Root tables, threads and garbage collection

use std::io::Write;
use std::sync::{Arc, Mutex};

use lunabind::{BridgeError, Kind, Value, Vm, VmOptions};
use serial_test::serial;

#[test]
fn test_eval_with_arguments() {
    let vm = Vm::new().unwrap();
    let results = vm
        .eval(
            "local a, b = ...; return a .. b",
            &[
                Value::string("lua"),
                Value::string("bind"),
            ],
        )
        .unwrap();
    assert_eq!(results, vec![Value::string("luabind")]);
}

#[test]
#[serial]
fn test_syntax_error() {
    let vm = Vm::new().unwrap();
    match vm.eval("return +", &[]) {
        Err(BridgeError::Syntax(message)) => assert!(message.starts_with("lunabind:1:")),
        other => panic!("expected syntax error, got {:?}", other),
    }
    assert_eq!(vm.stack_top(), 0);
}

#[test]
#[serial]
fn test_custom_chunk_name() {
    let vm = Vm::with_options(VmOptions::default().with_chunk_name("=config")).unwrap();
    let err = vm.eval("error('bad value')", &[]).unwrap_err();
    assert!(matches!(err, BridgeError::Runtime(ref m) if m == "config:1: bad value"));
}

#[test]
#[serial]
fn test_eval_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "#!/usr/bin/env lua").unwrap();
    writeln!(file, "local n = ...").unwrap();
    writeln!(file, "if n < 0 then error('negative') end").unwrap();
    writeln!(file, "return n * 10").unwrap();
    file.flush().unwrap();

    let vm = Vm::new().unwrap();
    let results = vm.eval_file(file.path(), &[Value::float(4.0)]).unwrap();
    assert_eq!(results, vec![Value::float(40.0)]);

    // Shebang line is skipped but still counted
    match vm.eval_file(file.path(), &[Value::float(-1.0)]) {
        Err(BridgeError::Runtime(message)) => assert!(message.ends_with(":3: negative")),
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let vm = Vm::new().unwrap();
    let err = vm
        .create_function_from_file(dir.path().join("missing.lua"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)));
}

#[test]
#[serial]
fn test_error_handler_sees_messages() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    lunabind::set_error_handler(move |message| {
        sink.lock().unwrap().push(message.to_string());
    });

    let vm = Vm::new().unwrap();
    let _ = vm.eval("error('first', 0)", &[]);
    let _ = vm.eval("return (", &[]);
    assert!(vm.eval("return 1", &[]).is_ok());
    lunabind::reset_error_handler();
    let _ = vm.eval("error('after reset', 0)", &[]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], "first");
    assert!(seen[1].contains("lunabind:1:"));
}

#[test]
#[serial]
fn test_error_handler_sees_host_failures() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    lunabind::set_error_handler(move |message| {
        sink.lock().unwrap().push(message.to_string());
    });

    let vm = Vm::new().unwrap();
    let fail = vm
        .create_function(|_vm, _args| Err("closure failed".into()))
        .unwrap();
    let err = fail.call(&[]).unwrap_err();
    lunabind::reset_error_handler();

    assert!(matches!(err, BridgeError::Runtime(ref m) if m == "closure failed"));
    assert_eq!(*seen.lock().unwrap(), vec!["closure failed".to_string()]);
}

#[test]
fn test_registry_and_globals() {
    let vm = Vm::new().unwrap();
    let registry = vm.registry().unwrap();
    let globals = vm.globals().unwrap();
    assert_ne!(registry, globals);

    let results = vm.eval("return _G", &[]).unwrap();
    assert_eq!(results, vec![Value::Table(globals)]);

    registry.set("lunabind.test", true).unwrap();
    assert_eq!(
        registry.get("lunabind.test").unwrap(),
        Value::Boolean(true)
    );
}

#[test]
fn test_threads() {
    let vm = Vm::new().unwrap();
    let results = vm
        .eval(
            "local t, m = coroutine.running(); return t, m, coroutine.create(function() end)",
            &[],
        )
        .unwrap();
    assert_eq!(results.len(), 3);

    match (&results[0], &results[2]) {
        (Value::Thread(main), Value::Thread(coroutine)) => {
            assert!(main.is_main().unwrap());
            assert!(!coroutine.is_main().unwrap());
            assert_ne!(main, coroutine);
        }
        other => panic!("expected threads, got {:?}", other),
    }
    assert_eq!(results[1], Value::Boolean(true));
    assert_eq!(results[2].kind(), Kind::Thread);
}

#[test]
fn test_collect_garbage_releases_memory() {
    let vm = Vm::new().unwrap();
    vm.collect_garbage();
    let baseline = vm.used_memory();

    let table = vm
        .eval(
            "local t = {} for i = 1, 10000 do t[i] = tostring(i) end return t",
            &[],
        )
        .unwrap();
    vm.collect_garbage();
    let loaded = vm.used_memory();
    assert!(loaded > baseline);

    drop(table);
    vm.collect_garbage();
    assert!(vm.used_memory() < loaded);
}

#[test]
#[serial]
fn test_options_are_exposed() {
    let vm = Vm::with_options(VmOptions::bare().with_stack_headroom(8)).unwrap();
    assert!(!vm.options().open_libs);
    assert_eq!(vm.options().stack_headroom, 8);

    // Only the base environment table exists without libs
    let results = vm.eval("return type(print)", &[]);
    assert!(results.is_err());
}
