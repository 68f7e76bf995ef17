//! Integration tests for the isolation layer: loading artifacts into
//! disposable contexts, terminal interception, policy denials and wall-clock
//! budgets.

use std::time::Duration;

use sandbox::{InvocationError, MemorySize, Runtime, RuntimeConfig, Trust};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("failed to create runtime")
}

fn compile(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("fixture does not assemble")
}

const HELLO: &str = r#"
(module
  (import "terminal" "write" (func $write (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "Hello, World!\n")
  (func (export "main")
    (call $write (i32.const 0) (i32.const 14))))
"#;

const ECHO: &str = r#"
(module
  (import "terminal" "read_line" (func $read_line (param i32 i32) (result i32)))
  (import "terminal" "write" (func $write (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 256) "\n")
  (func (export "main")
    (local $n i32)
    (block $done
      (loop $next
        (local.set $n (call $read_line (i32.const 0) (i32.const 200)))
        (br_if $done (i32.lt_s (local.get $n) (i32.const 0)))
        (call $write (i32.const 0) (local.get $n))
        (call $write (i32.const 256) (i32.const 1))
        (br $next)))))
"#;

const SPIN: &str = r#"
(module
  (func (export "main")
    (loop $spin (br $spin))))
"#;

const EXITER: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "main")
    (call $exit (i32.const 1))))
"#;

#[test]
fn entry_point_writes_are_captured() {
    let runtime = runtime();
    let context = runtime.create_context(Trust::Untrusted);
    let module = context.load("demo.Hello", &compile(HELLO)).unwrap();
    assert!(module.has_entry_point());

    context.reset_terminal();
    context
        .invoke_entry(&module, Duration::from_secs(5))
        .expect("hello world faulted");
    assert_eq!(context.output(), "Hello, World!\n");
}

#[test]
fn scripted_input_reaches_the_entry_point() {
    let runtime = runtime();
    let context = runtime.create_context(Trust::Untrusted);
    let module = context.load("demo.Echo", &compile(ECHO)).unwrap();

    context.reset_terminal();
    context.set_input(&["one".to_owned(), "two".to_owned()]);
    context
        .invoke_entry(&module, Duration::from_secs(5))
        .expect("echo faulted");
    assert_eq!(context.output(), "one\ntwo\n");
}

#[test]
fn budget_expiry_aborts_the_invocation() {
    let runtime = runtime();
    let context = runtime.create_context(Trust::Untrusted);
    let module = context.load("demo.Spin", &compile(SPIN)).unwrap();

    let result = context.invoke_entry(&module, Duration::from_millis(300));
    match result {
        Err(InvocationError::Timeout) => (),
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[test]
fn denied_imports_surface_as_violations() {
    let runtime = runtime();
    let context = runtime.create_context(Trust::Untrusted);
    let module = context.load("demo.Exiter", &compile(EXITER)).unwrap();

    let result = context.invoke_entry(&module, Duration::from_secs(5));
    match result {
        Err(InvocationError::Violation(violation)) => {
            assert!(violation.to_string().contains("system exit"));
        }
        other => panic!("expected a violation, got {:?}", other),
    }

    // The process and the context survive the denial.
    let hello = context.load("demo.Hello", &compile(HELLO)).unwrap();
    context.reset_terminal();
    context
        .invoke_entry(&hello, Duration::from_secs(5))
        .expect("context unusable after a denial");
    assert_eq!(context.output(), "Hello, World!\n");
}

#[test]
fn modules_without_entry_point_are_detected() {
    let runtime = runtime();
    let context = runtime.create_context(Trust::Untrusted);
    let module = context
        .load("demo.Library", &compile("(module (func $helper))"))
        .unwrap();
    assert!(!module.has_entry_point());

    match context.invoke_entry(&module, Duration::from_secs(1)) {
        Err(InvocationError::NoEntryPoint) => (),
        other => panic!("expected no entry point, got {:?}", other),
    }
}

#[test]
fn contexts_are_isolated() {
    let runtime = runtime();
    let first = runtime.create_context(Trust::Untrusted);
    let second = runtime.create_context(Trust::Untrusted);
    assert_ne!(first.id(), second.id());

    let module = first.load("demo.Hello", &compile(HELLO)).unwrap();
    first.reset_terminal();
    first
        .invoke_entry(&module, Duration::from_secs(5))
        .unwrap();

    assert_eq!(first.output(), "Hello, World!\n");
    assert_eq!(second.output(), "");
}

#[test]
fn memory_limit_is_enforced() {
    let config = RuntimeConfig {
        max_memory: MemorySize::KiloBytes(128),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(config).unwrap();
    let context = runtime.create_context(Trust::Untrusted);

    // Sixteen pages is a megabyte, well past the configured cap.
    let result = context.load(
        "demo.Hog",
        &compile("(module (memory (export \"memory\") 16) (func (export \"main\")))"),
    );
    let module = match result {
        Ok(module) => module,
        // Engines may reject the oversized memory at load or at
        // instantiation; both count.
        Err(_) => return,
    };
    assert!(context
        .invoke_entry(&module, Duration::from_secs(1))
        .is_err());
}
