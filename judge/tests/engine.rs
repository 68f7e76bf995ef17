//! End-to-end tests of the check engine: compile a submission in memory,
//! load it into a disposable context and run checks against it.

use std::collections::BTreeMap;
use std::time::Duration;

use judge::checks::{self, CheckSet};
use judge::compiler;
use judge::protocol::{CheckEnvelope, CheckType};
use judge::runner::CheckRunner;
use judge::{ErrorKind, Outcome, Submission, SUBMISSION_WIDE};
use sandbox::{Runtime, RuntimeConfig};

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

const FILE_PEEKER: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_open" (func $open (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "main")
    (drop (call $open (i32.const 0) (i32.const 11)))))
"#;

/// Drives the target once with the input "ping" and expects it echoed back.
const ECHO_PROBE_CHECK: &str = r#"
(module
  (import "check" "set_input" (func $set_input (param i32 i32)))
  (import "check" "run_target" (func $run_target (result i32)))
  (import "check" "read_output" (func $read_output (param i32 i32) (result i32)))
  (import "check" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "ping\n")
  (data (i32.const 64) "target did not echo the probe")
  (func (export "run_check")
    (local $n i32)
    (call $set_input (i32.const 0) (i32.const 5))
    (drop (call $run_target))
    (local.set $n (call $read_output (i32.const 1024) (i32.const 512)))
    (if (i32.ne (local.get $n) (i32.const 5))
      (then (call $fail (i32.const 64) (i32.const 29))))
    (if (i32.ne (i32.load8_u (i32.const 1024)) (i32.const 112))
      (then (call $fail (i32.const 64) (i32.const 29))))))
"#;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("failed to create runtime")
}

fn submission(files: &[(&str, &str)]) -> Submission {
    let mut map = BTreeMap::new();
    for (name, source) in files {
        map.insert(name.to_string(), source.to_string());
    }
    Submission {
        files: map,
        entry_hint: None,
    }
}

fn io_check(name: &str, input: &[&str], expected: &str) -> CheckEnvelope {
    let payload = serde_json::json!({
        "name": name,
        "input": input,
        "expectedOutput": expected,
    });
    CheckEnvelope {
        check_type: CheckType::Io,
        payload: payload.to_string(),
    }
}

fn build(runtime: &Runtime, envelopes: &[CheckEnvelope]) -> CheckSet {
    checks::build_checks(runtime, envelopes).expect("failed to build checks")
}

fn run(
    runtime: &Runtime,
    files: &[(&str, &str)],
    envelopes: &[CheckEnvelope],
    budget: Duration,
) -> judge::SubmissionCheckResult {
    let compiled =
        compiler::compile_and_load(runtime, &submission(files)).expect("compilation failed");
    let set = build(runtime, envelopes);
    CheckRunner::new(budget).check_submission(&compiled, &set)
}

#[test]
fn hello_world_passes() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Hello", HELLO)],
        &[io_check("hello", &[], "Hello, World!\n")],
        Duration::from_secs(10),
    );

    assert_eq!(result.len(), 1);
    let check_result = &result.file_results["demo.Hello"][0];
    assert_eq!(check_result.outcome, Outcome::Passed);
    assert_eq!(check_result.captured_output.as_deref(), Some("Hello, World!\n"));
}

#[test]
fn output_mismatch_fails_with_both_outputs() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Hello", HELLO)],
        &[io_check("goodbye", &[], "Goodbye!\n")],
        Duration::from_secs(10),
    );

    let check_result = &result.file_results["demo.Hello"][0];
    assert_eq!(check_result.outcome, Outcome::Failed);
    assert!(check_result.message.contains("Hello, World!"));
    assert!(check_result.message.contains("Goodbye!"));
}

#[test]
fn infinite_loop_errors_with_timeout() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Spin", SPIN)],
        &[io_check("spin", &[], "")],
        Duration::from_secs(2),
    );

    let check_result = &result.file_results["demo.Spin"][0];
    assert_eq!(check_result.outcome, Outcome::Errored);
    assert!(check_result.message.contains("timeout"));
}

#[test]
fn sandbox_violation_errors_and_execution_continues() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Peeker", FILE_PEEKER), ("demo.Hello", HELLO)],
        &[io_check("hello", &[], "Hello, World!\n")],
        Duration::from_secs(10),
    );

    // Both files have entry points; the peeker errors, the hello passes,
    // proving the denial left the process intact.
    assert_eq!(result.len(), 2);
    let peeker = &result.file_results["demo.Peeker"][0];
    assert_eq!(peeker.outcome, Outcome::Errored);
    assert!(peeker.message.contains("filesystem access"));
    assert!(peeker.message.contains("path_open"));

    let hello = &result.file_results["demo.Hello"][0];
    assert_eq!(hello.outcome, Outcome::Passed);
}

#[test]
fn scripted_input_feeds_the_submission() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Echo", ECHO)],
        &[io_check("echo", &["one", "two"], "one\ntwo\n")],
        Duration::from_secs(10),
    );
    assert_eq!(
        result.file_results["demo.Echo"][0].outcome,
        Outcome::Passed
    );
}

#[test]
fn compilation_failure_surfaces_diagnostics() {
    let runtime = runtime();
    let error = compiler::compile_and_load(
        &runtime,
        &submission(&[("demo.Broken", "(module (func")]),
    )
    .unwrap_err();
    match error.kind() {
        ErrorKind::Compilation(output) => {
            assert!(!output.successful);
            assert!(!output.diagnostics.is_empty());
        }
        other => panic!("unexpected error kind: {:?}", other),
    }
}

#[test]
fn import_check_runs_once_per_submission() {
    let runtime = runtime();
    let envelope = CheckEnvelope {
        check_type: CheckType::Import,
        payload: serde_json::json!({
            "name": "no filesystem imports",
            "forbidden": ["wasi_snapshot_preview1::path_"],
        })
        .to_string(),
    };
    let result = run(
        &runtime,
        &[("demo.Peeker", FILE_PEEKER), ("demo.Hello", HELLO)],
        &[envelope],
        Duration::from_secs(10),
    );

    // One result for the whole submission, not one per file.
    assert_eq!(result.len(), 1);
    let check_result = &result.file_results[SUBMISSION_WIDE][0];
    assert_eq!(check_result.outcome, Outcome::Failed);
    assert!(check_result.message.contains("path_open"));
    assert!(check_result.message.contains("demo.Peeker"));
}

#[test]
fn import_check_passes_clean_submissions() {
    let runtime = runtime();
    let envelope = CheckEnvelope {
        check_type: CheckType::Import,
        payload: serde_json::json!({
            "name": "imports",
            "forbidden": ["wasi_snapshot_preview1::"],
            "required": ["terminal::write"],
        })
        .to_string(),
    };
    let result = run(
        &runtime,
        &[("demo.Hello", HELLO)],
        &[envelope],
        Duration::from_secs(10),
    );
    assert_eq!(
        result.file_results[SUBMISSION_WIDE][0].outcome,
        Outcome::Passed
    );
}

#[test]
fn source_code_check_drives_the_target() {
    let runtime = runtime();
    let envelope = CheckEnvelope {
        check_type: CheckType::SourceCode,
        payload: serde_json::json!({ "source": ECHO_PROBE_CHECK }).to_string(),
    };

    let passing = run(
        &runtime,
        &[("demo.Echo", ECHO)],
        std::slice::from_ref(&envelope),
        Duration::from_secs(10),
    );
    assert_eq!(
        passing.file_results["demo.Echo"][0].outcome,
        Outcome::Passed
    );

    let failing = run(
        &runtime,
        &[("demo.Hello", HELLO)],
        &[envelope],
        Duration::from_secs(10),
    );
    let check_result = &failing.file_results["demo.Hello"][0];
    assert_eq!(check_result.outcome, Outcome::Failed);
    assert!(check_result.message.contains("did not echo"));
}

#[test]
fn submission_without_entry_point_is_skipped() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("demo.Library", "(module (func $helper))")],
        &[io_check("io", &[], "x")],
        Duration::from_secs(10),
    );

    assert_eq!(result.len(), 1);
    let check_result = &result.file_results[SUBMISSION_WIDE][0];
    assert_eq!(check_result.outcome, Outcome::Skipped);
    assert!(check_result.message.contains("no main entry point"));
}

#[test]
fn results_preserve_check_and_file_order() {
    let runtime = runtime();
    let result = run(
        &runtime,
        &[("b.Second", HELLO), ("a.First", HELLO)],
        &[
            io_check("first check", &[], "Hello, World!\n"),
            io_check("second check", &[], "nope"),
        ],
        Duration::from_secs(10),
    );

    let files: Vec<&String> = result.file_results.keys().collect();
    assert_eq!(files, vec!["a.First", "b.Second"]);
    for file in &["a.First", "b.Second"] {
        let names: Vec<&str> = result.file_results[*file]
            .iter()
            .map(|r| r.check_name.as_str())
            .collect();
        assert_eq!(names, vec!["first check", "second check"]);
        assert_eq!(result.file_results[*file][0].outcome, Outcome::Passed);
        assert_eq!(result.file_results[*file][1].outcome, Outcome::Failed);
    }
}

#[test]
fn entry_hint_narrows_the_driven_files() {
    let runtime = runtime();
    let mut sub = submission(&[("a.Main", HELLO), ("b.Main", HELLO)]);
    sub.entry_hint = Some("b.Main".to_owned());
    let compiled = compiler::compile_and_load(&runtime, &sub).unwrap();
    let set = build(&runtime, &[io_check("hello", &[], "Hello, World!\n")]);
    let result = CheckRunner::new(Duration::from_secs(10)).check_submission(&compiled, &set);

    assert_eq!(result.len(), 1);
    assert!(result.file_results.contains_key("b.Main"));
}

#[test]
fn malformed_check_payloads_are_rejected() {
    let runtime = runtime();
    let envelope = CheckEnvelope {
        check_type: CheckType::Io,
        payload: r#"{"name":"x","text":"a","input":[],"expectedOutput":"b"}"#.to_owned(),
    };
    let error = checks::build_checks(&runtime, &[envelope]).unwrap_err();
    match error.kind() {
        ErrorKind::MalformedCheck(..) => (),
        other => panic!("unexpected error kind: {:?}", other),
    }
}

#[test]
fn failing_check_batch_is_a_compilation_error() {
    let runtime = runtime();
    let envelope = CheckEnvelope {
        check_type: CheckType::SourceCode,
        payload: serde_json::json!({ "source": "(module (func" }).to_string(),
    };
    let error = checks::build_checks(&runtime, &[envelope]).unwrap_err();
    match error.kind() {
        ErrorKind::Compilation(output) => assert!(!output.successful),
        other => panic!("unexpected error kind: {:?}", other),
    }
}
