//! In-process integration tests.
//!
//! These tests call the loader, VM and serializer APIs directly instead of
//! spawning a separate process, so they are included in coverage measurement.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cxvm::error::exit_code;
use cxvm::{LoadError, NativeRegistry, Program, RuntimeConfig};

fn snapshot_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join(name)
}

/// Collects what the `print.*` natives write.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn load_with(name: &str, config: RuntimeConfig) -> Result<(Program, Captured), LoadError> {
    let mut program = cxvm::load_file(&snapshot_path(name), NativeRegistry::with_builtins(), config)?;
    let captured = Captured::default();
    program.set_output(Box::new(captured.clone()));
    Ok((program, captured))
}

fn run_test_file(name: &str) -> String {
    let (mut program, captured) = load_with(name, RuntimeConfig::default()).unwrap();
    program.run().unwrap();
    captured.text()
}

fn run_test_file_expect_error(name: &str, config: RuntimeConfig) -> u8 {
    let (mut program, _) = load_with(name, config).unwrap();
    program.run().expect_err("expected error").exit_code()
}

fn tiny_heap() -> RuntimeConfig {
    RuntimeConfig {
        initial_heap_size: 64,
        max_heap_size: 1024,
        ..RuntimeConfig::default()
    }
}

// Basic tests
#[test]
fn test_basic_add() {
    assert_eq!(run_test_file("basic/add.json"), "5\n");
}

#[test]
fn test_basic_loop() {
    assert_eq!(run_test_file("basic/loop.json"), "55\n");
}

#[test]
fn test_basic_fib() {
    assert_eq!(run_test_file("basic/fib.json"), "610\n");
}

#[test]
fn test_basic_strings() {
    assert_eq!(
        run_test_file("basic/strings.json"),
        "hello, world\nanswer: 42\ntrue\n"
    );
}

#[test]
fn test_basic_slices() {
    assert_eq!(run_test_file("basic/slices.json"), "5\n16\n13\n");
}

#[test]
fn test_basic_records() {
    assert_eq!(run_test_file("basic/records.json"), "22\n107\n");
}

#[test]
fn test_string_literals_keep_spaces() {
    let source = r#"{
        "packages": [{
            "name": "main",
            "globals": [{ "name": "g", "type": "str" }],
            "functions": [{
                "name": "main",
                "body": [{ "op": "str.concat", "inputs": ["str:a ", "str:b"], "outputs": ["g"] }]
            }]
        }]
    }"#;
    let mut program = cxvm::load(source, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
    program.run().unwrap();
    assert_eq!(program.read_global_str("main", "g").unwrap(), "a b");
}

#[test]
fn test_gc_keeps_live_string_under_tiny_heap() {
    let (mut program, captured) = load_with("basic/gc.json", tiny_heap()).unwrap();
    program.run().unwrap();
    assert_eq!(captured.text(), "999\n");
    assert!(program.gc_stats().cycles > 0);
    assert!(program.machine().heap_size <= 1024);
    assert_eq!(program.read_global_str("main", "last").unwrap(), "999");
}

#[test]
fn test_stack_pointer_returns_to_base_after_run() {
    let (mut program, _) = load_with("basic/fib.json", RuntimeConfig::default()).unwrap();
    let base = program.stack_pointer();
    program.run().unwrap();
    assert!(program.is_terminated());
    assert!(program.machine().calls.is_empty());
    assert_eq!(program.stack_pointer(), base);
}

#[test]
fn test_reset_allows_a_second_run() {
    let (mut program, captured) = load_with("basic/loop.json", RuntimeConfig::default()).unwrap();
    program.run().unwrap();
    program.reset().unwrap();
    program.run().unwrap();
    assert_eq!(captured.text(), "55\n55\n");
}

#[test]
fn test_invoke_function_directly() {
    let (mut program, _) = load_with("basic/add.json", RuntimeConfig::default()).unwrap();
    let outputs = program
        .invoke("math.add", &[20i32.to_le_bytes().to_vec(), 22i32.to_le_bytes().to_vec()])
        .unwrap();
    assert_eq!(outputs, vec![42i32.to_le_bytes().to_vec()]);
}

// Error tests
#[test]
fn test_errors_index_out_of_range() {
    let code = run_test_file_expect_error("errors/index_out_of_range.json", RuntimeConfig::default());
    assert_eq!(code, exit_code::INDEX_OUT_OF_RANGE);
}

#[test]
fn test_errors_heap_exhausted() {
    let config = RuntimeConfig {
        initial_heap_size: 128,
        max_heap_size: 1024,
        ..RuntimeConfig::default()
    };
    let code = run_test_file_expect_error("errors/heap_exhausted.json", config);
    assert_eq!(code, exit_code::HEAP_EXHAUSTED);
}

#[test]
fn test_errors_recursion_reports_call_stack() {
    let (mut program, _) = load_with("errors/recursion.json", RuntimeConfig {
        call_stack_size: 50,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let err = program.run().unwrap_err();
    assert_eq!(err.exit_code(), exit_code::STACK_OVERFLOW);
    assert!(!err.call_stack.is_empty());
    assert!(err.to_string().contains("main.forever"));
}

#[test]
fn test_errors_nil_pointer() {
    let code = run_test_file_expect_error("errors/nil_pointer.json", RuntimeConfig::default());
    assert_eq!(code, exit_code::INVALID_ARGUMENT);
}

#[test]
fn test_errors_division_by_zero() {
    let code = run_test_file_expect_error("errors/division_by_zero.json", RuntimeConfig::default());
    assert_eq!(code, exit_code::INVALID_ARGUMENT);
}

#[test]
fn test_errors_at_load_time() {
    let cases = [
        ("errors/unknown_op.json", exit_code::INVALID_OPCODE),
        ("errors/missing_function.json", exit_code::BROKEN_REFERENCE),
        ("errors/malformed.json", exit_code::LOAD_ERROR),
    ];
    for (name, expected) in cases {
        let err = load_with(name, RuntimeConfig::default()).err().unwrap();
        assert_eq!(err.exit_code(), expected, "{}: {}", name, err);
    }
}

// Serialization
#[test]
fn test_snapshot_mid_run_and_resume_matches_uninterrupted_run() {
    for name in ["basic/fib.json", "basic/slices.json", "basic/records.json", "basic/gc.json"] {
        let uninterrupted = run_test_file(name);

        let (mut program, first) = load_with(name, RuntimeConfig::default()).unwrap();
        let terminated = program.run_steps(25).unwrap();
        let blob = cxvm::serialize(&mut program).unwrap();

        let mut resumed =
            cxvm::deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default())
                .unwrap();
        let second = Captured::default();
        resumed.set_output(Box::new(second.clone()));
        resumed.run().unwrap();

        assert!(resumed.is_terminated(), "{}", name);
        let combined = first.text() + &second.text();
        assert_eq!(combined, uninterrupted, "{} (terminated early: {})", name, terminated);
    }
}

#[test]
fn test_snapshot_of_fresh_program_runs_from_entry() {
    let (mut program, _) = load_with("basic/strings.json", RuntimeConfig::default()).unwrap();
    let blob = cxvm::serialize(&mut program).unwrap();
    let mut restored =
        cxvm::deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
    let captured = Captured::default();
    restored.set_output(Box::new(captured.clone()));
    restored.run().unwrap();
    assert_eq!(captured.text(), "hello, world\nanswer: 42\ntrue\n");
    assert_eq!(restored.read_global_str("main", "greeting").unwrap(), "hello, world");
}
