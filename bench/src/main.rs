use cxvm::{NativeRegistry, Program, RuntimeConfig};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    vm_secs: f64,
    rust_time_secs: f64,
    gc_cycles: u64,
}

#[derive(Serialize)]
struct SnapshotResult {
    name: String,
    blob_bytes: usize,
    serialize_secs: f64,
    deserialize_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
    snapshots: Vec<SnapshotResult>,
}

const SUM_LOOP: &str = r#"{
    "packages": [{
        "name": "main",
        "globals": [{ "name": "sum", "type": "i64" }],
        "functions": [{
            "name": "main",
            "locals": [
                { "name": "i", "type": "i64" },
                { "name": "c", "type": "bool" }
            ],
            "body": [
                { "label": "top", "op": "i64.add", "inputs": ["i", "i64:1"], "outputs": ["i"] },
                { "op": "i64.add", "inputs": ["sum", "i"], "outputs": ["sum"] },
                { "op": "i64.lt", "inputs": ["i", "i64:1000000"], "outputs": ["c"] },
                { "jump": "c", "then": "top" }
            ]
        }]
    }]
}"#;

const FIBONACCI: &str = r#"{
    "packages": [{
        "name": "main",
        "globals": [{ "name": "out", "type": "i32" }],
        "functions": [
            {
                "name": "fib",
                "inputs": [{ "name": "n", "type": "i32" }],
                "outputs": [{ "name": "r", "type": "i32" }],
                "locals": [
                    { "name": "small", "type": "bool" },
                    { "name": "m", "type": "i32" },
                    { "name": "a", "type": "i32" },
                    { "name": "b", "type": "i32" }
                ],
                "body": [
                    { "op": "i32.lt", "inputs": ["n", "2"], "outputs": ["small"] },
                    { "jump": "small", "then": "base" },
                    { "op": "i32.sub", "inputs": ["n", "1"], "outputs": ["m"] },
                    { "call": "fib", "inputs": ["m"], "outputs": ["a"] },
                    { "op": "i32.sub", "inputs": ["n", "2"], "outputs": ["m"] },
                    { "call": "fib", "inputs": ["m"], "outputs": ["b"] },
                    { "op": "i32.add", "inputs": ["a", "b"], "outputs": ["r"] },
                    { "goto": "return" },
                    { "label": "base", "op": "identity", "inputs": ["n"], "outputs": ["r"] }
                ]
            },
            {
                "name": "main",
                "body": [{ "call": "fib", "inputs": ["25"], "outputs": ["out"] }]
            }
        ]
    }]
}"#;

/// Allocation churn: only the latest string and the growing array stay live.
const STRING_CHURN: &str = r#"{
    "packages": [{
        "name": "main",
        "globals": [
            { "name": "last", "type": "str" },
            { "name": "lengths", "type": "[]i32" }
        ],
        "functions": [{
            "name": "main",
            "locals": [
                { "name": "i", "type": "i32" },
                { "name": "n", "type": "i32" },
                { "name": "c", "type": "bool" }
            ],
            "body": [
                { "label": "top", "op": "i32.str", "inputs": ["i"], "outputs": ["last"] },
                { "op": "str.concat", "inputs": ["last", "str:!"], "outputs": ["last"] },
                { "op": "i32.mod", "inputs": ["i", "100"], "outputs": ["n"] },
                { "op": "append", "inputs": ["lengths", "n"], "outputs": ["lengths"] },
                { "op": "i32.add", "inputs": ["i", "1"], "outputs": ["i"] },
                { "op": "i32.lt", "inputs": ["i", "100000"], "outputs": ["c"] },
                { "jump": "c", "then": "top" }
            ]
        }]
    }]
}"#;

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: i64 = 0;
    for i in 1..=1_000_000 {
        sum += i;
    }
    eprintln!("{}", sum);
}

fn rust_fibonacci(n: i32) -> i32 {
    if n <= 1 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn rust_string_churn() {
    let mut last = String::new();
    let mut lengths = Vec::new();
    for i in 0..100_000 {
        last = format!("{}!", i);
        lengths.push(i % 100);
    }
    eprintln!("{} {}", last, lengths.len());
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn load(source: &str, config: RuntimeConfig) -> Option<Program> {
    match cxvm::load(source, NativeRegistry::with_builtins(), config) {
        Ok(program) => Some(program),
        Err(e) => {
            eprintln!("failed to load benchmark program: {}", e);
            None
        }
    }
}

fn run_vm_benchmark(name: &str, source: &str, config: RuntimeConfig) -> (f64, u64) {
    let Some(mut program) = load(source, config) else {
        return (f64::NAN, 0);
    };
    let start = Instant::now();
    let result = program.run();
    let elapsed = start.elapsed().as_secs_f64();
    if let Err(e) = result {
        eprintln!("benchmark {} failed: {}", name, e);
    }
    (elapsed, program.gc_stats().cycles)
}

/// Time a snapshot of the program halfway through `steps` instructions.
fn run_snapshot_benchmark(name: &str, source: &str, steps: u64) -> Option<SnapshotResult> {
    let mut program = load(source, RuntimeConfig::default())?;
    if let Err(e) = program.run_steps(steps) {
        eprintln!("benchmark {} failed: {}", name, e);
        return None;
    }

    let start = Instant::now();
    let blob = cxvm::serialize(&mut program).ok()?;
    let serialize_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let restored = cxvm::deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default());
    let deserialize_secs = start.elapsed().as_secs_f64();
    if let Err(e) = restored {
        eprintln!("benchmark {} snapshot failed to reload: {}", name, e);
        return None;
    }

    Some(SnapshotResult {
        name: name.to_string(),
        blob_bytes: blob.len(),
        serialize_secs,
        deserialize_secs,
    })
}

fn main() {
    let mut results = Vec::new();

    let rust_time = time_rust(rust_sum_loop);
    let (vm_secs, gc_cycles) = run_vm_benchmark("sum_loop", SUM_LOOP, RuntimeConfig::default());
    results.push(BenchmarkResult {
        name: "sum_loop".to_string(),
        vm_secs,
        rust_time_secs: rust_time,
        gc_cycles,
    });

    let rust_time = time_rust(|| eprintln!("{}", rust_fibonacci(25)));
    let (vm_secs, gc_cycles) = run_vm_benchmark("fibonacci", FIBONACCI, RuntimeConfig::default());
    results.push(BenchmarkResult {
        name: "fibonacci".to_string(),
        vm_secs,
        rust_time_secs: rust_time,
        gc_cycles,
    });

    // A small starting heap forces frequent collections.
    let rust_time = time_rust(rust_string_churn);
    let config = RuntimeConfig {
        initial_heap_size: 4 * 1024,
        ..Default::default()
    };
    let (vm_secs, gc_cycles) = run_vm_benchmark("string_churn", STRING_CHURN, config);
    results.push(BenchmarkResult {
        name: "string_churn".to_string(),
        vm_secs,
        rust_time_secs: rust_time,
        gc_cycles,
    });

    let snapshots = [
        ("fibonacci", FIBONACCI, 100_000),
        ("string_churn", STRING_CHURN, 300_000),
    ]
    .into_iter()
    .filter_map(|(name, source, steps)| run_snapshot_benchmark(name, source, steps))
    .collect();

    let output = BenchmarkOutput { results, snapshots };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
