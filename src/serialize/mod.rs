//! Program snapshots: the whole program graph plus the live memory image,
//! flattened into a binary blob that can be reloaded and resumed.
//!
//! Blob layout:
//!
//! ```text
//! [ header: magic "CXVM", version, table offsets ]
//! [ program ][ calls ][ packages ][ record types ][ functions ]
//! [ expressions ][ arguments ][ integer pool ][ name pool ][ memory ]
//! ```
//!
//! Records are fixed width (see [`records`]), so every table is a plain
//! array. The memory section is `[0, heap top)`: the stack, the data segment
//! and the live heap after a collection.

pub mod decoder;
pub mod encoder;
pub mod records;

use thiserror::Error;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{exit_code, VmError};
use crate::program::Program;
use crate::vm::NativeRegistry;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("record codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("truncated {table}: expected {expected} bytes, found {actual}")]
    Truncated {
        table: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid magic number")]
    BadMagic,

    #[error("unsupported format version {0} (expected {})", records::VERSION)]
    BadVersion(u32),

    #[error("corrupt program: {0}")]
    Corrupt(String),

    #[error("broken reference: {0}")]
    BrokenReference(String),

    #[error("{0} exceeds the 32-bit format limits")]
    Overflow(&'static str),

    #[error("cannot serialize while a native is running a nested call")]
    NestedRun,

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl SerializeError {
    pub fn kind(&self) -> &'static str {
        match self {
            SerializeError::BrokenReference(_) => "BROKEN_REFERENCE",
            SerializeError::Vm(error) => error.kind(),
            _ => "SERIALIZATION_ERROR",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            SerializeError::BrokenReference(_) => exit_code::BROKEN_REFERENCE,
            SerializeError::Vm(error) => error.exit_code(),
            _ => exit_code::SERIALIZATION_ERROR,
        }
    }
}

/// Whether `bytes` start like a serialized program.
pub fn is_blob(bytes: &[u8]) -> bool {
    bytes.starts_with(&records::MAGIC)
}

/// Snapshot a program. Garbage is collected first so only live objects are
/// written; the program itself can keep running afterwards.
pub fn serialize(program: &mut Program) -> Result<Vec<u8>, SerializeError> {
    if !program.machine().boundaries.is_empty() {
        return Err(SerializeError::NestedRun);
    }
    program.collect_garbage()?;
    let blob = encoder::encode(program.model(), program.machine())?;
    info!(
        bytes = blob.len(),
        calls = program.machine().calls.len(),
        "program serialized"
    );
    Ok(blob)
}

/// Rebuild a program from a blob produced by [`serialize`]. Either the whole
/// program is restored or an error is returned.
pub fn deserialize(
    bytes: &[u8],
    natives: NativeRegistry,
    config: RuntimeConfig,
) -> Result<Program, SerializeError> {
    let program = decoder::decode(bytes, natives, config)?;
    info!(
        packages = program.model().packages.len(),
        functions = program.model().functions.len(),
        terminated = program.is_terminated(),
        "program deserialized"
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;
    use crate::vm::Address;

    // Grows a dynamic array to ten elements in a loop, so a snapshot taken
    // mid-run has a live call frame and heap objects.
    const COUNTER: &str = r#"{
        "packages": [{
            "name": "main",
            "records": [{ "name": "Pair", "fields": [
                { "name": "a", "type": "i32" },
                { "name": "b", "type": "*Pair" }
            ] }],
            "globals": [
                { "name": "total", "type": "i32" },
                { "name": "xs", "type": "[]i32" },
                { "name": "label", "type": "str" }
            ],
            "functions": [{
                "name": "main",
                "locals": [
                    { "name": "i", "type": "i32" },
                    { "name": "c", "type": "bool" },
                    { "name": "p", "type": "*Pair" }
                ],
                "body": [
                    { "op": "make", "inputs": ["0"], "outputs": ["xs"] },
                    { "op": "new", "outputs": ["p"] },
                    { "label": "top", "op": "append", "inputs": ["xs", "i"], "outputs": ["xs"] },
                    { "op": "i32.add", "inputs": ["i", "1"], "outputs": ["i"] },
                    { "op": "i32.lt", "inputs": ["i", "10"], "outputs": ["c"] },
                    { "jump": "c", "then": "top" },
                    { "op": "len", "inputs": ["xs"], "outputs": ["total"] },
                    { "op": "i32.add", "inputs": ["total", "xs[9]"], "outputs": ["total"] },
                    { "op": "i32.str", "inputs": ["total"], "outputs": ["label"] }
                ]
            }]
        }]
    }"#;

    fn load() -> Program {
        let mut program = loader::load(
            COUNTER,
            NativeRegistry::with_builtins(),
            RuntimeConfig::default(),
        )
        .unwrap();
        program.set_output(Box::new(std::io::sink()));
        program
    }

    fn live_memory(program: &Program) -> Vec<u8> {
        let machine = program.machine();
        machine
            .memory
            .read_bytes(Address::NIL, machine.heap_starts_at + machine.heap_pointer)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_roundtrip_preserves_model_and_memory() {
        let mut program = load();
        program.run().unwrap();
        let blob = serialize(&mut program).unwrap();
        assert!(is_blob(&blob));

        let restored =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        assert_eq!(restored.model(), program.model());
        assert_eq!(live_memory(&restored), live_memory(&program));
        assert!(restored.is_terminated());
        assert_eq!(restored.read_global_i32("main", "total").unwrap(), 19);
        assert_eq!(restored.read_global_str("main", "label").unwrap(), "19");
    }

    #[test]
    fn test_resume_after_mid_run_snapshot() {
        let mut reference = load();
        reference.run().unwrap();

        let mut program = load();
        assert!(!program.run_steps(12).unwrap());
        let blob = serialize(&mut program).unwrap();

        let mut resumed =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        assert_eq!(resumed.machine().calls.len(), 1);
        resumed.set_output(Box::new(std::io::sink()));
        resumed.run().unwrap();
        assert_eq!(resumed.read_global_i32("main", "total").unwrap(), 19);
        assert_eq!(
            resumed.read_global_str("main", "label").unwrap(),
            reference.read_global_str("main", "label").unwrap()
        );
    }

    #[test]
    fn test_snapshot_before_start_runs_from_entry() {
        let mut program = load();
        let blob = serialize(&mut program).unwrap();
        let mut restored =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        restored.set_output(Box::new(std::io::sink()));
        restored.run().unwrap();
        assert_eq!(restored.read_global_i32("main", "total").unwrap(), 19);
    }

    #[test]
    fn test_bad_magic() {
        let mut program = load();
        let mut blob = serialize(&mut program).unwrap();
        blob[0] = b'X';
        let err =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, SerializeError::BadMagic));
        assert_eq!(err.to_string(), "invalid magic number");
        assert_eq!(err.exit_code(), exit_code::SERIALIZATION_ERROR);
    }

    #[test]
    fn test_bad_version() {
        let mut program = load();
        let mut blob = serialize(&mut program).unwrap();
        blob[4] = 99;
        let err =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, SerializeError::BadVersion(99)));
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let mut program = load();
        let blob = serialize(&mut program).unwrap();
        for len in [0, 10, blob.len() / 2, blob.len() - 1] {
            let err = deserialize(
                &blob[..len],
                NativeRegistry::with_builtins(),
                RuntimeConfig::default(),
            )
            .unwrap_err();
            assert!(
                matches!(err, SerializeError::Truncated { .. }),
                "length {}: {}",
                len,
                err
            );
        }
    }

    const CALLER: &str = r#"{
        "packages": [{
            "name": "main",
            "globals": [{ "name": "out", "type": "i32" }],
            "functions": [
                {
                    "name": "helper",
                    "outputs": [{ "name": "r", "type": "i32" }],
                    "body": [{ "op": "identity", "inputs": ["7"], "outputs": ["r"] }]
                },
                {
                    "name": "main",
                    "body": [{ "call": "helper", "outputs": ["out"] }]
                }
            ]
        }]
    }"#;

    #[test]
    fn test_unresolvable_call_target_is_a_broken_reference() {
        let mut program =
            loader::load(CALLER, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        let mut blob = serialize(&mut program).unwrap();

        // `main.helper` becomes `main.help.r`, which names no package.
        let at = blob
            .windows(b"helper".len())
            .position(|w| w == b"helper")
            .unwrap();
        blob[at + 4] = b'.';

        let err =
            deserialize(&blob, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, SerializeError::BrokenReference(_)), "{}", err);
        assert_eq!(err.exit_code(), exit_code::BROKEN_REFERENCE);
    }

    #[test]
    fn test_serialize_refuses_during_nested_run() {
        let mut program = load();
        program.machine_mut().boundaries.push(0);
        let err = serialize(&mut program).unwrap_err();
        assert!(matches!(err, SerializeError::NestedRun));
        assert_eq!(err.exit_code(), exit_code::SERIALIZATION_ERROR);

        program.machine_mut().boundaries.clear();
        assert!(serialize(&mut program).is_ok());
    }

    #[test]
    fn test_unknown_native_is_rejected() {
        let mut program = load();
        let blob = serialize(&mut program).unwrap();
        let err = deserialize(&blob, NativeRegistry::new(), RuntimeConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), exit_code::INVALID_OPCODE);
    }
}
