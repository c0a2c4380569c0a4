//! Program loading: the JSON assembly format and the linker that turns it
//! into a runnable [`Program`].

pub mod assembly;
pub mod linker;
pub mod syntax;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, RuntimeConfig};
use crate::error::{exit_code, VmError};
use crate::program::Program;
use crate::vm::NativeRegistry;

pub use assembly::Assembly;
pub use linker::{link, Linked};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed assembly: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{location}: unknown operation `{name}`")]
    UnknownOperation { location: String, name: String },

    #[error("{location}: broken reference: {message}")]
    BrokenReference { location: String, message: String },

    #[error("{location}: {message}")]
    Invalid { location: String, message: String },

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoadError {
    pub fn invalid(location: impl fmt::Display, message: impl Into<String>) -> Self {
        LoadError::Invalid {
            location: location.to_string(),
            message: message.into(),
        }
    }

    pub fn broken(location: impl fmt::Display, message: impl Into<String>) -> Self {
        LoadError::BrokenReference {
            location: location.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Io { .. } => "IO_ERROR",
            LoadError::UnknownOperation { .. } => "INVALID_OPCODE",
            LoadError::BrokenReference { .. } => "BROKEN_REFERENCE",
            LoadError::Vm(error) => error.kind(),
            LoadError::Json(_) | LoadError::Invalid { .. } | LoadError::Config(_) => "LOAD_ERROR",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            LoadError::Io { .. } | LoadError::Config(_) => exit_code::IO_ERROR,
            LoadError::UnknownOperation { .. } => exit_code::INVALID_OPCODE,
            LoadError::BrokenReference { .. } => exit_code::BROKEN_REFERENCE,
            LoadError::Vm(error) => error.exit_code(),
            LoadError::Json(_) | LoadError::Invalid { .. } => exit_code::LOAD_ERROR,
        }
    }
}

/// Parse the JSON text of an assembly.
pub fn parse(source: &str) -> Result<Assembly, LoadError> {
    Ok(serde_json::from_str(source)?)
}

/// Parse, link and lay out a program ready to run.
pub fn load(
    source: &str,
    natives: NativeRegistry,
    config: RuntimeConfig,
) -> Result<Program, LoadError> {
    let assembly = parse(source)?;
    load_assembly(&assembly, natives, config)
}

pub fn load_assembly(
    assembly: &Assembly,
    natives: NativeRegistry,
    config: RuntimeConfig,
) -> Result<Program, LoadError> {
    config.validate()?;
    let Linked { model, data } = link(assembly, &natives, config.stack_size)?;
    info!(
        packages = model.packages.len(),
        functions = model.functions.len(),
        data_bytes = data.len(),
        "program linked"
    );
    Ok(Program::new(model, data, natives, config)?)
}

pub fn load_file(
    path: &Path,
    natives: NativeRegistry,
    config: RuntimeConfig,
) -> Result<Program, LoadError> {
    let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load(&source, natives, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = r#"{
        "packages": [{
            "name": "main",
            "globals": [{ "name": "out", "type": "i32" }],
            "functions": [{
                "name": "main",
                "body": [{ "op": "i32.add", "inputs": ["i32:40", "2"], "outputs": ["out"] }]
            }]
        }]
    }"#;

    #[test]
    fn test_load_and_run() {
        let mut program = load(HELLO, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        program.run().unwrap();
        assert_eq!(program.read_global_i32("main", "out").unwrap(), 42);
    }

    const ADD: &str = r#"{
        "packages": [{
            "name": "main",
            "globals": [{ "name": "out", "type": "i32" }],
            "functions": [
                {
                    "name": "add",
                    "inputs": [{ "name": "a", "type": "i32" }, { "name": "b", "type": "i32" }],
                    "outputs": [{ "name": "r", "type": "i32" }],
                    "body": [{ "op": "i32.add", "inputs": ["a", "b"], "outputs": ["r"] }]
                },
                {
                    "name": "main",
                    "locals": [{ "name": "r", "type": "i32" }],
                    "body": [
                        { "call": "add", "inputs": ["2", "3"], "outputs": ["r"] },
                        { "op": "identity", "inputs": ["r"], "outputs": ["out"] }
                    ]
                }
            ]
        }]
    }"#;

    #[test]
    fn test_add_leaves_result_and_restores_stack() {
        let mut program = load(ADD, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap();
        let base = program.stack_pointer();
        program.run().unwrap();
        assert!(program.is_terminated());
        assert_eq!(program.stack_pointer(), base);
        assert_eq!(program.read_global_i32("main", "out").unwrap(), 5);
    }

    #[test]
    fn test_load_file_reports_missing_path() {
        let err = load_file(
            Path::new("/nonexistent/program.json"),
            NativeRegistry::with_builtins(),
            RuntimeConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
        assert_eq!(err.exit_code(), exit_code::IO_ERROR);
    }

    #[test]
    fn test_malformed_json_is_a_load_error() {
        let err = load("{", NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), exit_code::LOAD_ERROR);
    }

    #[test]
    fn test_unknown_operation_exit_code() {
        let source = HELLO.replace("i32.add", "i32.frobnicate");
        let err = load(&source, NativeRegistry::with_builtins(), RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownOperation { ref name, .. } if name == "i32.frobnicate"));
        assert_eq!(err.exit_code(), exit_code::INVALID_OPCODE);
    }
}
