//! Error taxonomy and the fatal-error report.
//!
//! Every error the runtime can raise is fatal: it unwinds straight to the
//! caller of [`crate::Program::run`] (or the loader/serializer entry points),
//! which prints a report and exits with a kind-specific code.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::vm::ops::Opcode;

/// Process exit codes, one per error kind.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const LOAD_ERROR: u8 = 1;
    pub const IO_ERROR: u8 = 2;
    pub const RUNTIME_ERROR: u8 = 5;
    pub const STACK_OVERFLOW: u8 = 6;
    pub const HEAP_EXHAUSTED: u8 = 7;
    pub const INVALID_ARGUMENT: u8 = 8;
    pub const INDEX_OUT_OF_RANGE: u8 = 9;
    pub const INVALID_OPCODE: u8 = 10;
    pub const BROKEN_REFERENCE: u8 = 11;
    pub const SERIALIZATION_ERROR: u8 = 12;
}

/// Errors raised while executing a program.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("stack overflow: frame needs {needed} bytes, stack region holds {limit}")]
    StackOverflow { needed: u64, limit: u32 },

    #[error("call stack overflow: depth limit {limit} reached")]
    CallStackOverflow { limit: usize },

    #[error("heap exhausted: cannot allocate {requested} bytes (heap limit {limit})")]
    HeapExhausted { requested: u64, limit: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index {index} out of range (length {length})")]
    IndexOutOfRange { index: i64, length: u32 },

    #[error("invalid opcode {0}")]
    InvalidOpcode(Opcode),

    #[error("broken reference: {0}")]
    BrokenReference(String),

    #[error("invalid memory access of {len} bytes at {address}")]
    InvalidAddress { address: u64, len: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VmError {
    /// Short name of the error kind, printed in fatal reports.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::StackOverflow { .. } | VmError::CallStackOverflow { .. } => "STACK_OVERFLOW",
            VmError::HeapExhausted { .. } => "HEAP_EXHAUSTED",
            VmError::InvalidArgument(_) => "INVALID_ARGUMENT",
            VmError::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            VmError::InvalidOpcode(_) => "INVALID_OPCODE",
            VmError::BrokenReference(_) => "BROKEN_REFERENCE",
            VmError::InvalidAddress { .. } | VmError::Io(_) => "RUNTIME_ERROR",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            VmError::StackOverflow { .. } | VmError::CallStackOverflow { .. } => {
                exit_code::STACK_OVERFLOW
            }
            VmError::HeapExhausted { .. } => exit_code::HEAP_EXHAUSTED,
            VmError::InvalidArgument(_) => exit_code::INVALID_ARGUMENT,
            VmError::IndexOutOfRange { .. } => exit_code::INDEX_OUT_OF_RANGE,
            VmError::InvalidOpcode(_) => exit_code::INVALID_OPCODE,
            VmError::BrokenReference(_) => exit_code::BROKEN_REFERENCE,
            VmError::InvalidAddress { .. } | VmError::Io(_) => exit_code::RUNTIME_ERROR,
        }
    }
}

/// Source position of an instruction: `package.function:line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub package: String,
    pub function: String,
    pub line: usize,
    /// Rendered instruction, when the line is inside the function body.
    pub instruction: Option<String>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.package, self.function, self.line)?;
        if let Some(instruction) = &self.instruction {
            write!(f, " `{}`", instruction)?;
        }
        Ok(())
    }
}

/// A fatal runtime error together with where it happened.
#[derive(Debug)]
pub struct RuntimeError {
    pub error: VmError,
    pub location: Option<Location>,
    /// Active frames, innermost first. Empty when call-stack dumps are off.
    pub call_stack: Vec<Location>,
}

impl RuntimeError {
    pub fn new(error: VmError) -> Self {
        Self {
            error,
            location: None,
            call_stack: Vec::new(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

impl From<VmError> for RuntimeError {
    fn from(error: VmError) -> Self {
        RuntimeError::new(error)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}: error: {}: {}", location, self.error.kind(), self.error)?,
            None => write!(f, "error: {}: {}", self.error.kind(), self.error)?,
        }
        if !self.call_stack.is_empty() {
            write!(f, "\ncall stack:")?;
            for (depth, frame) in self.call_stack.iter().enumerate() {
                write!(f, "\n  #{} {}", depth, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
