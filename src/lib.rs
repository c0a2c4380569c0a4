//! cxvm - a virtual machine for linked CX-style programs
//!
//! A program is loaded from its JSON assembly, linked into a [`Program`]
//! (the program graph plus a single byte buffer holding the stack, the data
//! segment and a garbage-collected heap), and executed one instruction at a
//! time. A program can be snapshotted into a binary blob at any instruction
//! boundary and resumed later with [`serialize`] / [`deserialize`].

pub mod config;
pub mod error;
pub mod loader;
pub mod program;
pub mod serialize;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{RuntimeError, VmError};
pub use loader::{load, load_file, LoadError};
pub use program::Program;
pub use serialize::{deserialize, is_blob, serialize, SerializeError};
pub use vm::{GcStats, NativeRegistry};
