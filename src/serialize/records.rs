//! Fixed-width record layouts of the serialized format.
//!
//! Every record is made of plain integers only, so its encoded size is a
//! constant and a table is just `count * size` bytes. Cross-references are
//! indices into other tables; variable-length data lives in the integer and
//! name pools and is referenced by [`Span`]s.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::SerializeError;

/// Magic bytes at the start of every blob.
pub const MAGIC: [u8; 4] = *b"CXVM";

/// Current format version.
pub const VERSION: u32 = 1;

/// Index value standing for "no reference".
pub const NONE: u32 = u32::MAX;

/// The record codec: fixed-width little-endian integers.
pub fn codec() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Encoded size of one record of type `R`.
pub fn record_size<R: Serialize + Default>() -> Result<usize, SerializeError> {
    Ok(codec().serialized_size(&R::default())? as usize)
}

pub fn encode_into<R: Serialize>(out: &mut Vec<u8>, record: &R) -> Result<(), SerializeError> {
    codec().serialize_into(out, record)?;
    Ok(())
}

/// Decode a table of `R` records from its exact byte range.
pub fn decode_table<R: DeserializeOwned + Serialize + Default>(
    table: &'static str,
    bytes: &[u8],
) -> Result<Vec<R>, SerializeError> {
    let size = record_size::<R>()?;
    if bytes.len() % size != 0 {
        return Err(SerializeError::Truncated {
            table,
            expected: bytes.len().div_ceil(size) * size,
            actual: bytes.len(),
        });
    }
    bytes
        .chunks_exact(size)
        .map(|chunk| Ok(codec().deserialize(chunk)?))
        .collect()
}

/// Tables in the order they follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Program = 0,
    Calls = 1,
    Packages = 2,
    RecordTypes = 3,
    Functions = 4,
    Expressions = 5,
    Arguments = 6,
    Integers = 7,
    Names = 8,
    Memory = 9,
}

pub const TABLE_COUNT: usize = 10;

impl Table {
    pub const ALL: [Table; TABLE_COUNT] = [
        Table::Program,
        Table::Calls,
        Table::Packages,
        Table::RecordTypes,
        Table::Functions,
        Table::Expressions,
        Table::Arguments,
        Table::Integers,
        Table::Names,
        Table::Memory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Program => "program",
            Table::Calls => "calls",
            Table::Packages => "packages",
            Table::RecordTypes => "record types",
            Table::Functions => "functions",
            Table::Expressions => "expressions",
            Table::Arguments => "arguments",
            Table::Integers => "integer pool",
            Table::Names => "name pool",
            Table::Memory => "memory",
        }
    }
}

/// Index header: where each table starts, as an absolute byte offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u32,
    pub offsets: [u64; TABLE_COUNT],
}

/// `(start, count)` into a table or pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub count: u32,
}

impl Span {
    pub fn range(self) -> std::ops::Range<usize> {
        self.start as usize..self.start as usize + self.count as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub stack_size: u32,
    pub data_size: u32,
    pub stack_pointer: u32,
    pub heap_starts_at: u32,
    pub heap_pointer: u32,
    pub heap_size: u32,
    pub terminated: u8,
    /// Function table index of the entry point, or [`NONE`].
    pub entry: u32,
    pub gc_cycles: u64,
    pub gc_bytes_reclaimed: u64,
    pub gc_total_pause_nanos: u64,
    pub gc_max_pause_nanos: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub function: u32,
    pub line: u32,
    pub frame_pointer: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: Span,
    /// Package indices, in the integer pool.
    pub imports: Span,
    pub globals: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordTypeRecord {
    pub name: Span,
    pub package: u32,
    pub fields: Span,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: Span,
    pub package: u32,
    pub size: u32,
    pub inputs: Span,
    pub outputs: Span,
    pub list_of_pointers: Span,
    pub expressions: Span,
}

pub const OPERATOR_NONE: u8 = 0;
pub const OPERATOR_NATIVE: u8 = 1;
pub const OPERATOR_CALL: u8 = 2;
pub const OPERATOR_JUMP: u8 = 3;
pub const OPERATOR_GOTO: u8 = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRecord {
    pub operator_kind: u8,
    /// Opcode of a native, function index of a call.
    pub operator: u32,
    pub inputs: Span,
    pub outputs: Span,
    pub then_lines: i32,
    pub else_lines: i32,
    pub scope: u8,
    pub has_label: u8,
    pub label: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgumentRecord {
    pub name: Span,
    pub type_code: u8,
    /// Record type index, or [`NONE`].
    pub record_type: u32,
    pub specifiers: Span,
    pub lengths: Span,
    pub offset: u32,
    pub size: u32,
    pub total_size: u32,
    pub pass_by: u8,
    pub is_inner_reference: u8,
    pub dereference_operations: Span,
    pub indexes: Span,
    pub fields: Span,
}
