//! Runtime state and the machinery that drives it.

pub mod address;
pub mod debug;
pub mod engine;
pub mod heap;
pub mod memory;
pub mod natives;
pub mod ops;

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;

use crate::program::model::FunctionId;
use memory::{Memory, NULL_GAP};

pub use address::resolve;
pub use memory::Address;
pub use ops::{NativeContext, NativeOp, NativeRegistry, Opcode, OperandType};

/// An activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub operator: FunctionId,
    /// Index of the next instruction to execute.
    pub line: usize,
    pub frame_pointer: u32,
}

/// Collector statistics, accumulated over the life of a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcStats {
    pub cycles: u64,
    pub bytes_reclaimed: u64,
    pub total_pause: Duration,
    pub max_pause: Duration,
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gc: {} cycles, {} bytes reclaimed, total pause {:?}, max pause {:?}",
            self.cycles, self.bytes_reclaimed, self.total_pause, self.max_pause
        )
    }
}

/// Mutable execution state: memory, registers and the call stack.
pub struct Machine {
    pub memory: Memory,
    pub stack_size: u32,
    pub data_size: u32,
    /// Next free stack byte.
    pub stack_pointer: u32,
    pub heap_starts_at: u32,
    /// Bytes in use from the heap base.
    pub heap_pointer: u32,
    /// Current heap capacity; the memory buffer ends at `heap_starts_at + heap_size`.
    pub heap_size: u32,
    pub calls: Vec<Call>,
    /// Call-stack depths at which nested runs started by natives return.
    pub boundaries: Vec<usize>,
    pub terminated: bool,
    pub gc_stats: GcStats,
    pub output: Box<dyn Write>,
}

impl Machine {
    pub fn new(stack_size: u32, data_size: u32, heap_size: u32) -> Self {
        let heap_starts_at = stack_size + data_size;
        Self {
            memory: Memory::new(heap_starts_at as usize + heap_size as usize),
            stack_size,
            data_size,
            stack_pointer: NULL_GAP,
            heap_starts_at,
            heap_pointer: 0,
            heap_size,
            calls: Vec::new(),
            boundaries: Vec::new(),
            terminated: false,
            gc_stats: GcStats::default(),
            output: Box::new(io::stdout()),
        }
    }

    pub fn heap_base(&self) -> Address {
        Address::new(self.heap_starts_at)
    }

    /// First address past the last allocated object.
    pub fn heap_top(&self) -> Address {
        Address::new(self.heap_starts_at + self.heap_pointer)
    }

    pub fn in_heap(&self, addr: Address) -> bool {
        addr >= self.heap_base() && addr < self.heap_top()
    }

    pub fn set_heap_size(&mut self, heap_size: u32) {
        self.heap_size = heap_size;
        self.memory
            .resize(self.heap_starts_at as usize + heap_size as usize);
    }

    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("memory_size", &self.memory.len())
            .field("stack_size", &self.stack_size)
            .field("data_size", &self.data_size)
            .field("stack_pointer", &self.stack_pointer)
            .field("heap_starts_at", &self.heap_starts_at)
            .field("heap_pointer", &self.heap_pointer)
            .field("heap_size", &self.heap_size)
            .field("calls", &self.calls)
            .field("terminated", &self.terminated)
            .finish()
    }
}
