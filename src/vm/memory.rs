//! The shared byte buffer backing the stack, data segment and heap.
//!
//! Layout, low to high:
//!
//! ```text
//! [ reserved | call frames ... ]  stack region, `stack_size` bytes
//! [ globals + literals ]          data segment
//! [ header | payload ] ...        heap objects, bump-allocated
//! ```
//!
//! Every byte access in the VM goes through the bounds-checked accessors
//! here; an out-of-range access is a [`VmError::InvalidAddress`].

use std::fmt;
use std::ops::Range;

use crate::error::VmError;

/// Bytes reserved at address 0 so that no storage ever lives at nil.
pub const NULL_GAP: u32 = 4;
/// Heap object header: mark byte, forwarding address, payload size.
pub const OBJECT_HEADER_SIZE: u32 = 9;
pub const MARK_OFFSET: u32 = 0;
pub const FORWARD_OFFSET: u32 = 1;
pub const SIZE_OFFSET: u32 = 5;
/// Dynamic-array payload header: capacity then length, both u32.
pub const SLICE_HEADER_SIZE: u32 = 8;
pub const SLICE_CAPACITY_OFFSET: u32 = OBJECT_HEADER_SIZE;
pub const SLICE_LENGTH_OFFSET: u32 = OBJECT_HEADER_SIZE + 4;
/// String payload header: byte length.
pub const STR_HEADER_SIZE: u32 = 4;
pub const POINTER_SIZE: u32 = 4;

/// An absolute offset into [`Memory`]. Address 0 is nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u32);

impl Address {
    pub const NIL: Address = Address(0);

    pub fn new(offset: u32) -> Self {
        Address(offset)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// `self + bytes`, failing on overflow of the 32-bit address space.
    pub fn add(self, bytes: u32) -> Result<Address, VmError> {
        self.0
            .checked_add(bytes)
            .map(Address)
            .ok_or(VmError::InvalidAddress {
                address: self.0 as u64 + bytes as u64,
                len: 0,
            })
    }

    pub fn offset(self, delta: i64) -> Result<Address, VmError> {
        let target = self.0 as i64 + delta;
        u32::try_from(target)
            .map(Address)
            .map_err(|_| VmError::InvalidAddress {
                address: target.max(0) as u64,
                len: 0,
            })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

macro_rules! scalar_access {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&self, addr: Address) -> Result<$ty, VmError> {
            let bytes = self.read_bytes(addr, std::mem::size_of::<$ty>() as u32)?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_le_bytes(raw))
        }

        pub fn $write(&mut self, addr: Address, value: $ty) -> Result<(), VmError> {
            self.write_bytes(addr, &value.to_le_bytes())
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Grow or shrink the buffer. New bytes are zero.
    pub fn resize(&mut self, size: usize) {
        self.bytes.resize(size, 0);
    }

    fn range(&self, addr: Address, len: u32) -> Result<Range<usize>, VmError> {
        let start = addr.get() as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(VmError::InvalidAddress {
                address: addr.get() as u64,
                len: len as u64,
            });
        }
        Ok(start..end)
    }

    pub fn read_bytes(&self, addr: Address, len: u32) -> Result<&[u8], VmError> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: Address, data: &[u8]) -> Result<(), VmError> {
        let range = self.range(addr, data.len() as u32)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn zero(&mut self, addr: Address, len: u32) -> Result<(), VmError> {
        let range = self.range(addr, len)?;
        self.bytes[range].fill(0);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: Address, dst: Address, len: u32) -> Result<(), VmError> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    pub fn read_u8(&self, addr: Address) -> Result<u8, VmError> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    pub fn write_u8(&mut self, addr: Address, value: u8) -> Result<(), VmError> {
        self.write_bytes(addr, &[value])
    }

    pub fn read_bool(&self, addr: Address) -> Result<bool, VmError> {
        Ok(self.read_u8(addr)? != 0)
    }

    pub fn write_bool(&mut self, addr: Address, value: bool) -> Result<(), VmError> {
        self.write_u8(addr, value as u8)
    }

    /// Read a stored reference.
    pub fn read_address(&self, addr: Address) -> Result<Address, VmError> {
        self.read_u32(addr).map(Address::new)
    }

    pub fn write_address(&mut self, addr: Address, value: Address) -> Result<(), VmError> {
        self.write_u32(addr, value.get())
    }

    scalar_access!(read_u32, write_u32, u32);
    scalar_access!(read_i32, write_i32, i32);
    scalar_access!(read_i64, write_i64, i64);
    scalar_access!(read_f32, write_f32, f32);
    scalar_access!(read_f64, write_f64, f64);
}
