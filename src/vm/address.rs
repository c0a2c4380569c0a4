//! Address resolution: turning an operand descriptor plus a frame pointer
//! into an absolute offset in [`Memory`](super::memory::Memory).
//!
//! All operand address arithmetic lives here. Resolution only reads memory;
//! it never allocates.

use crate::error::VmError;
use crate::program::model::{Argument, DerefOp};

use super::memory::{Address, OBJECT_HEADER_SIZE, SLICE_HEADER_SIZE, SLICE_LENGTH_OFFSET};
use super::Machine;

/// Walk state shared by an operand's chain and its nested field chains.
struct Cursor {
    offset: u32,
    /// The last step followed a reference, so `offset` is an object start
    /// whose header has not been skipped yet.
    is_pointer: bool,
}

impl Cursor {
    /// Dynamic arrays are only reached through their reference slot, so a
    /// followed pointer never lands on an array payload: only the object
    /// header is skipped here.
    fn skip_header(&mut self, machine: &Machine) {
        if self.is_pointer && self.offset >= machine.heap_starts_at {
            self.offset += OBJECT_HEADER_SIZE;
        }
        self.is_pointer = false;
    }

    fn address(&self) -> Address {
        Address::new(self.offset)
    }
}

/// Absolute address of the bytes `arg` designates in the frame at `fp`.
pub fn resolve(machine: &Machine, fp: u32, arg: &Argument) -> Result<Address, VmError> {
    let mut cursor = Cursor {
        offset: start_offset(machine, fp, arg.offset)?,
        is_pointer: false,
    };
    apply_chain(machine, fp, arg, &mut cursor)?;
    if cursor.is_pointer {
        cursor.skip_header(machine);
    }
    Ok(cursor.address())
}

/// The value stored for `&arg`: its address, moved back by the object header
/// size when it points inside a heap object so that dereferencing it skips
/// the header again.
pub fn reference_value(machine: &Machine, fp: u32, arg: &Argument) -> Result<Address, VmError> {
    let addr = resolve(machine, fp, arg)?;
    if arg.is_inner_reference && addr >= machine.heap_base() {
        return addr.offset(-(OBJECT_HEADER_SIZE as i64));
    }
    Ok(addr)
}

fn start_offset(machine: &Machine, fp: u32, offset: u32) -> Result<u32, VmError> {
    if offset < machine.stack_size {
        offset.checked_add(fp).ok_or(VmError::InvalidAddress {
            address: offset as u64 + fp as u64,
            len: 0,
        })
    } else {
        Ok(offset)
    }
}

fn apply_chain(
    machine: &Machine,
    fp: u32,
    arg: &Argument,
    cursor: &mut Cursor,
) -> Result<(), VmError> {
    let mut indexes = arg.indexes.iter();
    // Position in `arg.specifiers` of the type the cursor currently points at.
    let mut depth = 0usize;

    for op in &arg.dereference_operations {
        match op {
            DerefOp::Pointer => {
                if cursor.is_pointer {
                    cursor.skip_header(machine);
                }
                let target = machine.memory.read_u32(cursor.address())?;
                if target == 0 {
                    return Err(VmError::InvalidArgument(format!(
                        "nil dereference of `{}`",
                        arg
                    )));
                }
                cursor.offset = target;
                cursor.is_pointer = true;
                depth += 1;
            }
            DerefOp::ArrayIndex => {
                if cursor.is_pointer {
                    cursor.skip_header(machine);
                }
                let index = read_index(machine, fp, indexes.next(), arg)?;
                if index < 0 {
                    return Err(VmError::IndexOutOfRange {
                        index: index as i64,
                        length: arg.lengths.first().copied().unwrap_or(0),
                    });
                }
                let stride = arg.stride_at(depth);
                let step = (index as u64) * stride as u64;
                cursor.offset = checked_offset(cursor.offset, step)?;
                depth += 1;
            }
            DerefOp::SliceIndex => {
                if cursor.is_pointer {
                    cursor.skip_header(machine);
                }
                let index = read_index(machine, fp, indexes.next(), arg)?;
                let stride = arg.stride_at(depth);
                cursor.offset = slice_element(machine, cursor.address(), index, stride)?.get();
                cursor.is_pointer = false;
                depth += 1;
            }
            DerefOp::Field => {
                for field in &arg.fields {
                    if cursor.is_pointer {
                        cursor.skip_header(machine);
                    }
                    cursor.offset = checked_offset(cursor.offset, field.offset as u64)?;
                    apply_chain(machine, fp, field, cursor)?;
                }
            }
        }
    }
    Ok(())
}

/// Address of element `index` of the dynamic array referenced from `slot`.
pub fn slice_element(
    machine: &Machine,
    slot: Address,
    index: i32,
    stride: u32,
) -> Result<Address, VmError> {
    let object = machine.memory.read_address(slot)?;
    if object.is_nil() {
        return Err(VmError::IndexOutOfRange {
            index: index as i64,
            length: 0,
        });
    }
    let length = machine.memory.read_u32(object.add(SLICE_LENGTH_OFFSET)?)?;
    let base = object.add(OBJECT_HEADER_SIZE + SLICE_HEADER_SIZE)?;
    let relative = index as i64 * stride as i64;
    let limit = length as i64 * stride as i64;
    let aligned = stride == 0 || relative % stride as i64 == 0;
    if relative < 0 || relative >= limit || !aligned {
        return Err(VmError::IndexOutOfRange {
            index: index as i64,
            length,
        });
    }
    base.offset(relative)
}

fn read_index(
    machine: &Machine,
    fp: u32,
    index: Option<&Argument>,
    owner: &Argument,
) -> Result<i32, VmError> {
    let index = index.ok_or_else(|| {
        VmError::InvalidArgument(format!("missing index operand in `{}`", owner))
    })?;
    let addr = resolve(machine, fp, index)?;
    machine.memory.read_i32(addr)
}

fn checked_offset(offset: u32, step: u64) -> Result<u32, VmError> {
    u32::try_from(offset as u64 + step).map_err(|_| VmError::InvalidAddress {
        address: offset as u64 + step,
        len: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::{TypeCode, TypeSpecifier};
    use crate::vm::memory::{POINTER_SIZE, SLICE_CAPACITY_OFFSET};

    const STACK: u32 = 64;

    fn machine() -> Machine {
        // 64 bytes of stack, 16 bytes of data segment, 256 bytes of heap.
        Machine::new(STACK, 16, 256)
    }

    fn local(name: &str, offset: u32) -> Argument {
        let mut arg = Argument::new(name, TypeCode::I32, 4);
        arg.offset = offset;
        arg
    }

    /// Place a dynamic array of i32 with the given elements at heap offset 0.
    fn put_slice(machine: &mut Machine, elements: &[i32]) -> Address {
        let object = machine.heap_base();
        let payload = SLICE_HEADER_SIZE + 4 * elements.len() as u32;
        let memory = &mut machine.memory;
        memory.write_u32(object.add(5).unwrap(), payload).unwrap();
        memory
            .write_u32(object.add(SLICE_CAPACITY_OFFSET).unwrap(), elements.len() as u32)
            .unwrap();
        memory
            .write_u32(object.add(SLICE_LENGTH_OFFSET).unwrap(), elements.len() as u32)
            .unwrap();
        for (i, value) in elements.iter().enumerate() {
            let at = object.add(17 + 4 * i as u32).unwrap();
            memory.write_i32(at, *value).unwrap();
        }
        machine.heap_pointer = OBJECT_HEADER_SIZE + payload;
        object
    }

    fn slice_operand(slot: u32, index_slot: u32) -> Argument {
        let mut arg = local("s", slot);
        arg.specifiers = vec![TypeSpecifier::Slice];
        arg.total_size = POINTER_SIZE;
        arg.dereference_operations = vec![DerefOp::SliceIndex];
        arg.indexes = vec![local("i", index_slot)];
        arg
    }

    #[test]
    fn test_locals_are_frame_relative_and_globals_absolute() {
        let machine = machine();
        let global = local("g", STACK + 4);
        let loc = local("x", 8);
        for fp in [4, 20, 40] {
            assert_eq!(resolve(&machine, fp, &global).unwrap(), Address::new(STACK + 4));
            assert_eq!(resolve(&machine, fp, &loc).unwrap(), Address::new(fp + 8));
        }
    }

    #[test]
    fn test_fixed_array_index_uses_remaining_dimensions() {
        let mut machine = machine();
        // m [2][3]i32 at frame offset 0, i at 24, j at 28
        let mut m = local("m", 0);
        m.specifiers = vec![TypeSpecifier::Array, TypeSpecifier::Array];
        m.lengths = vec![2, 3];
        m.dereference_operations = vec![DerefOp::ArrayIndex, DerefOp::ArrayIndex];
        m.indexes = vec![local("i", 24), local("j", 28)];
        let fp = 4;
        machine.memory.write_i32(Address::new(fp + 24), 1).unwrap();
        machine.memory.write_i32(Address::new(fp + 28), 2).unwrap();
        assert_eq!(resolve(&machine, fp, &m).unwrap(), Address::new(fp + 12 + 8));
    }

    #[test]
    fn test_slice_index_skips_both_headers() {
        let mut machine = machine();
        let object = put_slice(&mut machine, &[10, 20, 30]);
        let fp = 4;
        machine.memory.write_address(Address::new(fp), object).unwrap();
        machine.memory.write_i32(Address::new(fp + 4), 2).unwrap();
        let addr = resolve(&machine, fp, &slice_operand(0, 4)).unwrap();
        assert_eq!(addr, object.add(17 + 8).unwrap());
        assert_eq!(machine.memory.read_i32(addr).unwrap(), 30);
    }

    #[test]
    fn test_slice_index_out_of_range() {
        let mut machine = machine();
        let object = put_slice(&mut machine, &[1, 2, 3]);
        let fp = 4;
        machine.memory.write_address(Address::new(fp), object).unwrap();
        let operand = slice_operand(0, 4);
        for bad in [3, 7, -1] {
            machine.memory.write_i32(Address::new(fp + 4), bad).unwrap();
            assert!(matches!(
                resolve(&machine, fp, &operand),
                Err(VmError::IndexOutOfRange { length: 3, .. })
            ));
        }
        machine.memory.write_address(Address::new(fp), Address::NIL).unwrap();
        machine.memory.write_i32(Address::new(fp + 4), 0).unwrap();
        assert!(matches!(
            resolve(&machine, fp, &operand),
            Err(VmError::IndexOutOfRange { length: 0, .. })
        ));
    }

    #[test]
    fn test_pointer_follow_skips_object_header_only_in_heap() {
        let mut machine = machine();
        let fp = 4;
        let mut deref = local("p", 0);
        deref.specifiers = vec![TypeSpecifier::Pointer];
        deref.dereference_operations = vec![DerefOp::Pointer];

        // Pointer to a heap object.
        let object = machine.heap_base();
        machine.memory.write_address(Address::new(fp), object).unwrap();
        assert_eq!(resolve(&machine, fp, &deref).unwrap(), object.add(9).unwrap());

        // Pointer to a stack slot: no header.
        machine.memory.write_u32(Address::new(fp), fp + 8).unwrap();
        assert_eq!(resolve(&machine, fp, &deref).unwrap(), Address::new(fp + 8));

        // Nil.
        machine.memory.write_u32(Address::new(fp), 0).unwrap();
        assert!(matches!(
            resolve(&machine, fp, &deref),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pointer_to_slice_skips_only_the_box_header() {
        let mut machine = machine();
        let fp = 4;
        let slice = put_slice(&mut machine, &[10, 20, 30]);

        // A boxed slice reference, as `new` would leave it.
        let boxed = machine.heap_base().add(machine.heap_pointer).unwrap();
        machine.memory.write_u32(boxed.add(5).unwrap(), POINTER_SIZE).unwrap();
        machine.memory.write_address(boxed.add(9).unwrap(), slice).unwrap();
        machine.heap_pointer += OBJECT_HEADER_SIZE + POINTER_SIZE;

        machine.memory.write_address(Address::new(fp), boxed).unwrap();
        machine.memory.write_i32(Address::new(fp + 4), 1).unwrap();

        // p *[]i32; operand `(*p)[i]`
        let mut operand = local("p", 0);
        operand.specifiers = vec![TypeSpecifier::Pointer, TypeSpecifier::Slice];
        operand.dereference_operations = vec![DerefOp::Pointer, DerefOp::SliceIndex];
        operand.indexes = vec![local("i", 4)];

        let addr = resolve(&machine, fp, &operand).unwrap();
        assert_eq!(addr, slice.add(OBJECT_HEADER_SIZE + SLICE_HEADER_SIZE + 4).unwrap());
        assert_eq!(machine.memory.read_i32(addr).unwrap(), 20);
    }

    #[test]
    fn test_field_after_pointer_and_inner_reference() {
        let mut machine = machine();
        let fp = 4;
        // p *R where R { a i32, b i32 }; operand `p.b`
        let mut operand = local("p", 0);
        operand.type_code = TypeCode::Record;
        operand.size = 8;
        operand.specifiers = vec![TypeSpecifier::Pointer];
        operand.dereference_operations = vec![DerefOp::Pointer, DerefOp::Field];
        operand.fields = vec![local("b", 4)];
        let object = machine.heap_base();
        machine.memory.write_address(Address::new(fp), object).unwrap();
        let addr = resolve(&machine, fp, &operand).unwrap();
        assert_eq!(addr, object.add(9 + 4).unwrap());

        operand.is_inner_reference = true;
        let reference = reference_value(&machine, fp, &operand).unwrap();
        assert_eq!(reference, object.add(4).unwrap());
    }
}
