//! Built-in native operations.
//!
//! Opcodes are stable: serialized programs refer to natives by number.
//! Natives that allocate read plain values before allocating and re-read
//! references afterwards, since a collection may move heap objects.

use tracing::warn;

use crate::error::VmError;
use crate::program::model::PassBy;

use super::memory::{
    Address, Memory, OBJECT_HEADER_SIZE, SLICE_CAPACITY_OFFSET, SLICE_HEADER_SIZE,
    SLICE_LENGTH_OFFSET, STR_HEADER_SIZE,
};
use super::ops::{NativeContext, NativeOp, NativeRegistry};
use super::ops::OperandType::{Any, Bool, F64, I32, I64, Pointer, Slice, Str};

macro_rules! native {
    ($opcode:expr, $name:expr, [$($input:expr),*] -> [$($output:expr),*], $body:expr) => {
        NativeOp {
            opcode: $opcode,
            name: $name,
            inputs: &[$($input),*],
            outputs: &[$($output),*],
            body: $body,
        }
    };
}

/// The built-in catalogue.
pub fn builtins() -> Vec<NativeOp> {
    vec![
        native!(0, "identity", [Any] -> [Any], identity),
        // i32
        native!(1, "i32.add", [I32, I32] -> [I32], i32_add),
        native!(2, "i32.sub", [I32, I32] -> [I32], i32_sub),
        native!(3, "i32.mul", [I32, I32] -> [I32], i32_mul),
        native!(4, "i32.div", [I32, I32] -> [I32], i32_div),
        native!(5, "i32.mod", [I32, I32] -> [I32], i32_mod),
        native!(6, "i32.lt", [I32, I32] -> [Bool], i32_lt),
        native!(7, "i32.gt", [I32, I32] -> [Bool], i32_gt),
        native!(8, "i32.eq", [I32, I32] -> [Bool], i32_eq),
        native!(9, "i32.lteq", [I32, I32] -> [Bool], i32_lteq),
        native!(10, "i32.gteq", [I32, I32] -> [Bool], i32_gteq),
        // i64
        native!(11, "i64.add", [I64, I64] -> [I64], i64_add),
        native!(12, "i64.sub", [I64, I64] -> [I64], i64_sub),
        native!(13, "i64.mul", [I64, I64] -> [I64], i64_mul),
        native!(14, "i64.div", [I64, I64] -> [I64], i64_div),
        native!(15, "i64.lt", [I64, I64] -> [Bool], i64_lt),
        native!(16, "i64.eq", [I64, I64] -> [Bool], i64_eq),
        // f64
        native!(17, "f64.add", [F64, F64] -> [F64], f64_add),
        native!(18, "f64.sub", [F64, F64] -> [F64], f64_sub),
        native!(19, "f64.mul", [F64, F64] -> [F64], f64_mul),
        native!(20, "f64.div", [F64, F64] -> [F64], f64_div),
        native!(21, "f64.lt", [F64, F64] -> [Bool], f64_lt),
        // bool
        native!(22, "bool.not", [Bool] -> [Bool], bool_not),
        native!(23, "bool.and", [Bool, Bool] -> [Bool], bool_and),
        native!(24, "bool.or", [Bool, Bool] -> [Bool], bool_or),
        native!(25, "bool.eq", [Bool, Bool] -> [Bool], bool_eq),
        // dynamic arrays
        native!(26, "len", [Slice] -> [I32], slice_len),
        native!(27, "make", [I32] -> [Slice], slice_make),
        native!(28, "append", [Slice, Any] -> [Slice], slice_append),
        native!(29, "resize", [Slice, I32] -> [Slice], slice_resize),
        native!(30, "copy", [Slice, Slice] -> [I32], slice_copy),
        // strings
        native!(31, "str.concat", [Str, Str] -> [Str], str_concat),
        native!(32, "str.eq", [Str, Str] -> [Bool], str_eq),
        native!(33, "i32.str", [I32] -> [Str], i32_str),
        // heap
        native!(34, "new", [] -> [Pointer], new_object),
        // output
        native!(35, "print.i32", [I32] -> [], print_i32),
        native!(36, "print.i64", [I64] -> [], print_i64),
        native!(37, "print.f64", [F64] -> [], print_f64),
        native!(38, "print.bool", [Bool] -> [], print_bool),
        native!(39, "print.str", [Str] -> [], print_str),
        native!(40, "gc", [] -> [], gc),
    ]
}

pub fn register_builtins(registry: &mut NativeRegistry) {
    for op in builtins() {
        if let Err(message) = registry.register(op) {
            warn!(%message, "skipping built-in native");
        }
    }
}

// =============================================================================
// Scalars
// =============================================================================

fn identity(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    if ctx.input_arg(0)?.pass_by == PassBy::Reference {
        let value = ctx.reference_value(0)?;
        return ctx.write_address(0, value);
    }
    let size = ctx.output_arg(0)?.total_size;
    let bytes = ctx.read_bytes(0)?;
    if bytes.len() != size as usize {
        return Err(VmError::InvalidArgument(format!(
            "cannot assign {} bytes to a {}-byte value",
            bytes.len(),
            size
        )));
    }
    ctx.write_bytes(0, &bytes)
}

macro_rules! binary {
    ($name:ident, $read:ident, $write:ident, |$a:ident, $b:ident| $body:expr) => {
        fn $name(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
            let $a = ctx.$read(0)?;
            let $b = ctx.$read(1)?;
            ctx.$write(0, $body)
        }
    };
}

macro_rules! checked_binary {
    ($name:ident, $read:ident, $write:ident, $op:ident, $what:expr) => {
        fn $name(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
            let a = ctx.$read(0)?;
            let b = ctx.$read(1)?;
            let value = a.$op(b).ok_or_else(|| {
                VmError::InvalidArgument(format!("{} of {} by {} is undefined", $what, a, b))
            })?;
            ctx.$write(0, value)
        }
    };
}

binary!(i32_add, read_i32, write_i32, |a, b| a.wrapping_add(b));
binary!(i32_sub, read_i32, write_i32, |a, b| a.wrapping_sub(b));
binary!(i32_mul, read_i32, write_i32, |a, b| a.wrapping_mul(b));
checked_binary!(i32_div, read_i32, write_i32, checked_div, "division");
checked_binary!(i32_mod, read_i32, write_i32, checked_rem, "remainder");
binary!(i32_lt, read_i32, write_bool, |a, b| a < b);
binary!(i32_gt, read_i32, write_bool, |a, b| a > b);
binary!(i32_eq, read_i32, write_bool, |a, b| a == b);
binary!(i32_lteq, read_i32, write_bool, |a, b| a <= b);
binary!(i32_gteq, read_i32, write_bool, |a, b| a >= b);

binary!(i64_add, read_i64, write_i64, |a, b| a.wrapping_add(b));
binary!(i64_sub, read_i64, write_i64, |a, b| a.wrapping_sub(b));
binary!(i64_mul, read_i64, write_i64, |a, b| a.wrapping_mul(b));
checked_binary!(i64_div, read_i64, write_i64, checked_div, "division");
binary!(i64_lt, read_i64, write_bool, |a, b| a < b);
binary!(i64_eq, read_i64, write_bool, |a, b| a == b);

binary!(f64_add, read_f64, write_f64, |a, b| a + b);
binary!(f64_sub, read_f64, write_f64, |a, b| a - b);
binary!(f64_mul, read_f64, write_f64, |a, b| a * b);
binary!(f64_div, read_f64, write_f64, |a, b| a / b);
binary!(f64_lt, read_f64, write_bool, |a, b| a < b);

binary!(bool_and, read_bool, write_bool, |a, b| a && b);
binary!(bool_or, read_bool, write_bool, |a, b| a || b);
binary!(bool_eq, read_bool, write_bool, |a, b| a == b);

fn bool_not(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let value = ctx.read_bool(0)?;
    ctx.write_bool(0, !value)
}

// =============================================================================
// Dynamic arrays
// =============================================================================

/// `(capacity, length)` of the dynamic array at `object`; nil is empty.
pub fn slice_header(memory: &Memory, object: Address) -> Result<(u32, u32), VmError> {
    if object.is_nil() {
        return Ok((0, 0));
    }
    let capacity = memory.read_u32(object.add(SLICE_CAPACITY_OFFSET)?)?;
    let length = memory.read_u32(object.add(SLICE_LENGTH_OFFSET)?)?;
    Ok((capacity, length))
}

/// Address of the first element of the dynamic array at `object`.
pub fn slice_data(object: Address) -> Result<Address, VmError> {
    object.add(OBJECT_HEADER_SIZE + SLICE_HEADER_SIZE)
}

fn element_stride(ctx: &NativeContext<'_>, input: usize) -> Result<u32, VmError> {
    Ok(ctx.input_type(input)?.rest().size())
}

fn non_negative(value: i32, what: &str) -> Result<u32, VmError> {
    u32::try_from(value)
        .map_err(|_| VmError::InvalidArgument(format!("negative {}: {}", what, value)))
}

/// Allocate a dynamic array with the given capacity and length.
fn allocate_slice(
    ctx: &mut NativeContext<'_>,
    capacity: u32,
    length: u32,
    stride: u32,
) -> Result<Address, VmError> {
    let payload = (capacity as u64 * stride as u64)
        .checked_add(SLICE_HEADER_SIZE as u64)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or_else(|| VmError::InvalidArgument(format!("array of {} elements is too large", capacity)))?;
    let object = ctx.allocate(payload)?;
    let memory = ctx.memory_mut();
    memory.write_u32(object.add(SLICE_CAPACITY_OFFSET)?, capacity)?;
    memory.write_u32(object.add(SLICE_LENGTH_OFFSET)?, length)?;
    Ok(object)
}

fn slice_len(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let object = ctx.read_address(0)?;
    let (_, length) = slice_header(ctx.memory(), object)?;
    ctx.write_i32(0, length as i32)
}

fn slice_make(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let length = non_negative(ctx.read_i32(0)?, "length")?;
    let stride = ctx.output_type(0)?.rest().size();
    let object = allocate_slice(ctx, length, length, stride)?;
    ctx.write_address(0, object)
}

fn slice_append(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let stride = element_stride(ctx, 0)?;
    let value_size = ctx.input_arg(1)?.total_size;
    if value_size != stride {
        return Err(VmError::InvalidArgument(format!(
            "cannot append a {}-byte value to an array of {}-byte elements",
            value_size, stride
        )));
    }

    let current = ctx.read_address(0)?;
    let (capacity, length) = slice_header(ctx.memory(), current)?;
    let target = if length < capacity {
        current
    } else {
        let grown = capacity.saturating_mul(2).max(1);
        let fresh = allocate_slice(ctx, grown, length, stride)?;
        let old = ctx.read_address(0)?;
        if !old.is_nil() {
            ctx.memory_mut()
                .copy_within(slice_data(old)?, slice_data(fresh)?, length * stride)?;
        }
        fresh
    };

    let value = ctx.read_bytes(1)?;
    let memory = ctx.memory_mut();
    memory.write_bytes(slice_data(target)?.add(length * stride)?, &value)?;
    memory.write_u32(target.add(SLICE_LENGTH_OFFSET)?, length + 1)?;
    ctx.write_address(0, target)
}

fn slice_resize(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let stride = element_stride(ctx, 0)?;
    let wanted = non_negative(ctx.read_i32(1)?, "length")?;
    let current = ctx.read_address(0)?;
    let (capacity, length) = slice_header(ctx.memory(), current)?;

    let target = if wanted <= capacity {
        let object = current;
        let memory = ctx.memory_mut();
        if wanted > length {
            let from = slice_data(object)?.add(length * stride)?;
            memory.zero(from, (wanted - length) * stride)?;
        }
        memory.write_u32(object.add(SLICE_LENGTH_OFFSET)?, wanted)?;
        object
    } else {
        let fresh = allocate_slice(ctx, wanted, wanted, stride)?;
        let old = ctx.read_address(0)?;
        if !old.is_nil() {
            ctx.memory_mut()
                .copy_within(slice_data(old)?, slice_data(fresh)?, length * stride)?;
        }
        fresh
    };
    ctx.write_address(0, target)
}

fn slice_copy(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let stride = element_stride(ctx, 0)?;
    if element_stride(ctx, 1)? != stride {
        return Err(VmError::InvalidArgument(
            "copy between arrays of different element sizes".to_string(),
        ));
    }
    let dst = ctx.read_address(0)?;
    let src = ctx.read_address(1)?;
    let (_, dst_len) = slice_header(ctx.memory(), dst)?;
    let (_, src_len) = slice_header(ctx.memory(), src)?;
    let count = dst_len.min(src_len);
    if count > 0 {
        ctx.memory_mut()
            .copy_within(slice_data(src)?, slice_data(dst)?, count * stride)?;
    }
    ctx.write_i32(0, count as i32)
}

// =============================================================================
// Strings
// =============================================================================

/// Bytes of the string object at `object`; nil is the empty string.
pub fn read_str(memory: &Memory, object: Address) -> Result<Vec<u8>, VmError> {
    if object.is_nil() {
        return Ok(Vec::new());
    }
    let payload = object.add(OBJECT_HEADER_SIZE)?;
    let length = memory.read_u32(payload)?;
    Ok(memory.read_bytes(payload.add(STR_HEADER_SIZE)?, length)?.to_vec())
}

fn allocate_str(ctx: &mut NativeContext<'_>, bytes: &[u8]) -> Result<Address, VmError> {
    let length = u32::try_from(bytes.len())
        .map_err(|_| VmError::InvalidArgument("string too long".to_string()))?;
    let object = ctx.allocate(STR_HEADER_SIZE + length)?;
    let payload = object.add(OBJECT_HEADER_SIZE)?;
    let memory = ctx.memory_mut();
    memory.write_u32(payload, length)?;
    memory.write_bytes(payload.add(STR_HEADER_SIZE)?, bytes)?;
    Ok(object)
}

fn input_str(ctx: &mut NativeContext<'_>, index: usize) -> Result<Vec<u8>, VmError> {
    let object = ctx.read_address(index)?;
    read_str(ctx.memory(), object)
}

fn str_concat(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let mut joined = input_str(ctx, 0)?;
    joined.extend(input_str(ctx, 1)?);
    let object = allocate_str(ctx, &joined)?;
    ctx.write_address(0, object)
}

fn str_eq(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let equal = input_str(ctx, 0)? == input_str(ctx, 1)?;
    ctx.write_bool(0, equal)
}

fn i32_str(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let text = ctx.read_i32(0)?.to_string();
    let object = allocate_str(ctx, text.as_bytes())?;
    ctx.write_address(0, object)
}

// =============================================================================
// Heap, output, collection
// =============================================================================

fn new_object(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let size = ctx.output_type(0)?.rest().size();
    let object = ctx.allocate(size)?;
    ctx.write_address(0, object)
}

fn print_i32(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let value = ctx.read_i32(0)?;
    writeln!(ctx.output_stream(), "{}", value)?;
    Ok(())
}

fn print_i64(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let value = ctx.read_i64(0)?;
    writeln!(ctx.output_stream(), "{}", value)?;
    Ok(())
}

fn print_f64(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let value = ctx.read_f64(0)?;
    writeln!(ctx.output_stream(), "{}", value)?;
    Ok(())
}

fn print_bool(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let value = ctx.read_bool(0)?;
    writeln!(ctx.output_stream(), "{}", value)?;
    Ok(())
}

fn print_str(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    let bytes = input_str(ctx, 0)?;
    writeln!(ctx.output_stream(), "{}", String::from_utf8_lossy(&bytes))?;
    Ok(())
}

fn gc(ctx: &mut NativeContext<'_>) -> Result<(), VmError> {
    ctx.collect()
}
