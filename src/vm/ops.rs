//! Native operation registry and the calling contract for native bodies.
//!
//! A native is identified by a stable integer opcode. Its descriptor holds
//! the operand signature the linker validates against and a function
//! pointer the engine dispatches to with a [`NativeContext`].

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use crate::config::RuntimeConfig;
use crate::error::VmError;
use crate::program::model::{Argument, Expression, FunctionId, Model, PassBy, TypeCode, TypeView};

use super::address::{reference_value, resolve};
use super::memory::{Address, Memory};
use super::{engine, heap, Machine};

pub type Opcode = u32;

pub type NativeFn = fn(&mut NativeContext<'_>) -> Result<(), VmError>;

/// Operand kinds a native signature can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    Any,
    Bool,
    I32,
    I64,
    F64,
    Str,
    /// Any dynamic array.
    Slice,
    /// Any pointer, including `&x` operands.
    Pointer,
}

impl OperandType {
    pub fn accepts(self, view: &TypeView<'_>, pass_by: PassBy) -> bool {
        if pass_by == PassBy::Reference {
            return matches!(self, OperandType::Any | OperandType::Pointer);
        }
        match self {
            OperandType::Any => true,
            OperandType::Bool => view.is_scalar(TypeCode::Bool),
            OperandType::I32 => view.is_scalar(TypeCode::I32),
            OperandType::I64 => view.is_scalar(TypeCode::I64),
            OperandType::F64 => view.is_scalar(TypeCode::F64),
            OperandType::Str => view.is_str(),
            OperandType::Slice => view.is_slice(),
            OperandType::Pointer => view.is_pointer(),
        }
    }
}

impl fmt::Display for OperandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperandType::Any => "any",
            OperandType::Bool => "bool",
            OperandType::I32 => "i32",
            OperandType::I64 => "i64",
            OperandType::F64 => "f64",
            OperandType::Str => "str",
            OperandType::Slice => "[]",
            OperandType::Pointer => "*",
        };
        write!(f, "{}", name)
    }
}

/// A registered native operation.
#[derive(Clone)]
pub struct NativeOp {
    pub opcode: Opcode,
    pub name: &'static str,
    pub inputs: &'static [OperandType],
    pub outputs: &'static [OperandType],
    pub body: NativeFn,
}

impl fmt::Debug for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeOp")
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Opcode-indexed table of native operations.
#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    ops: Vec<Option<NativeOp>>,
    by_name: HashMap<&'static str, Opcode>,
}

impl NativeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in catalogue.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::natives::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, op: NativeOp) -> Result<(), String> {
        let slot = op.opcode as usize;
        if self.by_name.contains_key(op.name) {
            return Err(format!("native `{}` is already registered", op.name));
        }
        if self.ops.get(slot).is_some_and(|existing| existing.is_some()) {
            return Err(format!("opcode {} is already registered", op.opcode));
        }
        if self.ops.len() <= slot {
            self.ops.resize(slot + 1, None);
        }
        self.by_name.insert(op.name, op.opcode);
        self.ops[slot] = Some(op);
        Ok(())
    }

    pub fn get(&self, opcode: Opcode) -> Result<&NativeOp, VmError> {
        self.ops
            .get(opcode as usize)
            .and_then(Option::as_ref)
            .ok_or(VmError::InvalidOpcode(opcode))
    }

    pub fn lookup(&self, name: &str) -> Option<&NativeOp> {
        let opcode = self.by_name.get(name)?;
        self.ops.get(*opcode as usize).and_then(Option::as_ref)
    }

    pub fn name(&self, opcode: Opcode) -> Option<&'static str> {
        self.get(opcode).ok().map(|op| op.name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativeOp> {
        self.ops.iter().flatten()
    }
}

/// What a native body sees: its resolved operand addresses and a narrow
/// window onto the machine.
///
/// Any allocation (and any nested invocation) may run the collector and move
/// heap objects. Addresses obtained before such a call are stale afterwards;
/// ask for them again through [`input`](Self::input) / [`output`](Self::output),
/// which re-resolve after a collection.
pub struct NativeContext<'a> {
    model: &'a Model,
    natives: &'a NativeRegistry,
    config: &'a RuntimeConfig,
    machine: &'a mut Machine,
    frame_pointer: u32,
    expression: &'a Expression,
    inputs: Vec<Address>,
    outputs: Vec<Address>,
    /// Collector cycle count the cached addresses were resolved at.
    epoch: u64,
}

impl<'a> NativeContext<'a> {
    pub fn new(
        model: &'a Model,
        natives: &'a NativeRegistry,
        config: &'a RuntimeConfig,
        machine: &'a mut Machine,
        frame_pointer: u32,
        expression: &'a Expression,
    ) -> Result<Self, VmError> {
        let mut ctx = Self {
            model,
            natives,
            config,
            epoch: machine.gc_stats.cycles,
            machine,
            frame_pointer,
            expression,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        ctx.resolve_operands()?;
        Ok(ctx)
    }

    fn resolve_operands(&mut self) -> Result<(), VmError> {
        let machine = &*self.machine;
        let fp = self.frame_pointer;
        self.inputs = self
            .expression
            .inputs
            .iter()
            .map(|arg| resolve(machine, fp, arg))
            .collect::<Result<_, _>>()?;
        self.outputs = self
            .expression
            .outputs
            .iter()
            .map(|arg| resolve(machine, fp, arg))
            .collect::<Result<_, _>>()?;
        self.epoch = machine.gc_stats.cycles;
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), VmError> {
        if self.machine.gc_stats.cycles != self.epoch {
            self.resolve_operands()?;
        }
        Ok(())
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn machine(&self) -> &Machine {
        &*self.machine
    }

    pub fn memory(&self) -> &Memory {
        &self.machine.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.machine.memory
    }

    pub fn input_count(&self) -> usize {
        self.expression.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.expression.outputs.len()
    }

    pub fn input_arg(&self, index: usize) -> Result<&'a Argument, VmError> {
        let expression: &'a Expression = self.expression;
        expression
            .inputs
            .get(index)
            .ok_or_else(|| VmError::InvalidArgument(format!("missing input #{}", index)))
    }

    pub fn output_arg(&self, index: usize) -> Result<&'a Argument, VmError> {
        let expression: &'a Expression = self.expression;
        expression
            .outputs
            .get(index)
            .ok_or_else(|| VmError::InvalidArgument(format!("missing output #{}", index)))
    }

    pub fn input_type(&self, index: usize) -> Result<TypeView<'a>, VmError> {
        Ok(self.input_arg(index)?.value_type())
    }

    pub fn output_type(&self, index: usize) -> Result<TypeView<'a>, VmError> {
        Ok(self.output_arg(index)?.value_type())
    }

    /// Address of input `index`, current as of the last collection.
    pub fn input(&mut self, index: usize) -> Result<Address, VmError> {
        self.refresh()?;
        self.inputs
            .get(index)
            .copied()
            .ok_or_else(|| VmError::InvalidArgument(format!("missing input #{}", index)))
    }

    pub fn output(&mut self, index: usize) -> Result<Address, VmError> {
        self.refresh()?;
        self.outputs
            .get(index)
            .copied()
            .ok_or_else(|| VmError::InvalidArgument(format!("missing output #{}", index)))
    }

    /// The value an `&x` input stands for.
    pub fn reference_value(&mut self, index: usize) -> Result<Address, VmError> {
        let arg = self.input_arg(index)?;
        reference_value(&*self.machine, self.frame_pointer, arg)
    }

    pub fn read_bytes(&mut self, index: usize) -> Result<Vec<u8>, VmError> {
        let size = self.input_arg(index)?.total_size;
        let addr = self.input(index)?;
        Ok(self.machine.memory.read_bytes(addr, size)?.to_vec())
    }

    pub fn write_bytes(&mut self, index: usize, bytes: &[u8]) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_bytes(addr, bytes)
    }

    pub fn read_bool(&mut self, index: usize) -> Result<bool, VmError> {
        let addr = self.input(index)?;
        self.machine.memory.read_bool(addr)
    }

    pub fn read_i32(&mut self, index: usize) -> Result<i32, VmError> {
        let addr = self.input(index)?;
        self.machine.memory.read_i32(addr)
    }

    pub fn read_i64(&mut self, index: usize) -> Result<i64, VmError> {
        let addr = self.input(index)?;
        self.machine.memory.read_i64(addr)
    }

    pub fn read_f64(&mut self, index: usize) -> Result<f64, VmError> {
        let addr = self.input(index)?;
        self.machine.memory.read_f64(addr)
    }

    pub fn read_address(&mut self, index: usize) -> Result<Address, VmError> {
        let addr = self.input(index)?;
        self.machine.memory.read_address(addr)
    }

    pub fn write_bool(&mut self, index: usize, value: bool) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_bool(addr, value)
    }

    pub fn write_i32(&mut self, index: usize, value: i32) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_i32(addr, value)
    }

    pub fn write_i64(&mut self, index: usize, value: i64) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_i64(addr, value)
    }

    pub fn write_f64(&mut self, index: usize, value: f64) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_f64(addr, value)
    }

    pub fn write_address(&mut self, index: usize, value: Address) -> Result<(), VmError> {
        let addr = self.output(index)?;
        self.machine.memory.write_address(addr, value)
    }

    /// Allocate a heap object; may collect.
    pub fn allocate(&mut self, size: u32) -> Result<Address, VmError> {
        heap::allocate(self.model, self.config, self.machine, size)
    }

    pub fn collect(&mut self) -> Result<(), VmError> {
        heap::collect(self.model, self.machine)
    }

    /// Run a composite function to completion from inside this native and
    /// return its output bytes.
    pub fn invoke(&mut self, function: FunctionId, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, VmError> {
        engine::invoke(self.model, self.natives, self.config, self.machine, function, inputs)
    }

    pub fn output_stream(&mut self) -> &mut dyn Write {
        &mut *self.machine.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut NativeContext<'_>) -> Result<(), VmError> {
        Ok(())
    }

    fn op(opcode: Opcode, name: &'static str) -> NativeOp {
        NativeOp {
            opcode,
            name,
            inputs: &[OperandType::I32],
            outputs: &[],
            body: nop,
        }
    }

    #[test]
    fn test_registry_dispatch_and_invalid_opcode() {
        let mut registry = NativeRegistry::new();
        registry.register(op(3, "three")).unwrap();
        assert_eq!(registry.get(3).unwrap().name, "three");
        assert_eq!(registry.lookup("three").unwrap().opcode, 3);
        assert!(matches!(registry.get(2), Err(VmError::InvalidOpcode(2))));
        assert!(matches!(registry.get(99), Err(VmError::InvalidOpcode(99))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = NativeRegistry::new();
        registry.register(op(1, "a")).unwrap();
        assert!(registry.register(op(1, "b")).is_err());
        assert!(registry.register(op(2, "a")).is_err());
    }

    #[test]
    fn test_operand_type_accepts() {
        let mut arg = Argument::new("x", TypeCode::I32, 4);
        assert!(OperandType::I32.accepts(&arg.value_type(), PassBy::Value));
        assert!(!OperandType::I64.accepts(&arg.value_type(), PassBy::Value));
        assert!(OperandType::Pointer.accepts(&arg.value_type(), PassBy::Reference));
        assert!(!OperandType::I32.accepts(&arg.value_type(), PassBy::Reference));
        arg.type_code = TypeCode::Str;
        assert!(OperandType::Str.accepts(&arg.value_type(), PassBy::Value));
    }

    #[test]
    fn test_builtins_have_unique_names() {
        let registry = NativeRegistry::with_builtins();
        assert!(registry.lookup("i32.add").is_some());
        assert!(registry.lookup("append").is_some());
        assert_eq!(registry.iter().count(), registry.len());
    }
}
