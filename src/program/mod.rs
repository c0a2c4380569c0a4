//! The Program: a linked model together with the machine executing it.

pub mod arena;
pub mod model;

use std::io::Write;

use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, VmError};
use crate::vm::memory::{Address, NULL_GAP};
use crate::vm::natives::read_str;
use crate::vm::{address, engine, heap, GcStats, Machine, NativeRegistry};
use model::{Argument, FunctionId, Model};

/// Root runtime object. Exactly one machine executes one model; the engine,
/// allocator and serializer all work through an exclusive borrow of it.
pub struct Program {
    model: Model,
    machine: Machine,
    natives: NativeRegistry,
    config: RuntimeConfig,
}

impl Program {
    /// Lay out memory for a freshly linked model. `data` is the initial image
    /// of the data segment (globals and literals).
    pub fn new(
        model: Model,
        data: Vec<u8>,
        natives: NativeRegistry,
        config: RuntimeConfig,
    ) -> Result<Self, VmError> {
        let mut machine = Machine::new(config.stack_size, data.len() as u32, config.initial_heap_size);
        machine
            .memory
            .write_bytes(Address::new(config.stack_size), &data)?;
        Ok(Self {
            model,
            machine,
            natives,
            config,
        })
    }

    /// Reassemble a program from an already populated machine.
    pub fn from_parts(
        model: Model,
        machine: Machine,
        natives: NativeRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            model,
            machine,
            natives,
            config,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.machine.gc_stats
    }

    pub fn is_terminated(&self) -> bool {
        self.machine.terminated
    }

    pub fn stack_pointer(&self) -> u32 {
        self.machine.stack_pointer
    }

    /// Redirect what the `print.*` natives write.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.machine.output = output;
    }

    /// Push the entry function's frame unless execution already started.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.machine.terminated || !self.machine.calls.is_empty() {
            return Ok(());
        }
        let entry = self
            .model
            .entry
            .ok_or_else(|| VmError::BrokenReference("program has no entry function".to_string()))?;
        engine::start(&self.model, &self.config, &mut self.machine, entry)?;
        Ok(())
    }

    /// Run to completion.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.start()?;
        let steps = engine::run(&self.model, &self.natives, &self.config, &mut self.machine, None)?;
        info!(steps, gc_cycles = self.machine.gc_stats.cycles, "run finished");
        Ok(())
    }

    /// Execute a single instruction. Returns whether the program has terminated.
    pub fn step(&mut self) -> Result<bool, RuntimeError> {
        self.run_steps(1)
    }

    /// Execute at most `steps` instructions. Returns whether the program has
    /// terminated.
    pub fn run_steps(&mut self, steps: u64) -> Result<bool, RuntimeError> {
        self.start()?;
        engine::run(&self.model, &self.natives, &self.config, &mut self.machine, Some(steps))?;
        Ok(self.machine.terminated)
    }

    /// Call a function by its `package.name` key with raw input bytes and
    /// return its raw outputs. Works with or without an active call stack.
    pub fn invoke(&mut self, key: &str, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, RuntimeError> {
        let function = self.model.find_function_by_key(key)?;
        self.invoke_function(function, inputs)
    }

    pub fn invoke_function(
        &mut self,
        function: FunctionId,
        inputs: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, RuntimeError> {
        engine::invoke(
            &self.model,
            &self.natives,
            &self.config,
            &mut self.machine,
            function,
            inputs,
        )
        .map_err(|error| {
            crate::vm::debug::report(
                &self.model,
                &self.natives,
                &self.machine,
                self.config.print_call_stack,
                error,
            )
        })
    }

    pub fn collect_garbage(&mut self) -> Result<(), VmError> {
        heap::collect(&self.model, &mut self.machine)
    }

    pub fn allocate(&mut self, size: u32) -> Result<Address, VmError> {
        heap::allocate(&self.model, &self.config, &mut self.machine, size)
    }

    pub fn resolve(&self, frame_pointer: u32, arg: &Argument) -> Result<Address, VmError> {
        address::resolve(&self.machine, frame_pointer, arg)
    }

    pub fn global(&self, package: &str, name: &str) -> Result<&Argument, VmError> {
        let id = self.model.find_package(package)?;
        self.model
            .package(id)
            .global(name)
            .ok_or_else(|| VmError::BrokenReference(format!("global `{}.{}`", package, name)))
    }

    pub fn global_bytes(&self, package: &str, name: &str) -> Result<&[u8], VmError> {
        let global = self.global(package, name)?;
        self.machine
            .memory
            .read_bytes(Address::new(global.offset), global.total_size)
    }

    pub fn read_global_i32(&self, package: &str, name: &str) -> Result<i32, VmError> {
        let global = self.global(package, name)?;
        self.machine.memory.read_i32(Address::new(global.offset))
    }

    pub fn read_global_f64(&self, package: &str, name: &str) -> Result<f64, VmError> {
        let global = self.global(package, name)?;
        self.machine.memory.read_f64(Address::new(global.offset))
    }

    /// Text of a `str` global.
    pub fn read_global_str(&self, package: &str, name: &str) -> Result<String, VmError> {
        let global = self.global(package, name)?;
        let object = self.machine.memory.read_address(Address::new(global.offset))?;
        let bytes = read_str(&self.machine.memory, object)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Discard all execution state so the model can run again from its
    /// entry point. Literals in the data segment are kept; globals, the stack
    /// and the heap are zeroed.
    pub fn reset(&mut self) -> Result<(), VmError> {
        let machine = &mut self.machine;
        machine.memory.zero(Address::NIL, machine.stack_size)?;
        for (_, package) in self.model.packages.iter() {
            for global in &package.globals {
                machine
                    .memory
                    .zero(Address::new(global.offset), global.total_size)?;
            }
        }
        machine.calls.clear();
        machine.boundaries.clear();
        machine.stack_pointer = NULL_GAP;
        machine.heap_pointer = 0;
        machine.set_heap_size(self.config.initial_heap_size);
        machine.memory.zero(machine.heap_base(), machine.heap_size)?;
        machine.terminated = false;
        machine.gc_stats = GcStats::default();
        Ok(())
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("packages", &self.model.packages.len())
            .field("functions", &self.model.functions.len())
            .field("machine", &self.machine)
            .finish()
    }
}
