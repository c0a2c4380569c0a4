//! The execution engine: a call-frame stack machine stepping through the
//! instruction lists of composite functions.

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, VmError};
use crate::program::model::{Expression, FunctionId, Model, Operator, PassBy};

use super::address::{reference_value, resolve};
use super::debug;
use super::memory::Address;
use super::ops::{NativeContext, NativeRegistry};
use super::{Call, Machine};

/// Execute until the program terminates, or until `limit` instructions have
/// run. Returns the number of instructions executed.
///
/// Errors are fatal: the returned report carries the failing instruction's
/// location and the call stack at the time of failure.
pub fn run(
    model: &Model,
    natives: &NativeRegistry,
    config: &RuntimeConfig,
    machine: &mut Machine,
    limit: Option<u64>,
) -> Result<u64, RuntimeError> {
    let mut steps = 0u64;
    while !machine.terminated && !machine.calls.is_empty() {
        if limit.is_some_and(|limit| steps >= limit) {
            break;
        }
        if let Err(error) = step(model, natives, config, machine) {
            return Err(debug::report(model, natives, machine, config.print_call_stack, error));
        }
        steps += 1;
    }
    Ok(steps)
}

/// Push the first frame for `function`, which takes no inputs.
pub fn start(
    model: &Model,
    config: &RuntimeConfig,
    machine: &mut Machine,
    function: FunctionId,
) -> Result<(), VmError> {
    let fp = reserve_frame(model, config, machine, function)?;
    enter_frame(model, machine, function, fp);
    debug!(function = %model.function_key(function), fp, "program started");
    Ok(())
}

/// Execute one state transition of the innermost call.
pub fn step(
    model: &Model,
    natives: &NativeRegistry,
    config: &RuntimeConfig,
    machine: &mut Machine,
) -> Result<(), VmError> {
    let Some(call) = machine.calls.last().copied() else {
        return Ok(());
    };
    let depth = machine.calls.len() - 1;
    let function = model.function(call.operator);
    let Some(expr) = function.expressions.get(call.line) else {
        return pop_call(model, machine);
    };

    match expr.operator {
        None => {
            for output in &expr.outputs {
                let addr = resolve(machine, call.frame_pointer, output)?;
                machine.memory.zero(addr, output.total_size)?;
            }
            machine.calls[depth].line += 1;
        }
        Some(Operator::Native(opcode)) => {
            let native = natives.get(opcode)?;
            {
                let mut ctx =
                    NativeContext::new(model, natives, config, machine, call.frame_pointer, expr)?;
                (native.body)(&mut ctx)?;
            }
            machine.calls[depth].line += 1;
        }
        Some(Operator::Jump) => {
            let condition = expr
                .inputs
                .first()
                .ok_or_else(|| VmError::InvalidArgument("jump without a condition".to_string()))?;
            let addr = resolve(machine, call.frame_pointer, condition)?;
            let delta = if machine.memory.read_bool(addr)? {
                expr.then_lines
            } else {
                expr.else_lines
            };
            jump(machine, depth, delta)?;
        }
        Some(Operator::Goto) => jump(machine, depth, expr.then_lines)?,
        Some(Operator::Call(callee)) => push_call(model, config, machine, &call, expr, callee)?,
    }
    Ok(())
}

fn jump(machine: &mut Machine, depth: usize, delta: i32) -> Result<(), VmError> {
    let call = &mut machine.calls[depth];
    let target = call.line as i64 + delta as i64;
    if target < 0 {
        return Err(VmError::InvalidArgument(format!(
            "jump from line {} by {} leaves the function",
            call.line, delta
        )));
    }
    trace!(from = call.line, to = target, "jump");
    call.line = target as usize;
    Ok(())
}

/// Check limits and zero-fill a frame for `function` at the current stack
/// pointer. Returns the new frame pointer; the frame is not yet entered.
fn reserve_frame(
    model: &Model,
    config: &RuntimeConfig,
    machine: &mut Machine,
    function: FunctionId,
) -> Result<u32, VmError> {
    if machine.calls.len() >= config.call_stack_size {
        return Err(VmError::CallStackOverflow {
            limit: config.call_stack_size,
        });
    }
    let size = model.function(function).size;
    let fp = machine.stack_pointer;
    let end = fp as u64 + size as u64;
    if end > machine.stack_size as u64 {
        return Err(VmError::StackOverflow {
            needed: end,
            limit: machine.stack_size,
        });
    }
    machine.memory.zero(Address::new(fp), size)?;
    Ok(fp)
}

fn enter_frame(model: &Model, machine: &mut Machine, function: FunctionId, fp: u32) {
    machine.stack_pointer = fp + model.function(function).size;
    machine.calls.push(Call {
        operator: function,
        line: 0,
        frame_pointer: fp,
    });
}

fn push_call(
    model: &Model,
    config: &RuntimeConfig,
    machine: &mut Machine,
    caller: &Call,
    expr: &Expression,
    callee: FunctionId,
) -> Result<(), VmError> {
    let fp = reserve_frame(model, config, machine, callee)?;
    let function = model.function(callee);
    for (param, input) in function.inputs.iter().zip(&expr.inputs) {
        let dst = Address::new(fp).add(param.offset)?;
        if input.pass_by == PassBy::Reference {
            let value = reference_value(machine, caller.frame_pointer, input)?;
            machine.memory.write_address(dst, value)?;
        } else {
            let src = resolve(machine, caller.frame_pointer, input)?;
            machine.memory.copy_within(src, dst, param.total_size)?;
        }
    }
    enter_frame(model, machine, callee, fp);
    trace!(
        function = %model.function_key(callee),
        fp,
        depth = machine.calls.len(),
        "call"
    );
    Ok(())
}

/// Return from the innermost call.
fn pop_call(model: &Model, machine: &mut Machine) -> Result<(), VmError> {
    let Some(finished) = machine.calls.pop() else {
        return Ok(());
    };

    // A nested run started by a native: its caller collects the outputs.
    if machine.boundaries.last() == Some(&machine.calls.len()) {
        machine.stack_pointer = finished.frame_pointer;
        return Ok(());
    }

    let Some(caller) = machine.calls.last().copied() else {
        machine.stack_pointer = finished.frame_pointer;
        machine.terminated = true;
        debug!(function = %model.function_key(finished.operator), "program terminated");
        return Ok(());
    };

    let callee = model.function(finished.operator);
    let caller_fn = model.function(caller.operator);
    let expr = caller_fn.expressions.get(caller.line).ok_or_else(|| {
        VmError::BrokenReference(format!(
            "return into {} past its last instruction",
            model.function_key(caller.operator)
        ))
    })?;
    for (output, target) in callee.outputs.iter().zip(&expr.outputs) {
        let src = resolve(machine, finished.frame_pointer, output)?;
        let dst = resolve(machine, caller.frame_pointer, target)?;
        machine.memory.copy_within(src, dst, output.total_size)?;
    }
    machine.stack_pointer = finished.frame_pointer;
    if let Some(call) = machine.calls.last_mut() {
        call.line += 1;
    }
    trace!(function = %model.function_key(finished.operator), "return");
    Ok(())
}

/// Run `function` to completion on top of the current call stack, for a
/// native that needs to call back into composite code.
///
/// The caller's line counter and the nesting boundary are restored
/// afterwards. Output bytes may hold heap references; they are only valid
/// until the next allocation unless stored into rooted storage first.
pub fn invoke(
    model: &Model,
    natives: &NativeRegistry,
    config: &RuntimeConfig,
    machine: &mut Machine,
    function: FunctionId,
    inputs: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, VmError> {
    let callee = model.function(function);
    if inputs.len() != callee.inputs.len() {
        return Err(VmError::InvalidArgument(format!(
            "{} takes {} inputs, got {}",
            model.function_key(function),
            callee.inputs.len(),
            inputs.len()
        )));
    }

    let saved_line = machine.calls.last().map(|call| call.line);
    let boundary = machine.calls.len();
    let fp = reserve_frame(model, config, machine, function)?;
    for (param, bytes) in callee.inputs.iter().zip(inputs) {
        if bytes.len() != param.total_size as usize {
            return Err(VmError::InvalidArgument(format!(
                "input `{}` needs {} bytes, got {}",
                param.name,
                param.total_size,
                bytes.len()
            )));
        }
        machine.memory.write_bytes(Address::new(fp).add(param.offset)?, bytes)?;
    }
    enter_frame(model, machine, function, fp);
    machine.boundaries.push(boundary);
    debug!(function = %model.function_key(function), boundary, "nested run");

    let mut outcome = Ok(());
    while machine.calls.len() > boundary {
        outcome = step(model, natives, config, machine);
        if outcome.is_err() {
            break;
        }
    }
    machine.boundaries.pop();
    outcome?;

    let mut results = Vec::with_capacity(callee.outputs.len());
    for output in &callee.outputs {
        let addr = resolve(machine, fp, output)?;
        results.push(machine.memory.read_bytes(addr, output.total_size)?.to_vec());
    }
    if let (Some(line), Some(call)) = (saved_line, machine.calls.last_mut()) {
        call.line = line;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::{Argument, Function, Package, TypeCode};
    use crate::vm::memory::NULL_GAP;

    const STACK: u32 = 256;

    fn var(name: &str, offset: u32) -> Argument {
        let mut arg = Argument::new(name, TypeCode::I32, 4);
        arg.offset = offset;
        arg
    }

    fn bool_var(name: &str, offset: u32) -> Argument {
        let mut arg = Argument::new(name, TypeCode::Bool, 1);
        arg.offset = offset;
        arg
    }

    fn native(registry: &NativeRegistry, name: &str, inputs: Vec<Argument>, outputs: Vec<Argument>) -> Expression {
        let mut expr = Expression::new(Some(Operator::Native(registry.lookup(name).unwrap().opcode)));
        expr.inputs = inputs;
        expr.outputs = outputs;
        expr
    }

    struct Fixture {
        model: Model,
        natives: NativeRegistry,
        config: RuntimeConfig,
        machine: Machine,
    }

    impl Fixture {
        /// `add(a, b) -> c` and a `main` whose body is produced by `body`.
        /// Globals: `out` at STACK, literals 2 and 3 at STACK+4 and STACK+8.
        fn new(body: impl FnOnce(&NativeRegistry, FunctionId) -> Vec<Expression>) -> Self {
            let natives = NativeRegistry::with_builtins();
            let mut model = Model::new();
            let pkg = model.add_package(Package::new("main"));
            let add = model.add_function(Function {
                name: "add".to_string(),
                package: pkg,
                inputs: vec![var("a", 0), var("b", 4)],
                outputs: vec![var("c", 8)],
                expressions: vec![],
                size: 12,
                list_of_pointers: vec![],
            });
            model.functions[add].expressions = vec![native(
                &natives,
                "i32.add",
                vec![var("a", 0), var("b", 4)],
                vec![var("c", 8)],
            )];
            let body = body(&natives, add);
            let main = model.add_function(Function {
                name: "main".to_string(),
                package: pkg,
                inputs: vec![],
                outputs: vec![],
                expressions: body,
                size: 8,
                list_of_pointers: vec![],
            });
            model.entry = Some(main);
            let config = RuntimeConfig {
                stack_size: STACK,
                call_stack_size: 8,
                ..Default::default()
            };
            let mut machine = Machine::new(STACK, 12, 64);
            machine.memory.write_i32(Address::new(STACK + 4), 2).unwrap();
            machine.memory.write_i32(Address::new(STACK + 8), 3).unwrap();
            Fixture {
                model,
                natives,
                config,
                machine,
            }
        }

        fn run(&mut self) -> Result<u64, RuntimeError> {
            let entry = self.model.entry.unwrap();
            start(&self.model, &self.config, &mut self.machine, entry).unwrap();
            run(&self.model, &self.natives, &self.config, &mut self.machine, None)
        }

        fn out(&self) -> i32 {
            self.machine.memory.read_i32(Address::new(STACK)).unwrap()
        }
    }

    #[test]
    fn test_call_copies_outputs_and_restores_stack_pointer() {
        let mut fixture = Fixture::new(|natives, add| {
            let mut declare = Expression::new(None);
            declare.outputs = vec![var("r", 0)];
            let mut call = Expression::new(Some(Operator::Call(add)));
            call.inputs = vec![var("", STACK + 4), var("", STACK + 8)];
            call.outputs = vec![var("r", 0)];
            let copy = native(natives, "identity", vec![var("r", 0)], vec![var("out", STACK)]);
            vec![declare, call, copy]
        });
        let steps = fixture.run().unwrap();
        assert!(fixture.machine.terminated);
        assert_eq!(fixture.machine.stack_pointer, NULL_GAP);
        assert_eq!(fixture.out(), 5);
        // declare, call, add body, return, identity, final return
        assert_eq!(steps, 6);
    }

    #[test]
    fn test_frame_pointer_equals_stack_pointer_at_call() {
        let mut fixture = Fixture::new(|_, add| {
            let mut call = Expression::new(Some(Operator::Call(add)));
            call.inputs = vec![var("", STACK + 4), var("", STACK + 8)];
            call.outputs = vec![var("r", 0)];
            vec![call]
        });
        let entry = fixture.model.entry.unwrap();
        start(&fixture.model, &fixture.config, &mut fixture.machine, entry).unwrap();
        let before = fixture.machine.stack_pointer;
        step(&fixture.model, &fixture.natives, &fixture.config, &mut fixture.machine).unwrap();
        let pushed = *fixture.machine.calls.last().unwrap();
        assert_eq!(pushed.frame_pointer, before);
        assert_eq!(fixture.machine.stack_pointer, before + 12);
        // inputs were copied into the callee's parameters
        let a = fixture.machine.memory.read_i32(Address::new(before)).unwrap();
        assert_eq!(a, 2);
        step(&fixture.model, &fixture.natives, &fixture.config, &mut fixture.machine).unwrap();
        step(&fixture.model, &fixture.natives, &fixture.config, &mut fixture.machine).unwrap();
        assert_eq!(fixture.machine.stack_pointer, before);
        let r = fixture.machine.memory.read_i32(Address::new(NULL_GAP)).unwrap();
        assert_eq!(r, 5);
    }

    #[test]
    fn test_conditional_jump_loop() {
        // out = 0; do { out += 2 } while out < 3
        let mut fixture = Fixture::new(|natives, _| {
            let mut reset = Expression::new(None);
            reset.outputs = vec![var("out", STACK)];
            let add = native(
                natives,
                "i32.add",
                vec![var("out", STACK), var("", STACK + 4)],
                vec![var("out", STACK)],
            );
            let check = native(
                natives,
                "i32.lt",
                vec![var("out", STACK), var("", STACK + 8)],
                vec![bool_var("keep", 0)],
            );
            let mut branch = Expression::new(Some(Operator::Jump));
            branch.inputs = vec![bool_var("keep", 0)];
            branch.then_lines = -2;
            branch.else_lines = 1;
            vec![reset, add, check, branch]
        });
        fixture.run().unwrap();
        // 0 -> 2 -> 4 stops once out >= 3
        assert_eq!(fixture.out(), 4);
    }

    #[test]
    fn test_goto_skips_lines() {
        let mut fixture = Fixture::new(|natives, _| {
            let mut skip = Expression::new(Some(Operator::Goto));
            skip.then_lines = 2;
            let never = native(natives, "identity", vec![var("", STACK + 8)], vec![var("out", STACK)]);
            let always = native(natives, "identity", vec![var("", STACK + 4)], vec![var("out", STACK)]);
            vec![skip, never, always]
        });
        fixture.run().unwrap();
        assert_eq!(fixture.out(), 2);
    }

    #[test]
    fn test_recursion_hits_call_stack_limit() {
        let mut fixture = Fixture::new(|_, _| vec![]);
        let main = fixture.model.entry.unwrap();
        fixture.model.functions[main].expressions = vec![Expression::new(Some(Operator::Call(main)))];
        let err = fixture.run().unwrap_err();
        assert!(matches!(err.error, VmError::CallStackOverflow { limit: 8 }));
        assert_eq!(err.call_stack.len(), 8);
    }

    #[test]
    fn test_frame_larger_than_stack_overflows() {
        let mut fixture = Fixture::new(|_, add| {
            let mut call = Expression::new(Some(Operator::Call(add)));
            call.inputs = vec![var("", STACK + 4), var("", STACK + 8)];
            call.outputs = vec![var("r", 0)];
            vec![call]
        });
        let add = fixture.model.find_function_by_key("main.add").unwrap();
        fixture.model.functions[add].size = STACK;
        let err = fixture.run().unwrap_err();
        assert!(matches!(err.error, VmError::StackOverflow { .. }));
        assert_eq!(err.exit_code(), crate::error::exit_code::STACK_OVERFLOW);
    }

    #[test]
    fn test_invalid_opcode_is_reported() {
        let mut fixture = Fixture::new(|_, _| vec![Expression::new(Some(Operator::Native(9999)))]);
        let err = fixture.run().unwrap_err();
        assert!(matches!(err.error, VmError::InvalidOpcode(9999)));
        assert_eq!(err.location.unwrap().line, 0);
    }

    #[test]
    fn test_invoke_runs_nested_and_restores_line() {
        let mut fixture = Fixture::new(|_, _| vec![]);
        let add = fixture.model.find_function_by_key("main.add").unwrap();
        let entry = fixture.model.entry.unwrap();
        start(&fixture.model, &fixture.config, &mut fixture.machine, entry).unwrap();
        let sp = fixture.machine.stack_pointer;
        let outputs = invoke(
            &fixture.model,
            &fixture.natives,
            &fixture.config,
            &mut fixture.machine,
            add,
            &[20i32.to_le_bytes().to_vec(), 22i32.to_le_bytes().to_vec()],
        )
        .unwrap();
        assert_eq!(outputs, vec![42i32.to_le_bytes().to_vec()]);
        assert_eq!(fixture.machine.calls.len(), 1);
        assert_eq!(fixture.machine.calls[0].line, 0);
        assert_eq!(fixture.machine.stack_pointer, sp);
        assert!(fixture.machine.boundaries.is_empty());
        assert!(!fixture.machine.terminated);
    }
}
