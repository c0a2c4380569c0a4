//! Source locations and call-stack dumps for fatal error reports.

use crate::error::{Location, RuntimeError, VmError};
use crate::program::model::{Expression, Model, Operator};

use super::ops::NativeRegistry;
use super::{Call, Machine};

/// Render an instruction as `outputs = operator(inputs)`.
pub fn render_expression(model: &Model, natives: &NativeRegistry, expr: &Expression) -> String {
    let join = |args: &[crate::program::model::Argument]| {
        args.iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let inputs = join(&expr.inputs);
    let outputs = join(&expr.outputs);

    let body = match expr.operator {
        None => return format!("declare {}", outputs),
        Some(Operator::Jump) => {
            return format!("jmp({}) then {:+} else {:+}", inputs, expr.then_lines, expr.else_lines);
        }
        Some(Operator::Goto) => return format!("goto {:+}", expr.then_lines),
        Some(Operator::Native(opcode)) => match natives.name(opcode) {
            Some(name) => format!("{}({})", name, inputs),
            None => format!("op#{}({})", opcode, inputs),
        },
        Some(Operator::Call(function)) => format!("{}({})", model.function_key(function), inputs),
    };
    if outputs.is_empty() {
        body
    } else {
        format!("{} = {}", outputs, body)
    }
}

/// Where a call currently is.
pub fn location(model: &Model, natives: &NativeRegistry, call: &Call) -> Location {
    let function = model.function(call.operator);
    Location {
        package: model.package(function.package).name.clone(),
        function: function.name.clone(),
        line: call.line,
        instruction: function
            .expressions
            .get(call.line)
            .map(|expr| render_expression(model, natives, expr)),
    }
}

/// Active calls, innermost first.
pub fn call_stack(model: &Model, natives: &NativeRegistry, machine: &Machine) -> Vec<Location> {
    machine
        .calls
        .iter()
        .rev()
        .map(|call| location(model, natives, call))
        .collect()
}

/// Attach the failing location (and, if requested, the call stack) to an
/// error raised while the machine was in its current state.
pub fn report(
    model: &Model,
    natives: &NativeRegistry,
    machine: &Machine,
    print_call_stack: bool,
    error: VmError,
) -> RuntimeError {
    RuntimeError {
        error,
        location: machine
            .current_call()
            .map(|call| location(model, natives, call)),
        call_stack: if print_call_stack {
            call_stack(model, natives, machine)
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::{Argument, Function, Package, TypeCode};

    fn model_with_body(natives: &NativeRegistry) -> Model {
        let mut model = Model::new();
        let pkg = model.add_package(Package::new("demo"));
        let mut add = Expression::new(Some(Operator::Native(natives.lookup("i32.add").unwrap().opcode)));
        add.inputs = vec![
            Argument::new("a", TypeCode::I32, 4),
            Argument::new("b", TypeCode::I32, 4),
        ];
        add.outputs = vec![Argument::new("c", TypeCode::I32, 4)];
        let mut jump = Expression::new(Some(Operator::Jump));
        jump.inputs = vec![Argument::new("ok", TypeCode::Bool, 1)];
        jump.then_lines = -1;
        jump.else_lines = 1;
        let function = model.add_function(Function {
            name: "f".to_string(),
            package: pkg,
            inputs: vec![],
            outputs: vec![],
            expressions: vec![add, jump],
            size: 0,
            list_of_pointers: vec![],
        });
        model.entry = Some(function);
        model
    }

    #[test]
    fn test_render_expression() {
        let natives = NativeRegistry::with_builtins();
        let model = model_with_body(&natives);
        let body = &model.function(model.entry.unwrap()).expressions;
        assert_eq!(render_expression(&model, &natives, &body[0]), "c = i32.add(a, b)");
        assert_eq!(render_expression(&model, &natives, &body[1]), "jmp(ok) then -1 else +1");
    }

    #[test]
    fn test_report_lists_innermost_first() {
        let natives = NativeRegistry::with_builtins();
        let model = model_with_body(&natives);
        let entry = model.entry.unwrap();
        let mut machine = Machine::new(64, 0, 0);
        machine.calls.push(Call { operator: entry, line: 1, frame_pointer: 4 });
        machine.calls.push(Call { operator: entry, line: 0, frame_pointer: 4 });

        let report = report(&model, &natives, &machine, true, VmError::InvalidOpcode(7));
        let location = report.location.clone().unwrap();
        assert_eq!(location.to_string(), "demo.f:0 `c = i32.add(a, b)`");
        assert_eq!(report.call_stack.len(), 2);
        assert_eq!(report.call_stack[1].line, 1);

        let quiet = super::report(&model, &natives, &machine, false, VmError::InvalidOpcode(7));
        assert!(quiet.call_stack.is_empty());
    }
}
