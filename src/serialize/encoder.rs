//! Flattening a program graph and its memory into record tables.

use std::collections::HashMap;

use tracing::debug;

use crate::program::model::{Argument, Expression, Model, Operator};
use crate::vm::Machine;

use super::records::{
    encode_into, record_size, ArgumentRecord, CallRecord, ExpressionRecord, FunctionRecord,
    Header, PackageRecord, ProgramRecord, RecordTypeRecord, Span, Table, MAGIC, NONE,
    OPERATOR_CALL, OPERATOR_GOTO, OPERATOR_JUMP, OPERATOR_NATIVE, OPERATOR_NONE, TABLE_COUNT,
    VERSION,
};
use super::SerializeError;

fn narrow(value: usize, what: &'static str) -> Result<u32, SerializeError> {
    u32::try_from(value).map_err(|_| SerializeError::Overflow(what))
}

#[derive(Default)]
struct Tables {
    calls: Vec<CallRecord>,
    packages: Vec<PackageRecord>,
    record_types: Vec<RecordTypeRecord>,
    functions: Vec<FunctionRecord>,
    expressions: Vec<ExpressionRecord>,
    arguments: Vec<ArgumentRecord>,
    integers: Vec<i32>,
    names: Vec<u8>,
    /// Name → its span in `names`, so repeated names are stored once.
    interned: HashMap<String, Span>,
}

impl Tables {
    fn name(&mut self, name: &str) -> Result<Span, SerializeError> {
        if let Some(span) = self.interned.get(name) {
            return Ok(*span);
        }
        let span = Span {
            start: narrow(self.names.len(), "name pool")?,
            count: narrow(name.len(), "name")?,
        };
        self.names.extend_from_slice(name.as_bytes());
        self.interned.insert(name.to_string(), span);
        Ok(span)
    }

    fn integers(&mut self, values: impl IntoIterator<Item = i32>) -> Result<Span, SerializeError> {
        let start = self.integers.len();
        self.integers.extend(values);
        Ok(Span {
            start: narrow(start, "integer pool")?,
            count: narrow(self.integers.len() - start, "integer pool")?,
        })
    }

    /// Encode `args` into a contiguous run of argument records. Nested
    /// index and field descriptors are appended after the run.
    fn arguments(&mut self, args: &[Argument]) -> Result<Span, SerializeError> {
        let start = self.arguments.len();
        self.arguments
            .resize(start + args.len(), ArgumentRecord::default());
        for (i, arg) in args.iter().enumerate() {
            let record = self.argument(arg)?;
            self.arguments[start + i] = record;
        }
        Ok(Span {
            start: narrow(start, "argument table")?,
            count: narrow(args.len(), "argument table")?,
        })
    }

    fn argument(&mut self, arg: &Argument) -> Result<ArgumentRecord, SerializeError> {
        Ok(ArgumentRecord {
            name: self.name(&arg.name)?,
            type_code: arg.type_code as u8,
            record_type: match arg.record_type {
                Some(id) => narrow(id.index(), "record type table")?,
                None => NONE,
            },
            specifiers: self.integers(arg.specifiers.iter().map(|s| *s as i32))?,
            lengths: self.integers(arg.lengths.iter().map(|l| *l as i32))?,
            offset: arg.offset,
            size: arg.size,
            total_size: arg.total_size,
            pass_by: arg.pass_by as u8,
            is_inner_reference: arg.is_inner_reference as u8,
            dereference_operations: self.integers(arg.dereference_operations.iter().map(|op| *op as i32))?,
            indexes: self.arguments(&arg.indexes)?,
            fields: self.arguments(&arg.fields)?,
        })
    }

    fn expression(&mut self, expr: &Expression) -> Result<ExpressionRecord, SerializeError> {
        let (operator_kind, operator) = match expr.operator {
            None => (OPERATOR_NONE, 0),
            Some(Operator::Native(opcode)) => (OPERATOR_NATIVE, opcode),
            Some(Operator::Call(function)) => (OPERATOR_CALL, narrow(function.index(), "function table")?),
            Some(Operator::Jump) => (OPERATOR_JUMP, 0),
            Some(Operator::Goto) => (OPERATOR_GOTO, 0),
        };
        let label = match &expr.label {
            Some(label) => self.name(label)?,
            None => Span::default(),
        };
        Ok(ExpressionRecord {
            operator_kind,
            operator,
            inputs: self.arguments(&expr.inputs)?,
            outputs: self.arguments(&expr.outputs)?,
            then_lines: expr.then_lines,
            else_lines: expr.else_lines,
            scope: expr.scope as u8,
            has_label: expr.label.is_some() as u8,
            label,
        })
    }
}

/// Encode the model and the live memory region (`[0, heap top)`).
pub fn encode(model: &Model, machine: &Machine) -> Result<Vec<u8>, SerializeError> {
    let mut tables = Tables::default();

    for (_, package) in model.packages.iter() {
        let record = PackageRecord {
            name: tables.name(&package.name)?,
            imports: tables.integers(package.imports.iter().map(|id| id.index() as i32))?,
            globals: tables.arguments(&package.globals)?,
        };
        tables.packages.push(record);
    }

    for (_, record_type) in model.record_types.iter() {
        let record = RecordTypeRecord {
            name: tables.name(&record_type.name)?,
            package: narrow(record_type.package.index(), "package table")?,
            fields: tables.arguments(&record_type.fields)?,
            size: record_type.size,
        };
        tables.record_types.push(record);
    }

    for (_, function) in model.functions.iter() {
        let name = tables.name(&function.name)?;
        let inputs = tables.arguments(&function.inputs)?;
        let outputs = tables.arguments(&function.outputs)?;
        let list_of_pointers = tables.arguments(&function.list_of_pointers)?;

        let mut body = Vec::with_capacity(function.expressions.len());
        for expr in &function.expressions {
            body.push(tables.expression(expr)?);
        }
        let expressions = Span {
            start: narrow(tables.expressions.len(), "expression table")?,
            count: narrow(body.len(), "expression table")?,
        };
        tables.expressions.extend(body);

        tables.functions.push(FunctionRecord {
            name,
            package: narrow(function.package.index(), "package table")?,
            size: function.size,
            inputs,
            outputs,
            list_of_pointers,
            expressions,
        });
    }

    for call in &machine.calls {
        tables.calls.push(CallRecord {
            function: narrow(call.operator.index(), "function table")?,
            line: narrow(call.line, "line")?,
            frame_pointer: call.frame_pointer,
        });
    }

    let stats = &machine.gc_stats;
    let program = ProgramRecord {
        stack_size: machine.stack_size,
        data_size: machine.data_size,
        stack_pointer: machine.stack_pointer,
        heap_starts_at: machine.heap_starts_at,
        heap_pointer: machine.heap_pointer,
        heap_size: machine.heap_size,
        terminated: machine.terminated as u8,
        entry: match model.entry {
            Some(id) => narrow(id.index(), "function table")?,
            None => NONE,
        },
        gc_cycles: stats.cycles,
        gc_bytes_reclaimed: stats.bytes_reclaimed,
        gc_total_pause_nanos: stats.total_pause.as_nanos() as u64,
        gc_max_pause_nanos: stats.max_pause.as_nanos() as u64,
    };

    let live = machine.memory.read_bytes(
        crate::vm::Address::NIL,
        machine.heap_starts_at + machine.heap_pointer,
    )?;

    // Tables in header order; the header itself is written last.
    let mut sections: [Vec<u8>; TABLE_COUNT] = Default::default();
    encode_into(&mut sections[Table::Program as usize], &program)?;
    for record in &tables.calls {
        encode_into(&mut sections[Table::Calls as usize], record)?;
    }
    for record in &tables.packages {
        encode_into(&mut sections[Table::Packages as usize], record)?;
    }
    for record in &tables.record_types {
        encode_into(&mut sections[Table::RecordTypes as usize], record)?;
    }
    for record in &tables.functions {
        encode_into(&mut sections[Table::Functions as usize], record)?;
    }
    for record in &tables.expressions {
        encode_into(&mut sections[Table::Expressions as usize], record)?;
    }
    for record in &tables.arguments {
        encode_into(&mut sections[Table::Arguments as usize], record)?;
    }
    for value in &tables.integers {
        encode_into(&mut sections[Table::Integers as usize], value)?;
    }
    sections[Table::Names as usize] = tables.names;
    sections[Table::Memory as usize] = live.to_vec();

    let mut header = Header {
        magic: MAGIC,
        version: VERSION,
        offsets: [0; TABLE_COUNT],
    };
    let mut offset = record_size::<Header>()? as u64;
    for (slot, section) in header.offsets.iter_mut().zip(&sections) {
        *slot = offset;
        offset += section.len() as u64;
    }

    let mut blob = Vec::with_capacity(offset as usize);
    encode_into(&mut blob, &header)?;
    for section in &sections {
        blob.extend_from_slice(section);
    }
    debug!(
        bytes = blob.len(),
        packages = tables.packages.len(),
        functions = tables.functions.len(),
        expressions = tables.expressions.len(),
        arguments = tables.arguments.len(),
        names = tables.interned.len(),
        memory = live.len(),
        "program encoded"
    );
    Ok(blob)
}
