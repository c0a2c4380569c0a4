//! Rebuilding a program from record tables.
//!
//! The graph is reconstructed in dependency order: packages, imports,
//! record types, globals, function shells, function bodies, calls. Every
//! cross-reference is resolved by name (`package.name` keys) against the
//! part of the graph already rebuilt, never by trusting a raw index.

use std::time::Duration;

use bincode::Options;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::program::model::{
    Argument, DerefOp, Expression, Function, FunctionId, Model, Operator, Package, PackageId,
    PassBy, RecordType, RecordTypeId, Scope, TypeCode, TypeSpecifier,
};
use crate::program::Program;
use crate::vm::memory::Address;
use crate::vm::{Call, GcStats, Machine, NativeRegistry};

use super::records::{
    codec, decode_table, record_size, ArgumentRecord, CallRecord, ExpressionRecord,
    FunctionRecord, Header, PackageRecord, ProgramRecord, RecordTypeRecord, Span, Table, MAGIC,
    NONE, OPERATOR_CALL, OPERATOR_GOTO, OPERATOR_JUMP, OPERATOR_NATIVE, OPERATOR_NONE,
    TABLE_COUNT, VERSION,
};
use super::SerializeError;

/// Nested index/field descriptors deeper than this mark a corrupt blob.
const MAX_NESTING: usize = 64;

fn corrupt(message: impl Into<String>) -> SerializeError {
    SerializeError::Corrupt(message.into())
}

/// Read and check the index header; return each table's byte range.
fn sections(bytes: &[u8]) -> Result<[&[u8]; TABLE_COUNT], SerializeError> {
    let header_size = record_size::<Header>()?;
    if bytes.len() < header_size {
        return Err(SerializeError::Truncated {
            table: "header",
            expected: header_size,
            actual: bytes.len(),
        });
    }
    let header: Header = codec().deserialize(&bytes[..header_size])?;
    if header.magic != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    if header.version != VERSION {
        return Err(SerializeError::BadVersion(header.version));
    }

    let mut sections = [&bytes[..0]; TABLE_COUNT];
    for (i, table) in Table::ALL.iter().enumerate() {
        let start = header.offsets[i];
        let end = header
            .offsets
            .get(i + 1)
            .copied()
            .unwrap_or(bytes.len() as u64);
        if start < header_size as u64 || start > end || end > bytes.len() as u64 {
            return Err(SerializeError::Truncated {
                table: table.name(),
                expected: end as usize,
                actual: bytes.len(),
            });
        }
        sections[i] = &bytes[start as usize..end as usize];
    }
    Ok(sections)
}

struct Decoder<'n> {
    natives: &'n NativeRegistry,
    packages: Vec<PackageRecord>,
    record_types: Vec<RecordTypeRecord>,
    functions: Vec<FunctionRecord>,
    expressions: Vec<ExpressionRecord>,
    arguments: Vec<ArgumentRecord>,
    integers: Vec<i32>,
    names: Vec<u8>,
    model: Model,
}

impl Decoder<'_> {
    fn name(&self, span: Span) -> Result<String, SerializeError> {
        let bytes = self
            .names
            .get(span.range())
            .ok_or_else(|| corrupt(format!("name span {:?} outside the name pool", span)))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("name is not valid UTF-8"))
    }

    fn integers(&self, span: Span) -> Result<&[i32], SerializeError> {
        self.integers
            .get(span.range())
            .ok_or_else(|| corrupt(format!("span {:?} outside the integer pool", span)))
    }

    fn record<'t, R>(table: &'t [R], index: u32, what: &str) -> Result<&'t R, SerializeError> {
        table
            .get(index as usize)
            .ok_or_else(|| corrupt(format!("{} index {} out of range", what, index)))
    }

    fn package_name(&self, index: u32) -> Result<String, SerializeError> {
        self.name(Self::record(&self.packages, index, "package")?.name)
    }

    /// `package.name` key of a function record.
    fn function_key(&self, index: u32) -> Result<String, SerializeError> {
        let record = Self::record(&self.functions, index, "function")?;
        Ok(format!(
            "{}.{}",
            self.package_name(record.package)?,
            self.name(record.name)?
        ))
    }

    fn find_function(&self, index: u32) -> Result<FunctionId, SerializeError> {
        let key = self.function_key(index)?;
        self.model
            .find_function_by_key(&key)
            .map_err(|_| SerializeError::BrokenReference(format!("function `{}`", key)))
    }

    fn find_record_type(&self, index: u32) -> Result<RecordTypeId, SerializeError> {
        let record = Self::record(&self.record_types, index, "record type")?;
        let package_name = self.package_name(record.package)?;
        let name = self.name(record.name)?;
        let missing =
            || SerializeError::BrokenReference(format!("record type `{}.{}`", package_name, name));
        let package = self.model.find_package(&package_name).map_err(|_| missing())?;
        self.model
            .find_record_type(package, &name)
            .map_err(|_| missing())
    }

    fn arguments(&self, span: Span, depth: usize) -> Result<Vec<Argument>, SerializeError> {
        if depth > MAX_NESTING {
            return Err(corrupt("argument nesting too deep"));
        }
        let records = self
            .arguments
            .get(span.range())
            .ok_or_else(|| corrupt(format!("span {:?} outside the argument table", span)))?;
        records
            .iter()
            .map(|record| self.argument(record, depth))
            .collect()
    }

    fn argument(&self, record: &ArgumentRecord, depth: usize) -> Result<Argument, SerializeError> {
        let type_code = TypeCode::from_u8(record.type_code)
            .ok_or_else(|| corrupt(format!("type code {}", record.type_code)))?;
        let specifiers = self
            .integers(record.specifiers)?
            .iter()
            .map(|raw| {
                u8::try_from(*raw)
                    .ok()
                    .and_then(TypeSpecifier::from_u8)
                    .ok_or_else(|| corrupt(format!("type specifier {}", raw)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let dereference_operations = self
            .integers(record.dereference_operations)?
            .iter()
            .map(|raw| {
                u8::try_from(*raw)
                    .ok()
                    .and_then(DerefOp::from_u8)
                    .ok_or_else(|| corrupt(format!("dereference operation {}", raw)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let record_type = match record.record_type {
            NONE => None,
            index => Some(self.find_record_type(index)?),
        };

        Ok(Argument {
            name: self.name(record.name)?,
            type_code,
            record_type,
            specifiers,
            lengths: self
                .integers(record.lengths)?
                .iter()
                .map(|l| *l as u32)
                .collect(),
            offset: record.offset,
            size: record.size,
            total_size: record.total_size,
            pass_by: if record.pass_by == PassBy::Reference as u8 {
                PassBy::Reference
            } else {
                PassBy::Value
            },
            is_inner_reference: record.is_inner_reference != 0,
            dereference_operations,
            indexes: self.arguments(record.indexes, depth + 1)?,
            fields: self.arguments(record.fields, depth + 1)?,
        })
    }

    fn expression(&self, record: &ExpressionRecord) -> Result<Expression, SerializeError> {
        let operator = match record.operator_kind {
            OPERATOR_NONE => None,
            OPERATOR_NATIVE => {
                self.natives.get(record.operator)?;
                Some(Operator::Native(record.operator))
            }
            OPERATOR_CALL => Some(Operator::Call(self.find_function(record.operator)?)),
            OPERATOR_JUMP => Some(Operator::Jump),
            OPERATOR_GOTO => Some(Operator::Goto),
            other => return Err(corrupt(format!("operator kind {}", other))),
        };
        Ok(Expression {
            operator,
            inputs: self.arguments(record.inputs, 0)?,
            outputs: self.arguments(record.outputs, 0)?,
            then_lines: record.then_lines,
            else_lines: record.else_lines,
            scope: Scope::from_u8(record.scope)
                .ok_or_else(|| corrupt(format!("scope {}", record.scope)))?,
            label: if record.has_label != 0 {
                Some(self.name(record.label)?)
            } else {
                None
            },
        })
    }

    fn rebuild(&mut self) -> Result<(), SerializeError> {
        for record in &self.packages {
            let name = self.name(record.name)?;
            if self.model.find_package(&name).is_ok() {
                return Err(corrupt(format!("duplicate package `{}`", name)));
            }
            self.model.add_package(Package::new(name));
        }
        for (index, record) in self.packages.iter().enumerate() {
            let package = self.model.find_package(&self.name(record.name)?)?;
            debug_assert_eq!(package.index(), index);
            let mut imports = Vec::new();
            for import in self.integers(record.imports)? {
                let name = self.package_name(*import as u32)?;
                let id = self
                    .model
                    .find_package(&name)
                    .map_err(|_| SerializeError::BrokenReference(format!("package `{}`", name)))?;
                imports.push(id);
            }
            self.model.packages[package].imports = imports;
        }

        // Record shells before fields: fields may name any record type.
        for record in &self.record_types {
            let package = self.model.find_package(&self.package_name(record.package)?)?;
            let name = self.name(record.name)?;
            self.model.add_record_type(RecordType {
                name,
                package,
                fields: Vec::new(),
                size: record.size,
            });
        }
        for (index, record) in self.record_types.iter().enumerate() {
            let fields = self.arguments(record.fields, 0)?;
            self.model.record_types[RecordTypeId::from_index(index)].fields = fields;
        }

        for (index, record) in self.packages.iter().enumerate() {
            let globals = self.arguments(record.globals, 0)?;
            self.model.packages[PackageId::from_index(index)].globals = globals;
        }

        // Function shells before bodies: calls resolve by key.
        for record in &self.functions {
            let package = self.model.find_package(&self.package_name(record.package)?)?;
            let name = self.name(record.name)?;
            self.model.add_function(Function {
                name,
                package,
                inputs: Vec::new(),
                outputs: Vec::new(),
                expressions: Vec::new(),
                size: record.size,
                list_of_pointers: Vec::new(),
            });
        }
        for (index, record) in self.functions.iter().enumerate() {
            let inputs = self.arguments(record.inputs, 0)?;
            let outputs = self.arguments(record.outputs, 0)?;
            let list_of_pointers = self.arguments(record.list_of_pointers, 0)?;
            let body = self
                .expressions
                .get(record.expressions.range())
                .ok_or_else(|| corrupt("function body outside the expression table"))?;
            let expressions = body
                .iter()
                .map(|expr| self.expression(expr))
                .collect::<Result<Vec<_>, _>>()?;

            let function = &mut self.model.functions[FunctionId::from_index(index)];
            function.inputs = inputs;
            function.outputs = outputs;
            function.list_of_pointers = list_of_pointers;
            function.expressions = expressions;
        }
        Ok(())
    }
}

/// Rebuild a program. The stack size and heap registers come from the blob;
/// `config` supplies the remaining limits.
pub fn decode(
    bytes: &[u8],
    natives: NativeRegistry,
    mut config: RuntimeConfig,
) -> Result<Program, SerializeError> {
    let sections = sections(bytes)?;
    let table = |t: Table| sections[t as usize];
    let programs: Vec<ProgramRecord> = decode_table(Table::Program.name(), table(Table::Program))?;
    let [program] = programs.as_slice() else {
        return Err(corrupt(format!(
            "expected one program record, found {}",
            programs.len()
        )));
    };
    let calls: Vec<CallRecord> = decode_table(Table::Calls.name(), table(Table::Calls))?;

    let mut decoder = Decoder {
        natives: &natives,
        packages: decode_table(Table::Packages.name(), table(Table::Packages))?,
        record_types: decode_table(Table::RecordTypes.name(), table(Table::RecordTypes))?,
        functions: decode_table(Table::Functions.name(), table(Table::Functions))?,
        expressions: decode_table(Table::Expressions.name(), table(Table::Expressions))?,
        arguments: decode_table(Table::Arguments.name(), table(Table::Arguments))?,
        integers: decode_table(Table::Integers.name(), table(Table::Integers))?,
        names: table(Table::Names).to_vec(),
        model: Model::new(),
    };
    decoder.rebuild()?;
    if program.entry != NONE {
        decoder.model.entry = Some(decoder.find_function(program.entry)?);
    }

    let mut call_stack = Vec::with_capacity(calls.len());
    for call in &calls {
        call_stack.push(Call {
            operator: decoder.find_function(call.function)?,
            line: call.line as usize,
            frame_pointer: call.frame_pointer,
        });
    }

    if program.stack_size.checked_add(program.data_size) != Some(program.heap_starts_at) {
        return Err(corrupt("heap base does not follow the data segment"));
    }
    let memory = table(Table::Memory);
    let live = program.heap_starts_at as u64 + program.heap_pointer as u64;
    if memory.len() as u64 != live || program.heap_pointer > program.heap_size {
        return Err(SerializeError::Truncated {
            table: Table::Memory.name(),
            expected: live as usize,
            actual: memory.len(),
        });
    }

    let mut machine = Machine::new(program.stack_size, program.data_size, program.heap_size);
    machine.memory.write_bytes(Address::NIL, memory)?;
    machine.stack_pointer = program.stack_pointer;
    machine.heap_pointer = program.heap_pointer;
    machine.calls = call_stack;
    machine.terminated = program.terminated != 0;
    machine.gc_stats = GcStats {
        cycles: program.gc_cycles,
        bytes_reclaimed: program.gc_bytes_reclaimed,
        total_pause: Duration::from_nanos(program.gc_total_pause_nanos),
        max_pause: Duration::from_nanos(program.gc_max_pause_nanos),
    };

    config.stack_size = program.stack_size;
    config.max_heap_size = config.max_heap_size.max(program.heap_size);
    debug!(
        packages = decoder.model.packages.len(),
        functions = decoder.model.functions.len(),
        calls = machine.calls.len(),
        memory = memory.len(),
        "program decoded"
    );
    Ok(Program::from_parts(decoder.model, machine, natives, config))
}
