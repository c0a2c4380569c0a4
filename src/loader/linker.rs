//! Linking: resolve names, lay out records, globals, literals and frames,
//! build operand chains and validate every instruction.
//!
//! Frames are laid out inputs first, then outputs, then locals, packed
//! without padding from offset 0. Globals and literals share the data
//! segment, which starts right after the stack region; offsets into it are
//! absolute.

use std::collections::HashMap;

use tracing::debug;

use crate::program::model::{
    size_of, Argument, DerefOp, Expression, Function, FunctionId, Model, Operator, Package,
    PackageId, PassBy, RecordType, RecordTypeId, Scope, TypeCode, TypeSpecifier, TypeView,
};
use crate::vm::memory::{NULL_GAP, OBJECT_HEADER_SIZE, POINTER_SIZE, SIZE_OFFSET, STR_HEADER_SIZE};
use crate::vm::ops::{NativeOp, NativeRegistry};

use super::assembly::{Assembly, FunctionSource, InstructionSource, VarSource};
use super::syntax::{parse_operand, parse_type, BaseSyntax, Literal, OperandSyntax, PathSyntax, Step};
use super::LoadError;

/// Jump target naming the end of the function body.
pub const RETURN_LABEL: &str = "return";

/// Output of [`link`]: the model and the initial data-segment image.
#[derive(Debug)]
pub struct Linked {
    pub model: Model,
    pub data: Vec<u8>,
}

pub fn link(
    assembly: &Assembly,
    natives: &NativeRegistry,
    stack_size: u32,
) -> Result<Linked, LoadError> {
    let mut linker = Linker {
        assembly,
        natives,
        stack_size,
        model: Model::new(),
        data: DataSegment::default(),
        packages: Vec::new(),
    };
    linker.declare_packages()?;
    linker.layout_records()?;
    linker.place_globals()?;
    let frames = linker.declare_functions()?;
    linker.link_bodies(&frames)?;
    linker.set_entry()?;

    debug!(
        records = linker.model.record_types.len(),
        functions = linker.model.functions.len(),
        data_bytes = linker.data.bytes.len(),
        literals = linker.data.literals.len(),
        "link finished"
    );
    Ok(Linked {
        model: linker.model,
        data: linker.data.bytes,
    })
}

/// A type with its record name resolved.
#[derive(Debug, Clone)]
struct ResolvedType {
    specifiers: Vec<TypeSpecifier>,
    lengths: Vec<u32>,
    type_code: TypeCode,
    record_type: Option<RecordTypeId>,
}

impl ResolvedType {
    /// Whether the size depends on the base type's size.
    fn stores_base_inline(&self) -> bool {
        self.specifiers.iter().all(|s| *s == TypeSpecifier::Array)
    }
}

fn same_type(a: &TypeView<'_>, b: &TypeView<'_>) -> bool {
    a.specifiers == b.specifiers
        && a.lengths == b.lengths
        && a.type_code == b.type_code
        && a.record_type == b.record_type
}

/// The globals and literal constants between the stack and the heap.
#[derive(Debug, Default)]
struct DataSegment {
    bytes: Vec<u8>,
    /// Encoded literal → its absolute offset, so equal constants share storage.
    literals: HashMap<(TypeCode, Vec<u8>), u32>,
}

impl DataSegment {
    /// Append `size` zero bytes and return their absolute offset.
    fn reserve(&mut self, stack_size: u32, size: u32) -> Result<u32, String> {
        let offset = u32::try_from(self.bytes.len())
            .ok()
            .and_then(|len| stack_size.checked_add(len))
            .ok_or_else(|| "data segment exceeds the address space".to_string())?;
        self.bytes.resize(self.bytes.len() + size as usize, 0);
        Ok(offset)
    }

    fn write(&mut self, stack_size: u32, offset: u32, bytes: &[u8]) {
        let start = (offset - stack_size) as usize;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Absolute offset of the slot holding `literal`.
    ///
    /// A string literal is stored as an object image (header, length,
    /// bytes) followed by a reference slot pointing at it, so it reads like
    /// any heap string. The collector never moves it: it lies below the heap.
    fn literal(&mut self, stack_size: u32, literal: &Literal) -> Result<u32, String> {
        let encoded = match literal {
            Literal::Bool(v) => vec![*v as u8],
            Literal::I32(v) => v.to_le_bytes().to_vec(),
            Literal::I64(v) => v.to_le_bytes().to_vec(),
            Literal::F64(v) => v.to_le_bytes().to_vec(),
            Literal::Str(v) => v.as_bytes().to_vec(),
        };
        let key = (literal.type_code(), encoded);
        if let Some(offset) = self.literals.get(&key) {
            return Ok(*offset);
        }

        let slot = if let Literal::Str(text) = literal {
            let length = u32::try_from(text.len())
                .map_err(|_| "string literal is too long".to_string())?;
            let payload = STR_HEADER_SIZE + length;
            let object = self.reserve(stack_size, OBJECT_HEADER_SIZE + payload)?;
            let mut image = vec![0u8; (OBJECT_HEADER_SIZE + payload) as usize];
            let size_at = SIZE_OFFSET as usize;
            image[size_at..size_at + 4].copy_from_slice(&payload.to_le_bytes());
            let length_at = OBJECT_HEADER_SIZE as usize;
            image[length_at..length_at + 4].copy_from_slice(&length.to_le_bytes());
            image[length_at + 4..].copy_from_slice(text.as_bytes());
            self.write(stack_size, object, &image);

            let slot = self.reserve(stack_size, POINTER_SIZE)?;
            self.write(stack_size, slot, &object.to_le_bytes());
            slot
        } else {
            let slot = self.reserve(stack_size, key.1.len() as u32)?;
            self.write(stack_size, slot, &key.1);
            slot
        };
        self.literals.insert(key, slot);
        Ok(slot)
    }
}

struct Linker<'a> {
    assembly: &'a Assembly,
    natives: &'a NativeRegistry,
    stack_size: u32,
    model: Model,
    data: DataSegment,
    /// Package ids in assembly order.
    packages: Vec<PackageId>,
}

/// A function shell awaiting its body.
struct Frame<'a> {
    id: FunctionId,
    package: PackageId,
    source: &'a FunctionSource,
    /// Inputs, outputs and locals with their frame offsets.
    variables: Vec<Argument>,
}

impl<'a> Linker<'a> {
    // =========================================================================
    // Packages and types
    // =========================================================================

    fn declare_packages(&mut self) -> Result<(), LoadError> {
        for source in &self.assembly.packages {
            if self.model.find_package(&source.name).is_ok() {
                return Err(LoadError::invalid(&source.name, "duplicate package"));
            }
            let id = self.model.add_package(Package::new(source.name.clone()));
            self.packages.push(id);
        }
        for (source, id) in self.assembly.packages.iter().zip(self.packages.clone()) {
            for import in &source.imports {
                let imported = self
                    .model
                    .find_package(import)
                    .map_err(|_| LoadError::broken(&source.name, format!("import of unknown package `{}`", import)))?;
                self.model.packages[id].imports.push(imported);
            }
        }
        Ok(())
    }

    /// Whether code in `from` may name things declared in `to`.
    fn visible(&self, from: PackageId, to: PackageId) -> bool {
        from == to || self.model.package(from).imports.contains(&to)
    }

    fn resolve_type(
        &self,
        package: PackageId,
        location: &str,
        text: &str,
    ) -> Result<ResolvedType, LoadError> {
        let syntax = parse_type(text).map_err(|message| LoadError::invalid(location, message))?;
        let (type_code, record_type) = match syntax.base {
            BaseSyntax::Primitive(code) => (code, None),
            BaseSyntax::Record { package: owner, name } => {
                let owner = match owner {
                    None => package,
                    Some(owner) => {
                        let id = self
                            .model
                            .find_package(&owner)
                            .map_err(|e| LoadError::broken(location, e.to_string()))?;
                        if !self.visible(package, id) {
                            return Err(LoadError::invalid(
                                location,
                                format!("package `{}` is not imported", owner),
                            ));
                        }
                        id
                    }
                };
                let id = self
                    .model
                    .find_record_type(owner, &name)
                    .map_err(|_| LoadError::broken(location, format!("unknown type `{}`", text)))?;
                (TypeCode::Record, Some(id))
            }
        };
        Ok(ResolvedType {
            specifiers: syntax.specifiers,
            lengths: syntax.lengths,
            type_code,
            record_type,
        })
    }

    /// A storage descriptor of the given type at offset 0.
    fn variable(&self, name: &str, ty: &ResolvedType) -> Argument {
        let base_size = self.model.base_size(ty.type_code, ty.record_type);
        let mut arg = Argument::new(name, ty.type_code, base_size);
        arg.record_type = ty.record_type;
        arg.specifiers = ty.specifiers.clone();
        arg.lengths = ty.lengths.clone();
        arg.total_size = size_of(&ty.specifiers, &ty.lengths, base_size);
        arg
    }

    fn layout_records(&mut self) -> Result<(), LoadError> {
        // Shells first so fields can name any record, in any order.
        let mut sources = Vec::new();
        for (source, package) in self.assembly.packages.iter().zip(self.packages.clone()) {
            for record in &source.records {
                if self.model.find_record_type(package, &record.name).is_ok() {
                    return Err(LoadError::invalid(
                        format!("{}.{}", source.name, record.name),
                        "duplicate record type",
                    ));
                }
                self.model.add_record_type(RecordType {
                    name: record.name.clone(),
                    package,
                    fields: Vec::new(),
                    size: 0,
                });
                sources.push((package, record));
            }
        }

        let mut declared = Vec::with_capacity(sources.len());
        for (index, (package, record)) in sources.iter().enumerate() {
            let location = self.model.record_type_key(RecordTypeId::from_index(index));
            let mut fields: Vec<(&VarSource, ResolvedType)> = Vec::new();
            for field in &record.fields {
                if fields.iter().any(|(seen, _)| seen.name == field.name) {
                    return Err(LoadError::invalid(&location, format!("duplicate field `{}`", field.name)));
                }
                fields.push((field, self.resolve_type(*package, &location, &field.type_name)?));
            }
            declared.push(fields);
        }

        let mut sizes = vec![None; declared.len()];
        let mut visiting = vec![false; declared.len()];
        for index in 0..declared.len() {
            record_size(&self.model, &declared, index, &mut sizes, &mut visiting)?;
        }
        for (index, size) in sizes.iter().enumerate() {
            self.model.record_types[RecordTypeId::from_index(index)].size = size.unwrap_or(0);
        }

        for (index, fields) in declared.iter().enumerate() {
            let mut offset = 0u32;
            let mut arguments = Vec::with_capacity(fields.len());
            for (source, ty) in fields {
                let mut field = self.variable(&source.name, ty);
                field.offset = offset;
                offset += field.total_size;
                arguments.push(field);
            }
            self.model.record_types[RecordTypeId::from_index(index)].fields = arguments;
        }
        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    fn place_globals(&mut self) -> Result<(), LoadError> {
        for (source, package) in self.assembly.packages.iter().zip(self.packages.clone()) {
            for global in &source.globals {
                let location = format!("{}.{}", source.name, global.name);
                if self.model.package(package).global(&global.name).is_some() {
                    return Err(LoadError::invalid(&location, "duplicate global"));
                }
                let ty = self.resolve_type(package, &location, &global.type_name)?;
                let mut arg = self.variable(&global.name, &ty);
                arg.offset = self
                    .data
                    .reserve(self.stack_size, arg.total_size)
                    .map_err(|message| LoadError::invalid(&location, message))?;
                self.model.packages[package].globals.push(arg);
            }
        }
        Ok(())
    }

    fn declare_functions(&mut self) -> Result<Vec<Frame<'a>>, LoadError> {
        let assembly = self.assembly;
        let mut frames = Vec::new();
        for (source, package) in assembly.packages.iter().zip(self.packages.clone()) {
            for function in &source.functions {
                let location = format!("{}.{}", source.name, function.name);
                if self.model.find_function(package, &function.name).is_ok() {
                    return Err(LoadError::invalid(&location, "duplicate function"));
                }

                let mut variables: Vec<Argument> = Vec::new();
                let mut offset = 0u64;
                let groups = [&function.inputs, &function.outputs, &function.locals];
                for var in groups.into_iter().flatten() {
                    if variables.iter().any(|seen| seen.name == var.name) {
                        return Err(LoadError::invalid(&location, format!("duplicate variable `{}`", var.name)));
                    }
                    let ty = self.resolve_type(package, &location, &var.type_name)?;
                    let mut arg = self.variable(&var.name, &ty);
                    arg.offset = offset as u32;
                    offset += arg.total_size as u64;
                    variables.push(arg);
                }
                // Frame offsets at or past the stack size would read as absolute.
                if offset + NULL_GAP as u64 > self.stack_size as u64 {
                    return Err(LoadError::invalid(
                        &location,
                        format!("frame of {} bytes does not fit a {}-byte stack", offset, self.stack_size),
                    ));
                }

                let inputs = variables[..function.inputs.len()].to_vec();
                let outputs =
                    variables[function.inputs.len()..function.inputs.len() + function.outputs.len()].to_vec();
                let list_of_pointers = variables
                    .iter()
                    .filter(|var| self.model.holds_references(&var.declared_type()))
                    .cloned()
                    .collect();
                let id = self.model.add_function(Function {
                    name: function.name.clone(),
                    package,
                    inputs,
                    outputs,
                    expressions: Vec::new(),
                    size: offset as u32,
                    list_of_pointers,
                });
                frames.push(Frame {
                    id,
                    package,
                    source: function,
                    variables,
                });
            }
        }
        Ok(frames)
    }

    // =========================================================================
    // Bodies
    // =========================================================================

    fn link_bodies(&mut self, frames: &[Frame<'a>]) -> Result<(), LoadError> {
        for frame in frames {
            let key = self.model.function_key(frame.id);
            let body = &frame.source.body;

            let mut labels: HashMap<&str, usize> = HashMap::new();
            for (line, instruction) in body.iter().enumerate() {
                if let Some(label) = &instruction.label {
                    if label == RETURN_LABEL || labels.insert(label, line).is_some() {
                        return Err(LoadError::invalid(
                            format!("{}:{}", key, line),
                            format!("label `{}` is reserved or already defined", label),
                        ));
                    }
                }
            }
            let target = |label: &str, location: &str| -> Result<usize, LoadError> {
                if label == RETURN_LABEL {
                    return Ok(body.len());
                }
                labels
                    .get(label)
                    .copied()
                    .ok_or_else(|| LoadError::broken(location, format!("unknown label `{}`", label)))
            };

            let mut expressions = Vec::with_capacity(body.len());
            for (line, instruction) in body.iter().enumerate() {
                let location = format!("{}:{}", key, line);
                let mut resolver = OperandResolver {
                    model: &self.model,
                    data: &mut self.data,
                    stack_size: self.stack_size,
                    package: frame.package,
                    variables: &frame.variables,
                    location: &location,
                };
                let mut expr = link_instruction(&mut resolver, self.natives, instruction)?;

                let delta = |to: usize| (to as i64 - line as i64) as i32;
                match expr.operator {
                    Some(Operator::Jump) => {
                        let then = match &instruction.then {
                            Some(label) => target(label, &location)?,
                            None => line + 1,
                        };
                        let otherwise = match &instruction.otherwise {
                            Some(label) => target(label, &location)?,
                            None => line + 1,
                        };
                        expr.then_lines = delta(then);
                        expr.else_lines = delta(otherwise);
                    }
                    Some(Operator::Goto) => {
                        let label = instruction.goto.as_deref().unwrap_or(RETURN_LABEL);
                        expr.then_lines = delta(target(label, &location)?);
                    }
                    _ => {}
                }
                expressions.push(expr);
            }
            self.model.functions[frame.id].expressions = expressions;
        }
        Ok(())
    }

    fn set_entry(&mut self) -> Result<(), LoadError> {
        let entry = self
            .model
            .find_function_by_key(&self.assembly.entry)
            .map_err(|_| LoadError::broken("entry", format!("no function `{}`", self.assembly.entry)))?;
        if !self.model.function(entry).inputs.is_empty() {
            return Err(LoadError::invalid(&self.assembly.entry, "entry function cannot take inputs"));
        }
        self.model.entry = Some(entry);
        Ok(())
    }
}

/// Memoized record sizes. A record that contains itself by value (directly
/// or through fixed arrays) has no finite size.
fn record_size(
    model: &Model,
    declared: &[Vec<(&VarSource, ResolvedType)>],
    index: usize,
    sizes: &mut [Option<u32>],
    visiting: &mut [bool],
) -> Result<u32, LoadError> {
    if let Some(size) = sizes[index] {
        return Ok(size);
    }
    let location = model.record_type_key(RecordTypeId::from_index(index));
    if visiting[index] {
        return Err(LoadError::invalid(location, "record contains itself by value"));
    }
    visiting[index] = true;

    let mut total = 0u32;
    for (_, ty) in &declared[index] {
        let base = match ty.record_type {
            Some(id) if ty.stores_base_inline() => record_size(model, declared, id.index(), sizes, visiting)?,
            Some(_) => 0,
            None => ty.type_code.size(),
        };
        total = total
            .checked_add(size_of(&ty.specifiers, &ty.lengths, base))
            .ok_or_else(|| LoadError::invalid(&location, "record is too large"))?;
    }

    visiting[index] = false;
    sizes[index] = Some(total);
    Ok(total)
}

fn scope(location: &str, text: Option<&str>) -> Result<Scope, LoadError> {
    match text {
        None => Ok(Scope::None),
        Some("enter") => Ok(Scope::Enter),
        Some("exit") => Ok(Scope::Exit),
        Some(other) => Err(LoadError::invalid(location, format!("unknown scope `{}`", other))),
    }
}

/// Build an instruction, leaving jump distances to the caller.
fn link_instruction(
    resolver: &mut OperandResolver<'_>,
    natives: &NativeRegistry,
    instruction: &InstructionSource,
) -> Result<Expression, LoadError> {
    let location = resolver.location;
    let kinds = [
        instruction.op.is_some(),
        instruction.call.is_some(),
        instruction.jump.is_some(),
        instruction.goto.is_some(),
    ];
    if kinds.iter().filter(|set| **set).count() > 1 {
        return Err(LoadError::invalid(location, "an instruction takes one of op, call, jump or goto"));
    }
    if instruction.jump.is_none() && (instruction.then.is_some() || instruction.otherwise.is_some()) {
        return Err(LoadError::invalid(location, "then/else targets need a jump condition"));
    }

    let inputs = instruction
        .inputs
        .iter()
        .map(|text| resolver.operand(text))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = instruction
        .outputs
        .iter()
        .map(|text| resolver.operand(text))
        .collect::<Result<Vec<_>, _>>()?;
    for output in &outputs {
        if output.is_literal() || output.pass_by == PassBy::Reference {
            return Err(LoadError::invalid(location, format!("cannot assign to `{}`", output)));
        }
    }

    let mut expr = if let Some(name) = &instruction.op {
        let native = natives.lookup(name).ok_or_else(|| LoadError::UnknownOperation {
            location: location.to_string(),
            name: name.clone(),
        })?;
        check_native(location, native, &inputs, &outputs)?;
        Expression::new(Some(Operator::Native(native.opcode)))
    } else if let Some(callee) = &instruction.call {
        let function = resolver.function(callee)?;
        check_call(resolver.model, location, function, &inputs, &outputs)?;
        Expression::new(Some(Operator::Call(function)))
    } else if let Some(condition) = &instruction.jump {
        if !inputs.is_empty() || !outputs.is_empty() {
            return Err(LoadError::invalid(location, "a jump takes only its condition"));
        }
        let condition = resolver.operand(condition)?;
        if condition.pass_by == PassBy::Reference || !condition.value_type().is_scalar(TypeCode::Bool) {
            return Err(LoadError::invalid(
                location,
                format!("jump condition `{}` must be a bool", condition),
            ));
        }
        let mut expr = Expression::new(Some(Operator::Jump));
        expr.inputs.push(condition);
        expr
    } else if instruction.goto.is_some() {
        if !inputs.is_empty() || !outputs.is_empty() {
            return Err(LoadError::invalid(location, "goto takes no operands"));
        }
        Expression::new(Some(Operator::Goto))
    } else {
        if !inputs.is_empty() {
            return Err(LoadError::invalid(location, "a declaration takes no inputs"));
        }
        Expression::new(None)
    };

    if expr.operator != Some(Operator::Jump) {
        expr.inputs = inputs;
    }
    expr.outputs = outputs;
    expr.scope = scope(location, instruction.scope.as_deref())?;
    expr.label = instruction.label.clone();
    Ok(expr)
}

fn check_native(
    location: &str,
    native: &NativeOp,
    inputs: &[Argument],
    outputs: &[Argument],
) -> Result<(), LoadError> {
    let groups = [("input", native.inputs, inputs), ("output", native.outputs, outputs)];
    for (what, expected, actual) in groups {
        if expected.len() != actual.len() {
            return Err(LoadError::invalid(
                location,
                format!("`{}` takes {} {}s, got {}", native.name, expected.len(), what, actual.len()),
            ));
        }
        for (index, (want, arg)) in expected.iter().zip(actual).enumerate() {
            if !want.accepts(&arg.value_type(), arg.pass_by) {
                return Err(LoadError::invalid(
                    location,
                    format!(
                        "{} #{} of `{}` must be {}, got `{}` of type {}",
                        what,
                        index,
                        native.name,
                        want,
                        arg,
                        arg.value_type()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_call(
    model: &Model,
    location: &str,
    callee: FunctionId,
    inputs: &[Argument],
    outputs: &[Argument],
) -> Result<(), LoadError> {
    let function = model.function(callee);
    let key = model.function_key(callee);
    if function.inputs.len() != inputs.len() || function.outputs.len() != outputs.len() {
        return Err(LoadError::invalid(
            location,
            format!(
                "`{}` takes {} inputs and {} outputs, got {} and {}",
                key,
                function.inputs.len(),
                function.outputs.len(),
                inputs.len(),
                outputs.len()
            ),
        ));
    }
    for (param, arg) in function.inputs.iter().zip(inputs) {
        let declared = param.declared_type();
        let matches = if arg.pass_by == PassBy::Reference {
            declared.is_pointer() && same_type(&declared.rest(), &arg.value_type())
        } else {
            same_type(&declared, &arg.value_type())
        };
        if !matches {
            return Err(LoadError::invalid(
                location,
                format!("`{}` of `{}` is {}, got `{}`", param.name, key, declared, arg),
            ));
        }
    }
    for (result, target) in function.outputs.iter().zip(outputs) {
        if !same_type(&result.declared_type(), &target.value_type()) {
            return Err(LoadError::invalid(
                location,
                format!(
                    "output `{}` of `{}` is {}, cannot store it in `{}` of type {}",
                    result.name,
                    key,
                    result.declared_type(),
                    target,
                    target.value_type()
                ),
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Operands
// =============================================================================

/// Turns operand text into [`Argument`] chains in the scope of one function.
struct OperandResolver<'r> {
    model: &'r Model,
    data: &'r mut DataSegment,
    stack_size: u32,
    package: PackageId,
    variables: &'r [Argument],
    location: &'r str,
}

impl OperandResolver<'_> {
    fn invalid(&self, message: impl Into<String>) -> LoadError {
        LoadError::invalid(self.location, message)
    }

    fn operand(&mut self, text: &str) -> Result<Argument, LoadError> {
        let syntax = parse_operand(text).map_err(|message| self.invalid(message))?;
        self.resolve(&syntax)
    }

    fn resolve(&mut self, syntax: &OperandSyntax) -> Result<Argument, LoadError> {
        match syntax {
            OperandSyntax::Literal(literal) => {
                let offset = self
                    .data
                    .literal(self.stack_size, literal)
                    .map_err(|message| self.invalid(message))?;
                let code = literal.type_code();
                let mut arg = Argument::new("", code, code.size());
                arg.offset = offset;
                Ok(arg)
            }
            OperandSyntax::Path(path) => self.path(path),
        }
    }

    /// `name` or `package.name` of a function visible from this package.
    fn function(&self, text: &str) -> Result<FunctionId, LoadError> {
        let (package, name) = match text.rsplit_once('.') {
            Some((package, name)) => {
                let id = self
                    .model
                    .find_package(package)
                    .map_err(|e| LoadError::broken(self.location, e.to_string()))?;
                if id != self.package && !self.model.package(self.package).imports.contains(&id) {
                    return Err(self.invalid(format!("package `{}` is not imported", package)));
                }
                (id, name)
            }
            None => (self.package, text),
        };
        self.model
            .find_function(package, name)
            .map_err(|e| LoadError::broken(self.location, e.to_string()))
    }

    /// Storage a path starts from: a frame variable, a global of this
    /// package, or `package.global` (which consumes the first step).
    fn root<'s>(&self, name: &str, steps: &mut &'s [Step]) -> Result<Argument, LoadError> {
        if let Some(var) = self.variables.iter().find(|var| var.name == name) {
            return Ok(var.clone());
        }
        if let Some(global) = self.model.package(self.package).global(name) {
            return Ok(global.clone());
        }
        let current: &'s [Step] = *steps;
        if let (Some((Step::Field(global), rest)), Ok(package)) =
            (current.split_first(), self.model.find_package(name))
        {
            if package == self.package || self.model.package(self.package).imports.contains(&package) {
                let global = self
                    .model
                    .package(package)
                    .global(global)
                    .ok_or_else(|| LoadError::broken(self.location, format!("no global `{}.{}`", name, global)))?;
                *steps = rest;
                return Ok(global.clone());
            }
        }
        Err(LoadError::broken(self.location, format!("unknown variable `{}`", name)))
    }

    fn path(&mut self, path: &PathSyntax) -> Result<Argument, LoadError> {
        let mut steps = path.steps.as_slice();
        let mut arg = self.root(&path.root, &mut steps)?;

        for _ in 0..path.derefs {
            let view = arg.value_type();
            if !view.is_pointer() {
                return Err(self.invalid(format!("cannot dereference `{}` of type {}", arg, view)));
            }
            push_step(&mut arg, DerefOp::Pointer, None);
        }

        for step in steps {
            follow_pointers(&mut arg);
            match step {
                Step::Field(name) => {
                    let view = arg.value_type();
                    let record = match (view.outer(), view.record_type) {
                        (None, Some(record)) => record,
                        _ => {
                            return Err(self.invalid(format!(
                                "`{}` of type {} has no field `{}`",
                                arg, view, name
                            )));
                        }
                    };
                    let field = self.model.record_type(record).field(name).cloned().ok_or_else(|| {
                        LoadError::broken(
                            self.location,
                            format!("record `{}` has no field `{}`", self.model.record_type_key(record), name),
                        )
                    })?;
                    if !arg.dereference_operations.contains(&DerefOp::Field) {
                        arg.dereference_operations.push(DerefOp::Field);
                    }
                    arg.fields.push(field);
                }
                Step::Index(index) => {
                    let view = arg.value_type();
                    let op = match view.outer() {
                        Some(TypeSpecifier::Array) => DerefOp::ArrayIndex,
                        Some(TypeSpecifier::Slice) => DerefOp::SliceIndex,
                        _ => {
                            return Err(self.invalid(format!("`{}` of type {} cannot be indexed", arg, view)));
                        }
                    };
                    let index = self.resolve(index)?;
                    if index.pass_by == PassBy::Reference || !index.value_type().is_scalar(TypeCode::I32) {
                        return Err(self.invalid(format!("index `{}` must be an i32", index)));
                    }
                    push_step(&mut arg, op, Some(index));
                }
            }
        }

        if path.reference {
            arg.pass_by = PassBy::Reference;
            arg.is_inner_reference = crosses_reference(&arg);
            arg.total_size = POINTER_SIZE;
        } else {
            arg.total_size = arg.value_type().size();
        }
        Ok(arg)
    }
}

/// The descriptor new steps extend: the root until a field has been
/// selected, the last selected field afterwards.
fn chain_owner(arg: &mut Argument) -> &mut Argument {
    if arg.dereference_operations.contains(&DerefOp::Field) && !arg.fields.is_empty() {
        let last = arg.fields.len() - 1;
        &mut arg.fields[last]
    } else {
        arg
    }
}

fn push_step(arg: &mut Argument, op: DerefOp, index: Option<Argument>) {
    let owner = chain_owner(arg);
    owner.dereference_operations.push(op);
    owner.indexes.extend(index);
}

/// Pointers are dereferenced implicitly before `.field` and `[index]`.
fn follow_pointers(arg: &mut Argument) {
    while arg.value_type().is_pointer() {
        push_step(arg, DerefOp::Pointer, None);
    }
}

fn crosses_reference(arg: &Argument) -> bool {
    arg.dereference_operations
        .iter()
        .any(|op| matches!(op, DerefOp::Pointer | DerefOp::SliceIndex))
        || arg.fields.iter().any(crosses_reference)
}
