//! The Program Model: packages, functions, instructions, operand
//! descriptors and record types.
//!
//! Nodes refer to each other through arena ids that are resolved once, at
//! link time. Names are kept for diagnostics and for the serialized format.

use std::fmt;

use super::arena::{Arena, Id};
use crate::error::VmError;
use crate::vm::memory::POINTER_SIZE;
use crate::vm::ops::Opcode;

pub type PackageId = Id<Package>;
pub type FunctionId = Id<Function>;
pub type RecordTypeId = Id<RecordType>;

/// Primitive type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    Bool = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    UI8 = 6,
    UI16 = 7,
    UI32 = 8,
    UI64 = 9,
    F32 = 10,
    F64 = 11,
    Str = 12,
    Record = 13,
}

impl TypeCode {
    /// Storage size of a value of this type. Strings are references to heap
    /// objects; records report 0 and take their size from the record type.
    pub fn size(self) -> u32 {
        match self {
            TypeCode::Bool | TypeCode::I8 | TypeCode::UI8 => 1,
            TypeCode::I16 | TypeCode::UI16 => 2,
            TypeCode::I32 | TypeCode::UI32 | TypeCode::F32 => 4,
            TypeCode::I64 | TypeCode::UI64 | TypeCode::F64 => 8,
            TypeCode::Str => POINTER_SIZE,
            TypeCode::Record => 0,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "bool" => TypeCode::Bool,
            "i8" => TypeCode::I8,
            "i16" => TypeCode::I16,
            "i32" => TypeCode::I32,
            "i64" => TypeCode::I64,
            "ui8" => TypeCode::UI8,
            "ui16" => TypeCode::UI16,
            "ui32" => TypeCode::UI32,
            "ui64" => TypeCode::UI64,
            "f32" => TypeCode::F32,
            "f64" => TypeCode::F64,
            "str" => TypeCode::Str,
            _ => return None,
        };
        Some(code)
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeCode::Bool => "bool",
            TypeCode::I8 => "i8",
            TypeCode::I16 => "i16",
            TypeCode::I32 => "i32",
            TypeCode::I64 => "i64",
            TypeCode::UI8 => "ui8",
            TypeCode::UI16 => "ui16",
            TypeCode::UI32 => "ui32",
            TypeCode::UI64 => "ui64",
            TypeCode::F32 => "f32",
            TypeCode::F64 => "f64",
            TypeCode::Str => "str",
            TypeCode::Record => "record",
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        let code = match raw {
            1 => TypeCode::Bool,
            2 => TypeCode::I8,
            3 => TypeCode::I16,
            4 => TypeCode::I32,
            5 => TypeCode::I64,
            6 => TypeCode::UI8,
            7 => TypeCode::UI16,
            8 => TypeCode::UI32,
            9 => TypeCode::UI64,
            10 => TypeCode::F32,
            11 => TypeCode::F64,
            12 => TypeCode::Str,
            13 => TypeCode::Record,
            _ => return None,
        };
        Some(code)
    }
}

/// Type constructors, outermost first: `*[]i32` is `[Pointer, Slice]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeSpecifier {
    Pointer = 1,
    /// Fixed-size array; its length is the next unused entry of `lengths`.
    Array = 2,
    /// Dynamic array: a reference to a heap object with a capacity+length header.
    Slice = 3,
}

impl TypeSpecifier {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TypeSpecifier::Pointer),
            2 => Some(TypeSpecifier::Array),
            3 => Some(TypeSpecifier::Slice),
            _ => None,
        }
    }
}

/// One step of an operand's addressing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DerefOp {
    Pointer = 1,
    ArrayIndex = 2,
    SliceIndex = 3,
    Field = 4,
}

impl DerefOp {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(DerefOp::Pointer),
            2 => Some(DerefOp::ArrayIndex),
            3 => Some(DerefOp::SliceIndex),
            4 => Some(DerefOp::Field),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PassBy {
    #[default]
    Value = 0,
    Reference = 1,
}

/// Lexical scope marker carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Scope {
    #[default]
    None = 0,
    Enter = 1,
    Exit = 2,
}

impl Scope {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Scope::None),
            1 => Some(Scope::Enter),
            2 => Some(Scope::Exit),
            _ => None,
        }
    }
}

/// Byte size of a type given its specifiers (outermost first), the fixed
/// array lengths they consume, and the size of the base type.
pub fn size_of(specifiers: &[TypeSpecifier], lengths: &[u32], base_size: u32) -> u32 {
    match specifiers.split_first() {
        None => base_size,
        Some((TypeSpecifier::Pointer | TypeSpecifier::Slice, _)) => POINTER_SIZE,
        Some((TypeSpecifier::Array, rest)) => {
            let (count, rest_lengths) = match lengths.split_first() {
                Some((count, rest_lengths)) => (*count, rest_lengths),
                None => (0, &[][..]),
            };
            count.saturating_mul(size_of(rest, rest_lengths, base_size))
        }
    }
}

/// A borrowed view of a (possibly partially dereferenced) type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeView<'a> {
    pub specifiers: &'a [TypeSpecifier],
    pub lengths: &'a [u32],
    pub type_code: TypeCode,
    pub record_type: Option<RecordTypeId>,
    pub base_size: u32,
}

impl<'a> TypeView<'a> {
    pub fn size(&self) -> u32 {
        size_of(self.specifiers, self.lengths, self.base_size)
    }

    pub fn outer(&self) -> Option<TypeSpecifier> {
        self.specifiers.first().copied()
    }

    /// The type with its outermost specifier removed.
    pub fn rest(&self) -> TypeView<'a> {
        match self.specifiers.split_first() {
            None => *self,
            Some((spec, rest)) => {
                let lengths = if *spec == TypeSpecifier::Array && !self.lengths.is_empty() {
                    &self.lengths[1..]
                } else {
                    self.lengths
                };
                TypeView {
                    specifiers: rest,
                    lengths,
                    ..*self
                }
            }
        }
    }

    /// Whether a value of this type is itself a heap reference.
    pub fn is_reference(&self) -> bool {
        match self.outer() {
            Some(TypeSpecifier::Pointer | TypeSpecifier::Slice) => true,
            Some(TypeSpecifier::Array) => false,
            None => self.type_code == TypeCode::Str,
        }
    }

    pub fn is_scalar(&self, code: TypeCode) -> bool {
        self.specifiers.is_empty() && self.type_code == code
    }

    pub fn is_slice(&self) -> bool {
        self.outer() == Some(TypeSpecifier::Slice)
    }

    pub fn is_pointer(&self) -> bool {
        self.outer() == Some(TypeSpecifier::Pointer)
    }

    pub fn is_str(&self) -> bool {
        self.is_scalar(TypeCode::Str)
    }
}

impl fmt::Display for TypeView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lengths = self.lengths.iter();
        for spec in self.specifiers {
            match spec {
                TypeSpecifier::Pointer => write!(f, "*")?,
                TypeSpecifier::Slice => write!(f, "[]")?,
                TypeSpecifier::Array => write!(f, "[{}]", lengths.next().copied().unwrap_or(0))?,
            }
        }
        match self.record_type {
            Some(id) => write!(f, "record#{}", id.index()),
            None => write!(f, "{}", self.type_code.name()),
        }
    }
}

/// Operand descriptor: where a value lives and how to reach it.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Empty for literals.
    pub name: String,
    pub type_code: TypeCode,
    pub record_type: Option<RecordTypeId>,
    /// Declared type constructors of the named storage, outermost first.
    pub specifiers: Vec<TypeSpecifier>,
    /// Fixed-array dimensions, in the order the `Array` specifiers appear.
    pub lengths: Vec<u32>,
    /// Frame-relative when below the stack size, absolute otherwise. For a
    /// field descriptor, the offset inside its record.
    pub offset: u32,
    /// Size of the base type.
    pub size: u32,
    /// Size of the value this operand designates.
    pub total_size: u32,
    pub pass_by: PassBy,
    /// `&` applied to something inside a heap object.
    pub is_inner_reference: bool,
    pub dereference_operations: Vec<DerefOp>,
    /// One index operand per array/slice step, in chain order.
    pub indexes: Vec<Argument>,
    /// Field descents applied by a `Field` step, in order.
    pub fields: Vec<Argument>,
}

impl Argument {
    /// A plain named slot with no addressing chain.
    pub fn new(name: impl Into<String>, type_code: TypeCode, size: u32) -> Self {
        Self {
            name: name.into(),
            type_code,
            record_type: None,
            specifiers: Vec::new(),
            lengths: Vec::new(),
            offset: 0,
            size,
            total_size: size,
            pass_by: PassBy::Value,
            is_inner_reference: false,
            dereference_operations: Vec::new(),
            indexes: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.name.is_empty()
    }

    /// The declared type of the named storage.
    pub fn declared_type(&self) -> TypeView<'_> {
        TypeView {
            specifiers: &self.specifiers,
            lengths: &self.lengths,
            type_code: self.type_code,
            record_type: self.record_type,
            base_size: self.size,
        }
    }

    /// The type of the value designated once the whole chain is applied.
    pub fn value_type(&self) -> TypeView<'_> {
        if self.dereference_operations.contains(&DerefOp::Field) {
            if let Some(last) = self.fields.last() {
                return last.value_type();
            }
        }
        let steps = self
            .dereference_operations
            .iter()
            .filter(|op| **op != DerefOp::Field)
            .count();
        let mut view = self.declared_type();
        for _ in 0..steps {
            view = view.rest();
        }
        view
    }

    /// Element stride for the indexing step that consumes the specifier at
    /// `depth` (0 = outermost).
    pub fn stride_at(&self, depth: usize) -> u32 {
        let mut view = self.declared_type();
        for _ in 0..=depth {
            view = view.rest();
        }
        view.size()
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pass_by == PassBy::Reference {
            write!(f, "&")?;
        }
        let mut rendered = if self.is_literal() {
            format!("<{}@{}>", self.type_code.name(), self.offset)
        } else {
            self.name.clone()
        };
        render_chain(self, &mut rendered);
        write!(f, "{}", rendered)
    }
}

fn render_chain(arg: &Argument, out: &mut String) {
    let mut indexes = arg.indexes.iter();
    for op in &arg.dereference_operations {
        match op {
            DerefOp::Pointer => *out = format!("(*{})", out),
            DerefOp::ArrayIndex | DerefOp::SliceIndex => {
                let index = indexes
                    .next()
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "?".to_string());
                out.push('[');
                out.push_str(&index);
                out.push(']');
            }
            DerefOp::Field => {
                for field in &arg.fields {
                    out.push('.');
                    out.push_str(&field.name);
                    let mut inner = String::new();
                    render_chain(field, &mut inner);
                    out.push_str(&inner);
                }
            }
        }
    }
}

/// What an instruction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// A registered native operation.
    Native(Opcode),
    /// A composite function call.
    Call(FunctionId),
    /// Conditional jump on a boolean input: `ThenLines` or `ElseLines`.
    Jump,
    /// Unconditional jump by `ThenLines`.
    Goto,
}

/// One instruction of a composite function.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// `None` declares the outputs: their storage is zero-filled.
    pub operator: Option<Operator>,
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
    pub then_lines: i32,
    pub else_lines: i32,
    pub scope: Scope,
    pub label: Option<String>,
}

impl Expression {
    pub fn new(operator: Option<Operator>) -> Self {
        Self {
            operator,
            inputs: Vec::new(),
            outputs: Vec::new(),
            then_lines: 0,
            else_lines: 0,
            scope: Scope::None,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub package: PackageId,
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
    pub expressions: Vec<Expression>,
    /// Frame size in bytes: parameters, outputs and locals.
    pub size: u32,
    /// Frame slots holding heap references; the collector's roots.
    pub list_of_pointers: Vec<Argument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    pub name: String,
    pub package: PackageId,
    /// Field descriptors; each `offset` is relative to the record start.
    pub fields: Vec<Argument>,
    pub size: u32,
}

impl RecordType {
    pub fn field(&self, name: &str) -> Option<&Argument> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    pub imports: Vec<PackageId>,
    pub record_types: Vec<RecordTypeId>,
    pub functions: Vec<FunctionId>,
    /// Global storage, addressed absolutely inside the data segment.
    pub globals: Vec<Argument>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            record_types: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn global(&self, name: &str) -> Option<&Argument> {
        self.globals.iter().find(|g| g.name == name)
    }
}

/// The whole linked program graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub packages: Arena<Package>,
    pub functions: Arena<Function>,
    pub record_types: Arena<RecordType>,
    /// Function run by `Program::start`.
    pub entry: Option<FunctionId>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, package: Package) -> PackageId {
        self.packages.alloc(package)
    }

    /// Add a function and register it with its package.
    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let package = function.package;
        let id = self.functions.alloc(function);
        self.packages[package].functions.push(id);
        id
    }

    pub fn add_record_type(&mut self, record: RecordType) -> RecordTypeId {
        let package = record.package;
        let id = self.record_types.alloc(record);
        self.packages[package].record_types.push(id);
        id
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id]
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id]
    }

    pub fn record_type(&self, id: RecordTypeId) -> &RecordType {
        &self.record_types[id]
    }

    pub fn find_package(&self, name: &str) -> Result<PackageId, VmError> {
        self.packages
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, _)| id)
            .ok_or_else(|| VmError::BrokenReference(format!("package `{}`", name)))
    }

    pub fn find_function(&self, package: PackageId, name: &str) -> Result<FunctionId, VmError> {
        self.packages[package]
            .functions
            .iter()
            .copied()
            .find(|id| self.functions[*id].name == name)
            .ok_or_else(|| {
                VmError::BrokenReference(format!(
                    "function `{}.{}`",
                    self.packages[package].name, name
                ))
            })
    }

    /// Look a function up by its `package.name` key.
    pub fn find_function_by_key(&self, key: &str) -> Result<FunctionId, VmError> {
        let (package, name) = key
            .rsplit_once('.')
            .ok_or_else(|| VmError::BrokenReference(format!("function `{}`", key)))?;
        self.find_function(self.find_package(package)?, name)
    }

    pub fn find_record_type(&self, package: PackageId, name: &str) -> Result<RecordTypeId, VmError> {
        self.packages[package]
            .record_types
            .iter()
            .copied()
            .find(|id| self.record_types[*id].name == name)
            .ok_or_else(|| {
                VmError::BrokenReference(format!(
                    "record type `{}.{}`",
                    self.packages[package].name, name
                ))
            })
    }

    /// Size of a value with the given base type, reading record sizes from
    /// the model.
    pub fn base_size(&self, type_code: TypeCode, record_type: Option<RecordTypeId>) -> u32 {
        match record_type {
            Some(id) => self.record_types[id].size,
            None => type_code.size(),
        }
    }

    /// Whether a value of this type contains heap references anywhere
    /// inside it, directly or through arrays and record fields.
    pub fn holds_references(&self, view: &TypeView<'_>) -> bool {
        match view.outer() {
            Some(TypeSpecifier::Pointer | TypeSpecifier::Slice) => true,
            Some(TypeSpecifier::Array) => self.holds_references(&view.rest()),
            None => match view.record_type {
                Some(id) => self.record_types[id]
                    .fields
                    .iter()
                    .any(|field| self.holds_references(&field.declared_type())),
                None => view.type_code == TypeCode::Str,
            },
        }
    }

    pub fn function_key(&self, id: FunctionId) -> String {
        let function = &self.functions[id];
        format!("{}.{}", self.packages[function.package].name, function.name)
    }

    pub fn record_type_key(&self, id: RecordTypeId) -> String {
        let record = &self.record_types[id];
        format!("{}.{}", self.packages[record.package].name, record.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_of_i32_arrays() -> Argument {
        // [][3]i32
        let mut arg = Argument::new("m", TypeCode::I32, 4);
        arg.specifiers = vec![TypeSpecifier::Slice, TypeSpecifier::Array];
        arg.lengths = vec![3];
        arg.total_size = arg.declared_type().size();
        arg
    }

    #[test]
    fn test_size_of_nested_types() {
        assert_eq!(size_of(&[], &[], 8), 8);
        assert_eq!(size_of(&[TypeSpecifier::Array, TypeSpecifier::Array], &[2, 3], 4), 24);
        assert_eq!(size_of(&[TypeSpecifier::Array, TypeSpecifier::Slice], &[5], 8), 20);
        assert_eq!(size_of(&[TypeSpecifier::Pointer, TypeSpecifier::Array], &[100], 8), 4);
    }

    #[test]
    fn test_stride_and_value_type_follow_chain() {
        let mut arg = slice_of_i32_arrays();
        assert_eq!(arg.total_size, 4);
        assert_eq!(arg.stride_at(0), 12);
        assert_eq!(arg.stride_at(1), 4);

        arg.dereference_operations = vec![DerefOp::SliceIndex];
        let view = arg.value_type();
        assert_eq!(view.outer(), Some(TypeSpecifier::Array));
        assert_eq!(view.size(), 12);

        arg.dereference_operations.push(DerefOp::ArrayIndex);
        assert!(arg.value_type().is_scalar(TypeCode::I32));
    }

    #[test]
    fn test_value_type_of_field_chain_is_last_field() {
        let mut base = Argument::new("p", TypeCode::Record, 8);
        let field = Argument::new("y", TypeCode::F32, 4);
        base.dereference_operations = vec![DerefOp::Field];
        base.fields = vec![field];
        assert!(base.value_type().is_scalar(TypeCode::F32));
    }

    #[test]
    fn test_reference_detection() {
        let s = Argument::new("s", TypeCode::Str, 4);
        assert!(s.declared_type().is_reference());
        let arr = slice_of_i32_arrays();
        assert!(arr.declared_type().is_reference());
        assert!(!arr.declared_type().rest().is_reference());
    }

    #[test]
    fn test_display_renders_chain() {
        let mut arg = slice_of_i32_arrays();
        let mut index = Argument::new("i", TypeCode::I32, 4);
        index.offset = 4;
        arg.dereference_operations = vec![DerefOp::SliceIndex];
        arg.indexes = vec![index];
        assert_eq!(arg.to_string(), "m[i]");
    }

    #[test]
    fn test_model_lookup_by_key() {
        let mut model = Model::new();
        let main = model.add_package(Package::new("main"));
        let math = model.add_package(Package::new("math"));
        let add = model.add_function(Function {
            name: "add".to_string(),
            package: math,
            inputs: vec![],
            outputs: vec![],
            expressions: vec![],
            size: 0,
            list_of_pointers: vec![],
        });
        assert_eq!(model.find_function_by_key("math.add").unwrap(), add);
        assert_eq!(model.function_key(add), "math.add");
        assert!(matches!(
            model.find_function(main, "add"),
            Err(VmError::BrokenReference(_))
        ));
        assert!(model.find_function_by_key("nodot").is_err());
    }
}
