//! Text syntax of type names and instruction operands.
//!
//! ```text
//! type    := ('*' | '[]' | '[' N ']')* base
//! base    := primitive | Record | package '.' Record
//!
//! operand := literal | '&'? '*'* name step*
//! step    := '.' name | '[' index ']'
//! index   := operand | integer
//! literal := kind ':' text | integer
//! ```

use std::fmt;

use crate::program::model::{TypeCode, TypeSpecifier};

/// A parsed type name, not yet resolved against the model.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSyntax {
    pub specifiers: Vec<TypeSpecifier>,
    pub lengths: Vec<u32>,
    pub base: BaseSyntax,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BaseSyntax {
    Primitive(TypeCode),
    Record {
        package: Option<String>,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

impl Literal {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Literal::Bool(_) => TypeCode::Bool,
            Literal::I32(_) => TypeCode::I32,
            Literal::I64(_) => TypeCode::I64,
            Literal::F64(_) => TypeCode::F64,
            Literal::Str(_) => TypeCode::Str,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperandSyntax {
    Literal(Literal),
    Path(PathSyntax),
}

/// A named operand with its addressing steps.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSyntax {
    /// `&` prefix: pass the address instead of the value.
    pub reference: bool,
    /// Number of leading `*`.
    pub derefs: usize,
    pub root: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(String),
    Index(Box<OperandSyntax>),
}

impl fmt::Display for OperandSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandSyntax::Literal(Literal::Bool(v)) => write!(f, "bool:{}", v),
            OperandSyntax::Literal(Literal::I32(v)) => write!(f, "{}", v),
            OperandSyntax::Literal(Literal::I64(v)) => write!(f, "i64:{}", v),
            OperandSyntax::Literal(Literal::F64(v)) => write!(f, "f64:{}", v),
            OperandSyntax::Literal(Literal::Str(v)) => write!(f, "str:{}", v),
            OperandSyntax::Path(path) => {
                if path.reference {
                    write!(f, "&")?;
                }
                write!(f, "{}{}", "*".repeat(path.derefs), path.root)?;
                for step in &path.steps {
                    match step {
                        Step::Field(name) => write!(f, ".{}", name)?,
                        Step::Index(index) => write!(f, "[{}]", index)?,
                    }
                }
                Ok(())
            }
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_name(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(is_name_start) && chars.all(is_name_char)
}

// =============================================================================
// Types
// =============================================================================

pub fn parse_type(text: &str) -> Result<TypeSyntax, String> {
    let mut rest = text.trim();
    let mut specifiers = Vec::new();
    let mut lengths = Vec::new();

    loop {
        if let Some(after) = rest.strip_prefix('*') {
            specifiers.push(TypeSpecifier::Pointer);
            rest = after;
        } else if let Some(after) = rest.strip_prefix("[]") {
            specifiers.push(TypeSpecifier::Slice);
            rest = after;
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after
                .find(']')
                .ok_or_else(|| format!("unclosed `[` in type `{}`", text))?;
            let length: u32 = after[..close]
                .trim()
                .parse()
                .map_err(|_| format!("invalid array length `{}` in type `{}`", &after[..close], text))?;
            specifiers.push(TypeSpecifier::Array);
            lengths.push(length);
            rest = &after[close + 1..];
        } else {
            break;
        }
    }

    let base = if let Some(code) = TypeCode::from_name(rest) {
        BaseSyntax::Primitive(code)
    } else {
        let (package, name) = match rest.split_once('.') {
            Some((package, name)) => (Some(package.to_string()), name),
            None => (None, rest),
        };
        if !is_name(name) || package.as_deref().is_some_and(|p| !is_name(p)) {
            return Err(format!("invalid type `{}`", text));
        }
        BaseSyntax::Record {
            package,
            name: name.to_string(),
        }
    };
    Ok(TypeSyntax {
        specifiers,
        lengths,
        base,
    })
}

// =============================================================================
// Operands
// =============================================================================

pub fn parse_operand(text: &str) -> Result<OperandSyntax, String> {
    // A string literal's value runs verbatim to the end of the operand.
    let text = text.trim_start();
    if let Some(value) = text.strip_prefix("str:") {
        return Ok(OperandSyntax::Literal(Literal::Str(value.to_string())));
    }
    let text = text.trim_end();
    if text.is_empty() {
        return Err("empty operand".to_string());
    }
    if let Some(literal) = parse_literal(text)? {
        return Ok(OperandSyntax::Literal(literal));
    }
    let mut parser = Parser {
        text,
        chars: text.char_indices().peekable(),
    };
    let path = parser.path()?;
    if let Some((at, c)) = parser.chars.next() {
        return Err(format!("unexpected `{}` at {} in `{}`", c, at, text));
    }
    Ok(OperandSyntax::Path(path))
}

fn parse_literal(text: &str) -> Result<Option<Literal>, String> {
    if text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return text
            .parse()
            .map(|v| Some(Literal::I32(v)))
            .map_err(|_| format!("invalid i32 literal `{}`", text));
    }
    let Some((kind, value)) = text.split_once(':').filter(|(kind, _)| is_name(kind)) else {
        return Ok(None);
    };
    let invalid = || format!("invalid {} literal `{}`", kind, value);
    let literal = match kind {
        "bool" => Literal::Bool(value.parse().map_err(|_| invalid())?),
        "i32" => Literal::I32(value.parse().map_err(|_| invalid())?),
        "i64" => Literal::I64(value.parse().map_err(|_| invalid())?),
        "f64" => Literal::F64(value.parse().map_err(|_| invalid())?),
        _ => return Err(format!("unknown literal kind `{}`", kind)),
    };
    Ok(Some(literal))
}

struct Parser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn path(&mut self) -> Result<PathSyntax, String> {
        let reference = self.eat('&');
        let mut derefs = 0;
        while self.eat('*') {
            derefs += 1;
        }
        let root = self.name()?;
        let mut steps = Vec::new();
        loop {
            if self.eat('.') {
                steps.push(Step::Field(self.name()?));
            } else if self.eat('[') {
                let inner = self.bracketed()?;
                steps.push(Step::Index(Box::new(parse_operand(inner)?)));
            } else {
                break;
            }
        }
        Ok(PathSyntax {
            reference,
            derefs,
            root,
            steps,
        })
    }

    fn name(&mut self) -> Result<String, String> {
        let start = match self.chars.peek() {
            Some((at, c)) if is_name_start(*c) => *at,
            Some((at, c)) => return Err(format!("expected a name at {} in `{}`, found `{}`", at, self.text, c)),
            None => return Err(format!("expected a name at the end of `{}`", self.text)),
        };
        let mut end = start;
        while let Some((at, c)) = self.chars.peek().copied() {
            if !is_name_char(c) {
                break;
            }
            end = at + c.len_utf8();
            self.chars.next();
        }
        Ok(self.text[start..end].to_string())
    }

    /// Text up to the `]` matching an already consumed `[`.
    fn bracketed(&mut self) -> Result<&'a str, String> {
        let start = match self.chars.peek() {
            Some((at, _)) => *at,
            None => return Err(format!("unclosed `[` in `{}`", self.text)),
        };
        let mut depth = 1;
        for (at, c) in self.chars.by_ref() {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(&self.text[start..at]);
                    }
                }
                _ => {}
            }
        }
        Err(format!("unclosed `[` in `{}`", self.text))
    }
}
