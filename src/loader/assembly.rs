//! Serde types of the JSON program assembly format.
//!
//! ```json
//! {
//!   "entry": "main.main",
//!   "packages": [{
//!     "name": "main",
//!     "imports": ["math"],
//!     "records": [{ "name": "Point", "fields": [{ "name": "x", "type": "i32" }] }],
//!     "globals": [{ "name": "out", "type": "i32" }],
//!     "functions": [{
//!       "name": "main",
//!       "locals": [{ "name": "r", "type": "i32" }],
//!       "body": [
//!         { "call": "math.add", "inputs": ["i32:2", "i32:3"], "outputs": ["r"] },
//!         { "op": "identity", "inputs": ["r"], "outputs": ["out"] }
//!       ]
//!     }]
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};

fn default_entry() -> String {
    "main.main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assembly {
    /// `package.function` key of the function `run` starts with.
    #[serde(default = "default_entry")]
    pub entry: String,
    pub packages: Vec<PackageSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSource {
    pub name: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub records: Vec<RecordSource>,
    #[serde(default)]
    pub globals: Vec<VarSource>,
    #[serde(default)]
    pub functions: Vec<FunctionSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordSource {
    pub name: String,
    pub fields: Vec<VarSource>,
}

/// A named, typed storage declaration.
///
/// Types read outermost first: `*Point`, `[]i32`, `[3][4]f64`, `*[]str`,
/// `geo.Point`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarSource {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl VarSource {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSource {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<VarSource>,
    #[serde(default)]
    pub outputs: Vec<VarSource>,
    #[serde(default)]
    pub locals: Vec<VarSource>,
    #[serde(default)]
    pub body: Vec<InstructionSource>,
}

/// One instruction. At most one of `op`, `call`, `jump` and `goto` is set;
/// with none of them the instruction declares (zero-fills) its outputs.
///
/// Operands are written as text: `x`, `*p`, `p.x`, `a[2]`, `s[i].f`, `&x`,
/// `pkg.global`, and literals `i32:5`, `i64:-1`, `f64:1.5`, `bool:true`,
/// `str:hello`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstructionSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Native operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// Composite function: `name` in the same package or `package.name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    /// Condition operand of a conditional jump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<String>,
    /// Target label of an unconditional jump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// Jump target when the condition holds; the next instruction if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    /// Jump target when the condition fails; the next instruction if absent.
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// `enter` or `exit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_assembly() {
        let source = r#"{
            "packages": [{
                "name": "main",
                "functions": [{
                    "name": "main",
                    "locals": [{ "name": "x", "type": "i32" }],
                    "body": [
                        { "outputs": ["x"] },
                        { "label": "top", "jump": "b", "then": "top", "else": "return" }
                    ]
                }]
            }]
        }"#;
        let assembly: Assembly = serde_json::from_str(source).unwrap();
        assert_eq!(assembly.entry, "main.main");
        let body = &assembly.packages[0].functions[0].body;
        assert_eq!(body[0].outputs, vec!["x".to_string()]);
        assert_eq!(body[1].otherwise.as_deref(), Some("return"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let source = r#"{ "packages": [{ "name": "main", "fns": [] }] }"#;
        assert!(serde_json::from_str::<Assembly>(source).is_err());
    }
}
