use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Static type of a variable, parameter, return value or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    /// Not yet computed. Never reaches the VM.
    Invalid,
    Void,
    Double,
    Int,
    String,
}

impl VarType {
    pub fn is_numeric(self) -> bool {
        matches!(self, VarType::Int | VarType::Double)
    }

    /// True for the types a variable or parameter can have.
    pub fn is_storable(self) -> bool {
        matches!(self, VarType::Int | VarType::Double | VarType::String)
    }

    pub fn name(self) -> &'static str {
        match self {
            VarType::Invalid => "<invalid>",
            VarType::Void => "void",
            VarType::Double => "double",
            VarType::Int => "int",
            VarType::String => "string",
        }
    }

    /// Value a freshly created activation slot of this type holds.
    pub fn default_value(self) -> Option<Value> {
        match self {
            VarType::Int => Some(Value::Int(0)),
            VarType::Double => Some(Value::Double(0.0)),
            VarType::String => Some(Value::string("")),
            VarType::Void | VarType::Invalid => None,
        }
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to string data.
///
/// Strings are never owned by the VM: they either live in the program's
/// constant pool or were handed over by the host (native call results and
/// initial bindings).
#[derive(Debug, Clone, PartialEq)]
pub enum StrRef {
    /// Index into the constant pool.
    Const(u16),

    /// Host-provided string.
    Host(Rc<str>),
}

/// Runtime value.
///
/// Values are the only data that can exist on the operand stack or in an
/// activation slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit signed integer.
    Int(i64),

    /// 64-bit floating-point number.
    Double(f64),

    /// String reference.
    Str(StrRef),
}

impl Value {
    /// Build a host string value.
    pub fn string(s: &str) -> Self {
        Value::Str(StrRef::Host(Rc::from(s)))
    }

    pub fn var_type(&self) -> VarType {
        match self {
            Value::Int(_) => VarType::Int,
            Value::Double(_) => VarType::Double,
            Value::Str(_) => VarType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str_ref(&self) -> Option<&StrRef> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Host string contents. `None` for constant references, which need the
    /// program's pool to be read.
    pub fn as_host_str(&self) -> Option<&str> {
        match self {
            Value::Str(StrRef::Host(s)) => Some(s),
            _ => None,
        }
    }
}

/// A named top-level variable, as passed to and returned from `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    pub name: String,
    pub value: Value,
}

impl Var {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn var_type(&self) -> VarType {
        self.value.var_type()
    }
}

/// Canonical text of a double: shortest round-trip digits, always with a
/// fractional part or exponent (`3.0`, `0.1`, `1e21`).
pub fn format_double(n: f64) -> String {
    format!("{:?}", n)
}
