//! Types module: defines decoded constant values and document field types.
//!
//! This module provides the ConstantValue and FieldType enums shared by the decoder,
//! the decompiler and the query layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FieldType {
    ObjectId,
    String,
    Integer,
    Float,
    Bool,
    DateTime,
    Array(Box<FieldType>),
    Document,
    Unknown,
}

/// A literal operand as it appears in a closure's constant table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConstantValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ConstantValue>),
}

impl FieldType {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, FieldType::Array(_) | FieldType::Document | FieldType::Unknown)
    }

    /// Whether a scalar accumulator (`$min`, `$sum`, ...) can be applied to this field.
    pub fn is_scalar(&self) -> bool {
        self.is_primitive() && !matches!(self, FieldType::ObjectId)
    }
}

impl ConstantValue {
    /// Short variant name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConstantValue::None => "None",
            ConstantValue::Bool(_) => "bool",
            ConstantValue::Int(_) => "int",
            ConstantValue::Float(_) => "float",
            ConstantValue::Str(_) => "str",
            ConstantValue::Tuple(_) => "tuple",
        }
    }

    /// Infers the document field type this literal would be stored as.
    pub fn field_type(&self) -> FieldType {
        match self {
            ConstantValue::None => FieldType::Unknown,
            ConstantValue::Bool(_) => FieldType::Bool,
            ConstantValue::Int(_) => FieldType::Integer,
            ConstantValue::Float(_) => FieldType::Float,
            ConstantValue::Str(_) => FieldType::String,
            ConstantValue::Tuple(items) => {
                let first = items.first().map(|v| v.field_type());
                match first {
                    Some(ty) if items.iter().all(|v| v.field_type() == ty) => FieldType::Array(Box::new(ty)),
                    _ => FieldType::Array(Box::new(FieldType::Unknown)),
                }
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstantValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the literal into its JSON document form. Tuples become arrays and
    /// non-finite floats become `null`, as JSON has no representation for them.
    pub fn to_json(&self) -> Value {
        match self {
            ConstantValue::None => Value::Null,
            ConstantValue::Bool(b) => Value::Bool(*b),
            ConstantValue::Int(i) => Value::from(*i),
            ConstantValue::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            ConstantValue::Str(s) => Value::String(s.clone()),
            ConstantValue::Tuple(items) => Value::Array(items.iter().map(ConstantValue::to_json).collect()),
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::None => write!(f, "None"),
            ConstantValue::Bool(true) => write!(f, "True"),
            ConstantValue::Bool(false) => write!(f, "False"),
            ConstantValue::Int(i) => write!(f, "{}", i),
            ConstantValue::Float(x) => write!(f, "{:?}", x),
            ConstantValue::Str(s) => write!(f, "{:?}", s),
            ConstantValue::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for ConstantValue {
    fn from(s: &str) -> Self {
        ConstantValue::Str(s.to_string())
    }
}

impl From<i64> for ConstantValue {
    fn from(i: i64) -> Self {
        ConstantValue::Int(i)
    }
}
