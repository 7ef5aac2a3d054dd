//! Value types for pinstore
//!
//! This module defines:
//! - Value: the typed value of a pin property
//! - ValueType: the type tag a key segment declares
//!
//! ## Type Rules
//!
//! - Different types are never equal: `Int(1) != Float(1.0)`
//! - Ordering comparisons (used by conditions) are numeric across
//!   `Int`/`Float`, and otherwise only defined within one type
//! - `Array` is the collection type; a collection-valued property is
//!   matched and indexed element by element

use crate::timestamp::Timestamp;
use crate::types::PinId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Typed value of a pin property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Point in time
    Timestamp(Timestamp),
    /// Reference to another pin
    Ref(PinId),
    /// Collection of values
    Array(Vec<Value>),
}

// IEEE-754 float semantics: NaN != NaN, -0.0 == 0.0
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

/// Declared type of an index segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// Boolean
    Bool = 1,
    /// Signed integer
    Int = 2,
    /// Floating point
    Float = 3,
    /// UTF-8 string
    String = 4,
    /// Raw bytes
    Bytes = 5,
    /// Timestamp
    Timestamp = 6,
    /// Pin reference
    Ref = 7,
}

impl ValueType {
    /// Byte used by the key-format descriptor
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Inverse of [`ValueType::as_byte`]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ValueType::Bool),
            2 => Some(ValueType::Int),
            3 => Some(ValueType::Float),
            4 => Some(ValueType::String),
            5 => Some(ValueType::Bytes),
            6 => Some(ValueType::Timestamp),
            7 => Some(ValueType::Ref),
            _ => None,
        }
    }

    /// Type name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "Bool",
            ValueType::Int => "Int",
            ValueType::Float => "Float",
            ValueType::String => "String",
            ValueType::Bytes => "Bytes",
            ValueType::Timestamp => "Timestamp",
            ValueType::Ref => "Ref",
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Timestamp(_) => "Timestamp",
            Value::Ref(_) => "Ref",
            Value::Array(_) => "Array",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this is a collection
    pub fn is_collection(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as timestamp; integers are read as microseconds
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::Int(i) if *i >= 0 => Some(Timestamp::from_micros(*i as u64)),
            _ => None,
        }
    }

    /// Scalar elements of this value
    ///
    /// A collection yields its elements (flattened one level, nulls
    /// dropped), a scalar yields itself, null yields nothing.
    pub fn elements(&self) -> Vec<&Value> {
        match self {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
            other => vec![other],
        }
    }

    /// Order two scalar values
    ///
    /// Returns `None` when the values are not comparable (different,
    /// non-numeric types, NaN, or collections).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Ref(a), Value::Ref(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}
