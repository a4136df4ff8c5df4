//! Property values and their data types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of a property on a mesh object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean value
    Boolean(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Opaque bytes
    Blob(Vec<u8>),
    /// Milliseconds since the epoch
    Timestamp(i64),
}

impl PropertyValue {
    /// Data type of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Integer(_) => DataType::Integer,
            Self::Float(_) => DataType::Float,
            Self::String(_) => DataType::String,
            Self::Blob(_) => DataType::Blob,
            Self::Timestamp(_) => DataType::Timestamp,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{:?}", v),
            Self::Blob(v) => write!(f, "<{} bytes>", v.len()),
            Self::Timestamp(v) => write!(f, "@{}", v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Data type declared by a property type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean
    Boolean,
    /// Signed integer
    Integer,
    /// Floating point
    Float,
    /// UTF-8 string
    String,
    /// Opaque bytes
    Blob,
    /// Milliseconds since the epoch
    Timestamp,
}

impl DataType {
    /// Whether a value may be assigned to a property of this type
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        value.data_type() == *self
    }
}
