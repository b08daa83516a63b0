//! The typed value model.
//!
//! [`Value`] is a closed tagged union over the types the wire protocol and
//! the storage layer support. The set is a protocol contract: codecs dispatch
//! on the tag and never invent types outside it.

mod array;
mod document;
mod object_id;

pub use array::Array;
pub use document::Document;
pub use object_id::ObjectId;

use chrono::{DateTime, Utc};

/// A regular expression value: a pattern and its option string.
///
/// Only the `i` (case-insensitive) option is supported by the filter
/// compiler; other options are rejected when a filter is compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Self {
        Regex {
            pattern: pattern.into(),
            options: options.into(),
        }
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Array),
    Bool(bool),
    /// UTC datetime with millisecond precision.
    DateTime(DateTime<Utc>),
    Null,
    Int32(i32),
    Int64(i64),
    ObjectId(ObjectId),
    Regex(Regex),
}

impl Value {
    /// The type name used in error messages, matching MongoDB's vocabulary.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "object",
            Value::Array(_) => "array",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "date",
            Value::Null => "null",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::ObjectId(_) => "objectId",
            Value::Regex(_) => "regex",
        }
    }

    /// Builds a datetime value from milliseconds since the Unix epoch.
    pub fn date_time_from_millis(millis: i64) -> Option<Value> {
        DateTime::from_timestamp_millis(millis).map(Value::DateTime)
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// Interprets the value as a whole number, widening int32 and accepting
    /// integral doubles. Used for numeric command arguments such as `limit`.
    pub fn as_whole_number(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(i64::from(*n)),
            Value::Int64(n) => Some(*n),
            Value::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<Regex> for Value {
    fn from(v: Regex) -> Self {
        Value::Regex(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}
