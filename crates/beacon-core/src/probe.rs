// ABOUTME: Defines probe values, their SQL column types, and the Sampler capability.
// ABOUTME: Type inference maps a sampled value onto the column type used in the status table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared column type of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    Integer,
    Float,
    Varchar,
    Timestamp,
    Blob,
}

impl SqlType {
    /// The type name as rendered in the CREATE TABLE statement.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Float => "FLOAT",
            SqlType::Varchar => "VARCHAR",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Blob => "BLOB",
        }
    }

    /// Guess a column type from a sampled value. Text, integral and
    /// floating values map onto their own types; everything else is a BLOB.
    pub fn infer(value: &ProbeValue) -> Self {
        match value {
            ProbeValue::Text(_) => SqlType::Varchar,
            ProbeValue::Integer(_) => SqlType::Integer,
            ProbeValue::Float(_) => SqlType::Float,
            ProbeValue::Null | ProbeValue::Timestamp(_) | ProbeValue::Blob(_) => SqlType::Blob,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A single value produced by a probe and bound into the status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl ProbeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ProbeValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ProbeValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ProbeValue::Float(v) => Some(*v),
            ProbeValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ProbeValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for ProbeValue {
    fn from(v: i64) -> Self {
        ProbeValue::Integer(v)
    }
}

impl From<i32> for ProbeValue {
    fn from(v: i32) -> Self {
        ProbeValue::Integer(v.into())
    }
}

impl From<u32> for ProbeValue {
    fn from(v: u32) -> Self {
        ProbeValue::Integer(v.into())
    }
}

impl From<bool> for ProbeValue {
    fn from(v: bool) -> Self {
        ProbeValue::Integer(v.into())
    }
}

impl From<f64> for ProbeValue {
    fn from(v: f64) -> Self {
        ProbeValue::Float(v)
    }
}

impl From<f32> for ProbeValue {
    fn from(v: f32) -> Self {
        ProbeValue::Float(v.into())
    }
}

impl From<String> for ProbeValue {
    fn from(v: String) -> Self {
        ProbeValue::Text(v)
    }
}

impl From<&str> for ProbeValue {
    fn from(v: &str) -> Self {
        ProbeValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for ProbeValue {
    fn from(v: DateTime<Utc>) -> Self {
        ProbeValue::Timestamp(v)
    }
}

impl From<Vec<u8>> for ProbeValue {
    fn from(v: Vec<u8>) -> Self {
        ProbeValue::Blob(v)
    }
}

impl<T: Into<ProbeValue>> From<Option<T>> for ProbeValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ProbeValue::Null, Into::into)
    }
}

/// A probe sampler raised an error while producing its value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProbeError {
    message: String,
}

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The textual description recorded in the `error` column.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Source of a fresh probe value, invoked on the polling thread at every tick.
///
/// Any `FnMut() -> Result<V, E>` closure is a sampler when `V` converts into
/// a [`ProbeValue`] and `E` can be displayed; infallible samplers can return
/// `Result<V, std::convert::Infallible>`.
///
/// Only a returned error counts against the beacon's failure budget. A
/// sampler that panics kills the polling thread without finalizing the
/// status file, and `Beacon::shutdown` then reports `LoopPanicked`.
pub trait Sampler: Send {
    fn sample(&mut self) -> Result<ProbeValue, ProbeError>;
}

impl<F, V, E> Sampler for F
where
    F: FnMut() -> Result<V, E> + Send,
    V: Into<ProbeValue>,
    E: fmt::Display,
{
    fn sample(&mut self) -> Result<ProbeValue, ProbeError> {
        self().map(Into::into).map_err(|e| ProbeError::new(e.to_string()))
    }
}
