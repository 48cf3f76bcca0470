use std::fmt;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// The declared type of a tag. Every write is coerced into this type before
/// it reaches the store; the protocol servers rely on it never changing after
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int,
    Bool,
    String,
    Raw,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Float,
        DataType::Int,
        DataType::Bool,
        DataType::String,
        DataType::Raw,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Raw => "raw",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the last write to a tag could be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Bad => "BAD",
            Quality::Uncertain => "UNCERTAIN",
        }
    }
}

/// A current tag sample. Callers never branch on raw JSON; everything that
/// enters the store goes through [`DataType::coerce`] first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    Raw(serde_json::Value),
}

impl TagValue {
    /// The neutral value returned for reads of unknown keys or addresses.
    pub fn zero() -> TagValue {
        TagValue::Int(0)
    }

    /// Numeric view. Bools count as 0/1, numeric strings parse.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Float(v) => Some(*v),
            TagValue::Int(v) => Some(*v as f64),
            TagValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TagValue::Str(s) => s.trim().parse::<f64>().ok(),
            TagValue::Raw(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|v| v as i64)
    }

    /// Truthiness as used for single-point and coil encodings.
    pub fn is_truthy(&self) -> bool {
        match self {
            TagValue::Bool(b) => *b,
            TagValue::Str(s) => !s.is_empty(),
            other => other.as_f64().is_some_and(|v| v != 0.0),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            TagValue::Int(v) => serde_json::Value::from(*v),
            TagValue::Bool(b) => serde_json::Value::from(*b),
            TagValue::Str(s) => serde_json::Value::from(s.clone()),
            TagValue::Raw(v) => v.clone(),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Str(s) => f.write_str(s),
            TagValue::Raw(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("cannot coerce {got} into {expected}")]
pub struct CoerceError {
    pub expected: DataType,
    pub got: String,
}

impl DataType {
    /// Coerce an untyped JSON value into this data type.
    ///
    /// The rules mirror the write path of the original gateway: ints accept
    /// anything that parses as a number and truncate, floats accept numbers
    /// and numeric strings, bools accept numbers (non-zero is true) and the
    /// usual string spellings, strings render any scalar, raw keeps the value
    /// verbatim.
    pub fn coerce(self, raw: &serde_json::Value) -> Result<TagValue, CoerceError> {
        use serde_json::Value;

        let fail = || CoerceError {
            expected: self,
            got: short_repr(raw),
        };

        match self {
            DataType::Float => match raw {
                Value::Number(n) => n.as_f64().map(TagValue::Float).ok_or_else(fail),
                Value::Bool(b) => Ok(TagValue::Float(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(TagValue::Float)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            DataType::Int => match raw {
                Value::Number(n) => n.as_f64().map(|v| TagValue::Int(v as i64)).ok_or_else(fail),
                Value::Bool(b) => Ok(TagValue::Int(i64::from(*b))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|v| TagValue::Int(v as i64))
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            DataType::Bool => match raw {
                Value::Bool(b) => Ok(TagValue::Bool(*b)),
                Value::Number(n) => n
                    .as_f64()
                    .map(|v| TagValue::Bool(v != 0.0))
                    .ok_or_else(fail),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => Ok(TagValue::Bool(true)),
                    "false" | "0" | "off" => Ok(TagValue::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            DataType::String => match raw {
                Value::String(s) => Ok(TagValue::Str(s.clone())),
                Value::Number(n) => Ok(TagValue::Str(n.to_string())),
                Value::Bool(b) => Ok(TagValue::Str(b.to_string())),
                _ => Err(fail()),
            },
            DataType::Raw => Ok(TagValue::Raw(raw.clone())),
        }
    }
}

fn short_repr(v: &serde_json::Value) -> String {
    let s = v.to_string();
    if s.len() > 48 {
        let truncated: String = s.chars().take(48).collect();
        format!("{truncated}…")
    } else {
        s
    }
}
