//! Owned snapshot of a JavaScript value.
//!
//! Engine values (`rquickjs::Value<'js>`) are only valid on the actor thread
//! while the context is borrowed. [`JsValue`] is what crosses the request
//! boundary instead: plain data is copied, functions are retained on the actor
//! thread and referenced by id.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum nesting depth for value conversion
pub const MAX_JS_DEPTH: usize = 100;
/// Maximum size in bytes for value conversion
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Identifier of a script function retained on an actor thread.
pub type FunctionId = u32;

/// Owned representation of a JavaScript value.
///
/// Note: The Serialize/Deserialize implementations are written by hand
/// because the Function variant cannot be serialized.
#[derive(Clone, Debug, PartialEq)]
pub enum JsValue {
    /// JavaScript undefined
    Undefined,
    /// JavaScript null
    Null,
    /// JavaScript boolean
    Bool(bool),
    /// JavaScript integer (within i64 range)
    Int(i64),
    /// JavaScript float (including NaN and ±Infinity)
    Float(f64),
    /// JavaScript BigInt that fits in an i64
    BigInt(i64),
    /// JavaScript string
    String(String),
    /// JavaScript array (preserves order)
    Array(Vec<JsValue>),
    /// JavaScript object (insertion order preserved)
    Object(IndexMap<String, JsValue>),
    /// Script function retained on the actor thread
    Function { id: FunctionId },
}

impl JsValue {
    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Null | JsValue::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsValue::Int(i) | JsValue::BigInt(i) => Some(*i),
            JsValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Int(i) => Some(*i as f64),
            JsValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Id of the retained function, if this is one.
    pub fn function_id(&self) -> Option<FunctionId> {
        match self {
            JsValue::Function { id } => Some(*id),
            _ => None,
        }
    }
}

impl From<&str> for JsValue {
    fn from(value: &str) -> Self {
        JsValue::String(value.to_owned())
    }
}

impl From<String> for JsValue {
    fn from(value: String) -> Self {
        JsValue::String(value)
    }
}

impl From<bool> for JsValue {
    fn from(value: bool) -> Self {
        JsValue::Bool(value)
    }
}

impl From<i32> for JsValue {
    fn from(value: i32) -> Self {
        JsValue::Int(value.into())
    }
}

impl From<i64> for JsValue {
    fn from(value: i64) -> Self {
        JsValue::Int(value)
    }
}

impl From<f64> for JsValue {
    fn from(value: f64) -> Self {
        JsValue::Float(value)
    }
}

impl From<serde_json::Value> for JsValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => JsValue::Int(i),
                None => JsValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => JsValue::String(s),
            serde_json::Value::Array(items) => {
                JsValue::Array(items.into_iter().map(JsValue::from).collect())
            }
            serde_json::Value::Object(map) => JsValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, JsValue::from(value)))
                    .collect(),
            ),
        }
    }
}

// Manual Serialize implementation that errors on Function variant
impl Serialize for JsValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            JsValue::Undefined | JsValue::Null => serializer.serialize_none(),
            JsValue::Bool(b) => serializer.serialize_bool(*b),
            JsValue::Int(i) | JsValue::BigInt(i) => serializer.serialize_i64(*i),
            JsValue::Float(f) => serializer.serialize_f64(*f),
            JsValue::String(s) => serializer.serialize_str(s),
            JsValue::Array(arr) => arr.serialize(serializer),
            JsValue::Object(obj) => obj.serialize(serializer),
            JsValue::Function { id } => Err(Error::custom(format!(
                "Cannot serialize JsValue::Function (id: {}). Functions must be called, not serialized.",
                id
            ))),
        }
    }
}

// Manual Deserialize implementation; functions have no serialized form
impl<'de> Deserialize<'de> for JsValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JsValueVisitor;

        impl<'de> Visitor<'de> for JsValueVisitor {
            type Value = JsValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a JavaScript value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(JsValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(JsValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                match i64::try_from(value) {
                    Ok(value) => Ok(JsValue::Int(value)),
                    Err(_) => Ok(JsValue::Float(value as f64)),
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(JsValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(JsValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(JsValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JsValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JsValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JsValueVisitor)
    }
}

/// Failures while converting between engine values and [`JsValue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("Depth exceeded maximum limit of {0}")]
    DepthExceeded(usize),
    #[error("Size ({size} bytes) exceeded maximum limit of {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },
    #[error("Cannot convert circular reference")]
    Circular,
    #[error("Cannot convert {0}")]
    Unsupported(&'static str),
    #[error("Function ID {0} not found")]
    UnknownFunction(FunctionId),
    #[error("{0}")]
    Engine(String),
}

impl From<rquickjs::Error> for ConversionError {
    fn from(err: rquickjs::Error) -> Self {
        ConversionError::Engine(err.to_string())
    }
}

/// Tracks depth and size limits during value conversion.
///
/// Used while walking engine values to bound memory use and recursion.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    pub fn enter(&mut self) -> Result<(), ConversionError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(ConversionError::DepthExceeded(self.max_depth));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), ConversionError> {
        self.current_bytes = self.current_bytes.saturating_add(bytes);
        if self.current_bytes > self.max_bytes {
            return Err(ConversionError::SizeExceeded {
                size: self.current_bytes,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new(MAX_JS_DEPTH, MAX_JS_BYTES)
    }
}
