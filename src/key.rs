use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::TypeId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Uuid(Uuid),
    String(String),
}

impl KeyValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Bool(_) => KeyKind::Bool,
            KeyValue::Int(_) => KeyKind::Int,
            KeyValue::Uuid(_) => KeyKind::Uuid,
            KeyValue::String(_) => KeyKind::String,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Uuid(id) => Value::String(id.to_string()),
            KeyValue::String(s) => Value::String(s.clone()),
        }
    }
}

/// Declared kind of one key value. Loaded column values are decoded by
/// kind, so a string key that happens to look like a uuid stays a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Bool,
    Int,
    Uuid,
    String,
}

impl KeyKind {
    /// Reads a key value of this kind out of a loaded column value. `Null`
    /// and values of another kind yield `None`.
    pub fn decode(self, value: &Value) -> Option<KeyValue> {
        match (self, value) {
            (KeyKind::Bool, Value::Bool(b)) => Some(KeyValue::Bool(*b)),
            (KeyKind::Int, Value::Number(n)) => n.as_i64().map(KeyValue::Int),
            (KeyKind::Uuid, Value::String(s)) => Uuid::parse_str(s).ok().map(KeyValue::Uuid),
            (KeyKind::String, Value::String(s)) => Some(KeyValue::String(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(value as i64)
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        KeyValue::Uuid(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::String(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::String(value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Uuid(id) => write!(f, "{}", id),
            KeyValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// Stable identity of a persisted object: the root of its type hierarchy
/// plus its key values. Two keys of the same hierarchy compare equal no
/// matter which subtype they were obtained through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    root: TypeId,
    values: Vec<KeyValue>,
}

impl Key {
    pub fn new(root: TypeId, values: Vec<KeyValue>) -> Self {
        Self { root, values }
    }

    pub fn single(root: TypeId, value: impl Into<KeyValue>) -> Self {
        Self {
            root,
            values: vec![value.into()],
        }
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.values
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.root)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Confidence about the concrete runtime type of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeCertainty {
    /// Only the hierarchy is known.
    Hierarchy,
    /// The type is a base of the real type.
    Base,
    /// The type is the concrete runtime type.
    Exact,
}

impl TypeCertainty {
    pub fn is_exact(&self) -> bool {
        matches!(self, TypeCertainty::Exact)
    }
}
