//! Runtime value model for compiled tags.
//!
//! Resolver callbacks consume and produce [`Value`]s, and the compiled tag
//! assembles them into the final `(args, kwargs)` output. `Dict` is an
//! insertion-ordered mapping: keys keep the position of their first insert
//! and re-inserting a key overwrites its value in place, so spread merges
//! preserve source order.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(Value, Value)>),
}

impl Value {
    /// Elements yielded when the value is expanded with `...` or `*`:
    /// lists yield their elements, dicts their keys, strings their
    /// characters. Scalars are not iterable.
    pub fn into_spread_elements(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            Value::Dict(entries) => Some(entries.into_iter().map(|(key, _)| key).collect()),
            Value::String(text) => Some(
                text.chars()
                    .map(|c| Value::String(c.to_string()))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Entries yielded when the value is expanded with `**`. Only dicts are
    /// mappings.
    pub fn into_mapping_entries(self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Text form used for template-string concatenation and for kwarg names
    /// produced by `**` spreads.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Insert into an ordered entry list, overwriting in place when the key
    /// already exists.
    pub(crate) fn dict_insert(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
        if let Some(slot) = entries.iter_mut().find(|(existing, _)| *existing == key) {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
