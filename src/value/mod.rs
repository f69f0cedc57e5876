//! # Document Value Model
//!
//! Core value types exchanged through slots: scalars, arrays, and
//! field-order-preserving documents, plus the sentinel values the
//! execution runtime distinguishes (`Nothing`, `Null`, `Undefined`).
//!
//! ## Usage
//!
//! ```rust
//! use slotplan::value::{Document, Val};
//!
//! let doc = Document::from_pairs(vec![
//!     ("a".to_string(), Val::Int32(1)),
//!     ("b".to_string(), Val::String("hello".into())),
//! ]);
//!
//! assert_eq!(doc.get("a"), Some(&Val::Int32(1)));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single runtime value.
///
/// `Nothing` is the slot-level absence marker: a slot bound to `Nothing`
/// exists but holds no value. `Null` and `Undefined` are ordinary BSON-ish
/// values with their usual sort semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Val {
    /// Absence of a value (distinct from `Null`)
    Nothing,
    /// Explicit null
    Null,
    /// Deprecated-but-live undefined value; produced by empty-array sort keys
    Undefined,
    /// Smallest possible key, sorts before everything
    MinKey,
    /// Largest possible key, sorts after everything
    MaxKey,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Internal timestamp (oplog ordering)
    Timestamp(u64),
    /// Storage-level record id
    RecordId(i64),
    /// Array of values
    Array(Vec<Val>),
    /// Document with preserved field order
    Object(Document),
}

impl Default for Val {
    fn default() -> Self {
        Val::Nothing
    }
}

impl Val {
    /// True iff this is the `Nothing` sentinel
    pub fn is_nothing(&self) -> bool {
        matches!(self, Val::Nothing)
    }

    /// True iff this value is a document
    pub fn is_object(&self) -> bool {
        matches!(self, Val::Object(_))
    }

    /// True iff this value is an array
    pub fn is_array(&self) -> bool {
        matches!(self, Val::Array(_))
    }

    /// Get a top-level field of an object value.
    ///
    /// Non-objects and missing fields both yield `None`.
    pub fn get_field(&self, name: &str) -> Option<&Val> {
        match self {
            Val::Object(doc) => doc.get(name),
            _ => None,
        }
    }

    /// Extract a value by dotted path (`"a.b.c"`).
    ///
    /// Descends through nested objects only; an array or scalar at a
    /// non-terminal position ends the walk with `None`.
    pub fn get_path(&self, path: &str) -> Option<&Val> {
        let mut current = self;
        for component in path.split('.') {
            current = current.get_field(component)?;
        }
        Some(current)
    }

    /// Convert a `serde_json::Value` into a `Val`.
    ///
    /// Used to load inline documents and test fixtures. JSON numbers map
    /// to `Int64` when integral, `Double` otherwise; JSON objects keep
    /// their field order.
    pub fn from_json(json: &serde_json::Value) -> Val {
        match json {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Val::Int64(i)
                } else {
                    Val::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Val::String(s.clone()),
            serde_json::Value::Array(items) => {
                Val::Array(items.iter().map(Val::from_json).collect())
            }
            serde_json::Value::Object(fields) => Val::Object(Document::from_pairs(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Val::from_json(v)))
                    .collect(),
            )),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nothing => write!(f, "Nothing"),
            Val::Null => write!(f, "null"),
            Val::Undefined => write!(f, "undefined"),
            Val::MinKey => write!(f, "MinKey"),
            Val::MaxKey => write!(f, "MaxKey"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int32(v) => write!(f, "{v}"),
            Val::Int64(v) => write!(f, "{v}L"),
            Val::Double(v) => write!(f, "{v}"),
            Val::String(s) => write!(f, "\"{s}\""),
            Val::Timestamp(t) => write!(f, "Timestamp({t})"),
            Val::RecordId(r) => write!(f, "RecordId({r})"),
            Val::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Val::Object(doc) => write!(f, "{doc}"),
        }
    }
}

/// A document: an ordered list of `(field, value)` pairs.
///
/// Field order is significant (it survives rehydration and make-object
/// stages), so this is a vector rather than a map. Lookups scan linearly;
/// documents flowing through the builder are small.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document(Vec<(String, Val)>);

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Document(Vec::new())
    }

    /// Create a document from ordered pairs
    pub fn from_pairs(pairs: Vec<(String, Val)>) -> Self {
        Document(pairs)
    }

    /// Append a field. Duplicate names are kept; `get` returns the first.
    pub fn push(&mut self, name: impl Into<String>, value: Val) {
        self.0.push((name.into(), value));
    }

    /// Get the first field with the given name
    pub fn get(&self, name: &str) -> Option<&Val> {
        self.0
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the document has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in document order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Val)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_path_nested() {
        let doc = Val::Object(Document::from_pairs(vec![(
            "a".to_string(),
            Val::Object(Document::from_pairs(vec![(
                "b".to_string(),
                Val::Int32(7),
            )])),
        )]));

        assert_eq!(doc.get_path("a.b"), Some(&Val::Int32(7)));
        assert_eq!(doc.get_path("a.c"), None);
        assert_eq!(doc.get_path("x"), None);
    }

    #[test]
    fn test_get_path_stops_at_array() {
        let doc = Val::Object(Document::from_pairs(vec![(
            "a".to_string(),
            Val::Array(vec![Val::Int32(1)]),
        )]));

        // Arrays are not descended into by dotted-path extraction
        assert_eq!(doc.get_path("a.0"), None);
        assert!(doc.get_path("a").is_some_and(Val::is_array));
    }

    #[test]
    fn test_from_json_preserves_field_order() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"z": 1, "a": {"m": true}}"#).expect("valid json");
        let val = Val::from_json(&json);

        let Val::Object(doc) = val else {
            panic!("expected object");
        };
        let names: Vec<&str> = doc.fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "a"]);
    }
}
