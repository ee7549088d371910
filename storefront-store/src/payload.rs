//! Caller payloads and the schema-on-write sanitizer.
//!
//! UI callers hand the access layer arbitrary object graphs. Some of what they
//! carry has no encoding in the store: undefined slots, callbacks, host handles
//! and shared nodes that point back at themselves. [`Payload`] models all of
//! these explicitly and [`Payload::sanitize`] turns the graph into plain JSON:
//!
//! | Input | Output |
//! |-------|--------|
//! | `Undefined` | `null` |
//! | `Function`, `Opaque` in an object | key dropped |
//! | `Function`, `Opaque` in an array | `null` |
//! | `Shared` node already visited | `null` (not walked again) |
//!
//! Sanitization never fails; only a non-object top level is rejected, by
//! [`Payload::into_record`].

use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::document::Record;
use crate::error::{StoreError, StoreResult};

/// A node that may be referenced from several places, including itself.
pub type SharedPayload = Arc<RwLock<Payload>>;

/// A caller-supplied value before sanitization.
#[derive(Clone)]
pub enum Payload {
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
    /// A callback; carries its name for diagnostics only.
    Function(String),
    /// A host handle (DOM node, file handle) with no data representation.
    Opaque(String),
    Shared(SharedPayload),
}

impl Payload {
    /// An empty object.
    pub fn object() -> Self {
        Payload::Object(BTreeMap::new())
    }

    /// Wrap a value in a shared, mutable node.
    pub fn shared(inner: Payload) -> Self {
        Payload::Shared(Arc::new(RwLock::new(inner)))
    }

    /// Insert `value` under `key`.
    ///
    /// Works on plain objects and on shared nodes wrapping an object; any other
    /// variant is left untouched.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Payload>) -> &mut Self {
        match self {
            Payload::Object(map) => {
                map.insert(key.into(), value.into());
            }
            Payload::Shared(node) => {
                let mut guard = node.write().unwrap_or_else(PoisonError::into_inner);
                if let Payload::Object(map) = &mut *guard {
                    map.insert(key.into(), value.into());
                }
            }
            _ => {}
        }
        self
    }

    /// Builder form of [`Payload::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.insert(key, value);
        self
    }

    /// Convert to plain JSON.
    pub fn sanitize(&self) -> Value {
        let mut walker = Sanitizer::default();
        walker.walk(self).unwrap_or(Value::Null)
    }

    /// Sanitize and require an object at the top level.
    pub fn into_record(self, collection: &str) -> StoreResult<Record> {
        match self.sanitize() {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::invalid(
                collection,
                format!("expected an object, got {}", json_kind(&other)),
            )),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Undefined => write!(f, "Undefined"),
            Payload::Null => write!(f, "Null"),
            Payload::Bool(b) => write!(f, "Bool({b})"),
            Payload::Number(n) => write!(f, "Number({n})"),
            Payload::String(s) => write!(f, "String({s:?})"),
            Payload::Array(items) => f.debug_list().entries(items).finish(),
            Payload::Object(map) => f.debug_map().entries(map).finish(),
            Payload::Function(name) => write!(f, "Function({name})"),
            Payload::Opaque(name) => write!(f, "Opaque({name})"),
            // Shared nodes may be cyclic.
            Payload::Shared(node) => write!(f, "Shared({:p})", Arc::as_ptr(node)),
        }
    }
}

#[derive(Default)]
struct Sanitizer {
    seen: HashSet<*const RwLock<Payload>>,
}

impl Sanitizer {
    /// `None` means "drop this slot".
    fn walk(&mut self, payload: &Payload) -> Option<Value> {
        match payload {
            Payload::Undefined | Payload::Null => Some(Value::Null),
            Payload::Bool(b) => Some(Value::Bool(*b)),
            Payload::Number(n) => Some(Value::Number(n.clone())),
            Payload::String(s) => Some(Value::String(s.clone())),
            Payload::Function(_) | Payload::Opaque(_) => None,
            Payload::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| self.walk(item).unwrap_or(Value::Null))
                    .collect(),
            )),
            Payload::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    if let Some(v) = self.walk(value) {
                        out.insert(key.clone(), v);
                    }
                }
                Some(Value::Object(out))
            }
            Payload::Shared(node) => {
                if !self.seen.insert(Arc::as_ptr(node)) {
                    return Some(Value::Null);
                }
                let guard = node.read().unwrap_or_else(PoisonError::into_inner);
                self.walk(&guard)
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Conversions ──────────────────────────────────────────────────────

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Object(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

impl From<Record> for Payload {
    fn from(record: Record) -> Self {
        Payload::from(Value::Object(record))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::String(s)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Payload::Number(n.into())
    }
}

impl From<u64> for Payload {
    fn from(n: u64) -> Self {
        Payload::Number(n.into())
    }
}

impl From<f64> for Payload {
    /// Non-finite floats have no JSON encoding and become `null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Payload::Null, Payload::Number)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Payload::Undefined, Into::into)
    }
}
