//! Stored document shape and write operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;

/// A stored document: field name → JSON value.
pub type Record = Map<String, Value>;

/// Infra bookkeeping field stamped on every write.
pub const UPDATED_AT_FIELD: &str = "_updatedAt";

/// Field holding the document identifier inside the body.
pub const ID_FIELD: &str = "id";

/// One mutation inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Write `record` under `id`; with `merge`, nested objects merge into the
    /// existing document instead of replacing it.
    Set {
        collection: String,
        id: String,
        record: Record,
        merge: bool,
    },
    Delete { collection: String, id: String },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. } | WriteOp::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Set { id, .. } | WriteOp::Delete { id, .. } => id,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Merge `incoming` into `existing`: objects merge recursively, everything
/// else replaces.
pub fn merge_into(existing: &mut Record, incoming: Record) {
    for (key, value) in incoming {
        match (existing.get_mut(&key), value) {
            (Some(Value::Object(old)), Value::Object(new)) => merge_into(old, new),
            (_, value) => {
                existing.insert(key, value);
            }
        }
    }
}

/// Numeric value of `field`, treating missing, non-numeric and zero alike.
///
/// Mirrors how the admin UI reads timestamps: `0` means "not set".
pub fn numeric_field(record: &Record, field: &str) -> Option<f64> {
    record
        .get(field)
        .and_then(Value::as_f64)
        .filter(|n| *n != 0.0 && n.is_finite())
}

/// The `id` field rendered as a string; numbers are coerced, anything else is empty.
pub fn id_string(record: &Record) -> String {
    match record.get(ID_FIELD) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
