//! Remote record representation.
//!
//! A [`Record`] is what the remote store persists: a type, a stable name and
//! a flat map of typed fields. Sequences of strings travel as JSON blobs and
//! relationships travel as [`RecordReference`]s carrying a delete policy.
//! A [`FieldValue::Null`] marks a field the sender cleared; stores never keep it.

use chrono::{DateTime, Utc};
use fitcoach_types::{RecordKey, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the remote does with a child when the referenced owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletePolicy {
    /// Deleting the owner deletes this record too.
    CascadeDeleteOwner,
    /// Deleting the owner leaves this record with a dangling (cleared) reference.
    NullifyOnOwnerDelete,
}

/// A typed pointer to another record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordReference {
    /// Remote name of the target record.
    pub key: String,
    pub policy: DeletePolicy,
}

impl RecordReference {
    pub fn new(target: RecordKey, policy: DeletePolicy) -> Self {
        Self {
            key: target.to_string(),
            policy,
        }
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    /// JSON-encoded blob (used for sequences of strings).
    Json(String),
    Reference(RecordReference),
    /// The field was cleared. Removes the stored value on a changed-keys save.
    Null,
}

impl FieldValue {
    /// Short name of the value kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::String(_) => "string",
            FieldValue::Int(_) => "int",
            FieldValue::Double(_) => "double",
            FieldValue::Bool(_) => "bool",
            FieldValue::Date(_) => "date",
            FieldValue::Json(_) => "json",
            FieldValue::Reference(_) => "reference",
            FieldValue::Null => "null",
        }
    }
}

/// The remote-side serialized form of a local entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    /// Remote record name. Normally a [`RecordKey`] rendered as text, but
    /// kept raw so that malformed names coming off the wire stay representable.
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Server-assigned modification time. `None` until the record is saved.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Creates an empty record with the given key.
    pub fn new(key: RecordKey) -> Self {
        Self {
            record_type: key.record_type(),
            key: key.to_string(),
            fields: BTreeMap::new(),
            modified_at: None,
        }
    }

    /// Creates an empty record with an arbitrary name.
    pub fn with_raw_key(record_type: RecordType, key: impl Into<String>) -> Self {
        Self {
            record_type,
            key: key.into(),
            fields: BTreeMap::new(),
            modified_at: None,
        }
    }

    /// Parses the record name.
    pub fn record_key(&self) -> Result<RecordKey, fitcoach_types::Error> {
        RecordKey::parse(&self.key)
    }

    /// Sets a field.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    /// Sets a field, or marks it cleared when there is no value.
    pub fn set_opt(&mut self, name: &str, value: Option<FieldValue>) {
        self.set(name, value.unwrap_or(FieldValue::Null));
    }

    /// Returns a field. Cleared fields read as absent.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).filter(|v| **v != FieldValue::Null)
    }

    /// Overwrites only the fields present in `changes`; cleared fields are removed.
    pub fn merge_changed_keys(&mut self, changes: &Record) {
        for (name, value) in &changes.fields {
            match value {
                FieldValue::Null => {
                    self.fields.remove(name);
                }
                _ => {
                    self.fields.insert(name.clone(), value.clone());
                }
            }
        }
    }

    /// Drops cleared-field markers, leaving only stored values.
    pub fn strip_nulls(&mut self) {
        self.fields.retain(|_, v| *v != FieldValue::Null);
    }

    /// Name of the first double field that is NaN or infinite, if any.
    pub fn non_finite_field(&self) -> Option<&str> {
        self.fields.iter().find_map(|(name, value)| match value {
            FieldValue::Double(d) if !d.is_finite() => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns true if the two records carry the same fields.
    pub fn same_content(&self, other: &Record) -> bool {
        self.record_type == other.record_type && self.key == other.key && self.fields == other.fields
    }
}
