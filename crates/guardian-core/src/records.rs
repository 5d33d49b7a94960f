use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known field names shared by the import, store and CLI layers.
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const AGE: &str = "age";
    pub const MEDICAL_HISTORY: &str = "medical_history";
    pub const CURRENT_CONDITIONS: &str = "current_conditions";
    pub const CURRENT_MEDICATIONS: &str = "current_medications";
}

/// Short random record identifier, unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Number of hex characters in a generated id.
    pub const LEN: usize = 8;

    /// Fresh id from a v4 UUID. Not checked for uniqueness; see [`RecordId::generate_unique`].
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..Self::LEN].to_string())
    }

    /// Generate ids until `taken` reports one as free.
    pub fn generate_unique(mut taken: impl FnMut(&RecordId) -> bool) -> Self {
        loop {
            let id = Self::generate();
            if !taken(&id) {
                return id;
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single field value. Serialized untagged so records stay plain JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Records(Vec<Record>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Text(value) => f.write_str(value),
            FieldValue::Records(records) => write!(f, "[{} entries]", records.len()),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<Vec<Record>> for FieldValue {
    fn from(value: Vec<Record>) -> Self {
        FieldValue::Records(value)
    }
}

/// One patient or doctor entry: a flat mapping of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Empty record carrying only its `id` field.
    pub fn new(id: &RecordId) -> Self {
        Self::default().with(fields::ID, id.as_str())
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(
        &mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Option<FieldValue> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn id(&self) -> Option<&str> {
        self.get(fields::ID).and_then(FieldValue::as_text)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(fields::NAME).and_then(FieldValue::as_text)
    }

    pub fn age(&self) -> Option<i64> {
        self.get(fields::AGE).and_then(FieldValue::as_integer)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Keyed collection of records, as held in memory and mirrored to disk.
pub type RecordSet = BTreeMap<RecordId, Record>;

/// Id that is not yet a key of `records`.
pub fn fresh_id(records: &RecordSet) -> RecordId {
    RecordId::generate_unique(|id| records.contains_key(id))
}
