//! Records and equality filters.
//!
//! A [`Record`] is an ordered JSON-like document: field name to value, where
//! values are null, booleans, numbers, strings, lists or nested maps. Records
//! live at a stable integer key (their position at insertion time) and never
//! carry the reserved `key` field themselves; the key is attached only to
//! query results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The reserved field name used to tag query results with the record key.
pub const KEY_FIELD: &str = "key";

/// An ordered document stored at an integer key.
///
/// # Example
///
/// ```
/// use nonedb_core::Record;
///
/// let record = Record::new()
///     .with_field("city", "Istanbul")
///     .with_field("population", 15_462_000);
///
/// assert_eq!(record.get_str("city"), Some("Istanbul"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    data: Map<String, Value>,
}

impl Record {
    /// Creates a new empty record.
    #[inline]
    pub fn new() -> Self {
        Self { data: Map::new() }
    }

    /// Creates a record from a JSON object map.
    #[inline]
    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Adds a field to the record. Chainable.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Sets a field value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.data.insert(key.into(), value.into());
    }

    /// Gets a field value by name.
    #[inline]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Gets a field as a string.
    #[inline]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }

    /// Gets a field as an i64.
    #[inline]
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.data.get(field).and_then(|v| v.as_i64())
    }

    /// Gets a field as an f64.
    #[inline]
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.data.get(field).and_then(|v| v.as_f64())
    }

    /// Gets a field as a bool.
    #[inline]
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.data.get(field).and_then(|v| v.as_bool())
    }

    /// Removes a field and returns its value if present.
    #[inline]
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.data.remove(field)
    }

    /// Returns true if the record contains the given field.
    #[inline]
    pub fn contains_field(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    /// Returns the number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the record has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns an iterator over the record fields in document order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Returns the underlying object map.
    #[inline]
    pub fn into_inner(self) -> Map<String, Value> {
        self.data
    }

    /// Rejects caller-supplied data containing the reserved `key` field.
    pub fn validate_fields(&self) -> Result<()> {
        if self.data.contains_key(KEY_FIELD) {
            return Err(Error::Validation(format!(
                "reserved field '{KEY_FIELD}' is not allowed in records"
            )));
        }
        Ok(())
    }

    /// Merges a set of fields into this record, overwriting existing values.
    pub fn merge(&mut self, fields: &Record) {
        for (name, value) in fields.iter() {
            self.data.insert(name.clone(), value.clone());
        }
    }

    /// Returns a copy of the record tagged with its key, as returned by `find`.
    pub fn tagged(&self, key: usize) -> Record {
        let mut out = self.clone();
        out.data.insert(KEY_FIELD.to_string(), Value::from(key as u64));
        out
    }
}

impl From<Map<String, Value>> for Record {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

/// Encodes a value into the canonical string used as an index map key.
///
/// The encoding is the JSON text of the value, so equality stays strict:
/// `1`, `"1"`, `true` and `null` all encode differently, and `null` is an
/// indexable value of its own.
pub fn encode_value(value: &Value) -> String {
    value.to_string()
}

/// An equality filter over record fields.
///
/// All listed fields must match with strict (type-and-value) equality. The
/// reserved `key` field may be used to filter by record key. An empty filter
/// matches every live record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    fields: Map<String, Value>,
}

impl Filter {
    /// Creates an empty filter matching all live records.
    #[inline]
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    /// Adds an equality condition. Chainable.
    pub fn with_field<K, V>(mut self, field: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Adds a condition on the record key. Chainable.
    pub fn with_key(mut self, key: usize) -> Self {
        self.fields.insert(KEY_FIELD.to_string(), Value::from(key as u64));
        self
    }

    /// Returns the key condition as an integer.
    ///
    /// A key condition holding anything but a non-negative integer yields
    /// `None` while [`has_key`](Filter::has_key) stays true; callers treat
    /// such a filter as matching nothing.
    pub fn key(&self) -> Option<usize> {
        self.fields
            .get(KEY_FIELD)
            .and_then(|v| v.as_u64())
            .map(|k| k as usize)
    }

    /// Returns true if a key condition is present, whatever its value.
    #[inline]
    pub fn has_key(&self) -> bool {
        self.fields.contains_key(KEY_FIELD)
    }

    /// Returns true if the filter has no conditions at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates the data-field conditions, excluding any key condition.
    pub fn data_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().filter(|(name, _)| *name != KEY_FIELD)
    }

    /// Evaluates the data-field conditions against a record.
    ///
    /// Key conditions are resolved by the caller against the record's
    /// position, not its fields.
    pub fn matches(&self, record: &Record) -> bool {
        self.data_fields()
            .all(|(name, value)| record.get(name) == Some(value))
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}
