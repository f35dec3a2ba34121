//! Record and row types flowing between backends, joins and the cache.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// 1. RawRecord
// ----------------------------------------------------------------------------

/// An untyped row fetched from one backend.
///
/// Records are read-only after a fetch: correlated data is never written back
/// onto them, joins produce [`JoinedRow`]s instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Backend-specific identifier (node UUID, aggregate id, port number, ...)
    pub id: String,
    /// Every field of the upstream object, as returned
    pub fields: JsonMap<String, JsonValue>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, fields: JsonMap<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a JSON object, taking the id from `id_field`.
    ///
    /// Returns `None` when the value is not an object or has no usable id.
    pub fn from_json(value: JsonValue, id_field: &str) -> Option<Self> {
        match value {
            JsonValue::Object(fields) => {
                let id = fields.get(id_field).and_then(scalar_to_string)?;
                Some(Self { id, fields })
            }
            _ => None,
        }
    }

    /// Top-level field lookup.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    /// Nested lookup following object keys. Keys are taken literally, so
    /// names containing dots or colons (`gpu.gpu`, `blazar:owner`) work.
    pub fn pointer(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.fields.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Field rendered as a label value. `null` and containers count as absent.
    pub fn str_field(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_to_string)
    }

    pub fn str_at(&self, path: &[&str]) -> Option<String> {
        self.pointer(path).and_then(scalar_to_string)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(JsonValue::as_f64)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(JsonValue::as_bool)
    }

    /// JSON truthiness: `null`, `false`, `0`, `""` and empty containers are false.
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => n.as_f64().map_or(false, |v| v != 0.0),
            Some(JsonValue::String(s)) => !s.is_empty(),
            Some(JsonValue::Array(a)) => !a.is_empty(),
            Some(JsonValue::Object(o)) => !o.is_empty(),
        }
    }

    /// True when the field exists and is not `null`.
    pub fn has_value(&self, key: &str) -> bool {
        !matches!(self.get(key), None | Some(JsonValue::Null))
    }
}

/// Convert a JSON scalar into its label representation.
pub fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// 2. JoinedRow
// ----------------------------------------------------------------------------

/// One named numeric value carried by a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub name: CompactString,
    pub value: f64,
}

impl Stat {
    pub fn new(name: impl Into<CompactString>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One correlated, collector-specific result row.
///
/// `fields` holds label values by name; projection onto a family's declared
/// label order happens in [`JoinedRow::label_values`], where a field that
/// was never set becomes an empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRow {
    /// Unique within one cache entry
    pub key: String,
    /// Label values by field name
    pub fields: BTreeMap<CompactString, String>,
    /// Numeric values, in insertion order
    pub stats: Vec<Stat>,
}

impl JoinedRow {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
            stats: Vec::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn with_stat(mut self, name: &str, value: f64) -> Self {
        self.push_stat(name, value);
        self
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(CompactString::from(name), value.into());
    }

    /// Set a field only when a value is present.
    pub fn set_opt_field(&mut self, name: &str, value: Option<String>) {
        if let Some(value) = value {
            self.set_field(name, value);
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn push_stat(&mut self, name: &str, value: f64) {
        self.stats.push(Stat::new(name, value));
    }

    pub fn stat(&self, name: &str) -> Option<f64> {
        self.stats
            .iter()
            .find(|s| s.name.as_str() == name)
            .map(|s| s.value)
    }

    /// Project the row onto `names`, in that order. Absent fields yield `""`.
    pub fn label_values<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        names
            .iter()
            .map(|name| self.field(name.as_ref()).unwrap_or_default().to_string())
            .collect()
    }
}

impl Display for JoinedRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.key)?;
        for (i, stat) in self.stats.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", stat.name, stat.value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> RawRecord {
        RawRecord::from_json(
            json!({
                "uuid": "3f2a",
                "name": "nc01",
                "maintenance": false,
                "last_error": null,
                "local_link_connection": {"port_id": "Ethernet 12", "switch_info": "corsa-1"},
                "gpu.gpu": "True",
            }),
            "uuid",
        )
        .unwrap()
    }

    #[test]
    fn test_record_from_json_requires_id() {
        assert!(RawRecord::from_json(json!({"name": "x"}), "uuid").is_none());
        assert!(RawRecord::from_json(json!([1, 2]), "uuid").is_none());
        let numeric = RawRecord::from_json(json!({"id": 7}), "id").unwrap();
        assert_eq!(numeric.id, "7");
    }

    #[test]
    fn test_record_field_access() {
        let record = node();
        assert_eq!(record.id, "3f2a");
        assert_eq!(record.str_field("maintenance").as_deref(), Some("false"));
        assert_eq!(record.str_field("last_error"), None);
        assert!(!record.has_value("last_error"));
        assert_eq!(
            record.str_at(&["local_link_connection", "port_id"]).as_deref(),
            Some("Ethernet 12")
        );
        assert!(record.is_truthy("gpu.gpu"));
        assert!(!record.is_truthy("missing"));
    }

    #[test]
    fn test_label_values_fill_missing_with_empty() {
        let row = JoinedRow::new("nc01")
            .with_field("name", "nc01")
            .with_field("provision_state", "active");
        assert_eq!(
            row.label_values(&["name", "project_name", "provision_state"]),
            vec!["nc01".to_string(), String::new(), "active".to_string()]
        );
    }

    #[test]
    fn test_stats_lookup() {
        let row = JoinedRow::new("k").with_stat("rx_bytes", 10.0).with_stat("tx_bytes", 4.0);
        assert_eq!(row.stat("tx_bytes"), Some(4.0));
        assert_eq!(row.stat("nope"), None);
        assert_eq!(row.to_string(), "k (rx_bytes=10, tx_bytes=4)");
    }
}
