use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single feature row flowing through the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    /// Feature set reference, e.g. `project/driver_stats`. Used as the group key.
    pub feature_set: String,
    pub event_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// `None` when the value is missing from the row.
    #[serde(default)]
    pub value: Option<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
}

impl FieldValue {
    /// Numeric view used for value summaries. Strings have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Int64(i) => Some(*i as f64),
            FieldValue::Double(d) if d.is_finite() => Some(*d),
            FieldValue::Double(_) | FieldValue::String(_) => None,
        }
    }
}

impl FeatureRow {
    pub fn new(feature_set: impl Into<String>, event_timestamp: DateTime<Utc>) -> Self {
        Self {
            feature_set: feature_set.into(),
            event_timestamp,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Option<FieldValue>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value,
        });
        self
    }

    pub fn key(&self) -> &str {
        &self.feature_set
    }
}
