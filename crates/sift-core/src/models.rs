use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::Mode;
use crate::metrics::{Metrics, as_secs};

/// Plain text per document key, as delivered by preprocessing.
pub type DocumentTexts = HashMap<String, Arc<str>>;

/// Ordered mapping of field name to a human-readable description.
///
/// Key order is preserved from the source JSON object so prompts and
/// outputs list fields the way the caller wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSchema {
    fields: Vec<(String, String)>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.insert(name, description);
        self
    }

    /// Insert or replace a field, keeping the position of an existing entry.
    pub fn insert(&mut self, name: impl Into<String>, description: impl Into<String>) {
        let name = name.into();
        let description = description.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = description,
            None => self.fields.push((name, description)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, d)| (n.as_str(), d.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The sub-schema of the named fields, in this schema's order.
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> FieldSchema {
        let wanted: Vec<&str> = names.into_iter().collect();
        FieldSchema {
            fields: self
                .fields
                .iter()
                .filter(|(n, _)| wanted.contains(&n.as_str()))
                .cloned()
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldSchema {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut schema = FieldSchema::new();
        for (name, description) in iter {
            schema.insert(name, description);
        }
        schema
    }
}

impl Serialize for FieldSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, description) in &self.fields {
            map.serialize_entry(name, description)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = FieldSchema;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping field names to descriptions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldSchema, A::Error> {
                let mut schema = FieldSchema::new();
                while let Some((name, description)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    let description = match description {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    schema.insert(name, description);
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

/// One document to extract, as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Key of the document's text in the batch's [`DocumentTexts`].
    #[serde(alias = "pdf_path")]
    pub document_key: String,
    pub label: String,
    #[serde(alias = "extraction_schema")]
    pub field_schema: FieldSchema,
}

impl Job {
    pub fn new(
        document_key: impl Into<String>,
        label: impl Into<String>,
        field_schema: FieldSchema,
    ) -> Self {
        Self {
            document_key: document_key.into(),
            label: label.into(),
            field_schema,
        }
    }
}

/// Extracted values in schema order; `None` marks a missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    values: Vec<(String, Option<String>)>,
}

impl FieldValues {
    /// Every field of the schema, all missing.
    pub fn missing(schema: &FieldSchema) -> Self {
        Self {
            values: schema.names().map(|n| (n.to_string(), None)).collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == field)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Set a field's value. Fields outside the schema are ignored.
    pub fn set(&mut self, field: &str, value: String) {
        if let Some(entry) = self.values.iter_mut().find(|(n, _)| n == field) {
            entry.1 = Some(value);
        }
    }

    pub fn missing_fields(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(n, _)| n.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|(_, v)| v.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl Serialize for FieldValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Oracle's self-reported confidence in an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Returns true for values the oracle uses to mean "not found".
pub fn is_null_sentinel(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case("null") || v.eq_ignore_ascii_case("none")
}

/// The oracle's answer for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAnswer {
    pub value: Option<String>,
    pub confidence: Confidence,
}

impl FieldAnswer {
    pub fn new(value: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            value: Some(value.into()),
            confidence,
        }
    }

    /// The value, if the answer is confident enough and not a null sentinel.
    pub fn accepted_value(&self) -> Option<&str> {
        if self.confidence == Confidence::Low {
            return None;
        }
        self.value.as_deref().filter(|v| !is_null_sentinel(v))
    }
}

/// Token and wall-clock cost of one oracle call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub tokens: u64,
    pub duration: Duration,
}

/// Field-inference oracle response.
#[derive(Debug, Clone, Default)]
pub struct Inference {
    pub answers: HashMap<String, FieldAnswer>,
    pub usage: Usage,
}

/// Pattern-synthesis oracle response.
#[derive(Debug, Clone, Default)]
pub struct Synthesis {
    pub patterns: HashMap<String, String>,
    pub usage: Usage,
}

/// A field selected for pattern learning, with the value the pattern must reproduce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub reference_value: String,
    pub description: String,
}

/// Learning candidates keyed by field name.
pub type Candidates = BTreeMap<String, Candidate>;

/// Scheduling bucket a job was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Warm,
    Orphan,
    Group,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Warm => "warm",
            Bucket::Orphan => "orphan",
            Bucket::Group => "group",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub document_key: String,
    pub label: String,
    pub bucket: Bucket,
    /// Mode the job actually ran under (warm jobs are forced to `standard`).
    pub mode: Mode,
    #[serde(rename = "extracted_data")]
    pub fields: FieldValues,
    pub metrics: Metrics,
    #[serde(rename = "sync_duration_s", serialize_with = "as_secs")]
    pub sync_duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
