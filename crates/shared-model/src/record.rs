//! Plain cell and notebook records: the nbformat-style interchange shape used
//! for persistence, clipboard copy and cell construction.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type Metadata = serde_json::Map<String, Value>;

/// The three cell variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a stored `cell_type` string onto a variant; `None` rejects it.
pub type CellTypeAdaptor = fn(&str) -> Option<CellKind>;

pub fn default_cell_type_adaptor(cell_type: &str) -> Option<CellKind> {
    match cell_type {
        "code" => Some(CellKind::Code),
        "markdown" => Some(CellKind::Markdown),
        "raw" => Some(CellKind::Raw),
        _ => None,
    }
}

/// Canonical cell record.
///
/// `execution_count` distinguishes a missing field (`None`) from an explicit
/// `null` (`Some(None)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub cell_type: String,
    #[serde(default, deserialize_with = "deserialize_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Value>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub execution_count: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Metadata>,
}

impl CellRecord {
    pub fn new(cell_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: None,
            cell_type: cell_type.into(),
            source: source.into(),
            metadata: Metadata::new(),
            outputs: None,
            execution_count: None,
            attachments: None,
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new("code", source)
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self::new("markdown", source)
    }

    pub fn raw(source: impl Into<String>) -> Self {
        Self::new("raw", source)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_execution_count(mut self, count: Option<i64>) -> Self {
        self.execution_count = Some(count);
        self
    }

    pub fn with_attachments(mut self, attachments: Metadata) -> Self {
        self.attachments = Some(attachments);
        self
    }
}

/// Whole-notebook record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookRecord {
    #[serde(default)]
    pub cells: Vec<CellRecord>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "default_nbformat")]
    pub nbformat: i64,
    #[serde(default = "default_nbformat_minor")]
    pub nbformat_minor: i64,
}

impl Default for NotebookRecord {
    fn default() -> Self {
        Self {
            cells: Vec::new(),
            metadata: Metadata::new(),
            nbformat: default_nbformat(),
            nbformat_minor: default_nbformat_minor(),
        }
    }
}

pub(crate) fn default_nbformat() -> i64 {
    4
}

pub(crate) fn default_nbformat_minor() -> i64 {
    5
}

/// nbformat allows `source` as a string or a list of lines that keep their own newlines.
fn deserialize_source<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Source {
        Text(String),
        Lines(Vec<String>),
    }

    Ok(match Source::deserialize(deserializer)? {
        Source::Text(text) => text,
        Source::Lines(lines) => lines.concat(),
    })
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<i64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<i64>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_lines_are_joined() {
        let record: CellRecord = serde_json::from_value(json!({
            "cell_type": "code",
            "source": ["import os\n", "print(os.getcwd())"],
            "metadata": {},
            "outputs": [],
            "execution_count": null
        }))
        .unwrap();
        assert_eq!(record.source, "import os\nprint(os.getcwd())");
        assert_eq!(record.execution_count, Some(None));
        assert_eq!(record.outputs, Some(vec![]));
        assert_eq!(record.id, None);
    }

    #[test]
    fn test_missing_execution_count_stays_absent() {
        let record: CellRecord =
            serde_json::from_value(json!({"cell_type": "markdown", "source": "# hi"})).unwrap();
        assert_eq!(record.execution_count, None);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"cell_type": "markdown", "source": "# hi", "metadata": {}})
        );
    }

    #[test]
    fn test_null_execution_count_serializes_as_null() {
        let record = CellRecord::code("1+1")
            .with_id("c1")
            .with_outputs(vec![])
            .with_execution_count(None);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["execution_count"], Value::Null);
        assert_eq!(value["id"], "c1");
    }

    #[test]
    fn test_default_adaptor() {
        assert_eq!(default_cell_type_adaptor("code"), Some(CellKind::Code));
        assert_eq!(default_cell_type_adaptor("markdown"), Some(CellKind::Markdown));
        assert_eq!(default_cell_type_adaptor("raw"), Some(CellKind::Raw));
        assert_eq!(default_cell_type_adaptor("sql"), None);
    }

    #[test]
    fn test_notebook_record_defaults() {
        let record: NotebookRecord = serde_json::from_value(json!({"cells": []})).unwrap();
        assert_eq!(record.nbformat, 4);
        assert_eq!(record.nbformat_minor, 5);
        assert!(record.metadata.is_empty());
    }
}
