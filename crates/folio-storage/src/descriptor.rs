//! Payload descriptors: the per-payload documents kept in `files`.

use std::fmt;

use chrono::{DateTime, Utc};
use folio_doc::{Document, Value};
use serde::{Deserialize, Serialize};

/// Declared role of a payload. Governs backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    Source,
    Annotation,
    Preview,
    Thumbnail,
    Enrichment,
    Error,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "Source",
            Self::Annotation => "Annotation",
            Self::Preview => "Preview",
            Self::Thumbnail => "Thumbnail",
            Self::Enrichment => "Enrichment",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PayloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Ok(Self::Source),
            "annotation" => Ok(Self::Annotation),
            "preview" => Ok(Self::Preview),
            "thumbnail" => Ok(Self::Thumbnail),
            "enrichment" => Ok(Self::Enrichment),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown payload type: {other}")),
        }
    }
}

/// Where a payload's content physically lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Bytes in the large-object store; the descriptor holds the object id.
    #[serde(rename = "BLOB", alias = "GRIDFS")]
    Blob,
    /// JSON content inline in the descriptor's `source` field.
    #[serde(rename = "EMBEDDED_DOCUMENT", alias = "COLLECTION_EMBEDDED")]
    EmbeddedDoc,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob => f.write_str("BLOB"),
            Self::EmbeddedDoc => f.write_str("EMBEDDED_DOCUMENT"),
        }
    }
}

/// Store-wide rule mapping payload types to backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPolicy {
    /// `Source` payloads are embedded documents, everything else is a blob.
    #[default]
    Auto,
    /// Every payload goes to the large-object store.
    Blob,
}

impl BackendPolicy {
    /// The backend a payload of `payload_type` is stored in.
    pub fn select(self, payload_type: PayloadType) -> BackendKind {
        match (self, payload_type) {
            (Self::Auto, PayloadType::Source) => BackendKind::EmbeddedDoc,
            _ => BackendKind::Blob,
        }
    }
}

/// Field of the descriptor holding embedded content.
pub const EMBEDDED_FIELD: &str = "source";

/// The document describing one payload inside an object's `files` array.
///
/// Unknown fields (including the embedded backend's `source` document)
/// are carried in `extra` so nothing is lost on a read-modify-write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDescriptor {
    pub pid: String,
    pub oid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub payload_type: PayloadType,
    #[serde(default)]
    pub linked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Legacy mirror of `backend` for blob payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<String>,
    /// Backend locator (large-object id, or the embedded field name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(rename = "backend_type", default, skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<BackendKind>,
    #[serde(flatten)]
    pub extra: Document,
}

impl PayloadDescriptor {
    /// A fresh descriptor: label is the pid, not linked, no content yet.
    pub fn new(pid: impl Into<String>, oid: impl Into<String>, payload_type: PayloadType) -> Self {
        let pid = pid.into();
        Self {
            label: pid.clone(),
            pid,
            oid: oid.into(),
            content_type: None,
            payload_type,
            linked: false,
            last_modified: None,
            payload_id: None,
            backend: None,
            backend_type: None,
            extra: Document::new(),
        }
    }

    /// Parse a descriptor out of a `files` entry.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(value.clone())
    }

    /// Encode as the stored descriptor document.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// The metadata attached to backend content: who it belongs to and
    /// what it is.
    pub fn content_metadata(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("pid".into(), Value::from(self.pid.as_str()));
        doc.insert("oid".into(), Value::from(self.oid.as_str()));
        doc.insert("label".into(), Value::from(self.label.as_str()));
        doc.insert("payloadType".into(), Value::from(self.payload_type.to_string()));
        doc.insert("linked".into(), Value::Bool(self.linked));
        if let Some(content_type) = &self.content_type {
            doc.insert("contentType".into(), Value::from(content_type.as_str()));
        }
        doc
    }

    /// Copy the caller-editable fields of `other` onto `self`, leaving the
    /// backend locator and embedded content alone.
    pub fn merge_meta(&mut self, other: &PayloadDescriptor) {
        self.label = other.label.clone();
        self.content_type = other.content_type.clone();
        self.payload_type = other.payload_type;
        self.linked = other.linked;
        self.last_modified = other.last_modified;
    }

    /// The embedded `{payload, metadata}` document, if any.
    pub fn embedded(&self) -> Option<&Document> {
        match self.extra.get(EMBEDDED_FIELD) {
            Some(Value::Object(doc)) => Some(doc),
            _ => None,
        }
    }
}
