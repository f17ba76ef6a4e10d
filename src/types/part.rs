//! Message and artifact part types.
//!
//! Parts are the content units of messages and artifacts. Each part is a
//! tagged variant discriminated by `kind` on the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A discriminated union representing a part of a message or artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    /// A text content part.
    Text(TextPart),
    /// A file content part.
    File(FilePart),
    /// A structured data part.
    Data(DataPart),
}

impl Part {
    /// Creates a new text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart::new(text))
    }

    /// Creates a new file part with inline base64 content.
    pub fn file_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<String>,
    ) -> Self {
        Part::File(FilePart {
            name: Some(name.into()),
            mime_type: Some(mime_type.into()),
            source: FileSource::Bytes(bytes.into()),
            metadata: None,
        })
    }

    /// Creates a new file part referencing content by URI.
    pub fn file_uri(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Part::File(FilePart {
            name: Some(name.into()),
            mime_type: Some(mime_type.into()),
            source: FileSource::Uri(uri.into()),
            metadata: None,
        })
    }

    /// Creates a new data part from any JSON value.
    #[must_use]
    pub fn data(value: serde_json::Value) -> Self {
        Part::Data(DataPart::new(value))
    }

    /// Returns true if this is a text part.
    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Part::Text(_))
    }

    /// Returns the text content if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(p) => Some(&p.text),
            _ => None,
        }
    }

    /// Returns the part's metadata mapping, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&HashMap<String, serde_json::Value>> {
        match self {
            Part::Text(p) => p.metadata.as_ref(),
            Part::File(p) => p.metadata.as_ref(),
            Part::Data(p) => p.metadata.as_ref(),
        }
    }
}

/// A text segment within a message or artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    /// The string content of the text part.
    pub text: String,
    /// Optional metadata associated with this part.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl TextPart {
    /// Creates a new text part.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: None,
        }
    }

    /// Sets the metadata for this part.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A file segment within a message or artifact.
///
/// Exactly one of inline bytes or a URI is present; the validator rejects
/// payloads carrying both or neither.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    /// An optional name for the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The MIME type of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// The file content, inline or by reference.
    #[serde(flatten)]
    pub source: FileSource,
    /// Optional metadata associated with this part.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// File content, provided inline as base64 or located at a URI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FileSource {
    /// Base64-encoded inline content.
    #[serde(rename = "bytes")]
    Bytes(String),
    /// A URL pointing to the file's content.
    #[serde(rename = "uri")]
    Uri(String),
}

impl FilePart {
    /// Returns true if the content is carried inline.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self.source, FileSource::Bytes(_))
    }

    /// Checks that the MIME type, when present, has a `type/subtype` shape.
    #[must_use]
    pub fn has_valid_mime_type(&self) -> bool {
        match self.mime_type.as_deref() {
            None => true,
            Some(mt) => {
                let mut halves = mt.splitn(2, '/');
                match (halves.next(), halves.next()) {
                    (Some(t), Some(s)) => !t.is_empty() && !s.is_empty(),
                    _ => false,
                }
            }
        }
    }
}

/// A structured data segment within a message or artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPart {
    /// The structured data content, any JSON value.
    pub data: serde_json::Value,
    /// Optional metadata associated with this part.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl DataPart {
    /// Creates a new data part.
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            metadata: None,
        }
    }
}
