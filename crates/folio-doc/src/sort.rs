use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{compare_values, get_path, type_name, Document};
use crate::error::{DocError, DocResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One sort key: a dotted path and a direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub direction: SortDirection,
}

/// An ordered list of sort keys; earlier keys take precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
}

impl SortSpec {
    /// Sort by `keys`, earlier keys taking precedence.
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }

    /// Sort ascending on a single path.
    pub fn ascending(path: impl Into<String>) -> Self {
        Self::new(vec![SortKey {
            path: path.into(),
            direction: SortDirection::Ascending,
        }])
    }

    /// Sort descending on a single path.
    pub fn descending(path: impl Into<String>) -> Self {
        Self::new(vec![SortKey {
            path: path.into(),
            direction: SortDirection::Descending,
        }])
    }

    /// Parse `{"field": 1, "other": -1}`.
    ///
    /// The brace-less form `"field": -1` used by older callers is accepted
    /// too and treated as if it were wrapped in braces.
    pub fn parse(text: &str) -> DocResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let wrapped;
        let source = if trimmed.starts_with('{') {
            trimmed
        } else {
            wrapped = format!("{{{trimmed}}}");
            &wrapped
        };
        let value: Value = serde_json::from_str(source)
            .map_err(|e| DocError::InvalidSort(format!("{e}: {text}")))?;
        match value {
            Value::Object(doc) => Self::from_document(&doc),
            other => Err(DocError::InvalidSort(format!(
                "expected a document, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Read keys from a `{"field": 1 | -1}` document, in field order.
    pub fn from_document(doc: &Document) -> DocResult<Self> {
        let keys = doc
            .iter()
            .map(|(path, dir)| {
                let direction = match dir.as_i64() {
                    Some(1) => SortDirection::Ascending,
                    Some(-1) => SortDirection::Descending,
                    _ => {
                        return Err(DocError::InvalidSort(format!(
                            "direction for {path} must be 1 or -1, got {dir}"
                        )))
                    }
                };
                Ok(SortKey {
                    path: path.clone(),
                    direction,
                })
            })
            .collect::<DocResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Returns `true` if there are no sort keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two documents under this spec. Missing fields sort as null.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.keys {
            let left = get_path(a, &key.path).unwrap_or(&Value::Null);
            let right = get_path(b, &key.path).unwrap_or(&Value::Null);
            let ord = match key.direction {
                SortDirection::Ascending => compare_values(left, right),
                SortDirection::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable in-place sort.
    pub fn sort(&self, docs: &mut [Document]) {
        if !self.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
    }
}
