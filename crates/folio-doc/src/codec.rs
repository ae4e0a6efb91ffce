//! Reversible escaping of document field names.
//!
//! Document databases reserve `.` (path separator) and `$` (operator prefix)
//! in field names, while domain metadata routinely uses both (namespaced
//! property names such as `dc.title`). [`KeyCodec`] rewrites every map key at
//! every nesting depth on the way in and restores it on the way out. Values
//! are never rewritten; only documents nested inside values (directly or
//! inside arrays) have their own keys transformed.
//!
//! Round-trip law: for any document whose keys do not already contain one of
//! the sentinel tokens, `unescape(escape(d)) == d`.

use serde_json::{Map, Value};

use crate::document::Document;

/// Ordered literal substitutions applied to field names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCodec {
    replacements: Vec<(String, String)>,
}

impl KeyCodec {
    /// The standard codec: `.` ↦ `_dot_`, `$` ↦ `_dollar_`.
    pub fn standard() -> Self {
        Self::with_replacements([(".", "_dot_"), ("$", "_dollar_")])
    }

    /// Build a codec from `(literal, token)` pairs, applied in order.
    pub fn with_replacements<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            replacements: pairs
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }

    /// Escape a single field name.
    pub fn escape_key(&self, key: &str) -> String {
        self.replacements
            .iter()
            .fold(key.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }

    /// Reverse [`escape_key`](Self::escape_key).
    pub fn unescape_key(&self, key: &str) -> String {
        self.replacements
            .iter()
            .rev()
            .fold(key.to_string(), |acc, (from, to)| acc.replace(to.as_str(), from))
    }

    /// Returns `true` if `key` contains one of the sentinel tokens, i.e. it
    /// would not survive an escape/unescape round trip unchanged.
    pub fn is_ambiguous(&self, key: &str) -> bool {
        self.replacements.iter().any(|(_, token)| key.contains(token.as_str()))
    }

    /// Escape every key of `doc`, recursively.
    pub fn escape(&self, doc: &Document) -> Document {
        transform_map(doc, &|key| self.escape_key(key))
    }

    /// Unescape every key of `doc`, recursively.
    pub fn unescape(&self, doc: &Document) -> Document {
        transform_map(doc, &|key| self.unescape_key(key))
    }

    /// Keys at any depth of `value` that [`is_ambiguous`](Self::is_ambiguous)
    /// flags, in document order. Scalar values are never checked.
    pub fn ambiguous_keys(&self, value: &Value) -> Vec<String> {
        let mut found = Vec::new();
        self.collect_ambiguous(value, &mut found);
        found
    }

    fn collect_ambiguous(&self, value: &Value, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    if self.is_ambiguous(key) {
                        found.push(key.clone());
                    }
                    self.collect_ambiguous(nested, found);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.collect_ambiguous(item, found);
                }
            }
            _ => {}
        }
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::standard()
    }
}

fn transform_map(doc: &Map<String, Value>, rename: &dyn Fn(&str) -> String) -> Document {
    doc.iter()
        .map(|(key, value)| (rename(key), transform_value(value, rename)))
        .collect()
}

fn transform_value(value: &Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(transform_map(map, rename)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| transform_value(item, rename))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}
