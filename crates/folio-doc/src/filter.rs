//! Query filters in the familiar document-database dialect.
//!
//! A filter is itself a document. Plain fields are equality tests;
//! `$`-prefixed keys introduce operators:
//!
//! ```text
//! { "collectionName": "default",
//!   "files": { "$elemMatch": { "pid": "metadata.tfpackage" } },
//!   "$or": [ { "size": { "$gt": 10 } }, { "size": { "$exists": false } } ] }
//! ```
//!
//! Dotted paths fan out through arrays, so `{"files.pid": "a"}` matches any
//! document whose `files` array contains an entry with `pid == "a"`.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{compare_values, type_name, values_equal, Document};
use crate::error::{DocError, DocResult};

/// A parsed filter expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Matches every document (`{}`).
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    /// All conditions must hold for the value(s) at `path`.
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
}

/// A single predicate applied to the value(s) found at a field path.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    /// Some array element is a document matching the filter.
    ElemMatch(Box<Filter>),
    /// Some array element satisfies every condition.
    ElemMatchValue(Vec<Condition>),
}

impl Filter {
    /// The match-everything filter.
    pub fn all() -> Self {
        Self::All
    }

    /// Equality on a single dotted path.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field {
            path: path.into(),
            conditions: vec![Condition::Eq(value.into())],
        }
    }

    /// Parse a filter from JSON text. Empty or whitespace-only text is `{}`.
    pub fn parse(text: &str) -> DocResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::All);
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| DocError::InvalidFilter(format!("{e}: {text}")))?;
        Self::from_value(&value)
    }

    /// Build a filter from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> DocResult<Self> {
        match value {
            Value::Object(doc) => Self::from_document(doc),
            other => Err(DocError::InvalidFilter(format!(
                "filter must be a document, got {}",
                type_name(other)
            ))),
        }
    }

    /// Build a filter from a filter document.
    pub fn from_document(doc: &Document) -> DocResult<Self> {
        let mut clauses = Vec::with_capacity(doc.len());
        for (key, value) in doc {
            let clause = match key.as_str() {
                "$and" => Self::And(parse_clause_list(key, value)?),
                "$or" => Self::Or(parse_clause_list(key, value)?),
                "$nor" => Self::Nor(parse_clause_list(key, value)?),
                op if op.starts_with('$') => {
                    return Err(DocError::InvalidFilter(format!(
                        "unknown top-level operator {op}"
                    )))
                }
                path => Self::Field {
                    path: path.to_string(),
                    conditions: parse_conditions(value)?,
                },
            };
            clauses.push(clause);
        }
        Ok(match clauses.len() {
            0 => Self::All,
            1 => clauses.remove(0),
            _ => Self::And(clauses),
        })
    }

    /// Combine two filters so both must match.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All, f) | (f, Self::All) => f,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), f) => {
                left.push(f);
                Self::And(left)
            }
            (f, g) => Self::And(vec![f, g]),
        }
    }

    /// Evaluate this filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            Self::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
            Self::Nor(clauses) => !clauses.iter().any(|c| c.matches(doc)),
            Self::Field { path, conditions } => {
                let mut found = Vec::new();
                resolve(doc, path, &mut found);
                conditions.iter().all(|c| c.holds(&found))
            }
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::All
    }
}

impl Condition {
    fn holds(&self, found: &[&Value]) -> bool {
        match self {
            Self::Eq(expected) => equals_any(found, expected),
            Self::Ne(expected) => !equals_any(found, expected),
            Self::In(options) => options.iter().any(|o| equals_any(found, o)),
            Self::Nin(options) => !options.iter().any(|o| equals_any(found, o)),
            Self::Exists(wanted) => found.is_empty() != *wanted,
            Self::Gt(bound) => compares_any(found, bound, |o| o == Ordering::Greater),
            Self::Gte(bound) => compares_any(found, bound, |o| o != Ordering::Less),
            Self::Lt(bound) => compares_any(found, bound, |o| o == Ordering::Less),
            Self::Lte(bound) => compares_any(found, bound, |o| o != Ordering::Greater),
            Self::ElemMatch(filter) => found.iter().any(|value| match value {
                Value::Array(items) => items.iter().any(|item| match item {
                    Value::Object(doc) => filter.matches(doc),
                    _ => false,
                }),
                _ => false,
            }),
            Self::ElemMatchValue(conditions) => found.iter().any(|value| match value {
                Value::Array(items) => items
                    .iter()
                    .any(|item| conditions.iter().all(|c| c.holds(&[item]))),
                _ => false,
            }),
        }
    }
}

fn parse_clause_list(op: &str, value: &Value) -> DocResult<Vec<Filter>> {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().map(Filter::from_value).collect(),
        _ => Err(DocError::InvalidFilter(format!(
            "{op} requires a non-empty array of filters"
        ))),
    }
}

fn parse_conditions(value: &Value) -> DocResult<Vec<Condition>> {
    let ops = match value {
        Value::Object(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => doc,
        other => return Ok(vec![Condition::Eq(other.clone())]),
    };
    ops.iter()
        .map(|(op, arg)| {
            Ok(match op.as_str() {
                "$eq" => Condition::Eq(arg.clone()),
                "$ne" => Condition::Ne(arg.clone()),
                "$gt" => Condition::Gt(arg.clone()),
                "$gte" => Condition::Gte(arg.clone()),
                "$lt" => Condition::Lt(arg.clone()),
                "$lte" => Condition::Lte(arg.clone()),
                "$in" => Condition::In(array_arg(op, arg)?),
                "$nin" => Condition::Nin(array_arg(op, arg)?),
                "$exists" => Condition::Exists(truthy(arg)),
                "$elemMatch" => match arg {
                    Value::Object(doc) if doc.keys().all(|k| k.starts_with('$')) && !doc.is_empty() => {
                        Condition::ElemMatchValue(parse_conditions(arg)?)
                    }
                    Value::Object(doc) => Condition::ElemMatch(Box::new(Filter::from_document(doc)?)),
                    _ => {
                        return Err(DocError::InvalidFilter(
                            "$elemMatch requires a document".into(),
                        ))
                    }
                },
                unknown => {
                    return Err(DocError::InvalidFilter(format!("unknown operator {unknown}")))
                }
            })
        })
        .collect()
}

fn array_arg(op: &str, arg: &Value) -> DocResult<Vec<Value>> {
    match arg {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(DocError::InvalidFilter(format!("{op} requires an array"))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// Collect every value reachable at `path`, fanning out through arrays.
fn resolve<'a>(doc: &'a Document, path: &str, out: &mut Vec<&'a Value>) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if let Some(value) = doc.get(head) {
        resolve_value(value, rest, out);
    }
}

fn resolve_value<'a>(value: &'a Value, rest: Option<&str>, out: &mut Vec<&'a Value>) {
    let Some(rest) = rest else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(doc) => resolve(doc, rest, out),
        Value::Array(items) => {
            let (head, tail) = match rest.split_once('.') {
                Some((head, tail)) => (head, Some(tail)),
                None => (rest, None),
            };
            if let Some(item) = head.parse::<usize>().ok().and_then(|i| items.get(i)) {
                resolve_value(item, tail, out);
            }
            for item in items {
                if let Value::Object(doc) = item {
                    resolve(doc, rest, out);
                }
            }
        }
        _ => {}
    }
}

fn equals_any(found: &[&Value], expected: &Value) -> bool {
    if found.is_empty() {
        return expected.is_null();
    }
    found.iter().any(|value| {
        values_equal(value, expected)
            || matches!(value, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
    })
}

fn compares_any(found: &[&Value], bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let comparable = |v: &Value| {
        std::mem::discriminant(v) == std::mem::discriminant(bound) && accept(compare_values(v, bound))
    };
    found.iter().any(|value| match value {
        Value::Array(items) if !bound.is_array() => items.iter().any(comparable),
        other => comparable(*other),
    })
}
