//! Aggregation pipeline stages and their evaluation.
//!
//! A pipeline is an ordered list of [`Stage`]s; each consumes the document
//! stream produced by the previous one. The stage set mirrors the subset of
//! the usual document-database aggregation language that Folio's views and
//! paged queries rely on.

use folio_doc::{get_path, remove_path, set_path, Document, Filter, SortSpec, Value};
use serde_json::Map;

use crate::error::{DbError, DbResult};

/// `field ← value at source path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    /// Output field (dotted paths create nested documents).
    pub field: String,
    /// Dotted source path in the input document.
    pub source: String,
}

impl Projection {
    /// Copy the value at `source` into `field`.
    pub fn new(field: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source: source.into(),
        }
    }

    /// Keep a field under its own name.
    pub fn include(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            source: field.clone(),
            field,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    /// Keep documents matching the filter.
    Match(Filter),
    Sort(SortSpec),
    Skip(usize),
    Limit(usize),
    /// Replace each document by the listed fields only. Missing sources are omitted.
    Project(Vec<Projection>),
    /// Keep only the elements of the array at `field` that match `filter`.
    FilterArray { field: String, filter: Filter },
    /// Emit one document per element of the array at `field`.
    /// Documents where the field is missing or empty are dropped.
    Unwind(String),
    /// Join: store every document of `from` whose `foreign_field` equals this
    /// document's `local_field` as an array under `as_field`.
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    /// Add or overwrite fields from source paths. Missing sources are skipped.
    Set(Vec<Projection>),
    /// Promote the document at `path` to be the whole document.
    /// Documents where it is absent or not a document are dropped.
    ReplaceRoot(String),
    /// Fold the whole stream into one `{count_field: n, docs_field: [...]}`
    /// document. An empty stream stays empty.
    Collect {
        count_field: String,
        docs_field: String,
    },
    /// Narrow the array at `field` to `[skip, skip + limit)`.
    Slice {
        field: String,
        skip: usize,
        limit: usize,
    },
}

impl Stage {
    /// Short stage name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Match(_) => "match",
            Self::Sort(_) => "sort",
            Self::Skip(_) => "skip",
            Self::Limit(_) => "limit",
            Self::Project(_) => "project",
            Self::FilterArray { .. } => "filterArray",
            Self::Unwind(_) => "unwind",
            Self::Lookup { .. } => "lookup",
            Self::Set(_) => "set",
            Self::ReplaceRoot(_) => "replaceRoot",
            Self::Collect { .. } => "collect",
            Self::Slice { .. } => "slice",
        }
    }
}

/// Reads a whole namespace for `Lookup` stages.
pub type NamespaceReader<'a> = dyn Fn(&str) -> DbResult<Vec<Document>> + 'a;

/// Run `stages` over `docs`.
pub fn run(stages: &[Stage], mut docs: Vec<Document>, read: &NamespaceReader<'_>) -> DbResult<Vec<Document>> {
    for stage in stages {
        docs = apply(stage, docs, read)?;
    }
    Ok(docs)
}

fn apply(stage: &Stage, docs: Vec<Document>, read: &NamespaceReader<'_>) -> DbResult<Vec<Document>> {
    Ok(match stage {
        Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
        Stage::Sort(spec) => {
            let mut docs = docs;
            spec.sort(&mut docs);
            docs
        }
        Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
        Stage::Limit(n) => docs.into_iter().take(*n).collect(),
        Stage::Project(fields) => docs
            .into_iter()
            .map(|doc| {
                let mut out = Map::new();
                for p in fields {
                    if let Some(value) = get_path(&doc, &p.source) {
                        set_path(&mut out, &p.field, value.clone());
                    }
                }
                out
            })
            .collect(),
        Stage::FilterArray { field, filter } => docs
            .into_iter()
            .map(|mut doc| {
                if let Some(Value::Array(items)) = get_path(&doc, field) {
                    let kept: Vec<Value> = items
                        .iter()
                        .filter(|item| matches!(item, Value::Object(d) if filter.matches(d)))
                        .cloned()
                        .collect();
                    set_path(&mut doc, field, Value::Array(kept));
                }
                doc
            })
            .collect(),
        Stage::Unwind(field) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                let items = match get_path(&doc, field) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Null) | None => continue,
                    Some(scalar) => vec![scalar.clone()],
                };
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
            out
        }
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => {
            let foreign = read(from)?;
            docs.into_iter()
                .map(|mut doc| {
                    let local = get_path(&doc, local_field).cloned().unwrap_or(Value::Null);
                    let joined: Vec<Value> = foreign
                        .iter()
                        .filter(|f| Filter::eq(foreign_field.as_str(), local.clone()).matches(f))
                        .cloned()
                        .map(Value::Object)
                        .collect();
                    set_path(&mut doc, as_field, Value::Array(joined));
                    doc
                })
                .collect()
        }
        Stage::Set(fields) => docs
            .into_iter()
            .map(|mut doc| {
                let values: Vec<(String, Value)> = fields
                    .iter()
                    .filter_map(|p| get_path(&doc, &p.source).map(|v| (p.field.clone(), v.clone())))
                    .collect();
                for (field, value) in values {
                    set_path(&mut doc, &field, value);
                }
                doc
            })
            .collect(),
        Stage::ReplaceRoot(path) => docs
            .into_iter()
            .filter_map(|mut doc| match remove_path(&mut doc, path) {
                Some(Value::Object(root)) => Some(root),
                _ => None,
            })
            .collect(),
        Stage::Collect {
            count_field,
            docs_field,
        } => {
            if docs.is_empty() {
                return Ok(docs);
            }
            let mut out = Map::new();
            out.insert(count_field.clone(), Value::from(docs.len() as u64));
            out.insert(
                docs_field.clone(),
                Value::Array(docs.into_iter().map(Value::Object).collect()),
            );
            vec![out]
        }
        Stage::Slice { field, skip, limit } => {
            let mut out = Vec::with_capacity(docs.len());
            for mut doc in docs {
                match get_path(&doc, field) {
                    Some(Value::Array(items)) => {
                        let window: Vec<Value> = items.iter().skip(*skip).take(*limit).cloned().collect();
                        set_path(&mut doc, field, Value::Array(window));
                    }
                    Some(other) => {
                        return Err(DbError::Pipeline(format!(
                            "slice: {field} is not an array ({other})"
                        )))
                    }
                    None => {}
                }
                out.push(doc);
            }
            out
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_doc::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    fn no_namespaces(_: &str) -> DbResult<Vec<Document>> {
        Ok(Vec::new())
    }

    fn numbers(n: i64) -> Vec<Document> {
        (0..n).map(|i| doc(json!({"n": i, "even": i % 2 == 0}))).collect()
    }

    #[test]
    fn match_sort_skip_limit() {
        let stages = vec![
            Stage::Match(Filter::eq("even", true)),
            Stage::Sort(SortSpec::descending("n")),
            Stage::Skip(1),
            Stage::Limit(2),
        ];
        let out = run(&stages, numbers(10), &no_namespaces).unwrap();
        let ns: Vec<i64> = out.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![6, 4]);
    }

    #[test]
    fn collect_then_slice_pages_a_result() {
        let stages = vec![
            Stage::Collect {
                count_field: "numFound".into(),
                docs_field: "docs".into(),
            },
            Stage::Slice {
                field: "docs".into(),
                skip: 3,
                limit: 4,
            },
        ];
        let out = run(&stages, numbers(5), &no_namespaces).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["numFound"], json!(5));
        assert_eq!(out[0]["docs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn collect_on_empty_stream_emits_nothing() {
        let stages = vec![Stage::Collect {
            count_field: "numFound".into(),
            docs_field: "docs".into(),
        }];
        assert!(run(&stages, Vec::new(), &no_namespaces).unwrap().is_empty());
    }

    #[test]
    fn filter_array_unwind_project() {
        let input = vec![doc(json!({
            "redboxOid": "o1",
            "files": [
                {"pid": "a.png", "oid": "o1"},
                {"pid": "metadata.tfpackage", "oid": "o1", "source": {"payload": {"title": "T"}}}
            ]
        }))];
        let stages = vec![
            Stage::FilterArray {
                field: "files".into(),
                filter: Filter::eq("pid", "metadata.tfpackage"),
            },
            Stage::Unwind("files".into()),
            Stage::Project(vec![
                Projection::new("metadata", "files.source.payload"),
                Projection::new("redboxOid", "files.oid"),
            ]),
        ];
        let out = run(&stages, input, &no_namespaces).unwrap();
        assert_eq!(out, vec![doc(json!({"metadata": {"title": "T"}, "redboxOid": "o1"}))]);
    }

    #[test]
    fn unwind_drops_missing_and_empty() {
        let input = vec![
            doc(json!({"k": 1, "xs": [1, 2]})),
            doc(json!({"k": 2, "xs": []})),
            doc(json!({"k": 3})),
        ];
        let out = run(&[Stage::Unwind("xs".into())], input, &no_namespaces).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], doc(json!({"k": 1, "xs": 2})));
    }

    #[test]
    fn lookup_set_replace_root() {
        let parents = vec![
            doc(json!({"redboxOid": "o1", "date_object_created": "2020"})),
            doc(json!({"redboxOid": "o2", "date_object_created": "2021"})),
        ];
        let read = move |name: &str| -> DbResult<Vec<Document>> {
            assert_eq!(name, "tf_obj_meta");
            Ok(parents.clone())
        };
        let input = vec![doc(json!({"redboxOid": "o2", "metadata": {"title": "T"}}))];
        let stages = vec![
            Stage::Lookup {
                from: "tf_obj_meta".into(),
                local_field: "redboxOid".into(),
                foreign_field: "redboxOid".into(),
                as_field: "tfObj".into(),
            },
            Stage::Set(vec![
                Projection::new("metadata.redboxOid", "redboxOid"),
                Projection::new("metadata.date_object_created", "tfObj.0.date_object_created"),
                Projection::new("metadata.packageType", "tfObj.0.packageType"),
            ]),
            Stage::ReplaceRoot("metadata".into()),
        ];
        let out = run(&stages, input, &read).unwrap();
        assert_eq!(
            out,
            vec![doc(json!({"title": "T", "redboxOid": "o2", "date_object_created": "2021"}))]
        );
    }

    #[test]
    fn slice_rejects_non_arrays() {
        let stages = vec![Stage::Slice {
            field: "n".into(),
            skip: 0,
            limit: 1,
        }];
        assert!(matches!(
            run(&stages, numbers(1), &no_namespaces),
            Err(DbError::Pipeline(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn collect_slice_window_is_bounded(n in 0i64..40, skip in 0usize..50, limit in 0usize..50) {
            let stages = vec![
                Stage::Match(Filter::eq("even", true)),
                Stage::Collect {
                    count_field: "numFound".into(),
                    docs_field: "docs".into(),
                },
                Stage::Slice {
                    field: "docs".into(),
                    skip,
                    limit,
                },
            ];
            let out = run(&stages, numbers(n), &no_namespaces).unwrap();
            let matching = ((n + 1) / 2) as usize;
            if matching == 0 {
                proptest::prop_assert!(out.is_empty());
            } else {
                proptest::prop_assert_eq!(out[0]["numFound"].as_u64(), Some(matching as u64));
                let page = out[0]["docs"].as_array().unwrap();
                proptest::prop_assert_eq!(page.len(), limit.min(matching.saturating_sub(skip)));
            }
        }
    }
}
