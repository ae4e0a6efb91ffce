use std::collections::BTreeMap;
use std::sync::RwLock;

use folio_doc::{get_path, values_equal, Document, Filter, Value};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::pipeline::{self, Stage};
use crate::traits::{DocumentDatabase, FindOptions, IndexSpec};

/// Views may be defined over views; this bounds the chain.
const MAX_VIEW_DEPTH: usize = 16;

#[derive(Clone, Debug)]
struct ViewDef {
    source: String,
    pipeline: Vec<Stage>,
}

#[derive(Default)]
pub(crate) struct DbState {
    pub(crate) collections: BTreeMap<String, Vec<Document>>,
    pub(crate) indexes: BTreeMap<String, Vec<IndexSpec>>,
    views: BTreeMap<String, ViewDef>,
}

/// In-memory document database.
///
/// Intended for tests, the CLI and embedding. Collections are vectors in
/// insertion order behind a single `RwLock`; every write takes the write
/// lock, so each single-document operation is atomic.
pub struct InMemoryDatabase {
    state: RwLock<DbState>,
}

impl InMemoryDatabase {
    /// Create an empty database with no collections.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DbState::default()),
        }
    }

    pub(crate) fn from_parts(
        collections: BTreeMap<String, Vec<Document>>,
        indexes: BTreeMap<String, Vec<IndexSpec>>,
    ) -> Self {
        Self {
            state: RwLock::new(DbState {
                collections,
                indexes,
                views: BTreeMap::new(),
            }),
        }
    }

    /// Clone of the stored collections and index definitions (views excluded).
    pub(crate) fn export_parts(
        &self,
    ) -> (BTreeMap<String, Vec<Document>>, BTreeMap<String, Vec<IndexSpec>>) {
        let state = self.state.read().expect("lock poisoned");
        (state.collections.clone(), state.indexes.clone())
    }

    /// Number of documents in a collection (0 if it does not exist).
    pub fn len(&self, collection: &str) -> usize {
        let state = self.state.read().expect("lock poisoned");
        state.collections.get(collection).map_or(0, Vec::len)
    }

    /// Returns `true` if no collection holds any document.
    pub fn is_empty(&self) -> bool {
        let state = self.state.read().expect("lock poisoned");
        state.collections.values().all(Vec::is_empty)
    }

    /// Index definitions for a collection.
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        let state = self.state.read().expect("lock poisoned");
        state.indexes.get(collection).cloned().unwrap_or_default()
    }

    /// Returns `true` if `name` is a view.
    pub fn is_view(&self, name: &str) -> bool {
        let state = self.state.read().expect("lock poisoned");
        state.views.contains_key(name)
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl DbState {
    fn read_namespace(&self, name: &str, depth: usize) -> DbResult<Vec<Document>> {
        if let Some(view) = self.views.get(name) {
            if depth >= MAX_VIEW_DEPTH {
                return Err(DbError::Pipeline(format!(
                    "view {name}: nesting deeper than {MAX_VIEW_DEPTH}"
                )));
            }
            let base = self.read_namespace(&view.source, depth + 1)?;
            let read = |other: &str| self.read_namespace(other, depth + 1);
            return pipeline::run(&view.pipeline, base, &read);
        }
        Ok(self.collections.get(name).cloned().unwrap_or_default())
    }

    fn ensure_writable(&self, name: &str) -> DbResult<()> {
        if self.views.contains_key(name) {
            return Err(DbError::ReadOnlyView(name.to_string()));
        }
        Ok(())
    }

    /// Reject `doc` if it collides on any unique index with a document
    /// other than the one at position `replacing`.
    fn check_unique(
        &self,
        collection: &str,
        doc: &Document,
        replacing: Option<usize>,
    ) -> DbResult<()> {
        let Some(indexes) = self.indexes.get(collection) else {
            return Ok(());
        };
        let existing = self.collections.get(collection);
        for index in indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, doc);
            if index.sparse && key.iter().all(Value::is_null) {
                continue;
            }
            let clash = existing.into_iter().flatten().enumerate().any(|(pos, other)| {
                Some(pos) != replacing
                    && index_key(index, other)
                        .iter()
                        .zip(key.iter())
                        .all(|(a, b)| values_equal(a, b))
            });
            if clash {
                return Err(DbError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    key: Value::Array(key).to_string(),
                });
            }
        }
        Ok(())
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|k| get_path(doc, k).cloned().unwrap_or(Value::Null))
        .collect()
}

impl DocumentDatabase for InMemoryDatabase {
    fn insert_one(&self, collection: &str, doc: Document) -> DbResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        state.ensure_writable(collection)?;
        state.check_unique(collection, &doc, None)?;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> DbResult<Vec<Document>> {
        let state = self.state.read().expect("lock poisoned");
        let mut docs: Vec<Document> = state
            .read_namespace(collection, 0)?
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();
        if let Some(sort) = &options.sort {
            sort.sort(&mut docs);
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(options.skip).take(limit).collect())
    }

    fn replace_one(&self, collection: &str, filter: &Filter, doc: Document) -> DbResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        state.ensure_writable(collection)?;
        let position = state
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().position(|d| filter.matches(d)));
        let Some(position) = position else {
            return Ok(false);
        };
        state.check_unique(collection, &doc, Some(position))?;
        if let Some(docs) = state.collections.get_mut(collection) {
            docs[position] = doc;
        }
        Ok(true)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> DbResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        state.ensure_writable(collection)?;
        let Some(docs) = state.collections.get_mut(collection) else {
            return Ok(false);
        };
        match docs.iter().position(|d| filter.matches(d)) {
            Some(position) => {
                docs.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn aggregate(&self, collection: &str, stages: &[Stage]) -> DbResult<Vec<Document>> {
        let state = self.state.read().expect("lock poisoned");
        let base = state.read_namespace(collection, 0)?;
        let read = |other: &str| state.read_namespace(other, 1);
        pipeline::run(stages, base, &read)
    }

    fn create_view(&self, name: &str, source: &str, stages: Vec<Stage>) -> DbResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.views.contains_key(name) || state.collections.contains_key(name) {
            return Err(DbError::NamespaceExists(name.to_string()));
        }
        debug!(view = name, source, stages = stages.len(), "creating view");
        state.views.insert(
            name.to_string(),
            ViewDef {
                source: source.to_string(),
                pipeline: stages,
            },
        );
        Ok(())
    }

    fn create_index(&self, collection: &str, index: IndexSpec) -> DbResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        state.ensure_writable(collection)?;
        let existing = state.indexes.entry(collection.to_string()).or_default();
        if existing.iter().any(|i| i.name == index.name) {
            return Ok(());
        }
        existing.push(index.clone());
        if index.unique {
            // Existing documents must already satisfy a new unique index.
            let docs = state.collections.get(collection).cloned().unwrap_or_default();
            for (pos, doc) in docs.iter().enumerate() {
                if let Err(err) = state.check_unique(collection, doc, Some(pos)) {
                    if let Some(list) = state.indexes.get_mut(collection) {
                        list.retain(|i| i.name != index.name);
                    }
                    return Err(err);
                }
            }
        }
        debug!(collection, index = %index.name, "created index");
        Ok(())
    }

    fn list_collections(&self) -> DbResult<Vec<String>> {
        let state = self.state.read().expect("lock poisoned");
        let mut names: Vec<String> = state
            .collections
            .keys()
            .chain(state.views.keys())
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn drop_database(&self) -> DbResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        *state = DbState::default();
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("InMemoryDatabase")
            .field("collections", &state.collections.len())
            .field("views", &state.views.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Projection;
    use folio_doc::{json, SortSpec};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    fn seeded() -> InMemoryDatabase {
        let db = InMemoryDatabase::new();
        for i in 0..5 {
            db.insert_one("things", doc(json!({"id": format!("t{i}"), "n": i})))
                .unwrap();
        }
        db
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn insert_and_find_in_natural_order() {
        let db = seeded();
        let all = db.find("things", &Filter::All, &FindOptions::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3", "t4"]);
        assert_eq!(db.len("things"), 5);
    }

    #[test]
    fn find_window_and_sort() {
        let db = seeded();
        let options = FindOptions {
            sort: Some(SortSpec::descending("n")),
            skip: 1,
            limit: Some(2),
        };
        let page = db.find("things", &Filter::All, &options).unwrap();
        let ns: Vec<i64> = page.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 2]);
    }

    #[test]
    fn missing_collection_reads_empty() {
        let db = InMemoryDatabase::new();
        assert!(db.find_one("nothing", &Filter::All).unwrap().is_none());
        assert_eq!(db.count("nothing", &Filter::All).unwrap(), 0);
    }

    #[test]
    fn replace_is_whole_document() {
        let db = seeded();
        let replaced = db
            .replace_one("things", &Filter::eq("id", "t2"), doc(json!({"id": "t2"})))
            .unwrap();
        assert!(replaced);
        let found = db.find_one("things", &Filter::eq("id", "t2")).unwrap().unwrap();
        assert_eq!(found, doc(json!({"id": "t2"})));
        assert!(!db
            .replace_one("things", &Filter::eq("id", "zz"), Document::new())
            .unwrap());
    }

    #[test]
    fn delete_one_removes_first_match_only() {
        let db = seeded();
        assert!(db.delete_one("things", &Filter::All).unwrap());
        assert_eq!(db.len("things"), 4);
        assert!(!db.delete_one("things", &Filter::eq("id", "t0")).unwrap());
    }

    #[test]
    fn distinct_values() {
        let db = InMemoryDatabase::new();
        for oid in ["a", "b", "a"] {
            db.insert_one("meta", doc(json!({"redboxOid": oid}))).unwrap();
        }
        db.insert_one("meta", doc(json!({"other": 1}))).unwrap();
        assert_eq!(db.distinct("meta", "redboxOid").unwrap(), vec![json!("a"), json!("b")]);
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    #[test]
    fn unique_index_rejects_duplicates() {
        let db = InMemoryDatabase::new();
        db.create_index("meta", IndexSpec::ascending("oid", &["redboxOid"]).unique())
            .unwrap();
        db.insert_one("meta", doc(json!({"redboxOid": "x"}))).unwrap();
        let err = db
            .insert_one("meta", doc(json!({"redboxOid": "x"})))
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateKey { ref index, .. } if index == "oid"));
        db.insert_one("meta", doc(json!({"redboxOid": "y"}))).unwrap();
        // Replacing a document with its own key is fine; stealing another's is not.
        assert!(db
            .replace_one("meta", &Filter::eq("redboxOid", "x"), doc(json!({"redboxOid": "x", "v": 2})))
            .unwrap());
        assert!(matches!(
            db.replace_one("meta", &Filter::eq("redboxOid", "y"), doc(json!({"redboxOid": "x"}))),
            Err(DbError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn sparse_unique_index_ignores_missing_keys() {
        let db = InMemoryDatabase::new();
        db.create_index("c", IndexSpec::ascending("k", &["k"]).unique().sparse())
            .unwrap();
        db.insert_one("c", doc(json!({"other": 1}))).unwrap();
        db.insert_one("c", doc(json!({"other": 2}))).unwrap();
        assert_eq!(db.len("c"), 2);
    }

    #[test]
    fn index_creation_is_idempotent_and_validates_existing_data() {
        let db = InMemoryDatabase::new();
        db.insert_one("c", doc(json!({"k": 1}))).unwrap();
        db.insert_one("c", doc(json!({"k": 1}))).unwrap();
        let spec = IndexSpec::ascending("k", &["k"]);
        db.create_index("c", spec.clone()).unwrap();
        db.create_index("c", spec).unwrap();
        assert_eq!(db.indexes("c").len(), 1);
        assert!(matches!(
            db.create_index("c", IndexSpec::ascending("k_unique", &["k"]).unique()),
            Err(DbError::DuplicateKey { .. })
        ));
        assert_eq!(db.indexes("c").len(), 1);
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    #[test]
    fn views_are_fresh_read_only_and_unique() {
        let db = seeded();
        db.create_view(
            "big",
            "things",
            vec![
                Stage::Match(Filter::parse(r#"{"n": {"$gte": 3}}"#).unwrap()),
                Stage::Project(vec![Projection::include("id")]),
            ],
        )
        .unwrap();
        assert_eq!(db.count("big", &Filter::All).unwrap(), 2);

        db.insert_one("things", doc(json!({"id": "t9", "n": 9}))).unwrap();
        let ids = db.distinct("big", "id").unwrap();
        assert_eq!(ids, vec![json!("t3"), json!("t4"), json!("t9")]);

        assert!(matches!(
            db.insert_one("big", Document::new()),
            Err(DbError::ReadOnlyView(_))
        ));
        assert!(matches!(
            db.create_view("big", "things", vec![]),
            Err(DbError::NamespaceExists(_))
        ));
        assert!(matches!(
            db.create_view("things", "big", vec![]),
            Err(DbError::NamespaceExists(_))
        ));
    }

    #[test]
    fn views_can_stack() {
        let db = seeded();
        db.create_view("odd", "things", vec![Stage::Match(Filter::parse(r#"{"n": {"$in": [1, 3]}}"#).unwrap())])
            .unwrap();
        db.create_view("odd_top", "odd", vec![Stage::Sort(SortSpec::descending("n")), Stage::Limit(1)])
            .unwrap();
        let top = db.find_one("odd_top", &Filter::All).unwrap().unwrap();
        assert_eq!(top["n"], json!(3));
        assert!(db.is_view("odd_top"));
    }

    #[test]
    fn aggregate_over_collection() {
        let db = seeded();
        let out = db
            .aggregate(
                "things",
                &[
                    Stage::Match(Filter::All),
                    Stage::Collect {
                        count_field: "numFound".into(),
                        docs_field: "docs".into(),
                    },
                    Stage::Slice {
                        field: "docs".into(),
                        skip: 0,
                        limit: 2,
                    },
                ],
            )
            .unwrap();
        assert_eq!(out[0]["numFound"], json!(5));
        assert_eq!(out[0]["docs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn drop_database_clears_everything() {
        let db = seeded();
        db.create_view("v", "things", vec![]).unwrap();
        db.drop_database().unwrap();
        assert!(db.is_empty());
        assert!(db.list_collections().unwrap().is_empty());
    }

    #[test]
    fn concurrent_inserts_respect_unique_index() {
        use std::sync::Arc;
        use std::thread;

        let db = Arc::new(InMemoryDatabase::new());
        db.create_index("meta", IndexSpec::ascending("oid", &["redboxOid"]).unique())
            .unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || db.insert_one("meta", doc(json!({"redboxOid": "race"}))).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(db.len("meta"), 1);
    }
}
