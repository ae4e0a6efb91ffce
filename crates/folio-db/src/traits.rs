use std::io::Read;

use chrono::{DateTime, Utc};
use folio_doc::{Document, Filter, SortSpec, Value};
use serde::{Deserialize, Serialize};

use crate::error::DbResult;
use crate::pipeline::Stage;

/// Window and ordering applied to a `find`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// A `[skip, skip + limit)` window in natural order.
    pub fn window(skip: usize, limit: usize) -> Self {
        Self {
            sort: None,
            skip,
            limit: Some(limit),
        }
    }
}

/// Index definition. Indexes with an existing name are left untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Dotted key paths, in order.
    pub keys: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Sparse indexes ignore documents that have none of the key fields.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    /// An ascending index over `keys`, neither unique nor sparse.
    pub fn ascending(name: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
            sparse: false,
        }
    }

    /// Reject documents that duplicate an existing key.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Skip documents missing every indexed field.
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// Document database boundary.
///
/// All implementations must satisfy these invariants:
/// - Each write affects a single document and is atomic.
/// - Reading a collection that was never written returns no documents
///   rather than an error.
/// - Views are read-only and always reflect the current state of their
///   source.
/// - All I/O errors are propagated, never silently ignored.
pub trait DocumentDatabase: Send + Sync {
    /// Insert a new document.
    ///
    /// Fails with `DuplicateKey` if a unique index would be violated.
    fn insert_one(&self, collection: &str, doc: Document) -> DbResult<()>;

    /// Matching documents in natural (insertion) order unless sorted.
    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions)
        -> DbResult<Vec<Document>>;

    /// Replace the first document matching `filter` wholesale.
    ///
    /// Returns `Ok(false)` if nothing matched.
    fn replace_one(&self, collection: &str, filter: &Filter, doc: Document) -> DbResult<bool>;

    /// Delete the first document matching `filter`. Returns `true` if one was deleted.
    fn delete_one(&self, collection: &str, filter: &Filter) -> DbResult<bool>;

    /// Run an aggregation pipeline over a collection or view.
    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> DbResult<Vec<Document>>;

    /// Define a read-only view of `source` transformed by `pipeline`.
    ///
    /// Fails with `NamespaceExists` if `name` is already a collection or view.
    fn create_view(&self, name: &str, source: &str, pipeline: Vec<Stage>) -> DbResult<()>;

    /// Create an index on a collection.
    fn create_index(&self, collection: &str, index: IndexSpec) -> DbResult<()>;

    /// Names of all collections and views.
    fn list_collections(&self) -> DbResult<Vec<String>>;

    /// Remove every collection, view and index.
    fn drop_database(&self) -> DbResult<()>;

    /// The first matching document.
    fn find_one(&self, collection: &str, filter: &Filter) -> DbResult<Option<Document>> {
        let mut docs = self.find(collection, filter, &FindOptions::window(0, 1))?;
        Ok(docs.pop())
    }

    /// Number of matching documents.
    fn count(&self, collection: &str, filter: &Filter) -> DbResult<u64> {
        Ok(self.find(collection, filter, &FindOptions::default())?.len() as u64)
    }

    /// Distinct values of `field` across the collection, in first-seen order.
    ///
    /// Array values contribute their elements.
    fn distinct(&self, collection: &str, field: &str) -> DbResult<Vec<Value>> {
        let docs = self.find(collection, &Filter::All, &FindOptions::default())?;
        let mut seen: Vec<Value> = Vec::new();
        for doc in &docs {
            let candidates = match folio_doc::get_path(doc, field) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in candidates {
                if !seen.iter().any(|s| folio_doc::values_equal(s, &value)) {
                    seen.push(value);
                }
            }
        }
        Ok(seen)
    }
}

/// Descriptive data about one stored large object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LargeObjectInfo {
    pub id: String,
    pub filename: String,
    pub length: u64,
    pub metadata: Document,
    pub upload_date: DateTime<Utc>,
}

/// Large-object (blob) store boundary.
///
/// Uploads are immutable; replacing content means uploading a new object
/// and deleting the old one.
pub trait LargeObjectStore: Send + Sync {
    /// Store the full contents of `source` and return the generated id.
    fn upload(&self, filename: &str, source: &mut dyn Read, metadata: Document)
        -> DbResult<String>;

    /// Open a reader over an object's bytes. Dropping the reader releases it.
    fn open(&self, id: &str) -> DbResult<Box<dyn Read + Send>>;

    /// Metadata for an object.
    fn info(&self, id: &str) -> DbResult<LargeObjectInfo>;

    /// Delete an object. Fails with `LargeObjectNotFound` if absent.
    fn delete(&self, id: &str) -> DbResult<()>;

    /// All objects uploaded under `filename`, oldest first.
    fn find_by_filename(&self, filename: &str) -> DbResult<Vec<LargeObjectInfo>>;
}
