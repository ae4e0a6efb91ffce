//! Paged and streaming queries over record collections and views.

use std::collections::VecDeque;
use std::sync::Arc;

use folio_db::{DocumentDatabase, FindOptions, Stage};
use folio_doc::{Document, Filter, KeyCodec, SortSpec, Value};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Count field of a paged result.
pub const NUM_FOUND_FIELD: &str = "numFound";
/// Page field of a paged result.
pub const DOCS_FIELD: &str = "docs";

/// Rows returned by a paged query when the caller does not say.
pub const DEFAULT_ROWS: usize = 10;

/// One page of a query plus the total number of matches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PagedResult {
    #[serde(rename = "numFound")]
    pub num_found: u64,
    pub docs: Vec<Document>,
}

impl PagedResult {
    /// Interpret the output of [`paged_pipeline`]. No output means no
    /// matches.
    pub fn from_aggregate(mut output: Vec<Document>, codec: &KeyCodec) -> StorageResult<Self> {
        let Some(combined) = output.pop() else {
            return Ok(Self::default());
        };
        let num_found = combined
            .get(NUM_FOUND_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let docs = match combined.get(DOCS_FIELD) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(doc) => Some(codec.unescape(doc)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self { num_found, docs })
    }
}

/// Match, optionally sort, count everything, then keep
/// `[start, start + rows)`.
pub fn paged_pipeline(filter: Filter, start: usize, rows: usize, sort: Option<SortSpec>) -> Vec<Stage> {
    let mut stages = vec![Stage::Match(filter)];
    if let Some(sort) = sort.filter(|s| !s.is_empty()) {
        stages.push(Stage::Sort(sort));
    }
    stages.push(Stage::Collect {
        count_field: NUM_FOUND_FIELD.into(),
        docs_field: DOCS_FIELD.into(),
    });
    stages.push(Stage::Slice {
        field: DOCS_FIELD.into(),
        skip: start,
        limit: rows,
    });
    stages
}

/// Lazy iterator over every document matching a filter.
///
/// Documents are fetched a batch at a time. Each call to
/// `ObjectStore::query` starts a new cursor from the beginning.
pub struct QueryCursor {
    db: Arc<dyn DocumentDatabase>,
    codec: KeyCodec,
    collection: String,
    filter: Filter,
    batch_size: usize,
    offset: usize,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl QueryCursor {
    /// Documents fetched per window unless changed.
    pub const DEFAULT_BATCH: usize = 100;

    pub(crate) fn new(db: Arc<dyn DocumentDatabase>, codec: KeyCodec, collection: String, filter: Filter) -> Self {
        Self {
            db,
            codec,
            collection,
            filter,
            batch_size: Self::DEFAULT_BATCH,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Fetch `batch_size` documents per window. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn fill(&mut self) -> StorageResult<()> {
        let batch = self
            .db
            .find(
                &self.collection,
                &self.filter,
                &FindOptions::window(self.offset, self.batch_size),
            )
            .map_err(|e| StorageError::from_db(e, format!("query {}", self.collection)))?;
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        self.offset += batch.len();
        self.buffer
            .extend(batch.iter().map(|doc| self.codec.unescape(doc)));
        Ok(())
    }
}

impl Iterator for QueryCursor {
    type Item = StorageResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("collection", &self.collection)
            .field("offset", &self.offset)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_db::InMemoryDatabase;
    use folio_doc::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    fn seeded(n: i64) -> Arc<InMemoryDatabase> {
        let db = Arc::new(InMemoryDatabase::new());
        for i in 0..n {
            db.insert_one("records", doc(json!({"n": i, "a_dot_b": i % 2})))
                .unwrap();
        }
        db
    }

    #[test]
    fn paged_pipeline_shape() {
        let stages = paged_pipeline(Filter::All, 0, 2, Some(SortSpec::descending("n")));
        let names: Vec<&str> = stages.iter().map(Stage::name).collect();
        assert_eq!(names, vec!["match", "sort", "collect", "slice"]);
        let unsorted = paged_pipeline(Filter::All, 0, 2, Some(SortSpec::default()));
        assert_eq!(unsorted.len(), 3);
    }

    #[test]
    fn paged_result_from_pipeline() {
        let db = seeded(5);
        let codec = KeyCodec::standard();
        let stages = paged_pipeline(Filter::All, 1, 2, Some(SortSpec::descending("n")));
        let page = PagedResult::from_aggregate(db.aggregate("records", &stages).unwrap(), &codec).unwrap();
        assert_eq!(page.num_found, 5);
        let ns: Vec<i64> = page.docs.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 2]);
        assert!(page.docs[0].contains_key("a.b"));
    }

    #[test]
    fn empty_aggregate_is_empty_page() {
        let page = PagedResult::from_aggregate(Vec::new(), &KeyCodec::standard()).unwrap();
        assert_eq!(page, PagedResult::default());
        let text = serde_json::to_string(&page).unwrap();
        assert_eq!(text, r#"{"numFound":0,"docs":[]}"#);
    }

    #[test]
    fn cursor_walks_every_batch() {
        let db = seeded(7);
        let cursor = QueryCursor::new(db, KeyCodec::standard(), "records".into(), Filter::All)
            .with_batch_size(3);
        let ns: Vec<i64> = cursor
            .map(|d| d.unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn cursor_filters_and_handles_empty() {
        let db = seeded(6);
        let filter = Filter::parse(r#"{"n": {"$gte": 4}}"#).unwrap();
        let count = QueryCursor::new(db.clone(), KeyCodec::standard(), "records".into(), filter).count();
        assert_eq!(count, 2);
        let none = QueryCursor::new(db, KeyCodec::standard(), "missing".into(), Filter::All);
        assert_eq!(none.count(), 0);
    }
}
