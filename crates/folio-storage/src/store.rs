use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use folio_db::{
    DocumentDatabase, InMemoryDatabase, InMemoryLargeObjectStore, LargeObjectStore, Stage,
};
use folio_doc::{Document, Filter, SortSpec, Value};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::context::StoreContext;
use crate::error::{StorageError, StorageResult};
use crate::mime::{ContentTypeSniffer, ExtensionSniffer};
use crate::object::{DigitalObject, OID_FIELD};
use crate::query::{paged_pipeline, PagedResult, QueryCursor, DEFAULT_ROWS};
use crate::views::{self, Provisioned};

/// Top-level digital-object store.
///
/// Hands out [`DigitalObject`] handles bound to a shared database and
/// large-object store, and runs queries over record collections and the
/// provisioned views.
pub struct ObjectStore {
    config: StorageConfig,
    ctx: Arc<StoreContext>,
    provisioned: Provisioned,
    /// Serializes the check-then-insert of `create_object` within this
    /// process. Other processes are caught by the unique oid index.
    creating: Mutex<()>,
}

impl ObjectStore {
    /// Open a store over existing database handles, provisioning views and
    /// indexes.
    pub fn open(
        config: StorageConfig,
        db: Arc<dyn DocumentDatabase>,
        blobs: Arc<dyn LargeObjectStore>,
    ) -> StorageResult<Self> {
        Self::open_with(config, db, blobs, Arc::new(ExtensionSniffer))
    }

    /// Like [`open`](Self::open) with a custom content-type sniffer.
    pub fn open_with(
        config: StorageConfig,
        db: Arc<dyn DocumentDatabase>,
        blobs: Arc<dyn LargeObjectStore>,
        sniffer: Arc<dyn ContentTypeSniffer>,
    ) -> StorageResult<Self> {
        config.validate()?;
        let provisioned = views::provision(db.as_ref(), &config)?;
        let ctx = Arc::new(StoreContext::new(&config, db, blobs, sniffer));
        info!(
            database = %config.database.name,
            collection = %config.collections.default,
            backend = ?config.payload.backend,
            "object store opened"
        );
        Ok(Self {
            config,
            ctx,
            provisioned,
            creating: Mutex::new(()),
        })
    }

    /// A store over fresh in-memory backends.
    pub fn in_memory(config: StorageConfig) -> StorageResult<Self> {
        Self::open(
            config,
            Arc::new(InMemoryDatabase::new()),
            Arc::new(InMemoryLargeObjectStore::new()),
        )
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The document database.
    pub fn database(&self) -> &Arc<dyn DocumentDatabase> {
        &self.ctx.db
    }

    /// The large-object store.
    pub fn blobs(&self) -> &Arc<dyn LargeObjectStore> {
        &self.ctx.blobs
    }

    /// Shared state handed to every object.
    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    /// Views created or found by the last provisioning run.
    pub fn provisioned(&self) -> &Provisioned {
        &self.provisioned
    }

    /// Collection used when none is named.
    pub fn default_collection(&self) -> &str {
        &self.config.collections.default
    }

    /// Name of the record-metadata view.
    pub fn record_view_name(&self) -> &str {
        &self.config.collections.record_metadata_view
    }

    // ---- Object operations ----

    /// Create and persist an empty object in the default collection.
    pub fn create_object(&self, oid: &str) -> StorageResult<DigitalObject> {
        self.create_object_in(oid, &self.config.collections.default)
    }

    /// Create an empty object in `collection`. Fails with `Conflict` if it exists.
    pub fn create_object_in(&self, oid: &str, collection: &str) -> StorageResult<DigitalObject> {
        let object = self.bind(oid, collection)?;
        let _guard = self.creating.lock().expect("lock poisoned");
        if object.exists_in_storage()? {
            return Err(StorageError::Conflict(format!("object {oid} already exists")));
        }
        object.save()?;
        Ok(object)
    }

    /// Load an existing object from the default collection.
    pub fn get_object(&self, oid: &str) -> StorageResult<DigitalObject> {
        self.get_object_in(oid, &self.config.collections.default)
    }

    /// Load an existing object from `collection`.
    pub fn get_object_in(&self, oid: &str, collection: &str) -> StorageResult<DigitalObject> {
        let object = self.bind(oid, collection)?;
        object.load()?;
        Ok(object)
    }

    /// Delete an object's metadata documents. Payload content must be
    /// removed first.
    pub fn remove_object(&self, oid: &str) -> StorageResult<()> {
        self.remove_object_in(oid, &self.config.collections.default)
    }

    /// Remove an object's metadata from `collection`. Payloads are not touched.
    pub fn remove_object_in(&self, oid: &str, collection: &str) -> StorageResult<()> {
        self.bind(oid, collection)?.remove()
    }

    /// Every object id in the store.
    ///
    /// Reads the whole metadata collection; meant for administration, not
    /// request paths.
    pub fn list_object_ids(&self) -> StorageResult<BTreeSet<String>> {
        let values = self
            .ctx
            .db
            .distinct(&self.ctx.metadata_collection, OID_FIELD)
            .map_err(|e| StorageError::from_db(e, "list object ids"))?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    fn bind(&self, oid: &str, collection: &str) -> StorageResult<DigitalObject> {
        if oid.trim().is_empty() {
            return Err(StorageError::InvalidArgument("object id must not be empty".into()));
        }
        if collection.trim().is_empty() {
            return Err(StorageError::InvalidArgument("collection must not be empty".into()));
        }
        Ok(DigitalObject::new(self.ctx.clone(), oid, collection))
    }

    // ---- Queries ----

    /// One page of the documents in `collection` matching `filter`.
    ///
    /// `filter` and `sort` are JSON documents. Field names in them are
    /// matched against stored (escaped) keys; returned documents are
    /// unescaped. No match yields `{numFound: 0, docs: []}`.
    pub fn paged_query(
        &self,
        collection: &str,
        filter: &str,
        start: usize,
        rows: usize,
        sort: Option<&str>,
    ) -> StorageResult<PagedResult> {
        let filter = parse_filter(filter)?;
        let sort = sort
            .filter(|s| !s.trim().is_empty())
            .map(SortSpec::parse)
            .transpose()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let stages = paged_pipeline(filter, start, rows, sort);
        let output = self
            .ctx
            .db
            .aggregate(collection, &stages)
            .map_err(|e| StorageError::from_db(e, format!("paged query on {collection}")))?;
        let page = PagedResult::from_aggregate(output, &self.ctx.codec)?;
        debug!(collection, start, rows, num_found = page.num_found, "paged query");
        Ok(page)
    }

    /// The first [`DEFAULT_ROWS`] matches in natural order.
    pub fn first_page(&self, collection: &str, filter: &str) -> StorageResult<PagedResult> {
        self.paged_query(collection, filter, 0, DEFAULT_ROWS, None)
    }

    /// All documents in `collection` matching `filter`, fetched lazily.
    pub fn query(&self, collection: &str, filter: &str) -> StorageResult<QueryCursor> {
        let filter = parse_filter(filter)?;
        Ok(QueryCursor::new(
            self.ctx.db.clone(),
            self.ctx.codec.clone(),
            collection.to_string(),
            filter,
        ))
    }

    /// Run a raw pipeline. Output documents are unescaped.
    pub fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> StorageResult<Vec<Document>> {
        let output = self
            .ctx
            .db
            .aggregate(collection, pipeline)
            .map_err(|e| StorageError::from_db(e, format!("aggregate on {collection}")))?;
        Ok(output.iter().map(|doc| self.ctx.codec.unescape(doc)).collect())
    }

    // ---- Administration ----

    /// Drop every collection, view and index, then provision views and
    /// indexes again so the store stays usable.
    pub fn drop_database(&mut self) -> StorageResult<()> {
        self.ctx
            .db
            .drop_database()
            .map_err(|e| StorageError::from_db(e, "drop database"))?;
        self.provisioned = views::provision(self.ctx.db.as_ref(), &self.config)?;
        info!(database = %self.config.database.name, "database dropped");
        Ok(())
    }
}

fn parse_filter(text: &str) -> StorageResult<Filter> {
    if text.trim().is_empty() {
        return Ok(Filter::All);
    }
    Filter::parse(text).map_err(|e| StorageError::InvalidArgument(e.to_string()))
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("database", &self.config.database.name)
            .field("default_collection", &self.config.collections.default)
            .field("metadata_collection", &self.ctx.metadata_collection)
            .finish()
    }
}
