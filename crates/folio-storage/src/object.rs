use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use folio_db::DbError;
use folio_doc::{Document, Filter, Value};
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::backend::{self, BackendContext, PayloadBackend};
use crate::context::StoreContext;
use crate::descriptor::{BackendKind, PayloadDescriptor, PayloadType};
use crate::error::{StorageError, StorageResult};
use crate::payload::Payload;

/// Object id field, present in both metadata documents.
pub const OID_FIELD: &str = "redboxOid";
/// Record-metadata field holding the payload descriptors.
pub const FILES_FIELD: &str = "files";
/// Object-metadata field naming the collection the record lives in.
pub const COLLECTION_FIELD: &str = "collectionName";
/// Stamped on the first save.
pub const CREATED_FIELD: &str = "date_object_created";
/// Stamped on every later save.
pub const MODIFIED_FIELD: &str = "date_object_modified";

/// Pid endings that mark a payload as a structured record.
const RECORD_SUFFIXES: [&str; 2] = ["json", "tfpackage"];

/// Where an object instance stands relative to storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifecycle {
    /// Nothing read or written yet.
    #[default]
    Unbound,
    /// Metadata materialized in memory but not yet persisted.
    New,
    Loaded,
    Persisted,
    /// Deleted from storage; terminal.
    Removed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unbound => "unbound",
            Self::New => "new",
            Self::Loaded => "loaded",
            Self::Persisted => "persisted",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct ObjectState {
    object_metadata: Option<Document>,
    record_metadata: Option<Document>,
    /// Properties that override object metadata on save.
    overlay: Document,
    /// Derived from `files`; rewritten into `files` on every change.
    manifest: Option<IndexMap<String, PayloadDescriptor>>,
    source_id: Option<String>,
    lifecycle: Lifecycle,
}

/// One stored object: two metadata documents plus a manifest of payloads.
///
/// Object metadata lives in the store's metadata collection; record
/// metadata, including the `files` descriptor array, lives in the object's
/// own collection. Both are keyed by `redboxOid`.
///
/// All state sits behind one mutex, so saves and payload operations on the
/// same instance never interleave. Nothing serializes separate instances
/// or processes: a racing creation fails with `Conflict` from the unique
/// index on the metadata collection.
pub struct DigitalObject {
    ctx: Arc<StoreContext>,
    oid: String,
    collection: String,
    state: Mutex<ObjectState>,
}

impl DigitalObject {
    /// Bind an object handle. Nothing is read until first use.
    pub fn new(ctx: Arc<StoreContext>, oid: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            ctx,
            oid: oid.into(),
            collection: collection.into(),
            state: Mutex::new(ObjectState::default()),
        }
    }

    /// The object id.
    pub fn id(&self) -> &str {
        &self.oid
    }

    /// Collection holding the record metadata.
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub(crate) fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    fn lock(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock().expect("lock poisoned")
    }

    fn oid_filter(&self) -> Filter {
        Filter::eq(OID_FIELD, self.oid.as_str())
    }

    /// Whether an object-metadata document exists for this id.
    ///
    /// Always asks the database; never consults cached state.
    pub fn exists_in_storage(&self) -> StorageResult<bool> {
        let found = self
            .ctx
            .db
            .find_one(&self.ctx.metadata_collection, &self.oid_filter())
            .map_err(|e| StorageError::from_db(e, format!("look up object {}", self.oid)))?;
        Ok(found.is_some())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Read both metadata documents from storage, discarding cached state.
    pub fn load(&self) -> StorageResult<()> {
        let mut state = self.lock();
        let object_metadata = self
            .fetch(&self.ctx.metadata_collection)?
            .ok_or_else(|| StorageError::NotFound(format!("object {} does not exist", self.oid)))?;
        let record_metadata = match self.fetch(&self.collection)? {
            Some(doc) => doc,
            None => {
                warn!(oid = %self.oid, collection = %self.collection, "object has no record metadata");
                self.fresh_record_metadata()
            }
        };
        *state = ObjectState {
            object_metadata: Some(object_metadata),
            record_metadata: Some(record_metadata),
            lifecycle: Lifecycle::Loaded,
            ..ObjectState::default()
        };
        debug!(oid = %self.oid, collection = %self.collection, "object loaded");
        Ok(())
    }

    /// Persist both metadata documents.
    ///
    /// Inserts them if the object is not in storage yet, otherwise
    /// replaces them wholesale. Overlay properties win over object
    /// metadata fields of the same name.
    pub fn save(&self) -> StorageResult<()> {
        let mut state = self.lock();
        self.save_locked(&mut state)
    }

    /// Same as [`save`](Self::save).
    pub fn close(&self) -> StorageResult<()> {
        self.save()
    }

    /// Delete both metadata documents. Payload content is left alone.
    pub fn remove(&self) -> StorageResult<()> {
        let mut state = self.lock();
        if !self.exists_in_storage()? {
            return Err(StorageError::NotFound(format!("object {} does not exist", self.oid)));
        }
        let filter = self.oid_filter();
        self.ctx
            .db
            .delete_one(&self.ctx.metadata_collection, &filter)
            .map_err(|e| StorageError::from_db(e, format!("remove object {}", self.oid)))?;
        if let Err(err) = self.ctx.db.delete_one(&self.collection, &filter) {
            error!(oid = %self.oid, collection = %self.collection, %err, "object metadata removed but record metadata was not");
            return Err(StorageError::BackendFailure {
                context: format!(
                    "object metadata for {} removed but record metadata in {} was not",
                    self.oid, self.collection
                ),
                source: err,
            });
        }
        *state = ObjectState {
            lifecycle: Lifecycle::Removed,
            ..ObjectState::default()
        };
        info!(oid = %self.oid, collection = %self.collection, "object removed");
        Ok(())
    }

    fn save_locked(&self, state: &mut ObjectState) -> StorageResult<()> {
        self.materialize(state)?;
        let exists = self.exists_in_storage()?;
        let stamp = timestamp();

        let object_metadata = state.object_metadata.get_or_insert_with(Document::new);
        let stamp_field = if exists { MODIFIED_FIELD } else { CREATED_FIELD };
        object_metadata.insert(stamp_field.into(), Value::from(stamp));
        for (key, value) in &state.overlay {
            object_metadata.insert(key.clone(), value.clone());
        }
        object_metadata.insert(OID_FIELD.into(), Value::from(self.oid.as_str()));
        let object_doc = self.ctx.codec.escape(object_metadata);

        let record_metadata = state.record_metadata.get_or_insert_with(Document::new);
        record_metadata.insert(OID_FIELD.into(), Value::from(self.oid.as_str()));
        let record_doc = self.ctx.codec.escape(record_metadata);

        let db = &self.ctx.db;
        let metadata_collection = &self.ctx.metadata_collection;
        if exists {
            let replaced = db
                .replace_one(metadata_collection, &self.oid_filter(), object_doc)
                .map_err(|e| StorageError::from_db(e, format!("save object {}", self.oid)))?;
            if !replaced {
                return Err(StorageError::NotFound(format!(
                    "object {} was removed while saving",
                    self.oid
                )));
            }
            self.upsert_record(record_doc, true)
                .map_err(|e| self.partial_save(e, "replaced"))?;
            debug!(oid = %self.oid, collection = %self.collection, "object saved");
        } else {
            db.insert_one(metadata_collection, object_doc)
                .map_err(|e| StorageError::from_db(e, format!("create object {}", self.oid)))?;
            self.upsert_record(record_doc, false)
                .map_err(|e| self.partial_save(e, "inserted"))?;
            info!(oid = %self.oid, collection = %self.collection, "object created");
        }
        state.lifecycle = Lifecycle::Persisted;
        Ok(())
    }

    fn upsert_record(&self, doc: Document, expected: bool) -> Result<(), DbError> {
        if self.ctx.db.replace_one(&self.collection, &self.oid_filter(), doc.clone())? {
            return Ok(());
        }
        if expected {
            warn!(oid = %self.oid, collection = %self.collection, "record metadata was missing, inserting it");
        }
        self.ctx.db.insert_one(&self.collection, doc)
    }

    fn partial_save(&self, err: DbError, written: &str) -> StorageError {
        error!(
            oid = %self.oid,
            collection = %self.collection,
            %err,
            "object metadata {written} but record metadata write failed; documents are inconsistent"
        );
        StorageError::BackendFailure {
            context: format!(
                "object metadata for {} {written} but record metadata in {} could not be written",
                self.oid, self.collection
            ),
            source: err,
        }
    }

    fn fetch(&self, collection: &str) -> StorageResult<Option<Document>> {
        let found = self
            .ctx
            .db
            .find_one(collection, &self.oid_filter())
            .map_err(|e| StorageError::from_db(e, format!("read {collection} for {}", self.oid)))?;
        Ok(found.map(|doc| self.ctx.codec.unescape(&doc)))
    }

    fn fresh_object_metadata(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(OID_FIELD.into(), Value::from(self.oid.as_str()));
        doc.insert(COLLECTION_FIELD.into(), Value::from(self.collection.as_str()));
        doc
    }

    fn fresh_record_metadata(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(OID_FIELD.into(), Value::from(self.oid.as_str()));
        doc
    }

    /// Make sure both metadata documents are in memory, reading them or
    /// creating fresh ones as needed.
    fn materialize(&self, state: &mut ObjectState) -> StorageResult<()> {
        if state.lifecycle == Lifecycle::Removed {
            return Err(StorageError::NotFound(format!("object {} was removed", self.oid)));
        }
        let mut found = false;
        if state.object_metadata.is_none() {
            let doc = self.fetch(&self.ctx.metadata_collection)?;
            found = doc.is_some();
            state.object_metadata = Some(doc.unwrap_or_else(|| self.fresh_object_metadata()));
        }
        if state.record_metadata.is_none() {
            let doc = self.fetch(&self.collection)?;
            state.record_metadata = Some(doc.unwrap_or_else(|| self.fresh_record_metadata()));
        }
        if state.lifecycle == Lifecycle::Unbound {
            state.lifecycle = if found { Lifecycle::Loaded } else { Lifecycle::New };
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Metadata access
    // -----------------------------------------------------------------------

    /// System metadata (id, collection, timestamps, saved properties).
    pub fn object_metadata(&self) -> StorageResult<Document> {
        let mut state = self.lock();
        self.materialize(&mut state)?;
        Ok(state.object_metadata.clone().unwrap_or_default())
    }

    /// Domain metadata, including `files`.
    pub fn record_metadata(&self) -> StorageResult<Document> {
        let mut state = self.lock();
        self.materialize(&mut state)?;
        Ok(state.record_metadata.clone().unwrap_or_default())
    }

    /// Set a top-level record-metadata field. Persisted on the next save.
    ///
    /// `files` and `redboxOid` are managed by the object and rejected.
    pub fn set_record_field(&self, key: &str, value: impl Into<Value>) -> StorageResult<()> {
        if key.is_empty() || key == FILES_FIELD || key == OID_FIELD {
            return Err(StorageError::InvalidArgument(format!("record field {key:?} cannot be set directly")));
        }
        let value = value.into();
        self.check_keys(key, &value)?;
        let mut state = self.lock();
        self.materialize(&mut state)?;
        state
            .record_metadata
            .get_or_insert_with(Document::new)
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Object metadata with overlay properties applied.
    pub fn metadata_properties(&self) -> StorageResult<Document> {
        let mut state = self.lock();
        self.materialize(&mut state)?;
        let mut merged = state.object_metadata.clone().unwrap_or_default();
        for (key, value) in &state.overlay {
            merged.insert(key.clone(), value.clone());
        }
        Ok(merged)
    }

    /// Set an overlay property. It overrides object metadata on save.
    pub fn set_property(&self, key: &str, value: impl Into<Value>) -> StorageResult<()> {
        if key.is_empty() || key == OID_FIELD {
            return Err(StorageError::InvalidArgument(format!("property {key:?} cannot be set")));
        }
        let value = value.into();
        self.check_keys(key, &value)?;
        let mut state = self.lock();
        self.materialize(&mut state)?;
        state.overlay.insert(key.to_string(), value);
        Ok(())
    }

    /// Field names holding an escape token would come back renamed.
    fn check_keys(&self, key: &str, value: &Value) -> StorageResult<()> {
        let mut ambiguous = self.ctx.codec.ambiguous_keys(value);
        if self.ctx.codec.is_ambiguous(key) {
            ambiguous.insert(0, key.to_string());
        }
        if ambiguous.is_empty() {
            return Ok(());
        }
        Err(StorageError::InvalidArgument(format!(
            "field names {ambiguous:?} contain an escape token"
        )))
    }

    /// Drop a property from both the overlay and the object metadata.
    pub fn remove_property(&self, key: &str) -> StorageResult<Option<Value>> {
        if key == OID_FIELD {
            return Err(StorageError::InvalidArgument(format!("property {key:?} cannot be removed")));
        }
        let mut state = self.lock();
        self.materialize(&mut state)?;
        let from_overlay = state.overlay.shift_remove(key);
        let from_metadata = state
            .object_metadata
            .as_mut()
            .and_then(|doc| doc.shift_remove(key));
        Ok(from_overlay.or(from_metadata))
    }

    // -----------------------------------------------------------------------
    // Manifest
    // -----------------------------------------------------------------------

    /// Payload descriptors keyed by pid, in insertion order.
    pub fn manifest(&self) -> StorageResult<IndexMap<String, PayloadDescriptor>> {
        let mut state = self.lock();
        Ok(self.manifest_mut(&mut state)?.clone())
    }

    /// Payload ids in manifest order.
    pub fn payload_ids(&self) -> StorageResult<Vec<String>> {
        let mut state = self.lock();
        Ok(self.manifest_mut(&mut state)?.keys().cloned().collect())
    }

    /// The primary payload: the explicitly chosen one, else the first
    /// `Source` payload, else the first payload added.
    pub fn source_id(&self) -> StorageResult<Option<String>> {
        let mut state = self.lock();
        self.manifest_mut(&mut state)?;
        Ok(source_of(&state))
    }

    /// Make `pid` the source payload. It must be in the manifest.
    pub fn set_source_id(&self, pid: &str) -> StorageResult<()> {
        let mut state = self.lock();
        if !self.manifest_mut(&mut state)?.contains_key(pid) {
            return Err(StorageError::NotFound(format!("payload {pid} in {}", self.oid)));
        }
        state.source_id = Some(pid.to_string());
        Ok(())
    }

    fn manifest_mut<'s>(
        &self,
        state: &'s mut ObjectState,
    ) -> StorageResult<&'s mut IndexMap<String, PayloadDescriptor>> {
        self.materialize(state)?;
        if state.manifest.is_none() {
            let mut manifest = IndexMap::new();
            let files = state
                .record_metadata
                .as_ref()
                .and_then(|doc| doc.get(FILES_FIELD))
                .and_then(Value::as_array);
            for entry in files.into_iter().flatten() {
                let descriptor = PayloadDescriptor::from_value(entry).map_err(|e| StorageError::BackendFailure {
                    context: format!("malformed payload descriptor in {}", self.oid),
                    source: DbError::from(e),
                })?;
                manifest.insert(descriptor.pid.clone(), descriptor);
            }
            state.manifest = Some(manifest);
        }
        Ok(state.manifest.get_or_insert_with(IndexMap::new))
    }

    /// Rewrite `files` from the manifest.
    fn write_files(&self, state: &mut ObjectState) -> StorageResult<()> {
        let Some(manifest) = state.manifest.as_ref() else {
            return Ok(());
        };
        let files = manifest
            .values()
            .map(PayloadDescriptor::to_value)
            .collect::<serde_json::Result<Vec<Value>>>()
            .map_err(|e| StorageError::BackendFailure {
                context: format!("encode payload descriptors of {}", self.oid),
                source: DbError::from(e),
            })?;
        state
            .record_metadata
            .get_or_insert_with(Document::new)
            .insert(FILES_FIELD.into(), Value::Array(files));
        Ok(())
    }

    // The three functions below are the only writers of the manifest.

    fn add_file_meta(&self, state: &mut ObjectState, descriptor: PayloadDescriptor) -> StorageResult<()> {
        self.manifest_mut(state)?.insert(descriptor.pid.clone(), descriptor);
        self.write_files(state)
    }

    fn remove_file_meta(
        &self,
        state: &mut ObjectState,
        pid: &str,
    ) -> StorageResult<Option<PayloadDescriptor>> {
        let removed = self.manifest_mut(state)?.shift_remove(pid);
        if state.source_id.as_deref() == Some(pid) {
            state.source_id = None;
        }
        self.write_files(state)?;
        Ok(removed)
    }

    fn replace_file_meta(&self, state: &mut ObjectState, descriptor: PayloadDescriptor) -> StorageResult<()> {
        match self.manifest_mut(state)?.get_mut(&descriptor.pid) {
            Some(slot) => *slot = descriptor,
            None => return Err(StorageError::NotFound(format!("payload {} in {}", descriptor.pid, self.oid))),
        }
        self.write_files(state)
    }

    // -----------------------------------------------------------------------
    // Payloads
    // -----------------------------------------------------------------------

    /// Store `source` as a new payload and save the object.
    ///
    /// The configured metadata payload id is always an annotation. The
    /// first other payload becomes the object's source when its pid names
    /// a structured record (`*json`, `*tfpackage`); anything else is an
    /// annotation and goes to the blob store.
    pub fn create_stored_payload(&self, pid: &str, source: &mut dyn Read) -> StorageResult<Payload<'_>> {
        validate_pid(pid)?;
        let mut state = self.lock();
        if self.manifest_mut(&mut state)?.contains_key(pid) {
            return Err(StorageError::Conflict(format!(
                "payload {pid} already exists in {}",
                self.oid
            )));
        }

        let payload_type = if pid == self.ctx.metadata_payload_id {
            PayloadType::Annotation
        } else if !has_source(&state, &self.ctx.metadata_payload_id) && is_record_pid(pid) {
            PayloadType::Source
        } else {
            PayloadType::Annotation
        };
        let mut descriptor = PayloadDescriptor::new(pid, self.oid.as_str(), payload_type);
        descriptor.content_type = Some(self.ctx.sniffer.sniff(pid));

        let kind = self.ctx.backend_policy.select(payload_type);
        let mut backend = backend::for_descriptor(kind, &descriptor);
        let ctx = BackendContext::new(self, pid);
        backend.create(&ctx, source, descriptor.content_metadata())?;
        descriptor.last_modified = Some(Utc::now());
        backend.write_descriptor(&mut descriptor);

        self.add_file_meta(&mut state, descriptor.clone())?;
        if payload_type == PayloadType::Source {
            state.source_id = Some(pid.to_string());
        }
        if let Err(err) = self.save_locked(&mut state) {
            self.remove_file_meta(&mut state, pid)?;
            discard(backend.as_mut(), &ctx);
            return Err(err);
        }
        debug!(oid = %self.oid, pid, %kind, %payload_type, "payload created");
        Ok(Payload::new(self, descriptor, Some(backend)))
    }

    /// Linked payloads are not supported: the file at `path` is copied in
    /// as a stored payload.
    pub fn create_linked_payload(&self, pid: &str, path: impl AsRef<Path>) -> StorageResult<Payload<'_>> {
        let path = path.as_ref();
        warn!(oid = %self.oid, pid, path = %path.display(), "linked payloads are not supported, storing a copy");
        let mut file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(format!("linked file {}", path.display())),
            _ => StorageError::BackendFailure {
                context: format!("open linked file {}", path.display()),
                source: DbError::Io(e),
            },
        })?;
        self.create_stored_payload(pid, &mut file)
    }

    /// Open an existing payload.
    pub fn get_payload(&self, pid: &str) -> StorageResult<Payload<'_>> {
        validate_pid(pid)?;
        let mut state = self.lock();
        let descriptor = self
            .manifest_mut(&mut state)?
            .get(pid)
            .cloned()
            .ok_or_else(|| self.payload_not_found(pid))?;
        Ok(Payload::new(self, descriptor, None))
    }

    /// Delete a payload's content and descriptor, then save.
    pub fn remove_payload(&self, pid: &str) -> StorageResult<()> {
        validate_pid(pid)?;
        let mut state = self.lock();
        let descriptor = self
            .manifest_mut(&mut state)?
            .get(pid)
            .cloned()
            .ok_or_else(|| self.payload_not_found(pid))?;
        let fallback = self.ctx.backend_policy.select(descriptor.payload_type);
        let mut backend = backend::stored_backend(&descriptor, fallback);
        match backend.remove(&BackendContext::new(self, pid)) {
            Ok(()) => {}
            Err(StorageError::NotFound(reason)) => {
                warn!(oid = %self.oid, pid, %reason, "payload content already gone");
            }
            Err(err) => return Err(err),
        }
        self.remove_file_meta(&mut state, pid)?;
        self.save_locked(&mut state)?;
        debug!(oid = %self.oid, pid, "payload removed");
        Ok(())
    }

    /// Replace a payload's content, keeping its place in `files`.
    ///
    /// New content is stored before the old content is deleted, so a
    /// failure leaves the previous content in place.
    pub fn update_payload(&self, pid: &str, source: &mut dyn Read) -> StorageResult<Payload<'_>> {
        validate_pid(pid)?;
        let mut state = self.lock();
        let previous = self
            .manifest_mut(&mut state)?
            .get(pid)
            .cloned()
            .ok_or_else(|| self.payload_not_found(pid))?;
        let kind = self.ctx.backend_policy.select(previous.payload_type);
        let mut old_backend = backend::stored_backend(&previous, kind);
        let mut new_backend = backend::for_descriptor(kind, &previous);
        let ctx = BackendContext::new(self, pid);

        let mut descriptor = previous.clone();
        new_backend.create(&ctx, source, descriptor.content_metadata())?;
        descriptor.last_modified = Some(Utc::now());
        new_backend.write_descriptor(&mut descriptor);
        let superseded = old_backend.kind() == BackendKind::Blob
            && old_backend.locator() != new_backend.locator();

        self.replace_file_meta(&mut state, descriptor.clone())?;
        if let Err(err) = self.save_locked(&mut state) {
            self.replace_file_meta(&mut state, previous)?;
            if new_backend.locator() != old_backend.locator() {
                discard(new_backend.as_mut(), &ctx);
            }
            return Err(err);
        }
        if superseded {
            discard(old_backend.as_mut(), &ctx);
        }
        debug!(oid = %self.oid, pid, %kind, "payload updated");
        Ok(Payload::new(self, descriptor, Some(new_backend)))
    }

    /// Persist metadata edits made through a [`Payload`].
    ///
    /// Only caller-editable fields are copied; the stored backend locator
    /// is left as it is.
    pub fn update_payload_meta(&self, descriptor: &PayloadDescriptor) -> StorageResult<()> {
        let mut state = self.lock();
        let mut current = self
            .manifest_mut(&mut state)?
            .get(&descriptor.pid)
            .cloned()
            .ok_or_else(|| self.payload_not_found(&descriptor.pid))?;
        current.merge_meta(descriptor);
        self.replace_file_meta(&mut state, current)?;
        self.save_locked(&mut state)
    }

    fn payload_not_found(&self, pid: &str) -> StorageError {
        StorageError::NotFound(format!("payload {pid} in {}", self.oid))
    }
}

impl fmt::Debug for DigitalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalObject")
            .field("oid", &self.oid)
            .field("collection", &self.collection)
            .field("lifecycle", &self.state.try_lock().ok().map(|s| s.lifecycle))
            .finish()
    }
}

fn source_of(state: &ObjectState) -> Option<String> {
    if let Some(pid) = &state.source_id {
        return Some(pid.clone());
    }
    let manifest = state.manifest.as_ref()?;
    manifest
        .values()
        .find(|d| d.payload_type == PayloadType::Source)
        .or_else(|| manifest.values().next())
        .map(|d| d.pid.clone())
}

/// Whether a source is already settled: chosen explicitly, typed
/// `Source`, or implied by an earlier non-metadata payload.
fn has_source(state: &ObjectState, metadata_pid: &str) -> bool {
    state.source_id.is_some()
        || state.manifest.as_ref().is_some_and(|m| {
            m.values()
                .any(|d| d.payload_type == PayloadType::Source || d.pid != metadata_pid)
        })
}

fn is_record_pid(pid: &str) -> bool {
    RECORD_SUFFIXES.iter().any(|suffix| pid.ends_with(suffix))
}

fn validate_pid(pid: &str) -> StorageResult<()> {
    if pid.trim().is_empty() {
        return Err(StorageError::InvalidArgument("payload id must not be empty".into()));
    }
    Ok(())
}

/// Best-effort removal of content that no descriptor points at any more.
fn discard(backend: &mut dyn PayloadBackend, ctx: &BackendContext<'_>) {
    if backend.kind() != BackendKind::Blob {
        return;
    }
    let locator = backend.locator();
    if let Err(err) = backend.remove(ctx) {
        warn!(oid = ctx.oid(), pid = ctx.pid(), blob = ?locator, %err, "could not delete orphaned payload content");
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use folio_db::{DocumentDatabase, InMemoryDatabase, InMemoryLargeObjectStore};
    use folio_doc::json;

    use crate::config::StorageConfig;
    use crate::descriptor::BackendPolicy;
    use crate::mime::ExtensionSniffer;

    struct Fixture {
        ctx: Arc<StoreContext>,
        db: Arc<InMemoryDatabase>,
        blobs: Arc<InMemoryLargeObjectStore>,
    }

    impl Fixture {
        fn new(policy: BackendPolicy) -> Self {
            let mut config = StorageConfig::default();
            config.payload.backend = policy;
            let db = Arc::new(InMemoryDatabase::new());
            let blobs = Arc::new(InMemoryLargeObjectStore::new());
            let ctx = Arc::new(StoreContext::new(
                &config,
                db.clone(),
                blobs.clone(),
                Arc::new(ExtensionSniffer),
            ));
            Self { ctx, db, blobs }
        }

        fn object(&self, oid: &str) -> DigitalObject {
            DigitalObject::new(self.ctx.clone(), oid, "default")
        }

        fn saved(&self, oid: &str) -> DigitalObject {
            let object = self.object(oid);
            object.save().unwrap();
            object
        }
    }

    fn bytes(data: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(data.to_vec())
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    #[test]
    fn first_save_creates_then_replaces() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.object("o1");
        assert_eq!(object.lifecycle(), Lifecycle::Unbound);
        assert!(!object.exists_in_storage().unwrap());

        object.save().unwrap();
        assert_eq!(object.lifecycle(), Lifecycle::Persisted);
        let meta = object.object_metadata().unwrap();
        assert_eq!(meta[OID_FIELD], json!("o1"));
        assert_eq!(meta[COLLECTION_FIELD], json!("default"));
        assert!(meta.contains_key(CREATED_FIELD));
        assert!(!meta.contains_key(MODIFIED_FIELD));

        object.save().unwrap();
        assert!(object.object_metadata().unwrap().contains_key(MODIFIED_FIELD));
        assert_eq!(fx.db.len("tf_obj_meta"), 1);
        assert_eq!(fx.db.len("default"), 1);
    }

    #[test]
    fn load_reproduces_saved_documents() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.object("o1");
        object.set_record_field("dc.title", "A title").unwrap();
        object.set_record_field("$type", json!({"x.y": [1, 2]})).unwrap();
        object.save().unwrap();

        let raw = fx
            .db
            .find_one("default", &Filter::eq(OID_FIELD, "o1"))
            .unwrap()
            .unwrap();
        assert!(raw.contains_key("dc_dot_title"));
        assert!(raw.contains_key("_dollar_type"));

        let again = fx.object("o1");
        again.load().unwrap();
        assert_eq!(again.lifecycle(), Lifecycle::Loaded);
        assert_eq!(again.record_metadata().unwrap(), object.record_metadata().unwrap());
        assert_eq!(again.object_metadata().unwrap(), object.object_metadata().unwrap());
        assert_eq!(again.record_metadata().unwrap()["$type"], json!({"x.y": [1, 2]}));
    }

    #[test]
    fn load_and_remove_require_existence() {
        let fx = Fixture::new(BackendPolicy::Blob);
        assert!(fx.object("ghost").load().unwrap_err().is_not_found());
        assert!(fx.object("ghost").remove().unwrap_err().is_not_found());
    }

    #[test]
    fn load_tolerates_missing_record() {
        let fx = Fixture::new(BackendPolicy::Blob);
        fx.saved("o1");
        fx.db.delete_one("default", &Filter::eq(OID_FIELD, "o1")).unwrap();

        let object = fx.object("o1");
        object.load().unwrap();
        assert!(object.payload_ids().unwrap().is_empty());
        object.save().unwrap();
        assert_eq!(fx.db.len("default"), 1);
    }

    #[test]
    fn removed_object_is_terminal() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        object.remove().unwrap();
        assert_eq!(object.lifecycle(), Lifecycle::Removed);
        assert!(fx.db.is_empty());
        assert!(object.save().unwrap_err().is_not_found());
        assert!(object.payload_ids().unwrap_err().is_not_found());
        assert!(object
            .create_stored_payload("a.txt", &mut bytes(b"x"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn partial_save_is_reported() {
        let fx = Fixture::new(BackendPolicy::Blob);
        fx.db.create_view("default", "elsewhere", Vec::new()).unwrap();
        let object = fx.object("o1");
        let err = object.save().unwrap_err();
        match err {
            StorageError::BackendFailure { context, .. } => assert!(context.contains("inserted")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(object.exists_in_storage().unwrap());
    }

    // ----------------------------------------------------------------------
    // Properties
    // ----------------------------------------------------------------------

    #[test]
    fn overlay_properties_win_on_save() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.object("o1");
        object.set_property(CREATED_FIELD, "legacy").unwrap();
        object.set_property("owner", "alice").unwrap();
        object.save().unwrap();

        let again = fx.object("o1");
        again.load().unwrap();
        let meta = again.object_metadata().unwrap();
        assert_eq!(meta[CREATED_FIELD], json!("legacy"));
        assert_eq!(meta["owner"], json!("alice"));

        assert_eq!(again.remove_property("owner").unwrap(), Some(json!("alice")));
        again.save().unwrap();
        let third = fx.object("o1");
        assert!(!third.object_metadata().unwrap().contains_key("owner"));
    }

    #[test]
    fn managed_fields_are_protected() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.object("o1");
        for key in [FILES_FIELD, OID_FIELD, ""] {
            assert!(matches!(
                object.set_record_field(key, 1),
                Err(StorageError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            object.set_property(OID_FIELD, "other"),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn escape_tokens_in_field_names_are_rejected() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.object("o1");
        assert!(matches!(
            object.set_record_field("dc_dot_title", "x"),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            object.set_property("owner", json!({"name_dollar_": "alice"})),
            Err(StorageError::InvalidArgument(_))
        ));
        object.set_record_field("note", "a value_dot_ like this is fine").unwrap();
        assert!(!object.record_metadata().unwrap().contains_key("dc_dot_title"));
    }

    // ----------------------------------------------------------------------
    // Payloads
    // ----------------------------------------------------------------------

    #[test]
    fn manifest_keeps_insertion_order() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        for pid in ["c.txt", "a.txt", "b.txt"] {
            object.create_stored_payload(pid, &mut bytes(pid.as_bytes())).unwrap();
        }
        assert_eq!(object.payload_ids().unwrap(), vec!["c.txt", "a.txt", "b.txt"]);

        let again = fx.object("o1");
        again.load().unwrap();
        assert_eq!(again.payload_ids().unwrap(), vec!["c.txt", "a.txt", "b.txt"]);
        assert_eq!(fx.blobs.len(), 3);
    }

    #[test]
    fn duplicate_pid_conflicts() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        object.create_stored_payload("a.txt", &mut bytes(b"one")).unwrap();
        let before = object.manifest().unwrap();

        let err = object.create_stored_payload("a.txt", &mut bytes(b"two")).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(object.manifest().unwrap(), before);
        assert_eq!(fx.blobs.len(), 1);
    }

    #[test]
    fn first_record_payload_becomes_source() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        let first = object.create_stored_payload("a.json", &mut bytes(b"{}")).unwrap();
        assert_eq!(first.payload_type(), PayloadType::Source);
        drop(first);
        let second = object.create_stored_payload("b.json", &mut bytes(b"{}")).unwrap();
        assert_eq!(second.payload_type(), PayloadType::Annotation);
        drop(second);
        assert_eq!(object.source_id().unwrap().as_deref(), Some("a.json"));

        let again = fx.object("o1");
        again.load().unwrap();
        assert_eq!(again.source_id().unwrap().as_deref(), Some("a.json"));
    }

    #[test]
    fn first_file_payload_is_annotation_but_still_source_id() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        let first = object.create_stored_payload("a.txt", &mut bytes(b"a")).unwrap();
        assert_eq!(first.payload_type(), PayloadType::Annotation);
        drop(first);
        // A later record does not take over the source.
        let second = object.create_stored_payload("b.json", &mut bytes(b"{}")).unwrap();
        assert_eq!(second.payload_type(), PayloadType::Annotation);
        drop(second);
        assert_eq!(object.source_id().unwrap().as_deref(), Some("a.txt"));
    }

    #[test]
    fn metadata_payload_is_never_source() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        let meta = object.create_stored_payload("TF-OBJ-META", &mut bytes(b"k=v")).unwrap();
        assert_eq!(meta.payload_type(), PayloadType::Annotation);
        drop(meta);
        let next = object.create_stored_payload("data.json", &mut bytes(b"{}")).unwrap();
        assert_eq!(next.payload_type(), PayloadType::Source);
        assert_eq!(next.content_type(), Some("application/json"));
    }

    #[test]
    fn remove_payload_deletes_content_and_descriptor() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        object.create_stored_payload("a.txt", &mut bytes(b"a")).unwrap();
        object.create_stored_payload("b.txt", &mut bytes(b"b")).unwrap();
        let files_before = object.record_metadata().unwrap()[FILES_FIELD].clone();

        assert!(object.remove_payload("zzz").unwrap_err().is_not_found());
        assert_eq!(object.record_metadata().unwrap()[FILES_FIELD], files_before);

        object.remove_payload("a.txt").unwrap();
        assert_eq!(fx.blobs.len(), 1);
        assert!(object.get_payload("a.txt").unwrap_err().is_not_found());
        assert_eq!(object.payload_ids().unwrap(), vec!["b.txt"]);
        assert_eq!(object.source_id().unwrap().as_deref(), Some("b.txt"));

        let again = fx.object("o1");
        again.load().unwrap();
        assert_eq!(again.payload_ids().unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn update_payload_keeps_slot_and_replaces_blob() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        object.create_stored_payload("a.txt", &mut bytes(b"old")).unwrap();
        object.create_stored_payload("b.txt", &mut bytes(b"b")).unwrap();

        let mut updated = object.update_payload("a.txt", &mut bytes(b"new content")).unwrap();
        assert_eq!(updated.read_all().unwrap(), b"new content");
        drop(updated);
        assert_eq!(object.payload_ids().unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(fx.blobs.len(), 2);

        let mut reread = object.get_payload("a.txt").unwrap();
        assert_eq!(reread.size().unwrap(), 11);
        assert!(object.update_payload("nope", &mut bytes(b"")).unwrap_err().is_not_found());
    }

    #[test]
    fn failed_save_rolls_back_new_payload() {
        let fx = Fixture::new(BackendPolicy::Blob);
        fx.db.create_view("tf_obj_meta", "elsewhere", Vec::new()).unwrap();
        let object = fx.object("o1");
        let err = object.create_stored_payload("a.txt", &mut bytes(b"a")).unwrap_err();
        assert!(matches!(err, StorageError::BackendFailure { .. }));
        assert!(object.payload_ids().unwrap().is_empty());
        assert!(fx.blobs.is_empty());
    }

    #[test]
    fn embedded_source_round_trip() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.saved("o1");
        let mut payload = object
            .create_stored_payload("metadata.tfpackage", &mut bytes(br#"{"title": "T", "a.b": 1}"#))
            .unwrap();
        assert_eq!(payload.backend_kind(), BackendKind::EmbeddedDoc);
        let value: Value = serde_json::from_slice(&payload.read_all().unwrap()).unwrap();
        assert_eq!(value, json!({"title": "T", "a.b": 1}));
        drop(payload);
        assert!(fx.blobs.is_empty());

        let again = fx.object("o1");
        again.load().unwrap();
        let mut reread = again.get_payload("metadata.tfpackage").unwrap();
        let value: Value = serde_json::from_slice(&reread.read_all().unwrap()).unwrap();
        assert_eq!(value["a.b"], json!(1));
    }

    #[test]
    fn embedded_parse_failure_on_new_object_is_invalid() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.object("o1");
        let err = object.create_stored_payload("data.json", &mut bytes(b"\x00\x01")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPayload { .. }));
        assert!(object.payload_ids().unwrap().is_empty());
        assert!(!object.exists_in_storage().unwrap());
    }

    #[test]
    fn binary_file_keeps_its_bytes_under_auto_policy() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.saved("o1");
        let mut payload = object
            .create_stored_payload("scan.pdf", &mut bytes(b"%PDF-1.4 binary"))
            .unwrap();
        assert_eq!(payload.payload_type(), PayloadType::Annotation);
        assert_eq!(payload.backend_kind(), BackendKind::Blob);
        assert_eq!(payload.read_all().unwrap(), b"%PDF-1.4 binary");
        drop(payload);
        assert_eq!(fx.blobs.len(), 1);
        assert_eq!(object.source_id().unwrap().as_deref(), Some("scan.pdf"));
    }

    #[test]
    fn unparseable_new_record_on_existing_object_is_invalid() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.saved("o1");
        let err = object
            .create_stored_payload("data.json", &mut bytes(b"not json"))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPayload { .. }));
        assert!(object.payload_ids().unwrap().is_empty());
        assert!(object.source_id().unwrap().is_none());
    }

    #[test]
    fn embedded_record_with_escape_token_is_invalid() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.saved("o1");
        let err = object
            .create_stored_payload("record.json", &mut bytes(br#"{"list": [{"a_dot_b": 1}]}"#))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPayload { .. }));
        assert!(object.payload_ids().unwrap().is_empty());
    }

    #[test]
    fn embedded_parse_failure_on_existing_object_is_ignored() {
        let fx = Fixture::new(BackendPolicy::Auto);
        let object = fx.saved("o1");
        object
            .create_stored_payload("record.json", &mut bytes(br#"{"v": 1}"#))
            .unwrap();

        let mut kept = object.update_payload("record.json", &mut bytes(b"not json")).unwrap();
        let value: Value = serde_json::from_slice(&kept.read_all().unwrap()).unwrap();
        assert_eq!(value, json!({"v": 1}));
    }

    #[test]
    fn linked_payload_is_stored_as_copy() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let mut payload = object.create_linked_payload("scan.pdf", &path).unwrap();
        assert!(!payload.is_linked());
        assert_eq!(payload.read_all().unwrap(), b"%PDF-1.4");
        drop(payload);

        std::fs::remove_file(&path).unwrap();
        let mut still = object.get_payload("scan.pdf").unwrap();
        assert_eq!(still.read_all().unwrap(), b"%PDF-1.4");
        drop(still);

        let missing = dir.path().join("missing.pdf");
        assert!(object.create_linked_payload("m.pdf", &missing).unwrap_err().is_not_found());
    }

    #[test]
    fn empty_pid_is_rejected() {
        let fx = Fixture::new(BackendPolicy::Blob);
        let object = fx.saved("o1");
        assert!(matches!(
            object.create_stored_payload("", &mut bytes(b"x")),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(object.get_payload(" "), Err(StorageError::InvalidArgument(_))));
    }
}
