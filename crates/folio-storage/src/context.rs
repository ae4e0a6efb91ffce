use std::sync::Arc;

use folio_db::{DocumentDatabase, LargeObjectStore};
use folio_doc::KeyCodec;

use crate::config::StorageConfig;
use crate::descriptor::BackendPolicy;
use crate::mime::ContentTypeSniffer;

/// Handles and settings shared by every object a store hands out.
pub struct StoreContext {
    pub db: Arc<dyn DocumentDatabase>,
    pub blobs: Arc<dyn LargeObjectStore>,
    pub sniffer: Arc<dyn ContentTypeSniffer>,
    pub codec: KeyCodec,
    /// Object-metadata collection.
    pub metadata_collection: String,
    pub backend_policy: BackendPolicy,
    /// Payload id always classified as an annotation.
    pub metadata_payload_id: String,
}

impl StoreContext {
    /// Build a context from `config` and the given handles.
    pub fn new(
        config: &StorageConfig,
        db: Arc<dyn DocumentDatabase>,
        blobs: Arc<dyn LargeObjectStore>,
        sniffer: Arc<dyn ContentTypeSniffer>,
    ) -> Self {
        Self {
            db,
            blobs,
            sniffer,
            codec: KeyCodec::standard(),
            metadata_collection: config.collections.metadata.clone(),
            backend_policy: config.payload.backend,
            metadata_payload_id: config.payload.metadata_payload_id.clone(),
        }
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("metadata_collection", &self.metadata_collection)
            .field("backend_policy", &self.backend_policy)
            .finish()
    }
}
