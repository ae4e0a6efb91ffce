//! Payload backends: where one payload's content is stored.
//!
//! A backend is chosen per payload by [`BackendPolicy::select`] and rebuilt
//! from the payload's descriptor whenever it is needed, so a payload never
//! carries a backend across a change of its declared type.
//!
//! [`BackendPolicy::select`]: crate::descriptor::BackendPolicy::select

mod blob;
mod embedded;

use std::io::Read;

use folio_db::LargeObjectStore;
use folio_doc::{Document, KeyCodec};

use crate::descriptor::{BackendKind, PayloadDescriptor};
use crate::error::StorageResult;
use crate::object::DigitalObject;

pub use blob::BlobBackend;
pub use embedded::EmbeddedDocBackend;

/// What a backend may know about the payload it serves.
pub struct BackendContext<'a> {
    object: &'a DigitalObject,
    pid: &'a str,
}

impl<'a> BackendContext<'a> {
    pub(crate) fn new(object: &'a DigitalObject, pid: &'a str) -> Self {
        Self { object, pid }
    }

    /// Id of the owning object.
    pub fn oid(&self) -> &str {
        self.object.id()
    }

    /// Id of the payload being served.
    pub fn pid(&self) -> &str {
        self.pid
    }

    /// The large-object store.
    pub fn blobs(&self) -> &dyn LargeObjectStore {
        self.object.context().blobs.as_ref()
    }

    /// Codec used for stored field names.
    pub fn codec(&self) -> &KeyCodec {
        &self.object.context().codec
    }

    /// Whether the owning object already has an object-metadata document.
    pub fn exists_in_storage(&self) -> StorageResult<bool> {
        self.object.exists_in_storage()
    }
}

/// Durable storage for one payload's content.
pub trait PayloadBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Store the full contents of `source`, replacing whatever this backend
    /// instance held.
    fn create(
        &mut self,
        ctx: &BackendContext<'_>,
        source: &mut dyn Read,
        metadata: Document,
    ) -> StorageResult<()>;

    /// A reader over the stored content. Dropping it releases the stream.
    fn open(&self, ctx: &BackendContext<'_>) -> StorageResult<Box<dyn Read + Send>>;

    /// Content length in bytes.
    fn size(&self, ctx: &BackendContext<'_>) -> StorageResult<u64>;

    /// Delete stored content. The descriptor itself is removed by the object.
    fn remove(&mut self, ctx: &BackendContext<'_>) -> StorageResult<()>;

    /// Locator recorded in the descriptor, if content has been stored.
    fn locator(&self) -> Option<String>;

    /// Record this backend's locator (and inline content) in `descriptor`.
    fn write_descriptor(&self, descriptor: &mut PayloadDescriptor);
}

/// Rebuild a backend of `kind` from what `descriptor` recorded.
///
/// State recorded by a backend of a different kind is ignored, which is
/// how a type change orphans the old content.
pub fn for_descriptor(kind: BackendKind, descriptor: &PayloadDescriptor) -> Box<dyn PayloadBackend> {
    let recorded = descriptor.backend_type == Some(kind);
    match kind {
        BackendKind::Blob => {
            let id = if recorded {
                descriptor.backend.clone().or_else(|| descriptor.payload_id.clone())
            } else if descriptor.backend_type.is_none() {
                descriptor.payload_id.clone()
            } else {
                None
            };
            Box::new(BlobBackend::new(id))
        }
        BackendKind::EmbeddedDoc => {
            let main = descriptor.embedded().cloned().unwrap_or_default();
            Box::new(EmbeddedDocBackend::new(main))
        }
    }
}

/// The backend that stored `descriptor`'s current content, falling back to
/// `fallback` for descriptors written before backends were recorded.
pub fn stored_backend(descriptor: &PayloadDescriptor, fallback: BackendKind) -> Box<dyn PayloadBackend> {
    for_descriptor(descriptor.backend_type.unwrap_or(fallback), descriptor)
}
