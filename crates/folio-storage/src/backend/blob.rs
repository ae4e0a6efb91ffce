use std::io::Read;

use folio_db::DbError;
use folio_doc::Document;
use tracing::debug;

use super::{BackendContext, PayloadBackend};
use crate::descriptor::{BackendKind, PayloadDescriptor, EMBEDDED_FIELD};
use crate::error::{StorageError, StorageResult};

/// Payload bytes in the large-object store.
///
/// Uploads are named `<oid>/<pid>`; the descriptor records the generated
/// large-object id.
#[derive(Clone, Debug, Default)]
pub struct BlobBackend {
    id: Option<String>,
}

impl BlobBackend {
    /// A backend over the large object `id`, or none yet.
    pub fn new(id: Option<String>) -> Self {
        Self { id }
    }

    fn require_id(&self, ctx: &BackendContext<'_>) -> StorageResult<&str> {
        self.id.as_deref().ok_or_else(|| {
            StorageError::NotFound(format!("payload {} of {} has no stored content", ctx.pid(), ctx.oid()))
        })
    }
}

fn lookup_error(err: DbError, ctx: &BackendContext<'_>) -> StorageError {
    match err {
        DbError::LargeObjectNotFound(id) => StorageError::NotFound(format!(
            "content {id} of payload {} in {}",
            ctx.pid(),
            ctx.oid()
        )),
        other => StorageError::from_db(other, format!("payload {} of {}", ctx.pid(), ctx.oid())),
    }
}

impl PayloadBackend for BlobBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Blob
    }

    fn create(
        &mut self,
        ctx: &BackendContext<'_>,
        source: &mut dyn Read,
        metadata: Document,
    ) -> StorageResult<()> {
        let filename = format!("{}/{}", ctx.oid(), ctx.pid());
        let id = ctx
            .blobs()
            .upload(&filename, source, metadata)
            .map_err(|e| StorageError::from_db(e, format!("upload {filename}")))?;
        debug!(%filename, blob = %id, "stored payload content");
        self.id = Some(id);
        Ok(())
    }

    fn open(&self, ctx: &BackendContext<'_>) -> StorageResult<Box<dyn Read + Send>> {
        let id = self.require_id(ctx)?;
        ctx.blobs().open(id).map_err(|e| lookup_error(e, ctx))
    }

    fn size(&self, ctx: &BackendContext<'_>) -> StorageResult<u64> {
        let id = self.require_id(ctx)?;
        Ok(ctx.blobs().info(id).map_err(|e| lookup_error(e, ctx))?.length)
    }

    fn remove(&mut self, ctx: &BackendContext<'_>) -> StorageResult<()> {
        if let Some(id) = self.id.take() {
            ctx.blobs().delete(&id).map_err(|e| lookup_error(e, ctx))?;
            debug!(oid = ctx.oid(), pid = ctx.pid(), blob = %id, "deleted payload content");
        }
        Ok(())
    }

    fn locator(&self) -> Option<String> {
        self.id.clone()
    }

    fn write_descriptor(&self, descriptor: &mut PayloadDescriptor) {
        descriptor.backend = self.id.clone();
        descriptor.payload_id = self.id.clone();
        descriptor.backend_type = Some(BackendKind::Blob);
        descriptor.extra.shift_remove(EMBEDDED_FIELD);
    }
}
