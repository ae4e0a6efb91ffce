use std::fmt;
use std::io::Read;

use chrono::{DateTime, Utc};
use folio_db::DbError;
use tracing::debug;

use crate::backend::{self, BackendContext, PayloadBackend};
use crate::descriptor::{BackendKind, PayloadDescriptor, PayloadType};
use crate::error::{StorageError, StorageResult};
use crate::object::DigitalObject;

/// A transient view of one payload of an object.
///
/// Rebuilt from the object's descriptor on every lookup. Metadata edits
/// stay local until [`close`](Self::close) writes them back.
pub struct Payload<'a> {
    object: &'a DigitalObject,
    descriptor: PayloadDescriptor,
    backend: Option<Box<dyn PayloadBackend>>,
    meta_changed: bool,
}

impl<'a> Payload<'a> {
    pub(crate) fn new(
        object: &'a DigitalObject,
        descriptor: PayloadDescriptor,
        backend: Option<Box<dyn PayloadBackend>>,
    ) -> Self {
        Self {
            object,
            descriptor,
            backend,
            meta_changed: false,
        }
    }

    /// The payload id.
    pub fn pid(&self) -> &str {
        &self.descriptor.pid
    }

    /// Id of the owning object.
    pub fn object_id(&self) -> &str {
        self.object.id()
    }

    /// Display label; defaults to the pid.
    pub fn label(&self) -> &str {
        &self.descriptor.label
    }

    /// Change the label. Persisted by [`close`](Self::close).
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.descriptor.label = label.into();
        self.meta_changed = true;
    }

    /// MIME type, if known.
    pub fn content_type(&self) -> Option<&str> {
        self.descriptor.content_type.as_deref()
    }

    /// Change the content type. Persisted by [`close`](Self::close).
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.descriptor.content_type = Some(content_type.into());
        self.meta_changed = true;
    }

    /// Declared payload type.
    pub fn payload_type(&self) -> PayloadType {
        self.descriptor.payload_type
    }

    /// Change the declared type. The next backend access rebinds to the
    /// backend the new type selects; stored content does not move.
    pub fn set_type(&mut self, payload_type: PayloadType) {
        self.descriptor.payload_type = payload_type;
        self.meta_changed = true;
    }

    /// Always `false`: linked payloads are stored as copies.
    pub fn is_linked(&self) -> bool {
        self.descriptor.linked
    }

    /// Whether metadata was edited since the payload was opened.
    pub fn is_meta_changed(&self) -> bool {
        self.meta_changed
    }

    /// The descriptor as last written or edited.
    pub fn descriptor(&self) -> &PayloadDescriptor {
        &self.descriptor
    }

    /// When content was last created or updated.
    pub fn last_modified(&self) -> StorageResult<DateTime<Utc>> {
        self.descriptor.last_modified.ok_or_else(|| {
            StorageError::NotFound(format!(
                "payload {} of {} has no modification time",
                self.descriptor.pid,
                self.object.id()
            ))
        })
    }

    /// The backend for the current payload type, rebuilt if the type
    /// changed since it was last bound.
    pub fn backend(&mut self) -> &dyn PayloadBackend {
        let wanted = self
            .object
            .context()
            .backend_policy
            .select(self.descriptor.payload_type);
        let backend = match self.backend.take() {
            Some(current) if current.kind() == wanted => current,
            previous => {
                if let Some(previous) = previous {
                    debug!(
                        pid = %self.descriptor.pid,
                        from = %previous.kind(),
                        to = %wanted,
                        "payload type changed, rebinding backend"
                    );
                }
                backend::for_descriptor(wanted, &self.descriptor)
            }
        };
        &**self.backend.insert(backend)
    }

    /// Kind of backend the current payload type selects.
    pub fn backend_kind(&mut self) -> BackendKind {
        self.backend().kind()
    }

    /// A reader over the content. Dropping it releases the stream.
    pub fn open(&mut self) -> StorageResult<Box<dyn Read + Send>> {
        let object = self.object;
        let pid = self.descriptor.pid.clone();
        self.backend().open(&BackendContext::new(object, &pid))
    }

    /// Content length in bytes.
    pub fn size(&mut self) -> StorageResult<u64> {
        let object = self.object;
        let pid = self.descriptor.pid.clone();
        self.backend().size(&BackendContext::new(object, &pid))
    }

    /// The whole content in memory.
    pub fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        let mut reader = self.open()?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| StorageError::BackendFailure {
            context: format!("read payload {} of {}", self.descriptor.pid, self.object.id()),
            source: DbError::Io(e),
        })?;
        Ok(bytes)
    }

    /// Write back metadata edits, if there were any.
    pub fn close(mut self) -> StorageResult<()> {
        if !self.meta_changed {
            return Ok(());
        }
        self.descriptor.last_modified = Some(Utc::now());
        self.object.update_payload_meta(&self.descriptor)
    }
}

impl fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("oid", &self.object.id())
            .field("pid", &self.descriptor.pid)
            .field("payload_type", &self.descriptor.payload_type)
            .field("backend", &self.backend.as_ref().map(|b| b.kind()))
            .field("meta_changed", &self.meta_changed)
            .finish()
    }
}
