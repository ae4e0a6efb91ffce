use std::io::{Cursor, Read};

use folio_doc::{parse_document, Document, Value};
use tracing::debug;

use super::{BackendContext, PayloadBackend};
use crate::descriptor::{BackendKind, PayloadDescriptor, EMBEDDED_FIELD};
use crate::error::{StorageError, StorageResult};

const PAYLOAD_FIELD: &str = "payload";
const METADATA_FIELD: &str = "metadata";

/// JSON payload content stored inline in the descriptor as
/// `source: {payload, metadata}`.
#[derive(Clone, Debug, Default)]
pub struct EmbeddedDocBackend {
    main: Document,
}

impl EmbeddedDocBackend {
    /// A backend holding an existing `{payload, metadata}` document.
    pub fn new(main: Document) -> Self {
        Self { main }
    }

    /// The stored JSON document, if any.
    pub fn document(&self) -> Option<&Document> {
        match self.main.get(PAYLOAD_FIELD) {
            Some(Value::Object(doc)) => Some(doc),
            _ => None,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.document()
            .and_then(|doc| serde_json::to_vec(doc).ok())
            .unwrap_or_default()
    }
}

fn read_document(source: &mut dyn Read) -> Result<Document, String> {
    let mut text = String::new();
    source.read_to_string(&mut text).map_err(|e| e.to_string())?;
    parse_document(&text).map_err(|e| e.to_string())
}

impl PayloadBackend for EmbeddedDocBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedDoc
    }

    fn create(
        &mut self,
        ctx: &BackendContext<'_>,
        source: &mut dyn Read,
        metadata: Document,
    ) -> StorageResult<()> {
        let doc = match read_document(source) {
            Ok(doc) => doc,
            Err(reason) => {
                // Only a rewrite of stored content is tolerated; it keeps
                // the previous content.
                if self.document().is_some() && ctx.exists_in_storage()? {
                    debug!(
                        oid = ctx.oid(),
                        pid = ctx.pid(),
                        %reason,
                        "ignoring unparseable embedded payload update"
                    );
                    return Ok(());
                }
                return Err(StorageError::InvalidPayload {
                    pid: ctx.pid().to_string(),
                    reason,
                });
            }
        };
        let doc = Value::Object(doc);
        let ambiguous = ctx.codec().ambiguous_keys(&doc);
        if !ambiguous.is_empty() {
            return Err(StorageError::InvalidPayload {
                pid: ctx.pid().to_string(),
                reason: format!("field names {ambiguous:?} contain an escape token"),
            });
        }
        self.main.insert(PAYLOAD_FIELD.into(), doc);
        self.main.insert(METADATA_FIELD.into(), Value::Object(metadata));
        Ok(())
    }

    fn open(&self, _ctx: &BackendContext<'_>) -> StorageResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.bytes())))
    }

    fn size(&self, _ctx: &BackendContext<'_>) -> StorageResult<u64> {
        Ok(self.bytes().len() as u64)
    }

    fn remove(&mut self, _ctx: &BackendContext<'_>) -> StorageResult<()> {
        self.main.clear();
        Ok(())
    }

    fn locator(&self) -> Option<String> {
        Some(EMBEDDED_FIELD.to_string())
    }

    fn write_descriptor(&self, descriptor: &mut PayloadDescriptor) {
        descriptor.backend = self.locator();
        descriptor.payload_id = None;
        descriptor.backend_type = Some(BackendKind::EmbeddedDoc);
        descriptor
            .extra
            .insert(EMBEDDED_FIELD.into(), Value::Object(self.main.clone()));
    }
}
