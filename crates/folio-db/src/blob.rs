use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use folio_doc::Document;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::traits::{LargeObjectInfo, LargeObjectStore};

/// One stored large object: descriptive info plus the bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredBlob {
    pub(crate) info: LargeObjectInfo,
    #[serde(with = "hex_bytes")]
    pub(crate) data: Arc<Vec<u8>>,
}

/// In-memory large-object store.
///
/// Ids are UUIDv7 strings, so ordering by id is ordering by upload time.
/// Content is shared with open readers; deleting an object does not
/// invalidate a reader that is already open.
pub struct InMemoryLargeObjectStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
}

impl InMemoryLargeObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn from_blobs(blobs: Vec<StoredBlob>) -> Self {
        let map = blobs
            .into_iter()
            .map(|blob| (blob.info.id.clone(), blob))
            .collect();
        Self {
            blobs: RwLock::new(map),
        }
    }

    pub(crate) fn export_blobs(&self) -> Vec<StoredBlob> {
        self.blobs.read().expect("lock poisoned").values().cloned().collect()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no large objects are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .read()
            .expect("lock poisoned")
            .values()
            .map(|blob| blob.info.length)
            .sum()
    }

    /// Remove every object.
    pub fn clear(&self) {
        self.blobs.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryLargeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeObjectStore for InMemoryLargeObjectStore {
    fn upload(&self, filename: &str, source: &mut dyn Read, metadata: Document) -> DbResult<String> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        let id = Uuid::now_v7().to_string();
        let info = LargeObjectInfo {
            id: id.clone(),
            filename: filename.to_string(),
            length: data.len() as u64,
            metadata,
            upload_date: Utc::now(),
        };
        debug!(id = %id, filename, bytes = data.len(), "uploaded large object");
        self.blobs.write().expect("lock poisoned").insert(
            id.clone(),
            StoredBlob {
                info,
                data: Arc::new(data),
            },
        );
        Ok(id)
    }

    fn open(&self, id: &str) -> DbResult<Box<dyn Read + Send>> {
        let map = self.blobs.read().expect("lock poisoned");
        let blob = map
            .get(id)
            .ok_or_else(|| DbError::LargeObjectNotFound(id.to_string()))?;
        Ok(Box::new(SharedReader {
            data: Arc::clone(&blob.data),
            pos: 0,
        }))
    }

    fn info(&self, id: &str) -> DbResult<LargeObjectInfo> {
        let map = self.blobs.read().expect("lock poisoned");
        map.get(id)
            .map(|blob| blob.info.clone())
            .ok_or_else(|| DbError::LargeObjectNotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> DbResult<()> {
        let mut map = self.blobs.write().expect("lock poisoned");
        match map.remove(id) {
            Some(_) => {
                debug!(id, "deleted large object");
                Ok(())
            }
            None => Err(DbError::LargeObjectNotFound(id.to_string())),
        }
    }

    fn find_by_filename(&self, filename: &str) -> DbResult<Vec<LargeObjectInfo>> {
        let map = self.blobs.read().expect("lock poisoned");
        let mut found: Vec<LargeObjectInfo> = map
            .values()
            .filter(|blob| blob.info.filename == filename)
            .map(|blob| blob.info.clone())
            .collect();
        found.sort_by(|a, b| a.upload_date.cmp(&b.upload_date).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}

impl std::fmt::Debug for InMemoryLargeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLargeObjectStore")
            .field("object_count", &self.len())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

/// Reader over shared blob bytes.
struct SharedReader {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

mod hex_bytes {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Encode blob bytes as a hex string.
    pub fn serialize<S: Serializer>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data.as_slice()))
    }

    /// Decode a hex string written by [`serialize`].
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map(Arc::new).map_err(serde::de::Error::custom)
    }
}
