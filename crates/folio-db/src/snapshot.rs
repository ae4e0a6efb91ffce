//! JSON snapshots of the in-memory backends.
//!
//! A snapshot holds every collection, index definition and large object.
//! Views are not captured: they are definitions, not data, and are
//! re-provisioned by whoever opens the store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use folio_doc::Document;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::{InMemoryLargeObjectStore, StoredBlob};
use crate::error::DbResult;
use crate::memory::InMemoryDatabase;
use crate::traits::IndexSpec;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Document>>,
    #[serde(default)]
    pub indexes: BTreeMap<String, Vec<IndexSpec>>,
    #[serde(default, rename = "largeObjects")]
    large_objects: Vec<StoredBlob>,
}

impl Snapshot {
    /// Capture the current contents of both backends.
    pub fn capture(db: &InMemoryDatabase, blobs: &InMemoryLargeObjectStore) -> Self {
        let (collections, indexes) = db.export_parts();
        Self {
            version: SNAPSHOT_VERSION,
            collections,
            indexes,
            large_objects: blobs.export_blobs(),
        }
    }

    /// Build fresh backends holding the snapshot's contents.
    pub fn restore(self) -> (InMemoryDatabase, InMemoryLargeObjectStore) {
        (
            InMemoryDatabase::from_parts(self.collections, self.indexes),
            InMemoryLargeObjectStore::from_blobs(self.large_objects),
        )
    }

    /// Number of large objects held.
    pub fn large_object_count(&self) -> usize {
        self.large_objects.len()
    }

    /// Write the snapshot to `path`.
    ///
    /// The file is written to a temporary sibling and renamed into place,
    /// so readers never see a half-written snapshot.
    pub fn save(&self, path: &Path) -> DbResult<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        info!(
            path = %path.display(),
            collections = self.collections.len(),
            large_objects = self.large_objects.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read a snapshot from `path`.
    pub fn load(path: &Path) -> DbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        debug!(path = %path.display(), version = snapshot.version, "snapshot loaded");
        Ok(snapshot)
    }

    /// Read `path` if it exists, otherwise start empty.
    pub fn load_or_default(path: &Path) -> DbResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no snapshot yet, starting empty");
            Ok(Self::default())
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            collections: BTreeMap::new(),
            indexes: BTreeMap::new(),
            large_objects: Vec::new(),
        }
    }
}
