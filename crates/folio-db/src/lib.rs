//! Storage boundaries for the Folio digital-object store.
//!
//! Folio keeps object metadata in a document database and payload bytes in
//! a separate large-object store. This crate defines both boundaries as
//! traits and ships in-memory implementations used by tests, the CLI and
//! embedded deployments.
//!
//! # Boundaries
//!
//! - [`DocumentDatabase`] -- named collections of [`Document`]s with
//!   single-document atomic writes, unique indexes, aggregation pipelines and
//!   read-only views
//! - [`LargeObjectStore`] -- content blobs keyed by generated ids, with a
//!   filename and attached metadata per upload
//!
//! # Backends
//!
//! - [`InMemoryDatabase`] / [`InMemoryLargeObjectStore`] -- `RwLock`-guarded
//!   maps; [`Snapshot`] persists both to a JSON file
//!
//! # Design Rules
//!
//! 1. Every write touches exactly one document and is atomic.
//! 2. Views are never materialized: reading a view re-runs its pipeline.
//! 3. Creating a namespace that already exists fails with
//!    [`DbError::NamespaceExists`] so provisioning code can tell "already
//!    there" apart from real failures.
//! 4. Unique index violations surface as [`DbError::DuplicateKey`].

pub mod blob;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod snapshot;
pub mod traits;

pub use blob::InMemoryLargeObjectStore;
pub use error::{DbError, DbResult};
pub use memory::InMemoryDatabase;
pub use pipeline::{Projection, Stage};
pub use snapshot::Snapshot;
pub use traits::{DocumentDatabase, FindOptions, IndexSpec, LargeObjectInfo, LargeObjectStore};

pub use folio_doc::{Document, Filter, SortSpec};
