//! Digital-object storage for Folio.
//!
//! A digital object is two metadata documents plus an ordered manifest of
//! named payloads. Object metadata (id, collection, timestamps, caller
//! properties) lives in one shared collection; record metadata, including
//! the `files` array of payload descriptors, lives in the object's own
//! collection. Payload content goes to a pluggable backend chosen from the
//! payload's declared type.
//!
//! # Key Types
//!
//! - [`ObjectStore`] -- creates, loads and removes objects; runs queries
//! - [`DigitalObject`] -- metadata, manifest and payload operations
//! - [`Payload`] -- transient view of one payload, rebuilt per lookup
//! - [`PayloadBackend`] -- [`BlobBackend`] (large-object store) or
//!   [`EmbeddedDocBackend`] (JSON inline in the descriptor)
//! - [`StorageConfig`] -- TOML configuration with defaults for every key
//!
//! # Design Rules
//!
//! 1. Every metadata write is key-escaped and every read unescaped.
//! 2. `save()` replaces both documents wholesale; it never patches.
//! 3. The manifest is a cache over `files` and only three functions write it.
//! 4. Operations on one object instance are serialized; nothing is locked
//!    across instances or processes, so a losing racer gets `Conflict`.
//! 5. No operation retries internally. Errors are classified and returned.

pub mod backend;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod mime;
pub mod object;
pub mod payload;
pub mod query;
pub mod store;
pub mod views;

pub use backend::{BackendContext, BlobBackend, EmbeddedDocBackend, PayloadBackend};
pub use config::{CollectionsConfig, DatabaseConfig, PayloadConfig, StorageConfig};
pub use context::StoreContext;
pub use descriptor::{BackendKind, BackendPolicy, PayloadDescriptor, PayloadType};
pub use error::{StorageError, StorageResult};
pub use mime::{ContentTypeSniffer, ExtensionSniffer};
pub use object::{DigitalObject, Lifecycle};
pub use payload::Payload;
pub use query::{PagedResult, QueryCursor};
pub use store::ObjectStore;
pub use views::Provisioned;
