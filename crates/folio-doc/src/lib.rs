//! Document model for the Folio digital-object store.
//!
//! Every piece of metadata Folio persists is a [`Document`]: an
//! insertion-ordered JSON map. This crate provides the value-level tools the
//! database and storage layers are built on.
//!
//! # Key Types
//!
//! - [`Document`] -- ordered field map (`serde_json::Map` with `preserve_order`)
//! - [`KeyCodec`] -- reversible escaping of field names the database forbids
//! - [`Filter`] -- parsed query filter evaluated against documents
//! - [`SortSpec`] -- ordered sort keys with a total cross-type value order

pub mod codec;
pub mod document;
pub mod error;
pub mod filter;
pub mod sort;

pub use codec::KeyCodec;
pub use document::{
    compare_values, get_path, parse_document, remove_path, set_path, values_equal, Document,
};
pub use error::{DocError, DocResult};
pub use filter::{Condition, Filter};
pub use sort::{SortDirection, SortKey, SortSpec};

/// Re-exported so downstream crates build documents with the same `Value`.
pub use serde_json::{json, Value};
