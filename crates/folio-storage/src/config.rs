use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::descriptor::BackendPolicy;
use crate::error::{StorageError, StorageResult};

/// Storage configuration, usually read from a TOML file.
///
/// Every section and field has a default, so an empty file is a valid
/// configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Package types that get a filtered view of the record-metadata view.
    pub package_types: Vec<String>,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub collections: CollectionsConfig,
    pub payload: PayloadConfig,
}

/// Connection settings for a networked document database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub ssl_enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 27017,
            name: "redbox".into(),
            ssl_enable: false,
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionsConfig {
    /// Record-metadata collection used when callers name none.
    pub default: String,
    /// Object-metadata collection (one document per object).
    pub metadata: String,
    /// Name of the derived "all package records" view.
    pub record_metadata_view: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            default: "default".into(),
            metadata: "tf_obj_meta".into(),
            record_metadata_view: "metadataDocuments".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub backend: BackendPolicy,
    /// Payload id that is always classified as an annotation.
    pub metadata_payload_id: String,
    /// Payload id whose embedded content feeds the record-metadata view.
    pub package_payload_id: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            backend: BackendPolicy::Auto,
            metadata_payload_id: "TF-OBJ-META".into(),
            package_payload_id: "metadata.tfpackage".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            package_types: Vec::new(),
            log_level: "info".into(),
            database: DatabaseConfig::default(),
            collections: CollectionsConfig::default(),
            payload: PayloadConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> StorageResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> StorageResult<String> {
        toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Reject a zero port and empty names.
    pub fn validate(&self) -> StorageResult<()> {
        if self.database.port == 0 {
            return Err(StorageError::Config("database.port must be non-zero".into()));
        }
        let names = [
            ("database.name", &self.database.name),
            ("collections.default", &self.collections.default),
            ("collections.metadata", &self.collections.metadata),
            ("collections.record_metadata_view", &self.collections.record_metadata_view),
            ("payload.metadata_payload_id", &self.payload.metadata_payload_id),
            ("payload.package_payload_id", &self.payload.package_payload_id),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(StorageError::Config(format!("{field} must not be empty")));
            }
        }
        if self.collections.metadata == self.collections.default {
            return Err(StorageError::Config(
                "collections.metadata and collections.default must differ".into(),
            ));
        }
        if self.package_types.iter().any(|t| t.trim().is_empty()) {
            return Err(StorageError::Config("package_types must not contain empty names".into()));
        }
        Ok(())
    }
}
