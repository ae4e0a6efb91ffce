//! Collection views and indexes a store needs before it serves requests.
//!
//! The record-metadata view flattens each record's package payload into a
//! plain document joined with the lifecycle fields of its object metadata.
//! One further view per configured package type narrows it down by
//! `packageType`.

use folio_db::{DbError, DocumentDatabase, IndexSpec, Projection, Stage};
use folio_doc::{Condition, Filter};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::object::{CREATED_FIELD, FILES_FIELD, MODIFIED_FIELD, OID_FIELD};

/// Object-metadata field naming an object's package type.
pub const PACKAGE_TYPE_FIELD: &str = "packageType";
/// Index over the fields the record view joins on.
pub const META_VIEW_INDEX: &str = "metaViewIndex";

const JOINED_FIELD: &str = "tfObj";
const ROOT_FIELD: &str = "metadata";

/// What a provisioning run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provisioned {
    /// Views created by this run.
    pub created: Vec<String>,
    /// Views that were already present.
    pub existing: Vec<String>,
}

/// Pipeline of the record-metadata view.
pub fn record_view_pipeline(config: &StorageConfig) -> Vec<Stage> {
    let package_pid = config.payload.package_payload_id.as_str();
    let files = FILES_FIELD.to_string();
    let joined = |field: &str| format!("{JOINED_FIELD}.0.{field}");
    let root = |field: &str| format!("{ROOT_FIELD}.{field}");
    vec![
        Stage::Match(Filter::Field {
            path: files.clone(),
            conditions: vec![Condition::ElemMatch(Box::new(Filter::eq("pid", package_pid)))],
        }),
        Stage::FilterArray {
            field: files.clone(),
            filter: Filter::eq("pid", package_pid),
        },
        Stage::Unwind(files),
        Stage::Project(vec![
            Projection::new(ROOT_FIELD, format!("{FILES_FIELD}.source.payload")),
            Projection::new(OID_FIELD, format!("{FILES_FIELD}.oid")),
        ]),
        Stage::Lookup {
            from: config.collections.metadata.clone(),
            local_field: OID_FIELD.into(),
            foreign_field: OID_FIELD.into(),
            as_field: JOINED_FIELD.into(),
        },
        Stage::Set(vec![
            Projection::new(root(OID_FIELD), OID_FIELD),
            Projection::new(root(PACKAGE_TYPE_FIELD), joined(PACKAGE_TYPE_FIELD)),
            Projection::new(root(CREATED_FIELD), joined(CREATED_FIELD)),
            Projection::new(root(MODIFIED_FIELD), joined(MODIFIED_FIELD)),
        ]),
        Stage::ReplaceRoot(ROOT_FIELD.into()),
    ]
}

/// View name for a package type. Names that would collide with a
/// collection or the record view get a `_package` suffix.
pub fn package_view_name(config: &StorageConfig, package_type: &str) -> String {
    let taken = [
        "default",
        config.collections.default.as_str(),
        config.collections.metadata.as_str(),
        config.collections.record_metadata_view.as_str(),
    ];
    if taken.contains(&package_type) {
        format!("{package_type}_package")
    } else {
        package_type.to_string()
    }
}

/// Indexes for the record collection and the object-metadata collection.
pub fn indexes(config: &StorageConfig) -> Vec<(String, IndexSpec)> {
    let records = config.collections.default.clone();
    vec![
        (
            records.clone(),
            IndexSpec::ascending("files.pid", &["files.pid"]).sparse(),
        ),
        (
            records,
            IndexSpec::ascending(
                META_VIEW_INDEX,
                &[
                    "files.pid",
                    "files.source.payload.metaMetadata.brandId",
                    "files.source.payload.metaMetadata.type",
                    "files.source.payload.workflow.stage",
                ],
            )
            .sparse(),
        ),
        (
            config.collections.metadata.clone(),
            IndexSpec::ascending(OID_FIELD, &[OID_FIELD]).unique(),
        ),
    ]
}

/// Create the views and indexes. Safe to run on every start: existing
/// views and indexes are left as they are.
pub fn provision(db: &dyn DocumentDatabase, config: &StorageConfig) -> StorageResult<Provisioned> {
    let mut report = Provisioned::default();

    let record_view = config.collections.record_metadata_view.as_str();
    create_view(
        db,
        record_view,
        &config.collections.default,
        record_view_pipeline(config),
        &mut report,
    )?;

    for package_type in &config.package_types {
        let name = package_view_name(config, package_type);
        create_view(
            db,
            &name,
            record_view,
            vec![Stage::Match(Filter::eq(PACKAGE_TYPE_FIELD, package_type.as_str()))],
            &mut report,
        )?;
    }

    for (collection, index) in indexes(config) {
        let name = index.name.clone();
        db.create_index(&collection, index).map_err(|e| {
            StorageError::from_db(e, format!("create index {name} on {collection}"))
        })?;
    }

    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        "views provisioned"
    );
    Ok(report)
}

fn create_view(
    db: &dyn DocumentDatabase,
    name: &str,
    source: &str,
    pipeline: Vec<Stage>,
    report: &mut Provisioned,
) -> StorageResult<()> {
    match db.create_view(name, source, pipeline) {
        Ok(()) => {
            debug!(view = name, source, "view created");
            report.created.push(name.to_string());
            Ok(())
        }
        Err(DbError::NamespaceExists(_)) => {
            debug!(view = name, "view already exists");
            report.existing.push(name.to_string());
            Ok(())
        }
        Err(err) => Err(StorageError::from_db(err, format!("create view {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_db::InMemoryDatabase;
    use folio_doc::{json, Document, Value};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    fn config() -> StorageConfig {
        let mut config = StorageConfig::default();
        config.package_types = vec!["rdmp".into(), "dataRecord".into(), "default".into()];
        config
    }

    fn seed(db: &InMemoryDatabase, config: &StorageConfig, oid: &str, package_type: &str) {
        db.insert_one(
            &config.collections.metadata,
            doc(json!({
                "redboxOid": oid,
                "packageType": package_type,
                "date_object_created": "2024-01-01T00:00:00.000Z"
            })),
        )
        .unwrap();
        db.insert_one(
            &config.collections.default,
            doc(json!({
                "redboxOid": oid,
                "files": [
                    {"pid": "attachment.pdf", "oid": oid, "backend": "abc"},
                    {"pid": "metadata.tfpackage", "oid": oid,
                     "source": {"payload": {"title": format!("title {oid}")}}}
                ]
            })),
        )
        .unwrap();
    }

    // ----------------------------------------------------------------------
    // Naming
    // ----------------------------------------------------------------------

    #[test]
    fn package_view_names_avoid_collisions() {
        let config = config();
        assert_eq!(package_view_name(&config, "rdmp"), "rdmp");
        assert_eq!(package_view_name(&config, "default"), "default_package");
        assert_eq!(
            package_view_name(&config, "metadataDocuments"),
            "metadataDocuments_package"
        );
        assert_eq!(package_view_name(&config, "tf_obj_meta"), "tf_obj_meta_package");
    }

    // ----------------------------------------------------------------------
    // Provisioning
    // ----------------------------------------------------------------------

    #[test]
    fn record_view_flattens_package_payload() {
        let config = config();
        let db = InMemoryDatabase::new();
        provision(&db, &config).unwrap();
        seed(&db, &config, "o1", "rdmp");

        let rows = db.aggregate("metadataDocuments", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("title o1"));
        assert_eq!(rows[0]["redboxOid"], json!("o1"));
        assert_eq!(rows[0]["packageType"], json!("rdmp"));
        assert_eq!(rows[0]["date_object_created"], json!("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn package_views_filter_by_type() {
        let config = config();
        let db = InMemoryDatabase::new();
        provision(&db, &config).unwrap();
        seed(&db, &config, "o1", "rdmp");
        seed(&db, &config, "o2", "dataRecord");
        seed(&db, &config, "o3", "rdmp");

        let rdmp = db.aggregate("rdmp", &[]).unwrap();
        let oids: Vec<&str> = rdmp.iter().map(|d| d["redboxOid"].as_str().unwrap()).collect();
        assert_eq!(oids, vec!["o1", "o3"]);
        assert_eq!(db.aggregate("dataRecord", &[]).unwrap().len(), 1);
        assert!(db.aggregate("default_package", &[]).unwrap().is_empty());
    }

    #[test]
    fn records_without_package_are_skipped() {
        let config = config();
        let db = InMemoryDatabase::new();
        provision(&db, &config).unwrap();
        db.insert_one(
            &config.collections.default,
            doc(json!({"redboxOid": "bare", "files": [{"pid": "a.png", "oid": "bare"}]})),
        )
        .unwrap();
        assert!(db.aggregate("metadataDocuments", &[]).unwrap().is_empty());
    }

    #[test]
    fn provisioning_twice_is_harmless() {
        let config = config();
        let db = InMemoryDatabase::new();
        let first = provision(&db, &config).unwrap();
        assert_eq!(first.created.len(), 4);
        assert!(first.existing.is_empty());

        let second = provision(&db, &config).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 4);
        assert_eq!(db.indexes(&config.collections.default).len(), 2);
    }

    #[test]
    fn provisioning_fails_on_duplicate_oids() {
        let config = config();
        let db = InMemoryDatabase::new();
        for _ in 0..2 {
            db.insert_one(&config.collections.metadata, doc(json!({"redboxOid": "dup"})))
                .unwrap();
        }
        let err = provision(&db, &config).unwrap_err();
        assert!(err.is_conflict());
    }
}
