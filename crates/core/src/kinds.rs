//! Record kinds shipped with the queue: uploaded indexes awaiting
//! processing and auto-index jobs awaiting execution.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::table::{ColumnType, NaturalKey, RecordKind, TableSpec, Value, ValueReader};

/// An uploaded index bundle waiting to be converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadJob {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub num_parts: i64,
    pub upload_size: Option<i64>,
}

/// Marker type for the `lsif_uploads` table.
#[derive(Debug, Clone, Copy)]
pub struct Upload;

impl RecordKind for Upload {
    type Payload = UploadJob;

    const NAME: &'static str = "uploads";

    fn table() -> TableSpec {
        TableSpec::new("lsif_uploads")
            .column("repository_id", ColumnType::Integer)
            .column("commit", ColumnType::Text)
            .column("root", ColumnType::Text)
            .column("indexer", ColumnType::Text)
            .column("num_parts", ColumnType::Integer)
            .nullable_column("upload_size", ColumnType::Integer)
            .natural_key(["repository_id", "commit"])
    }

    fn encode(payload: &UploadJob) -> Vec<Value> {
        vec![
            payload.repository_id.into(),
            payload.commit.clone().into(),
            payload.root.clone().into(),
            payload.indexer.clone().into(),
            payload.num_parts.into(),
            payload.upload_size.into(),
        ]
    }

    fn decode(values: &[Value]) -> Result<UploadJob, StoreError> {
        let mut reader = ValueReader::new(values);
        Ok(UploadJob {
            repository_id: reader.integer("repository_id")?,
            commit: reader.text("commit")?,
            root: reader.text("root")?,
            indexer: reader.text("indexer")?,
            num_parts: reader.integer("num_parts")?,
            upload_size: reader.optional_integer("upload_size")?,
        })
    }
}

/// Natural key of an upload: one pending upload per repository and commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadKey {
    pub repository_id: i64,
    pub commit: String,
}

impl UploadKey {
    pub fn new(repository_id: i64, commit: impl Into<String>) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
        }
    }
}

impl From<UploadKey> for NaturalKey {
    fn from(key: UploadKey) -> Self {
        NaturalKey(vec![key.repository_id.into(), key.commit.into()])
    }
}

/// An auto-indexing job for one repository at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexJob {
    pub repository_id: i64,
    pub commit: String,
    pub docker_image: String,
    pub root: Option<String>,
}

/// Marker type for the `lsif_indexes` table.
#[derive(Debug, Clone, Copy)]
pub struct Index;

impl RecordKind for Index {
    type Payload = IndexJob;

    const NAME: &'static str = "indexes";

    fn table() -> TableSpec {
        TableSpec::new("lsif_indexes")
            .column("repository_id", ColumnType::Integer)
            .column("commit", ColumnType::Text)
            .column("docker_image", ColumnType::Text)
            .nullable_column("root", ColumnType::Text)
            .natural_key(["repository_id", "commit"])
    }

    fn encode(payload: &IndexJob) -> Vec<Value> {
        vec![
            payload.repository_id.into(),
            payload.commit.clone().into(),
            payload.docker_image.clone().into(),
            payload.root.clone().into(),
        ]
    }

    fn decode(values: &[Value]) -> Result<IndexJob, StoreError> {
        let mut reader = ValueReader::new(values);
        Ok(IndexJob {
            repository_id: reader.integer("repository_id")?,
            commit: reader.text("commit")?,
            docker_image: reader.text("docker_image")?,
            root: reader.optional_text("root")?,
        })
    }
}

/// Natural key of an index job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub repository_id: i64,
    pub commit: String,
}

impl IndexKey {
    pub fn new(repository_id: i64, commit: impl Into<String>) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
        }
    }
}

impl From<IndexKey> for NaturalKey {
    fn from(key: IndexKey) -> Self {
        NaturalKey(vec![key.repository_id.into(), key.commit.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> UploadJob {
        UploadJob {
            repository_id: 50,
            commit: "deadbeef".into(),
            root: "lib/".into(),
            indexer: "lsif-go".into(),
            num_parts: 1,
            upload_size: Some(1024),
        }
    }

    #[test]
    fn table_specs_are_valid() {
        Upload::table().validate().unwrap();
        Index::table().validate().unwrap();
    }

    #[test]
    fn upload_encodes_in_column_order() {
        let values = Upload::encode(&upload());
        Upload::table().check_values(&values).unwrap();
        assert_eq!(Upload::decode(&values).unwrap(), upload());
    }

    #[test]
    fn upload_without_size_decodes_as_none() {
        let mut job = upload();
        job.upload_size = None;
        let values = Upload::encode(&job);
        assert_eq!(Upload::decode(&values).unwrap().upload_size, None);
    }

    #[test]
    fn index_rejects_wrong_types() {
        let values = vec![Value::from("50"), "c".into(), "img".into(), Value::Null];
        assert!(Index::decode(&values).is_err());
    }

    #[test]
    fn key_projection_matches_typed_key() {
        let values = Upload::encode(&upload());
        let projected = Upload::table().key_of(&values);
        let typed: NaturalKey = UploadKey {
            repository_id: 50,
            commit: "deadbeef".into(),
        }
        .into();
        assert_eq!(projected, typed);
    }
}
