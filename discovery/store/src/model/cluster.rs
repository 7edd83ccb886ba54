use crate::{pk, ListOptions, Model, Result, Table};
use mig_discovery_k8s_api::{MigCluster, ResourceExt};
use rusqlite::{types::Value, Row};

use super::{parse_version, TranslateError};

/// A mirrored cluster. Every resource row references one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cluster {
    pub uid: String,
    pub version: u64,
    pub namespace: String,
    pub name: String,
    /// The `MigCluster`, JSON-encoded.
    pub object: String,
    pub host: bool,
}

impl Cluster {
    pub fn key(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with(cluster: &MigCluster) -> Result<Self, TranslateError> {
        let name = cluster
            .metadata
            .name
            .clone()
            .ok_or(TranslateError::MissingName)?;
        Ok(Self {
            uid: cluster.uid().unwrap_or_default(),
            version: parse_version(cluster.metadata.resource_version.as_deref())?,
            namespace: cluster.namespace().unwrap_or_default(),
            name,
            object: serde_json::to_string(cluster)?,
            host: cluster.spec.is_host_cluster,
        })
    }

    pub fn decode_object(&self) -> Result<MigCluster> {
        Ok(serde_json::from_str(&self.object)?)
    }

    /// Inserts the row or, when it already exists, updates it.
    pub fn upsert(&self, table: &Table<'_>) -> Result<()> {
        match table.update(self) {
            Err(error) if error.is_not_found() => table.insert(self),
            res => res,
        }
    }

    /// Lists clusters ordered by namespace and name.
    pub fn list(table: &Table<'_>) -> Result<Vec<Self>> {
        table.list(&ListOptions::default().sort([4, 5]))
    }
}

impl Model for Cluster {
    const TABLE: &'static str = "Cluster";
    const COLUMNS: &'static [&'static str] =
        &["uid", "version", "namespace", "name", "object", "host"];

    fn pk(&self) -> String {
        pk(&[&self.namespace, &self.name])
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.uid.clone()),
            Value::Integer(self.version as i64),
            Value::Text(self.namespace.clone()),
            Value::Text(self.name.clone()),
            Value::Text(self.object.clone()),
            Value::Integer(self.host.into()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(1)?,
            version: row.get::<_, i64>(2)? as u64,
            namespace: row.get(3)?,
            name: row.get(4)?,
            object: row.get(5)?,
            host: row.get(6)?,
        })
    }
}
