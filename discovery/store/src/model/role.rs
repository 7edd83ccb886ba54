use super::{Base, FromObject, TranslateError};
use crate::{ListOptions, Model, Result, Table};
use mig_discovery_k8s_api as k8s;
use rusqlite::{types::Value, Row};

/// A `Role` or `ClusterRole`. Cluster roles have an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Role {
    pub base: Base,
    /// JSON-encoded policy rules.
    pub rules: String,
}

impl Role {
    pub fn key(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            base: Base::key(cluster, namespace, name),
            rules: String::new(),
        }
    }

    pub fn decode_rules(&self) -> Result<Vec<k8s::PolicyRule>> {
        if self.rules.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&self.rules)?)
    }

    pub fn list(table: &Table<'_>, cluster: &str) -> Result<Vec<Self>> {
        table.list(&ListOptions::default().eq("cluster", cluster.to_string()))
    }

    fn with_rules<O>(
        cluster: &str,
        object: &O,
        rules: Option<&Vec<k8s::PolicyRule>>,
    ) -> Result<Self, TranslateError>
    where
        O: k8s::Resource + serde::Serialize,
    {
        let rules = rules.map(Vec::as_slice).unwrap_or_default();
        Ok(Self {
            base: Base::with(cluster, object)?,
            rules: serde_json::to_string(rules)?,
        })
    }
}

impl FromObject<k8s::Role> for Role {
    fn from_object(cluster: &str, object: &k8s::Role) -> Result<Self, TranslateError> {
        Self::with_rules(cluster, object, object.rules.as_ref())
    }
}

impl FromObject<k8s::ClusterRole> for Role {
    fn from_object(cluster: &str, object: &k8s::ClusterRole) -> Result<Self, TranslateError> {
        Self::with_rules(cluster, object, object.rules.as_ref())
    }
}

impl Model for Role {
    const TABLE: &'static str = "Role";
    const COLUMNS: &'static [&'static str] = &[
        "cluster",
        "uid",
        "version",
        "namespace",
        "name",
        "object",
        "rules",
    ];

    fn pk(&self) -> String {
        self.base.pk()
    }

    fn values(&self) -> Vec<Value> {
        let mut values = self.base.values();
        values.push(Value::Text(self.rules.clone()));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            base: Base::from_row(row)?,
            rules: row.get(7)?,
        })
    }
}
