use super::{Base, FromObject, TranslateError};
use crate::{ListOptions, Model, Result, Table};
use mig_discovery_k8s_api as k8s;
use rusqlite::{types::Value, Row};

const BY_SUBJECT: &str = "
SELECT DISTINCT
  a.pk,
  a.cluster,
  a.uid,
  a.version,
  a.namespace,
  a.name,
  a.object,
  a.role
FROM RoleBinding a,
     Subject b
WHERE
  a.cluster = :cluster AND
  b.parent = a.pk AND
  b.kind = :kind AND
  b.namespace = :namespace AND
  b.name = :name
";

/// An identity granted a role by a binding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Subject {
    /// `User`, `ServiceAccount` or `Group`.
    pub kind: String,
    /// Set only for service accounts.
    pub namespace: String,
    pub name: String,
}

/// A `RoleBinding` or `ClusterRoleBinding`. Cluster bindings have an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleBinding {
    pub base: Base,
    /// JSON-encoded role reference.
    pub role: String,
    /// Stored as child rows, replaced as a set on every update.
    pub subjects: Vec<Subject>,
}

// === impl Subject ===

impl Subject {
    pub const USER: &'static str = "User";
    pub const SERVICE_ACCOUNT: &'static str = "ServiceAccount";
    pub const GROUP: &'static str = "Group";

    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: Self::USER.to_string(),
            namespace: String::new(),
            name: name.into(),
        }
    }

    pub fn service_account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Self::SERVICE_ACCOUNT.to_string(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: Self::GROUP.to_string(),
            namespace: String::new(),
            name: name.into(),
        }
    }
}

impl From<&k8s::Subject> for Subject {
    fn from(s: &k8s::Subject) -> Self {
        Self {
            kind: s.kind.clone(),
            namespace: s.namespace.clone().unwrap_or_default(),
            name: s.name.clone(),
        }
    }
}

// === impl RoleBinding ===

impl RoleBinding {
    pub fn key(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            base: Base::key(cluster, namespace, name),
            ..Self::default()
        }
    }

    pub fn decode_role(&self) -> Result<k8s::RoleRef> {
        Ok(serde_json::from_str(&self.role)?)
    }

    pub fn list(table: &Table<'_>, cluster: &str) -> Result<Vec<Self>> {
        table.list(&ListOptions::default().eq("cluster", cluster.to_string()))
    }

    /// Lists the bindings in `cluster` that grant a role to `subject`.
    pub fn list_by_subject(
        table: &Table<'_>,
        cluster: &str,
        subject: &Subject,
    ) -> Result<Vec<Self>> {
        table.query(
            BY_SUBJECT,
            vec![
                (":cluster".to_string(), Value::Text(cluster.to_string())),
                (":kind".to_string(), Value::Text(subject.kind.clone())),
                (":namespace".to_string(), Value::Text(subject.namespace.clone())),
                (":name".to_string(), Value::Text(subject.name.clone())),
            ],
        )
    }

    fn with_parts<O>(
        cluster: &str,
        object: &O,
        role_ref: &k8s::RoleRef,
        subjects: Option<&Vec<k8s::Subject>>,
    ) -> Result<Self, TranslateError>
    where
        O: k8s::Resource + serde::Serialize,
    {
        // Subject rows are unique per binding; repeats keep their first position.
        let mut unique = Vec::new();
        for subject in subjects.into_iter().flatten().map(Subject::from) {
            if !unique.contains(&subject) {
                unique.push(subject);
            }
        }
        Ok(Self {
            base: Base::with(cluster, object)?,
            role: serde_json::to_string(role_ref)?,
            subjects: unique,
        })
    }

    fn insert_subjects(&self, table: &Table<'_>) -> Result<()> {
        let parent = self.pk();
        for subject in &self.subjects {
            table.execute(
                "INSERT OR IGNORE INTO Subject (parent, kind, namespace, name) \
                 VALUES (:parent, :kind, :namespace, :name)",
                vec![
                    (":parent".to_string(), Value::Text(parent.clone())),
                    (":kind".to_string(), Value::Text(subject.kind.clone())),
                    (":namespace".to_string(), Value::Text(subject.namespace.clone())),
                    (":name".to_string(), Value::Text(subject.name.clone())),
                ],
            )?;
        }
        Ok(())
    }

    fn delete_subjects(&self, table: &Table<'_>) -> Result<()> {
        table.execute(
            "DELETE FROM Subject WHERE parent = :parent",
            vec![(":parent".to_string(), Value::Text(self.pk()))],
        )?;
        Ok(())
    }
}

impl FromObject<k8s::RoleBinding> for RoleBinding {
    fn from_object(cluster: &str, object: &k8s::RoleBinding) -> Result<Self, TranslateError> {
        Self::with_parts(cluster, object, &object.role_ref, object.subjects.as_ref())
    }
}

impl FromObject<k8s::ClusterRoleBinding> for RoleBinding {
    fn from_object(
        cluster: &str,
        object: &k8s::ClusterRoleBinding,
    ) -> Result<Self, TranslateError> {
        Self::with_parts(cluster, object, &object.role_ref, object.subjects.as_ref())
    }
}

impl Model for RoleBinding {
    const TABLE: &'static str = "RoleBinding";
    const COLUMNS: &'static [&'static str] = &[
        "cluster",
        "uid",
        "version",
        "namespace",
        "name",
        "object",
        "role",
    ];

    fn pk(&self) -> String {
        self.base.pk()
    }

    fn values(&self) -> Vec<Value> {
        let mut values = self.base.values();
        values.push(Value::Text(self.role.clone()));
        values
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            base: Base::from_row(row)?,
            role: row.get(7)?,
            subjects: Vec::new(),
        })
    }

    fn insert_children(&self, table: &Table<'_>) -> Result<()> {
        self.insert_subjects(table)
    }

    fn update_children(&self, table: &Table<'_>) -> Result<()> {
        self.delete_subjects(table)?;
        self.insert_subjects(table)
    }

    fn delete_children(&self, table: &Table<'_>) -> Result<()> {
        self.delete_subjects(table)
    }

    fn load_children(&mut self, table: &Table<'_>) -> Result<()> {
        self.subjects = table.map_rows(
            "SELECT kind, namespace, name FROM Subject WHERE parent = :parent ORDER BY rowid",
            vec![(":parent".to_string(), Value::Text(self.pk()))],
            |row| {
                Ok(Subject {
                    kind: row.get(0)?,
                    namespace: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )?;
        Ok(())
    }
}
