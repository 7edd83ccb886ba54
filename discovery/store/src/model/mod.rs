//! Rows mirroring Kubernetes objects.

mod cluster;
mod resource;
mod role;
mod rolebinding;


pub use self::{
    cluster::Cluster,
    resource::{Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Service},
    role::Role,
    rolebinding::{RoleBinding, Subject},
};
use crate::{pk, Model, Result, Table};
use mig_discovery_k8s_api::Resource as KubeResource;
use rusqlite::{types::Value, Row};
use serde::Serialize;

/// Fails to map a native object onto a row.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("object has no name")]
    MissingName,

    #[error("invalid resource version {0:?}")]
    InvalidVersion(String),

    #[error("failed to encode object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Maps a native object of type `O` onto a row owned by `cluster`.
pub trait FromObject<O>: Sized {
    fn from_object(cluster: &str, object: &O) -> Result<Self, TranslateError>;
}

/// Columns shared by every mirrored resource row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Base {
    /// The owning cluster's primary key.
    pub cluster: String,
    pub uid: String,
    /// The object's resource version. Only comparable with other versions from the same cluster.
    pub version: u64,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
    /// The object, JSON-encoded.
    pub object: String,
}

/// Any mirrored resource row.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Namespace(Namespace),
    Pod(Pod),
    PersistentVolume(PersistentVolume),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Service(Service),
    Role(Role),
    RoleBinding(RoleBinding),
}

// === impl Base ===

impl Base {
    pub(crate) const COLUMNS: [&'static str; 6] =
        ["cluster", "uid", "version", "namespace", "name", "object"];

    pub fn key(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds the shared columns from an object's metadata.
    pub fn with<O>(cluster: &str, object: &O) -> Result<Self, TranslateError>
    where
        O: KubeResource + Serialize,
    {
        let meta = object.meta();
        let name = meta
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(TranslateError::MissingName)?;
        let version = parse_version(meta.resource_version.as_deref())?;
        Ok(Self {
            cluster: cluster.to_string(),
            uid: meta.uid.clone().unwrap_or_default(),
            version,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name,
            object: serde_json::to_string(object)?,
        })
    }

    pub fn pk(&self) -> String {
        pk(&[&self.cluster, &self.namespace, &self.name])
    }

    pub(crate) fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.cluster.clone()),
            Value::Text(self.uid.clone()),
            Value::Integer(self.version as i64),
            Value::Text(self.namespace.clone()),
            Value::Text(self.name.clone()),
            Value::Text(self.object.clone()),
        ]
    }

    /// Reads the shared columns, which follow `pk`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cluster: row.get(1)?,
            uid: row.get(2)?,
            version: row.get::<_, i64>(3)? as u64,
            namespace: row.get(4)?,
            name: row.get(5)?,
            object: row.get(6)?,
        })
    }
}

fn parse_version(version: Option<&str>) -> Result<u64, TranslateError> {
    match version {
        None | Some("") => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| TranslateError::InvalidVersion(v.to_string())),
    }
}

// === impl Resource ===

macro_rules! each_kind {
    ($resource:expr, $m:ident => $body:expr) => {
        match $resource {
            Resource::Namespace($m) => $body,
            Resource::Pod($m) => $body,
            Resource::PersistentVolume($m) => $body,
            Resource::PersistentVolumeClaim($m) => $body,
            Resource::Service($m) => $body,
            Resource::Role($m) => $body,
            Resource::RoleBinding($m) => $body,
        }
    };
}

impl Resource {
    /// The table (and kind) name.
    pub fn kind(&self) -> &'static str {
        fn table<M: Model>(_: &M) -> &'static str {
            M::TABLE
        }
        each_kind!(self, m => table(m))
    }

    pub fn base(&self) -> &Base {
        each_kind!(self, m => &m.base)
    }

    pub fn pk(&self) -> String {
        self.base().pk()
    }

    /// A row of the same kind carrying only the identity columns, enough to delete it.
    pub fn to_key(&self) -> Self {
        let base = self.base();
        let key = Base::key(&base.cluster, &base.namespace, &base.name);
        match self {
            Self::Namespace(_) => Self::Namespace(Namespace { base: key }),
            Self::Pod(_) => Self::Pod(Pod { base: key }),
            Self::PersistentVolume(_) => Self::PersistentVolume(PersistentVolume { base: key }),
            Self::PersistentVolumeClaim(_) => {
                Self::PersistentVolumeClaim(PersistentVolumeClaim { base: key })
            }
            Self::Service(_) => Self::Service(Service { base: key }),
            Self::Role(_) => Self::Role(Role {
                base: key,
                ..Default::default()
            }),
            Self::RoleBinding(_) => Self::RoleBinding(RoleBinding {
                base: key,
                ..Default::default()
            }),
        }
    }

    pub fn version(&self) -> u64 {
        self.base().version
    }

    pub fn insert(&self, table: &Table<'_>) -> Result<()> {
        each_kind!(self, m => table.insert(m))
    }

    pub fn update(&self, table: &Table<'_>) -> Result<()> {
        each_kind!(self, m => table.update(m))
    }

    pub fn delete(&self, table: &Table<'_>) -> Result<()> {
        each_kind!(self, m => table.delete(m))
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = self.base();
        if base.namespace.is_empty() {
            write!(f, "{} {}", self.kind(), base.name)
        } else {
            write!(f, "{} {}/{}", self.kind(), base.namespace, base.name)
        }
    }
}

macro_rules! from_kind {
    ($($kind:ident),+) => {
        $(
            impl From<$kind> for Resource {
                fn from(m: $kind) -> Self {
                    Resource::$kind(m)
                }
            }
        )+
    };
}

from_kind!(
    Namespace,
    Pod,
    PersistentVolume,
    PersistentVolumeClaim,
    Service,
    Role,
    RoleBinding
);
