use super::{Base, FromObject, TranslateError};
use crate::{ListOptions, Model, Result, Table};
use mig_discovery_k8s_api as k8s;
use rusqlite::{types::Value, Row};

/// Defines a row that carries only the shared columns, mirroring one native kind.
macro_rules! resource {
    ($(#[$doc:meta])* $name:ident, $object:ty) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            pub base: Base,
        }

        impl $name {
            pub fn key(
                cluster: impl Into<String>,
                namespace: impl Into<String>,
                name: impl Into<String>,
            ) -> Self {
                Self {
                    base: Base::key(cluster, namespace, name),
                }
            }

            /// Lists the rows owned by `cluster`.
            pub fn list(table: &Table<'_>, cluster: &str) -> Result<Vec<Self>> {
                table.list(&ListOptions::default().eq("cluster", cluster.to_string()))
            }
        }

        impl FromObject<$object> for $name {
            fn from_object(cluster: &str, object: &$object) -> Result<Self, TranslateError> {
                Ok(Self {
                    base: Base::with(cluster, object)?,
                })
            }
        }

        impl Model for $name {
            const TABLE: &'static str = stringify!($name);
            const COLUMNS: &'static [&'static str] = &Base::COLUMNS;

            fn pk(&self) -> String {
                self.base.pk()
            }

            fn values(&self) -> Vec<Value> {
                self.base.values()
            }

            fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    base: Base::from_row(row)?,
                })
            }
        }
    };
}

resource!(Namespace, k8s::Namespace);
resource!(Pod, k8s::Pod);
resource!(
    /// A cluster-scoped persistent volume.
    PersistentVolume,
    k8s::PersistentVolume
);
resource!(PersistentVolumeClaim, k8s::PersistentVolumeClaim);
resource!(Service, k8s::Service);
