//! Relational persistence for mirrored cluster resources.
//!
//! Every mirrored resource kind maps to one table. Rows are addressed by a primary key derived
//! from the row's identity (cluster, namespace, name) so callers never supply keys directly and
//! writes from independent actors converge on the same row.
//!
//! ```text
//! [ Cluster ] <- [ Namespace | Pod | PV | PVC | Service | Role | RoleBinding ] <- [ Subject ]
//! ```
//!
//! Deleting a `Cluster` cascades to every row referencing it; deleting a `RoleBinding` cascades to
//! its `Subject` rows.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod db;
mod error;
pub mod model;
mod table;

pub use self::{
    db::Db,
    error::{Error, Result},
    table::{pk, ListOptions, Model, Page, Table},
};
pub use rusqlite::types::Value;
