//! Authorizes API requests against mirrored cluster data.
//!
//! Two strategies implement [`Authorizer`]:
//!
//! - [`MatrixRbac`] resolves the caller's bindings and roles from the store and checks every
//!   (group, resource, verb) combination of the request against the roles' rules.
//! - [`Delegated`] forwards each decision to the cluster's own access review API. It is used for
//!   the host cluster.
//!
//! Both authenticate the caller's bearer token once per instance. An instance serves one request.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod delegated;
mod matrix;
mod rbac;
mod review;

#[cfg(test)]
mod fake;

pub use self::{
    cache::TokenCache,
    delegated::Delegated,
    matrix::{Matrix, MxItem, Review},
    rbac::MatrixRbac,
    review::{KubeReviews, ReviewApi},
};
use mig_discovery_k8s_api::ClientError;
use mig_discovery_store::{model::Cluster, Db, Model};
use std::sync::Arc;

/// Matches any group, resource or verb.
pub const ALL: &str = "*";

pub mod resources {
    pub const NAMESPACES: &str = "namespaces";
    pub const PERSISTENT_VOLUMES: &str = "persistentvolumes";
    pub const PERSISTENT_VOLUME_CLAIMS: &str = "persistentvolumeclaims";
    pub const SERVICES: &str = "services";
    pub const PODS: &str = "pods";
    pub const POD_LOGS: &str = "pods/log";
}

pub mod verbs {
    pub const LIST: &str = "list";
    pub const GET: &str = "get";
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
    pub const PATCH: &str = "patch";
    pub const UPDATE: &str = "update";
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote request failed: {0}")]
    Remote(#[from] mig_discovery_k8s_api::Error),

    #[error(transparent)]
    Store(#[from] mig_discovery_store::Error),

    #[error("failed to decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Allow requests that carry no bearer token.
    pub auth_optional: bool,

    /// Users allowed everything.
    pub allowed_users: Vec<String>,
}

/// Decides whether the holder of a bearer token may perform a request.
#[async_trait::async_trait]
pub trait Authorizer: Send {
    /// Denial is `Ok(false)`. Errors are reserved for failed remote calls and store reads.
    async fn allow(&mut self, review: &Review) -> Result<bool>;

    fn authenticated(&self) -> bool;

    fn user(&self) -> Option<&str>;

    fn groups(&self) -> &[String];
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_optional: false,
            allowed_users: vec!["kube:admin".to_string()],
        }
    }
}

/// Picks the strategy for `cluster`: delegated review for the host cluster, the matrix matcher
/// otherwise.
pub fn authorizer<R: ReviewApi>(
    cluster: &Cluster,
    reviews: R,
    db: Db,
    settings: Arc<Settings>,
    token: impl Into<String>,
) -> Box<dyn Authorizer> {
    if cluster.host {
        tracing::debug!(cluster = %cluster.name, "Using delegated review");
        return Box::new(Delegated::new(reviews, token));
    }
    Box::new(MatrixRbac::new(reviews, db, cluster.pk(), settings, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeReviews;

    #[tokio::test]
    async fn host_clusters_delegate() {
        let db = Db::in_memory().expect("db");
        let reviews = FakeReviews::default().with_user("t", "alice", &[]);
        reviews.allow(
            Review::new([""], [resources::PODS], [verbs::GET])
                .in_namespace("ns")
                .attributes(),
        );
        let review = Review::new([""], [resources::PODS], [verbs::GET]).in_namespace("ns");

        let host = Cluster {
            host: true,
            ..Cluster::key("openshift-migration", "host")
        };
        let mut authz = authorizer(&host, reviews.clone(), db.clone(), Default::default(), "t");
        assert!(authz.allow(&review).await.expect("allow"));
        assert_eq!(authz.user(), Some("alice"));

        // The matrix matcher finds no bindings for alice.
        let remote = Cluster::key("openshift-migration", "remote");
        let mut authz = authorizer(&remote, reviews, db, Default::default(), "t");
        assert!(!authz.allow(&review).await.expect("allow"));
        assert!(authz.authenticated());
    }
}
