#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mig_discovery_auth as auth;
pub use mig_discovery_container as container;
pub use mig_discovery_k8s_api as k8s;
pub use mig_discovery_store as store;

mod args;
mod driver;

pub use self::{
    args::Args,
    driver::{Driver, Validate},
};

use self::{
    auth::{Authorizer, KubeReviews, Settings, TokenCache},
    container::{ClusterId, Container},
    store::{model::Cluster, Db},
};
use anyhow::Result;
use std::sync::Arc;

/// State shared with the API layer: the mirrored clusters and what is needed to authorize
/// requests against them.
#[derive(Clone)]
pub struct Discovery {
    container: Arc<Container>,
    db: Db,
    tokens: Arc<TokenCache>,
    settings: Arc<Settings>,
}

// === impl Discovery ===

impl Discovery {
    pub fn new(container: Arc<Container>, db: Db, tokens: TokenCache, settings: Settings) -> Self {
        Self {
            container,
            db,
            tokens: Arc::new(tokens),
            settings: Arc::new(settings),
        }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Builds an authorizer for one request against the identified cluster.
    ///
    /// `None` when the cluster is unknown or has not connected.
    pub fn authorizer(&self, id: &ClusterId, token: &str) -> Result<Option<Box<dyn Authorizer>>> {
        let Some(ds) = self.container.get_ds(id) else {
            return Ok(None);
        };
        let Some(client) = ds.client() else {
            tracing::debug!(%id, "Cluster not connected");
            return Ok(None);
        };
        let cluster = Cluster::with(ds.cluster())?;
        let reviews = KubeReviews::new(client, ds.cluster().clone(), self.tokens.clone());
        Ok(Some(auth::authorizer(
            &cluster,
            reviews,
            self.db.clone(),
            self.settings.clone(),
            token,
        )))
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("clusters", &self.container.ids())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{DataSourceConfig, Metrics};
    use crate::k8s::{Client, Config, MigCluster, MigClusterSpec};

    #[tokio::test]
    async fn no_authorizer_until_connected() {
        let db = Db::in_memory().expect("db");
        let host = Client::try_from(Config::new("http://127.0.0.1:1".parse().expect("url")))
            .expect("client");
        let container = Container::new(
            host,
            db.clone(),
            DataSourceConfig::default(),
            Metrics::default(),
        );
        let discovery = Discovery::new(
            Arc::new(container),
            db,
            TokenCache::default(),
            Settings::default(),
        );
        let id = ClusterId::new("openshift-migration", "c1");
        assert!(discovery.authorizer(&id, "t").expect("authorizer").is_none());

        // Registered but never started.
        let mut cluster = MigCluster::new(
            "c1",
            MigClusterSpec {
                url: Some("https://c1".to_string()),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("openshift-migration".to_string());
        let _ = discovery.container().add(cluster).await;
        assert!(discovery.container().get_ds(&id).is_some());
        assert!(discovery.authorizer(&id, "t").expect("authorizer").is_none());
    }
}
