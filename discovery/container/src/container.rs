use crate::{
    datasource::{DataSource, DataSourceConfig},
    metrics::Metrics,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use mig_discovery_k8s_api::{Api, Client, MigCluster, ResourceExt};
use mig_discovery_store::{model::Cluster, Db};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, instrument};


/// A mirror of one cluster that can be started and stopped.
#[async_trait::async_trait]
pub trait Source: Send + Sync + 'static {
    async fn start(&self) -> Result<()>;

    /// Stops mirroring. `purge` removes everything stored for the cluster.
    fn stop(&self, purge: bool);

    fn is_ready(&self) -> bool;
}

/// Identifies a `MigCluster`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId {
    pub namespace: String,
    pub name: String,
}

/// Holds one [`Source`] per cluster.
///
/// The map is locked only to change its membership; sources are started and stopped outside the
/// lock so that lookups are never held up by a slow cluster.
pub struct Container<S = DataSource> {
    db: Db,
    sources: RwLock<HashMap<ClusterId, Arc<S>>>,
    build: Box<dyn Fn(MigCluster) -> S + Send + Sync>,
    pruned: AtomicBool,
    metrics: Metrics,
}

// === impl ClusterId ===

impl ClusterId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(cluster: &MigCluster) -> Self {
        Self::new(
            cluster.namespace().unwrap_or_default(),
            cluster.name_unchecked(),
        )
    }
}

impl From<&Cluster> for ClusterId {
    fn from(c: &Cluster) -> Self {
        Self::new(c.namespace.clone(), c.name.clone())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Container ===

impl Container<DataSource> {
    pub fn new(host: Client, db: Db, config: DataSourceConfig, metrics: Metrics) -> Self {
        let (ds_db, ds_metrics) = (db.clone(), metrics.clone());
        Self::with_builder(db, metrics, move |cluster| {
            DataSource::new(
                cluster,
                host.clone(),
                ds_db.clone(),
                config.clone(),
                ds_metrics.clone(),
            )
        })
    }
}

impl<S: Source> Container<S> {
    pub fn with_builder(
        db: Db,
        metrics: Metrics,
        build: impl Fn(MigCluster) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            db,
            sources: Default::default(),
            build: Box::new(build),
            pruned: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn get_ds(&self, id: &ClusterId) -> Option<Arc<S>> {
        self.sources.read().get(id).cloned()
    }

    pub fn is_ready(&self, id: &ClusterId) -> bool {
        self.get_ds(id).map(|ds| ds.is_ready()).unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<ClusterId> {
        let mut ids = self.sources.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Builds and starts a source for the cluster, stopping the one it replaces first.
    ///
    /// A source that fails to start stays registered (and not ready) until the cluster is added
    /// again or deleted.
    #[instrument(skip_all, fields(cluster = %ClusterId::of(&cluster)))]
    pub async fn add(&self, cluster: MigCluster) -> Result<()> {
        let id = ClusterId::of(&cluster);
        let ds = Arc::new((self.build)(cluster));
        let prior = {
            let mut sources = self.sources.write();
            let prior = sources.insert(id.clone(), ds.clone());
            self.metrics.set_datasources(sources.len());
            prior
        };
        if let Some(prior) = prior {
            info!("Replacing");
            prior.stop(false);
        }
        ds.start()
            .await
            .with_context(|| format!("failed to start {id}"))
    }

    /// Stops the cluster's source and removes everything stored for it.
    #[instrument(skip(self), fields(cluster = %id))]
    pub fn delete(&self, id: &ClusterId) -> bool {
        let removed = {
            let mut sources = self.sources.write();
            let removed = sources.remove(id);
            self.metrics.set_datasources(sources.len());
            removed
        };
        match removed {
            Some(ds) => {
                info!("Deleted");
                ds.stop(true);
                true
            }
            None => false,
        }
    }

    /// Deletes stored clusters that are not among `live`, along with everything stored for them.
    /// Only the first call has any effect.
    pub fn prune(&self, live: &[MigCluster]) -> Result<Vec<ClusterId>> {
        if self.pruned.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let wanted = live.iter().map(ClusterId::of).collect::<HashSet<_>>();
        let stored = self.db.read(|t| Cluster::list(t))?;
        let mut pruned = Vec::new();
        for cluster in stored {
            let id = ClusterId::from(&cluster);
            if wanted.contains(&id) {
                continue;
            }
            self.db
                .delete(&cluster)
                .with_context(|| format!("failed to prune {id}"))?;
            info!(cluster = %id, "Pruned");
            pruned.push(id);
        }
        self.pruned.store(true, Ordering::Release);
        Ok(pruned)
    }

    /// True when the cluster still exists on the host.
    pub async fn has_cluster(&self, host: &Client, id: &ClusterId) -> Result<bool> {
        let found = Api::<MigCluster>::namespaced(host.clone(), &id.namespace)
            .get_opt(&id.name)
            .await?;
        Ok(found.is_some())
    }
}

impl<S> fmt::Debug for Container<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("sources", &self.sources.read().len())
            .finish_non_exhaustive()
    }
}
