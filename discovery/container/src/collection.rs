use crate::{datasource::EventSink, tracker::Tracker};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use mig_discovery_k8s_api::{self as k8s, watcher, Api, Client, ListParams, Watch};
use mig_discovery_store::{
    model::{self, FromObject, Resource},
    Db,
};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};

/// The resource kinds mirrored for every cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Namespace,
    Pod,
    PersistentVolume,
    PersistentVolumeClaim,
    Service,
    /// Both `Role` and `ClusterRole`.
    Role,
    /// Both `RoleBinding` and `ClusterRoleBinding`.
    RoleBinding,
}

/// Synchronizes one resource kind between a remote cluster and the store.
///
/// A collection is reconciled once, in full, when its cluster starts. Afterwards its watches
/// translate each change and forward it to the cluster's event channel; nothing else is triggered
/// by a watch.
#[derive(Debug)]
pub struct Collection {
    kind: Kind,
    ready: AtomicBool,
}

/// The changes made by a reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// The highest resource version discovered.
    pub version: u64,
}

/// The writes needed to make the stored rows match the discovered ones.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Plan {
    pub(crate) insert: Vec<Resource>,
    pub(crate) update: Vec<Resource>,
    pub(crate) delete: Vec<Resource>,
}

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Namespace,
        Kind::Pod,
        Kind::PersistentVolume,
        Kind::PersistentVolumeClaim,
        Kind::Service,
        Kind::Role,
        Kind::RoleBinding,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::Pod => "Pod",
            Self::PersistentVolume => "PersistentVolume",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::Service => "Service",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// === impl Collection ===

impl Collection {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            ready: AtomicBool::new(false),
        }
    }

    /// One collection for each mirrored kind.
    pub fn all() -> Vec<Self> {
        Kind::ALL.into_iter().map(Self::new).collect()
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// True once the collection has been reconciled.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Lists the kind's objects on the remote cluster.
    pub async fn get_discovered(&self, client: &Client, cluster: &str) -> Result<Vec<Resource>> {
        let discovered = match self.kind {
            Kind::Namespace => list::<k8s::Namespace, model::Namespace>(client, cluster).await?,
            Kind::Pod => list::<k8s::Pod, model::Pod>(client, cluster).await?,
            Kind::PersistentVolume => {
                list::<k8s::PersistentVolume, model::PersistentVolume>(client, cluster).await?
            }
            Kind::PersistentVolumeClaim => {
                list::<k8s::PersistentVolumeClaim, model::PersistentVolumeClaim>(client, cluster)
                    .await?
            }
            Kind::Service => list::<k8s::Service, model::Service>(client, cluster).await?,
            Kind::Role => {
                let mut roles = list::<k8s::Role, model::Role>(client, cluster).await?;
                roles.extend(list::<k8s::ClusterRole, model::Role>(client, cluster).await?);
                roles
            }
            Kind::RoleBinding => {
                let mut bindings =
                    list::<k8s::RoleBinding, model::RoleBinding>(client, cluster).await?;
                bindings.extend(
                    list::<k8s::ClusterRoleBinding, model::RoleBinding>(client, cluster).await?,
                );
                bindings
            }
        };
        Ok(discovered)
    }

    /// Lists the kind's rows stored for the cluster.
    pub fn get_stored(&self, db: &Db, cluster: &str) -> Result<Vec<Resource>> {
        fn rows<M: Into<Resource>>(rows: Vec<M>) -> Vec<Resource> {
            rows.into_iter().map(Into::into).collect()
        }

        let stored = db.read(|t| {
            Ok(match self.kind {
                Kind::Namespace => rows(model::Namespace::list(t, cluster)?),
                Kind::Pod => rows(model::Pod::list(t, cluster)?),
                Kind::PersistentVolume => rows(model::PersistentVolume::list(t, cluster)?),
                Kind::PersistentVolumeClaim => {
                    rows(model::PersistentVolumeClaim::list(t, cluster)?)
                }
                Kind::Service => rows(model::Service::list(t, cluster)?),
                Kind::Role => rows(model::Role::list(t, cluster)?),
                Kind::RoleBinding => rows(model::RoleBinding::list(t, cluster)?),
            })
        })?;
        Ok(stored)
    }

    /// Makes the stored rows match the remote cluster and marks the collection ready.
    ///
    /// Returns the discovered rows along with a summary of the changes.
    pub async fn reconcile(
        &self,
        client: &Client,
        db: &Db,
        cluster: &str,
    ) -> Result<(Reconciled, Vec<Resource>)> {
        let discovered = self
            .get_discovered(client, cluster)
            .await
            .with_context(|| format!("failed to list {}s", self.kind))?;
        let stored = self.get_stored(db, cluster)?;
        let version = discovered.iter().map(Resource::version).max().unwrap_or(0);

        let plan = Plan::diff(&discovered, stored);
        let reconciled = Reconciled {
            inserted: plan.insert.len(),
            updated: plan.update.len(),
            deleted: plan.delete.len(),
            version,
        };
        plan.apply(db)
            .with_context(|| format!("failed to store {}s", self.kind))?;

        self.ready.store(true, Ordering::Release);
        debug!(kind = %self.kind, ?reconciled, "Reconciled");
        Ok((reconciled, discovered))
    }

    /// Spawns the kind's watches, forwarding every change to `sink` until `stop` fires.
    ///
    /// `known` seeds the watches with the rows already stored so that objects removed before the
    /// first relist completes are deleted.
    pub(crate) fn add_watch(
        &self,
        client: &Client,
        sink: &EventSink,
        known: Vec<Resource>,
        stop: &watch::Receiver<bool>,
    ) {
        let (cluster_scoped, namespaced): (Vec<_>, Vec<_>) = known
            .into_iter()
            .partition(|r| r.base().namespace.is_empty());
        match self.kind {
            Kind::Namespace => {
                spawn::<k8s::Namespace, model::Namespace>(client, sink, cluster_scoped, stop)
            }
            Kind::Pod => spawn::<k8s::Pod, model::Pod>(client, sink, namespaced, stop),
            Kind::PersistentVolume => spawn::<k8s::PersistentVolume, model::PersistentVolume>(
                client,
                sink,
                cluster_scoped,
                stop,
            ),
            Kind::PersistentVolumeClaim => {
                spawn::<k8s::PersistentVolumeClaim, model::PersistentVolumeClaim>(
                    client, sink, namespaced, stop,
                )
            }
            Kind::Service => spawn::<k8s::Service, model::Service>(client, sink, namespaced, stop),
            Kind::Role => {
                spawn::<k8s::Role, model::Role>(client, sink, namespaced, stop);
                spawn::<k8s::ClusterRole, model::Role>(client, sink, cluster_scoped, stop);
            }
            Kind::RoleBinding => {
                spawn::<k8s::RoleBinding, model::RoleBinding>(client, sink, namespaced, stop);
                spawn::<k8s::ClusterRoleBinding, model::RoleBinding>(
                    client,
                    sink,
                    cluster_scoped,
                    stop,
                );
            }
        }
    }
}

// === impl Plan ===

impl Plan {
    /// Diffs rows by primary key: discovered-only rows are inserted, rows whose content differs
    /// are updated and stored-only rows are deleted.
    pub(crate) fn diff(discovered: &[Resource], stored: Vec<Resource>) -> Self {
        let mut stored = stored
            .into_iter()
            .map(|r| (r.pk(), r))
            .collect::<HashMap<_, _>>();
        let mut plan = Self::default();
        for r in discovered {
            match stored.remove(&r.pk()) {
                None => plan.insert.push(r.clone()),
                Some(s) if s != *r => plan.update.push(r.clone()),
                Some(_) => {}
            }
        }
        plan.delete = stored.into_values().collect();
        plan
    }

    /// Writes the plan in a single transaction.
    pub(crate) fn apply(&self, db: &Db) -> mig_discovery_store::Result<()> {
        db.transaction(|t| {
            for r in &self.delete {
                r.delete(t)?;
            }
            for r in &self.update {
                r.update(t)?;
            }
            for r in &self.insert {
                r.insert(t)?;
            }
            Ok(())
        })
    }
}

/// Lists all objects of type `O`, translating each into a row. Objects that cannot be translated
/// are skipped.
async fn list<O, M>(client: &Client, cluster: &str) -> Result<Vec<Resource>>
where
    O: k8s::Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
    M: FromObject<O> + Into<Resource>,
{
    let api = Api::<O>::all(client.clone());
    let mut rows = Vec::new();
    let mut params = ListParams::default().limit(500);
    loop {
        let list = api.list(&params).await?;
        for object in &list.items {
            match M::from_object(cluster, object) {
                Ok(m) => rows.push(m.into()),
                Err(error) => info!(kind = %O::kind(&()), %error, "Skipping object"),
            }
        }
        match list.metadata.continue_.filter(|c| !c.is_empty()) {
            Some(token) => params = params.continue_token(&token),
            None => break,
        }
    }
    Ok(rows)
}

fn spawn<O, M>(
    client: &Client,
    sink: &EventSink,
    known: Vec<Resource>,
    stop: &watch::Receiver<bool>,
) where
    O: k8s::Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    M: FromObject<O> + Into<Resource>,
{
    let kind = O::kind(&()).to_string();
    let span = info_span!("watch", cluster = %sink.cluster(), %kind);
    let mut tracker = Tracker::<O>::new::<M>(sink.cluster_pk()).with_known(known);
    let mut events = Watch::from(watcher(
        Api::<O>::all(client.clone()),
        watcher::Config::default(),
    ))
    .instrument(span.clone());
    let sink = sink.clone();
    let mut stop = stop.clone();
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => {
                            for model_event in tracker.handle(ev) {
                                sink.send(model_event).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("Stopped");
        }
        .instrument(span),
    );
}
