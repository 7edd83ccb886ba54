use crate::{
    container::{ClusterId, Container, Source},
    k8s::{Client, Event, MigCluster},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Decides whether a cluster can be mirrored.
#[async_trait::async_trait]
pub trait Validate: Send + Sync + 'static {
    async fn is_valid(&self, cluster: &MigCluster) -> bool;
}

/// Drives the container from the `MigCluster` watch.
///
/// The first complete listing prunes stored clusters that no longer exist. Valid clusters are
/// added when first seen or when their connection settings change; deleted clusters are removed.
/// Clusters missing from a later relist are removed as well.
///
/// Failed adds and a failed prune are retried after a delay.
pub struct Driver<S, V> {
    container: Arc<Container<S>>,
    validate: V,
    known: HashMap<ClusterId, MigCluster>,
    pending: HashMap<ClusterId, MigCluster>,
    pruned: bool,
    prune_failed: bool,
    listing: Option<Vec<MigCluster>>,
    retry_delay: Duration,
    retry_at: Option<Instant>,
}

const RETRY_DELAY: Duration = Duration::from_secs(10);

#[async_trait::async_trait]
impl Validate for Client {
    async fn is_valid(&self, cluster: &MigCluster) -> bool {
        cluster.is_valid(self).await
    }
}

// === impl Driver ===

impl<S: Source, V: Validate> Driver<S, V> {
    pub fn new(container: Arc<Container<S>>, validate: V) -> Self {
        Self {
            container,
            validate,
            known: HashMap::new(),
            pending: HashMap::new(),
            pruned: false,
            prune_failed: false,
            listing: None,
            retry_delay: RETRY_DELAY,
            retry_at: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn run(mut self, events: impl Stream<Item = Event<MigCluster>>) {
        tokio::pin!(events);
        loop {
            let event = match self.retry_at {
                Some(at) => tokio::select! {
                    event = events.next() => event,
                    _ = time::sleep_until(at) => {
                        self.retry().await;
                        continue;
                    }
                },
                None => events.next().await,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => break,
            }
        }
        debug!("MigCluster watch ended");
    }

    pub(crate) async fn handle(&mut self, event: Event<MigCluster>) {
        match event {
            Event::Init => self.listing = Some(Vec::new()),
            Event::InitApply(cluster) => match self.listing.as_mut() {
                Some(listing) => listing.push(cluster),
                None => self.apply(cluster).await,
            },
            Event::InitDone => {
                let listing = self.listing.take().unwrap_or_default();
                self.relisted(listing).await;
            }
            Event::Apply(cluster) => self.apply(cluster).await,
            Event::Delete(cluster) => self.delete(&ClusterId::of(&cluster)),
        }
    }

    /// Retries the failed adds and a failed prune.
    pub(crate) async fn retry(&mut self) {
        self.retry_at = None;
        if self.prune_failed {
            let live = self
                .known
                .values()
                .chain(self.pending.values())
                .cloned()
                .collect::<Vec<_>>();
            self.prune(&live);
        }
        let pending = std::mem::take(&mut self.pending);
        for (_, cluster) in pending {
            self.apply(cluster).await;
        }
    }

    fn prune(&mut self, live: &[MigCluster]) {
        match self.container.prune(live) {
            Ok(pruned) => {
                info!(pruned = pruned.len(), "Pruned stored clusters");
                self.pruned = true;
                self.prune_failed = false;
            }
            Err(error) => {
                warn!(%error, "Failed to prune");
                self.prune_failed = true;
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.retry_delay;
        self.retry_at.get_or_insert_with(|| Instant::now() + delay);
    }

    async fn relisted(&mut self, listing: Vec<MigCluster>) {
        if !self.pruned {
            self.prune(&listing);
        }

        let live = listing.iter().map(ClusterId::of).collect::<HashSet<_>>();
        let gone = self
            .known
            .keys()
            .chain(self.pending.keys())
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        for id in gone {
            self.delete(&id);
        }
        for cluster in listing {
            self.apply(cluster).await;
        }
    }

    async fn apply(&mut self, cluster: MigCluster) {
        let id = ClusterId::of(&cluster);
        self.pending.remove(&id);
        if let Some(prior) = self.known.get_mut(&id) {
            if !prior.connection_changed(&cluster) {
                *prior = cluster;
                return;
            }
        }

        if !self.validate.is_valid(&cluster).await {
            debug!(%id, "Ignoring invalid cluster");
            self.delete(&id);
            return;
        }

        match self.container.add(cluster.clone()).await {
            Ok(()) => {
                info!(%id, "Cluster added");
                self.known.insert(id, cluster);
            }
            Err(error) => {
                warn!(%id, %error, "Failed to add cluster");
                self.known.remove(&id);
                self.pending.insert(id, cluster);
                self.schedule_retry();
            }
        }
    }

    fn delete(&mut self, id: &ClusterId) {
        self.known.remove(id);
        self.pending.remove(id);
        if self.container.delete(id) {
            info!(%id, "Cluster deleted");
        }
    }
}
