use crate::{
    collection::Collection,
    event::ModelEvent,
    heartbeat::Heartbeat,
    metrics::Metrics,
    Source,
};
use anyhow::{bail, Context, Result};
use mig_discovery_k8s_api::{Client, MigCluster, ResourceExt};
use mig_discovery_store::{model::Cluster, Db, Model};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, watch},
    time::{Duration, Instant},
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

#[derive(Clone, Debug)]
pub struct DataSourceConfig {
    /// How long the cluster may go without delivering any watch event before it is considered
    /// unhealthy.
    pub heartbeat_threshold: Duration,

    /// Capacity of the event channel between the watches and the apply loop.
    pub channel_capacity: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Starting,
    Ready,
    Stopped,
}

/// Mirrors one cluster into the store.
///
/// Starting a data source reconciles every collection in full and then keeps the store current
/// from the cluster's watches. All writes driven by watches flow through a single apply loop, so
/// writes for one cluster never race one another.
pub struct DataSource {
    cluster: MigCluster,
    name: String,
    host: Client,
    db: Db,
    config: DataSourceConfig,
    metrics: Metrics,
    collections: Vec<Collection>,
    threshold: Arc<AtomicU64>,
    heartbeat: Heartbeat,
    state: Mutex<State>,
}

/// Forwards model events from a cluster's watches to its apply loop.
#[derive(Clone, Debug)]
pub struct EventSink {
    cluster: Arc<str>,
    cluster_pk: Arc<str>,
    tx: mpsc::Sender<ModelEvent>,
    heartbeat: Heartbeat,
}

struct State {
    phase: Phase,
    stop: Option<watch::Sender<bool>>,
    client: Option<Client>,
}

// === impl DataSourceConfig ===

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold: Duration::from_secs(60),
            channel_capacity: 100,
        }
    }
}

// === impl DataSource ===

impl DataSource {
    pub fn new(
        cluster: MigCluster,
        host: Client,
        db: Db,
        config: DataSourceConfig,
        metrics: Metrics,
    ) -> Self {
        let name = format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_unchecked()
        );
        let heartbeat = Heartbeat::new(config.heartbeat_threshold);
        Self {
            cluster,
            name,
            host,
            db,
            config,
            metrics,
            collections: Collection::all(),
            threshold: Default::default(),
            heartbeat,
            state: Mutex::new(State {
                phase: Phase::Created,
                stop: None,
                client: None,
            }),
        }
    }

    /// The cluster's `namespace/name`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &MigCluster {
        &self.cluster
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// A client for the remote cluster, once started.
    pub fn client(&self) -> Option<Client> {
        self.state.lock().client.clone()
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn version_threshold(&self) -> u64 {
        self.threshold.load(Ordering::Acquire)
    }

    /// Raises the version threshold to `version`. The threshold never decreases.
    pub fn has_discovered(&self, version: u64) {
        self.threshold.fetch_max(version, Ordering::AcqRel);
    }

    /// Healthy and fully reconciled.
    pub fn is_ready(&self) -> bool {
        self.heartbeat.is_healthy() && self.collections.iter().all(Collection::is_ready)
    }

    /// Stores the cluster, reconciles every collection and then starts the watches and the apply
    /// loop. Fails when the cluster cannot be reached or any reconciliation fails.
    pub async fn start(&self) -> Result<()> {
        self.start_with(self.connect()).await
    }

    async fn connect(&self) -> Result<Client> {
        let config = self
            .cluster
            .rest_config(&self.host)
            .await
            .with_context(|| format!("failed to configure a client for {}", self.name))?;
        Ok(Client::try_from(config)?)
    }

    /// Starts with the client produced by `connect`.
    pub(crate) async fn start_with(
        &self,
        connect: impl std::future::Future<Output = Result<Client>>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Created {
                bail!("{} cannot be started from {:?}", self.name, state.phase);
            }
            state.phase = Phase::Starting;
        }

        let started = Instant::now();
        let row = Cluster::with(&self.cluster)?;
        let cluster_pk = row.pk();
        self.db
            .transaction(|t| row.upsert(t))
            .context("failed to store cluster")?;

        let client = connect.await?;
        let connected = started.elapsed();

        let mut known = Vec::with_capacity(self.collections.len());
        for collection in &self.collections {
            let (reconciled, discovered) = collection
                .reconcile(&client, &self.db, &cluster_pk)
                .await
                .with_context(|| format!("failed to reconcile {}", self.name))?;
            self.has_discovered(reconciled.version);
            known.push(discovered);
        }
        self.heartbeat.beat();

        let mut state = self.state.lock();
        if state.phase == Phase::Stopped {
            debug!(cluster = %self.name, "Stopped while starting");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = EventSink {
            cluster: self.name.as_str().into(),
            cluster_pk: cluster_pk.into(),
            tx,
            heartbeat: self.heartbeat.clone(),
        };
        for (collection, known) in self.collections.iter().zip(known) {
            collection.add_watch(&client, &sink, known, &stop_rx);
        }
        self.heartbeat
            .watch_nodes(client.clone(), &self.name, stop_rx.clone());
        tokio::spawn(
            apply_events(
                rx,
                self.db.clone(),
                self.threshold.clone(),
                self.metrics.clone(),
                self.name.clone(),
                stop_rx,
            )
            .instrument(info_span!("apply", cluster = %self.name)),
        );
        state.phase = Phase::Ready;
        state.stop = Some(stop_tx);
        state.client = Some(client);
        drop(state);

        info!(
            cluster = %self.name,
            ?connected,
            reconciled = ?started.elapsed(),
            threshold = self.version_threshold(),
            "Started"
        );
        Ok(())
    }

    /// Stops the watches and the apply loop. When `purge` is set the cluster is gone for good and
    /// its rows are deleted.
    pub fn stop(&self, purge: bool) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Stopped;
            state.client = None;
            if let Some(stop) = state.stop.take() {
                stop.send_replace(true);
            }
        }
        for collection in &self.collections {
            collection.reset();
        }
        if purge {
            let key = Cluster::key(
                self.cluster.namespace().unwrap_or_default(),
                self.cluster.name_unchecked(),
            );
            if let Err(error) = self.db.delete(&key) {
                warn!(cluster = %self.name, %error, "Failed to delete cluster");
            }
        }
        info!(cluster = %self.name, purge, "Stopped");
    }
}

#[async_trait::async_trait]
impl Source for DataSource {
    async fn start(&self) -> Result<()> {
        DataSource::start(self).await
    }

    fn stop(&self, purge: bool) {
        DataSource::stop(self, purge)
    }

    fn is_ready(&self) -> bool {
        DataSource::is_ready(self)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("threshold", &self.version_threshold())
            .finish_non_exhaustive()
    }
}

// === impl EventSink ===

impl EventSink {
    /// The cluster's `namespace/name`.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The cluster's primary key, referenced by every row.
    pub fn cluster_pk(&self) -> &str {
        &self.cluster_pk
    }

    /// Records a heartbeat and enqueues the event.
    ///
    /// Sending after the data source has stopped is not an error: the event is dropped.
    pub async fn send(&self, event: ModelEvent) {
        self.heartbeat.beat();
        if let Err(error) = self.tx.send(event).await {
            debug!(cluster = %self.cluster, resource = %error.0.resource, "Event channel closed");
        }
    }
}

/// Applies events in arrival order until the channel closes or `stop` fires.
async fn apply_events(
    mut rx: mpsc::Receiver<ModelEvent>,
    db: Db,
    threshold: Arc<AtomicU64>,
    metrics: Metrics,
    cluster: String,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.changed() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let kind = event.resource.kind();
        match event.apply(&db, threshold.load(Ordering::Acquire)) {
            Ok(outcome) => {
                trace!(action = %event.action, resource = %event.resource, ?outcome);
                metrics.event(&cluster, kind, Some(outcome));
            }
            Err(error) => {
                warn!(
                    action = %event.action,
                    resource = %event.resource,
                    %error,
                    "Failed to apply event"
                );
                metrics.event(&cluster, kind, None);
            }
        }
    }
    debug!("Stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use http::{Request, Response, StatusCode};
    use kube::client::Body;
    use mig_discovery_store::{
        model::{Namespace, Pod},
        ListOptions,
    };
    use tower_test::mock;

    fn mk_db() -> (Db, String) {
        let db = Db::in_memory().expect("database must open");
        let cluster = Cluster::key("openshift-migration", "c1");
        db.insert(&cluster).expect("insert");
        (db, cluster.pk())
    }

    fn mk_pod(cluster: &str, name: &str, version: u64) -> Pod {
        let mut pod = Pod::key(cluster, "ns", name);
        pod.base.version = version;
        pod
    }

    fn mk_sink(tx: mpsc::Sender<ModelEvent>, heartbeat: Heartbeat) -> EventSink {
        EventSink {
            cluster: "openshift-migration/c1".into(),
            cluster_pk: "pk".into(),
            tx,
            heartbeat,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_record_heartbeats() {
        let heartbeat = Heartbeat::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(1);
        let sink = mk_sink(tx, heartbeat.clone());
        assert!(!heartbeat.is_healthy());

        sink.send(ModelEvent::create(mk_pod("pk", "a", 1))).await;
        assert!(heartbeat.is_healthy());
        assert_eq!(rx.recv().await.map(|ev| ev.action), Some(Action::Create));
    }

    #[tokio::test]
    async fn sends_after_close_are_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = mk_sink(tx, Heartbeat::new(Duration::from_secs(5)));
        // Must neither block nor panic.
        sink.send(ModelEvent::delete(mk_pod("pk", "a", 1))).await;
    }

    #[tokio::test]
    async fn apply_loop_gates_on_threshold() {
        let (db, cluster) = mk_db();
        let threshold = Arc::new(AtomicU64::new(5));
        let (tx, rx) = mpsc::channel(10);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let metrics = Metrics::default();

        tx.send(ModelEvent::create(mk_pod(&cluster, "old", 5)))
            .await
            .expect("send");
        tx.send(ModelEvent::create(mk_pod(&cluster, "new", 6)))
            .await
            .expect("send");
        tx.send(ModelEvent::delete(mk_pod(&cluster, "new", 1)))
            .await
            .expect("send");
        tx.send(ModelEvent::update(mk_pod(&cluster, "kept", 9)))
            .await
            .expect("send");
        drop(tx);

        apply_events(rx, db.clone(), threshold, metrics, "c1".to_string(), stop_rx).await;

        let names = db
            .list::<Pod>(&ListOptions::default())
            .expect("list")
            .into_iter()
            .map(|p| p.base.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["kept"]);
    }

    #[tokio::test]
    async fn apply_loop_exits_on_stop() {
        let (db, _) = mk_db();
        let (_tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(apply_events(
            rx,
            db,
            Default::default(),
            Metrics::default(),
            "c1".to_string(),
            stop_rx,
        ));
        stop_tx.send_replace(true);
        task.await.expect("apply loop must exit");
    }

    #[tokio::test]
    async fn lifecycle_without_start() {
        let (db, cluster_pk) = mk_db();
        let mut cluster = MigCluster::new("c1", Default::default());
        cluster.metadata.namespace = Some("openshift-migration".to_string());
        let host = Client::try_from(mig_discovery_k8s_api::Config::new(
            "http://127.0.0.1:1".parse().expect("valid uri"),
        ))
        .expect("client must build");
        let ds = DataSource::new(cluster, host, db.clone(), Default::default(), Default::default());
        assert_eq!(ds.name(), "openshift-migration/c1");
        assert_eq!(ds.phase(), Phase::Created);
        assert!(!ds.is_ready());

        for v in [3, 9, 4] {
            ds.has_discovered(v);
        }
        assert_eq!(ds.version_threshold(), 9);

        db.insert(&mk_pod(&cluster_pk, "a", 1)).expect("insert");
        ds.stop(true);
        assert_eq!(ds.phase(), Phase::Stopped);
        assert_eq!(db.count::<Pod>(&ListOptions::default()).expect("count"), 0);
        assert!(ds.start().await.is_err(), "a stopped data source cannot restart");
    }

    /// Serves lists from a fake API server. Watches are left pending, and listing any path that
    /// ends with `fail` is answered with an error.
    fn mk_client(fail: Option<&'static str>) -> Client {
        let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
        tokio::spawn(async move {
            let mut watches = Vec::new();
            while let Some((request, send)) = handle.next_request().await {
                if request.uri().query().unwrap_or_default().contains("watch=true") {
                    watches.push(send);
                    continue;
                }
                let path = request.uri().path();
                let (status, body) = if fail.is_some_and(|f| path.ends_with(f)) {
                    let status = serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "Status",
                        "status": "Failure",
                        "message": "boom",
                        "reason": "InternalError",
                        "code": 500,
                    });
                    (StatusCode::INTERNAL_SERVER_ERROR, status)
                } else {
                    let items = match path {
                        "/api/v1/namespaces" => vec![serde_json::json!({
                            "apiVersion": "v1",
                            "kind": "Namespace",
                            "metadata": { "name": "ns", "uid": "ns-uid", "resourceVersion": "7" },
                        })],
                        "/api/v1/pods" => vec![serde_json::json!({
                            "apiVersion": "v1",
                            "kind": "Pod",
                            "metadata": {
                                "namespace": "ns",
                                "name": "web",
                                "uid": "web-uid",
                                "resourceVersion": "12",
                            },
                        })],
                        _ => vec![],
                    };
                    let list = serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "List",
                        "metadata": { "resourceVersion": "12" },
                        "items": items,
                    });
                    (StatusCode::OK, list)
                };
                let body = serde_json::to_vec(&body).expect("json must encode");
                let rsp = Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("response must build");
                send.send_response(rsp);
            }
        });
        Client::new(service, "default")
    }

    fn mk_ds(db: &Db) -> DataSource {
        let mut cluster = MigCluster::new("c1", Default::default());
        cluster.metadata.namespace = Some("openshift-migration".to_string());
        cluster.metadata.resource_version = Some("1".to_string());
        DataSource::new(
            cluster,
            mk_client(None),
            db.clone(),
            Default::default(),
            Default::default(),
        )
    }

    #[tokio::test]
    async fn start_reconciles_every_collection() {
        let db = Db::in_memory().expect("database must open");
        let ds = mk_ds(&db);

        let client = mk_client(None);
        ds.start_with(async move { Ok::<_, anyhow::Error>(client) })
            .await
            .expect("start must succeed");
        assert_eq!(ds.phase(), Phase::Ready);
        assert!(ds.is_ready());
        assert!(ds.client().is_some());
        assert!(ds.collections().iter().all(Collection::is_ready));
        assert_eq!(ds.version_threshold(), 12);

        let namespaces = db
            .list::<Namespace>(&ListOptions::default())
            .expect("list");
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].base.name, "ns");
        let pods = db.list::<Pod>(&ListOptions::default()).expect("list");
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].base.name, "web");

        ds.stop(false);
        assert_eq!(ds.phase(), Phase::Stopped);
        assert!(!ds.is_ready());
        assert_eq!(db.count::<Pod>(&ListOptions::default()).expect("count"), 1);
    }

    #[tokio::test]
    async fn failed_reconcile_aborts_start() {
        let db = Db::in_memory().expect("database must open");
        let ds = mk_ds(&db);

        let client = mk_client(Some("/services"));
        let error = ds
            .start_with(async move { Ok::<_, anyhow::Error>(client) })
            .await
            .expect_err("start must fail");
        assert!(
            format!("{error:#}").contains("failed to list Services"),
            "{error:#}"
        );
        assert_ne!(ds.phase(), Phase::Ready);
        assert!(!ds.is_ready());
        assert!(ds.client().is_none());
        let ready = ds
            .collections()
            .iter()
            .filter(|c| c.is_ready())
            .map(Collection::kind)
            .collect::<Vec<_>>();
        assert_eq!(
            ready,
            vec![
                crate::Kind::Namespace,
                crate::Kind::Pod,
                crate::Kind::PersistentVolume,
                crate::Kind::PersistentVolumeClaim,
            ]
        );
    }

    #[tokio::test]
    async fn failed_connect_aborts_start() {
        let db = Db::in_memory().expect("database must open");
        let ds = mk_ds(&db);
        let error = ds
            .start_with(async { Err::<Client, _>(anyhow::anyhow!("unreachable")) })
            .await
            .expect_err("start must fail");
        assert_eq!(error.to_string(), "unreachable");
        assert!(!ds.is_ready());
    }
}
