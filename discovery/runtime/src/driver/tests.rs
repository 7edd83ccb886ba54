use super::*;
use crate::{
    container::Metrics,
    k8s::MigClusterSpec,
    store::{model::Cluster, Db},
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Default)]
struct Calls {
    log: Arc<Mutex<Vec<String>>>,
    /// Starts fail while this is positive.
    failures: Arc<AtomicUsize>,
}

struct FakeSource {
    name: String,
    calls: Calls,
}

/// Clusters named `invalid*` are invalid.
struct ByName;

#[async_trait::async_trait]
impl Source for FakeSource {
    async fn start(&self) -> anyhow::Result<()> {
        self.calls.log.lock().push(format!("start {}", self.name));
        let failing = self
            .calls
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("{} is unreachable", self.name);
        }
        Ok(())
    }

    fn stop(&self, purge: bool) {
        self.calls
            .log
            .lock()
            .push(format!("stop {} purge={purge}", self.name));
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl Validate for ByName {
    async fn is_valid(&self, cluster: &MigCluster) -> bool {
        !cluster
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
            .starts_with("invalid")
    }
}

impl Calls {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    fn fail_starts(&self, n: usize) {
        self.failures.store(n, Ordering::Release);
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn mk_cluster(name: &str, url: &str) -> MigCluster {
    let mut cluster = MigCluster::new(
        name,
        MigClusterSpec {
            url: Some(url.to_string()),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some("openshift-migration".to_string());
    cluster
}

fn mk_driver(db: Db, calls: Calls) -> Driver<FakeSource, ByName> {
    let container = Container::with_builder(db, Metrics::default(), move |cluster| FakeSource {
        name: cluster.metadata.name.clone().unwrap_or_default(),
        calls: calls.clone(),
    });
    Driver::new(Arc::new(container), ByName)
}

#[tokio::test]
async fn initial_listing_prunes_then_adds() {
    let _tracing = init_tracing();
    let db = Db::in_memory().expect("db");
    let stale = Cluster::with(&mk_cluster("stale", "https://stale")).expect("translate");
    db.insert(&stale).expect("insert");

    let calls = Calls::default();
    let driver = mk_driver(db.clone(), calls.clone());
    let events = stream::iter(vec![
        Event::Init,
        Event::InitApply(mk_cluster("a", "https://a")),
        Event::InitApply(mk_cluster("invalid", "https://x")),
        Event::InitDone,
    ]);
    let container = driver.container.clone();
    driver.run(events).await;

    assert_eq!(calls.take(), vec!["start a"]);
    assert_eq!(
        container.ids(),
        vec![ClusterId::new("openshift-migration", "a")]
    );
    assert!(
        db.get(&Cluster::key("openshift-migration", "stale")).is_err(),
        "stale cluster must be pruned"
    );
}

#[tokio::test]
async fn only_connection_changes_readd() {
    let calls = Calls::default();
    let mut driver = mk_driver(Db::in_memory().expect("db"), calls.clone());
    driver.handle(Event::Init).await;
    driver.handle(Event::InitDone).await;

    driver.handle(Event::Apply(mk_cluster("a", "https://a"))).await;
    let mut relabeled = mk_cluster("a", "https://a");
    relabeled.metadata.labels = Some(Default::default());
    driver.handle(Event::Apply(relabeled)).await;
    assert_eq!(calls.take(), vec!["start a"]);

    driver.handle(Event::Apply(mk_cluster("a", "https://b"))).await;
    assert_eq!(calls.take(), vec!["stop a purge=false", "start a"]);

    driver.handle(Event::Delete(mk_cluster("a", "https://b"))).await;
    assert_eq!(calls.take(), vec!["stop a purge=true"]);
    assert!(driver.container.ids().is_empty());
}

#[tokio::test]
async fn relist_removes_vanished_clusters() {
    let calls = Calls::default();
    let mut driver = mk_driver(Db::in_memory().expect("db"), calls.clone());
    for event in [
        Event::Init,
        Event::InitApply(mk_cluster("a", "https://a")),
        Event::InitApply(mk_cluster("b", "https://b")),
        Event::InitDone,
    ] {
        driver.handle(event).await;
    }
    calls.take();

    for event in [
        Event::Init,
        Event::InitApply(mk_cluster("b", "https://b")),
        Event::InitDone,
    ] {
        driver.handle(event).await;
    }
    assert_eq!(calls.take(), vec!["stop a purge=true"]);
    assert_eq!(
        driver.container.ids(),
        vec![ClusterId::new("openshift-migration", "b")]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_adds_are_retried() {
    let _tracing = init_tracing();
    let calls = Calls::default();
    calls.fail_starts(2);
    let driver = mk_driver(Db::in_memory().expect("db"), calls.clone());
    let container = driver.container.clone();
    let events = stream::iter(vec![
        Event::Init,
        Event::InitApply(mk_cluster("a", "https://a")),
        Event::InitDone,
    ])
    .chain(stream::pending());
    let task = tokio::spawn(driver.run(events));

    tokio::time::sleep(RETRY_DELAY / 2).await;
    assert_eq!(calls.take(), vec!["start a"]);

    tokio::time::sleep(RETRY_DELAY).await;
    assert_eq!(
        calls.take(),
        vec!["stop a purge=false", "start a"],
        "retried after a delay"
    );

    tokio::time::sleep(RETRY_DELAY * 3).await;
    assert_eq!(
        calls.take(),
        vec!["stop a purge=false", "start a"],
        "retried until started"
    );
    assert_eq!(
        container.ids(),
        vec![ClusterId::new("openshift-migration", "a")]
    );
    task.abort();
}

#[tokio::test]
async fn unchanged_clusters_are_readded_after_a_failure() {
    let calls = Calls::default();
    calls.fail_starts(1);
    let mut driver = mk_driver(Db::in_memory().expect("db"), calls.clone());
    for event in [
        Event::Init,
        Event::InitApply(mk_cluster("a", "https://a")),
        Event::InitDone,
    ] {
        driver.handle(event).await;
    }
    assert_eq!(calls.take(), vec!["start a"]);

    driver.handle(Event::Apply(mk_cluster("a", "https://a"))).await;
    assert_eq!(calls.take(), vec!["stop a purge=false", "start a"]);

    driver.handle(Event::Apply(mk_cluster("a", "https://a"))).await;
    assert!(calls.take().is_empty(), "started clusters are not re-added");
}

#[tokio::test]
async fn deleted_clusters_are_not_retried() {
    let calls = Calls::default();
    calls.fail_starts(1);
    let mut driver = mk_driver(Db::in_memory().expect("db"), calls.clone());
    driver.handle(Event::Init).await;
    driver.handle(Event::InitDone).await;
    driver.handle(Event::Apply(mk_cluster("a", "https://a"))).await;
    driver.handle(Event::Delete(mk_cluster("a", "https://a"))).await;
    assert_eq!(calls.take(), vec!["start a", "stop a purge=true"]);

    driver.retry().await;
    assert!(calls.take().is_empty());
}
