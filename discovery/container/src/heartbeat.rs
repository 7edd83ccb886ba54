use mig_discovery_k8s_api::{watcher, Api, Client, Node, Watch};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};
use tracing::{debug, info_span, Instrument};

/// Tracks whether a cluster's watches are still delivering events.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    last: Arc<Mutex<Option<Instant>>>,
    threshold: Duration,
}

// === impl Heartbeat ===

impl Heartbeat {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last: Default::default(),
            threshold,
        }
    }

    pub fn beat(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    /// True when a heartbeat was observed within the threshold.
    pub fn is_healthy(&self) -> bool {
        match *self.last.lock() {
            Some(last) => last.elapsed() <= self.threshold,
            None => false,
        }
    }

    /// Records a heartbeat for every `Node` event until `stop` fires.
    pub(crate) fn watch_nodes(
        &self,
        client: Client,
        cluster: &str,
        mut stop: watch::Receiver<bool>,
    ) {
        let span = info_span!("heartbeat", %cluster);
        let mut nodes = Watch::from(watcher(
            Api::<Node>::all(client),
            watcher::Config::default(),
        ))
        .instrument(span.clone());
        let heartbeat = self.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        ev = nodes.recv() => match ev {
                            Some(_) => heartbeat.beat(),
                            None => break,
                        },
                    }
                }
                debug!("Stopped");
            }
            .instrument(span),
        );
    }
}
