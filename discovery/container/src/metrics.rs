use crate::event::Outcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct Metrics {
    applied: Family<EventLabels, Counter>,
    stale: Family<EventLabels, Counter>,
    failed: Family<EventLabels, Counter>,
    datasources: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    cluster: String,
    kind: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let applied = Family::default();
        prom.register(
            "events_applied",
            "Count of model events written to the store",
            applied.clone(),
        );

        let stale = Family::default();
        prom.register(
            "events_stale",
            "Count of model events skipped because the initial reconciliation already covered them",
            stale.clone(),
        );

        let failed = Family::default();
        prom.register(
            "events_failed",
            "Count of model events that could not be written",
            failed.clone(),
        );

        let datasources = Gauge::default();
        prom.register(
            "datasources",
            "Gauge of the number of clusters being mirrored",
            datasources.clone(),
        );

        Self {
            applied,
            stale,
            failed,
            datasources,
        }
    }

    pub(crate) fn event(&self, cluster: &str, kind: &str, outcome: Option<Outcome>) {
        let labels = EventLabels {
            cluster: cluster.to_string(),
            kind: kind.to_string(),
        };
        let family = match outcome {
            Some(Outcome::Applied) => &self.applied,
            Some(Outcome::Stale) => &self.stale,
            None => &self.failed,
        };
        family.get_or_create(&labels).inc();
    }

    pub(crate) fn set_datasources(&self, n: usize) {
        self.datasources.set(n as i64);
    }
}

impl Default for Metrics {
    /// Metrics that are not exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
