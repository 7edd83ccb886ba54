use mig_discovery_store::{model::Resource, Db, Error, Result, Table};

/// A change observed on a remote cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// A row to be written, paired with the action that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelEvent {
    pub action: Action,
    pub resource: Resource,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The event's version is not newer than the threshold.
    Stale,
}

// === impl Action ===

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

// === impl ModelEvent ===

impl ModelEvent {
    pub fn create(resource: impl Into<Resource>) -> Self {
        Self {
            action: Action::Create,
            resource: resource.into(),
        }
    }

    pub fn update(resource: impl Into<Resource>) -> Self {
        Self {
            action: Action::Update,
            resource: resource.into(),
        }
    }

    pub fn delete(resource: impl Into<Resource>) -> Self {
        Self {
            action: Action::Delete,
            resource: resource.into(),
        }
    }

    /// Writes the event in its own transaction.
    ///
    /// Creates and updates carrying a version at or below `threshold` are already reflected by the
    /// initial reconciliation and are skipped. Deletes are always applied.
    ///
    /// Creates and updates are both applied as an upsert: a create for a row that exists updates
    /// it, and an update for a missing row inserts it.
    pub fn apply(&self, db: &Db, threshold: u64) -> Result<Outcome> {
        match self.action {
            Action::Create | Action::Update => {
                if self.resource.version() <= threshold {
                    return Ok(Outcome::Stale);
                }
                db.transaction(|t| upsert(t, &self.resource))?;
            }
            Action::Delete => db.transaction(|t| self.resource.delete(t))?,
        }
        Ok(Outcome::Applied)
    }
}

fn upsert(table: &Table<'_>, resource: &Resource) -> Result<()> {
    match resource.update(table) {
        Err(Error::NotFound) => resource.insert(table),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mig_discovery_store::{
        model::{Cluster, Pod},
        ListOptions, Model,
    };

    fn mk_db() -> (Db, String) {
        let db = Db::in_memory().expect("database must open");
        let cluster = Cluster::key("openshift-migration", "c1");
        db.insert(&cluster).expect("cluster must insert");
        (db, cluster.pk())
    }

    fn mk_pod(cluster: &str, name: &str, version: u64) -> Pod {
        let mut pod = Pod::key(cluster, "ns", name);
        pod.base.version = version;
        pod.base.object = "{}".to_string();
        pod
    }

    fn count(db: &Db) -> u64 {
        db.count::<Pod>(&ListOptions::default()).expect("count")
    }

    #[test]
    fn stale_creates_and_updates_are_skipped() {
        let (db, cluster) = mk_db();
        let threshold = 10;

        let ev = ModelEvent::create(mk_pod(&cluster, "a", 10));
        assert_eq!(ev.apply(&db, threshold).expect("apply"), Outcome::Stale);
        let ev = ModelEvent::update(mk_pod(&cluster, "a", 3));
        assert_eq!(ev.apply(&db, threshold).expect("apply"), Outcome::Stale);
        assert_eq!(count(&db), 0);

        let ev = ModelEvent::create(mk_pod(&cluster, "a", 11));
        assert_eq!(ev.apply(&db, threshold).expect("apply"), Outcome::Applied);
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn deletes_ignore_threshold() {
        let (db, cluster) = mk_db();
        db.insert(&mk_pod(&cluster, "a", 5)).expect("insert");

        let ev = ModelEvent::delete(mk_pod(&cluster, "a", 1));
        assert_eq!(ev.apply(&db, 100).expect("apply"), Outcome::Applied);
        assert_eq!(count(&db), 0);

        // Deleting again is harmless.
        assert_eq!(ev.apply(&db, 100).expect("apply"), Outcome::Applied);
    }

    #[test]
    fn creates_and_updates_upsert() {
        let (db, cluster) = mk_db();

        ModelEvent::update(mk_pod(&cluster, "a", 2))
            .apply(&db, 0)
            .expect("update of a missing row inserts");
        ModelEvent::create(mk_pod(&cluster, "a", 3))
            .apply(&db, 0)
            .expect("create of an existing row updates");

        let got = db.get(&Pod::key(&*cluster, "ns", "a")).expect("get");
        assert_eq!(got.base.version, 3);
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn failures_surface() {
        let db = Db::in_memory().expect("database must open");
        let ev = ModelEvent::create(mk_pod("no-such-cluster", "a", 1));
        assert!(ev.apply(&db, 0).is_err());
    }
}
