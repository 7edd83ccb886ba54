use crate::event::ModelEvent;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use mig_discovery_k8s_api::Event;
use mig_discovery_store::model::{FromObject, Resource, TranslateError};
use tracing::info;

/// Translates one watch's events into model events.
///
/// Watches report `Apply` for both new and changed objects and periodically relist. The tracker
/// remembers the keys it has seen so that applies of unseen keys become creates, applies of seen
/// keys become updates, and keys that disappear across a relist become deletes.
pub(crate) struct Tracker<O> {
    cluster: String,
    translate: fn(&str, &O) -> Result<Resource, TranslateError>,
    /// Identity-only rows by primary key.
    known: HashMap<String, Resource>,
    relisted: Option<HashSet<String>>,
}

// === impl Tracker ===

impl<O> Tracker<O> {
    pub(crate) fn new<M>(cluster: impl Into<String>) -> Self
    where
        M: FromObject<O> + Into<Resource>,
    {
        Self {
            cluster: cluster.into(),
            translate: translate::<O, M>,
            known: HashMap::new(),
            relisted: None,
        }
    }

    /// Seeds the tracker with rows that are already stored, so that rows removed before the first
    /// relist completes are deleted.
    pub(crate) fn with_known(mut self, known: impl IntoIterator<Item = Resource>) -> Self {
        self.known
            .extend(known.into_iter().map(|r| (r.pk(), r.to_key())));
        self
    }

    pub(crate) fn handle(&mut self, event: Event<O>) -> Vec<ModelEvent> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }

            Event::InitApply(object) => {
                let Some(resource) = self.translate(&object) else {
                    return Vec::new();
                };
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(resource.pk());
                }
                vec![self.apply(resource)]
            }

            Event::Apply(object) => match self.translate(&object) {
                Some(resource) => vec![self.apply(resource)],
                None => Vec::new(),
            },

            Event::Delete(object) => match self.translate(&object) {
                Some(resource) => {
                    self.known.remove(&resource.pk());
                    vec![ModelEvent::delete(resource)]
                }
                None => Vec::new(),
            },

            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone = self
                    .known
                    .keys()
                    .filter(|pk| !relisted.contains(*pk))
                    .cloned()
                    .collect::<Vec<_>>();
                gone.into_iter()
                    .filter_map(|pk| self.known.remove(&pk))
                    .map(ModelEvent::delete)
                    .collect()
            }
        }
    }

    fn apply(&mut self, resource: Resource) -> ModelEvent {
        match self.known.insert(resource.pk(), resource.to_key()) {
            Some(_) => ModelEvent::update(resource),
            None => ModelEvent::create(resource),
        }
    }

    fn translate(&self, object: &O) -> Option<Resource> {
        match (self.translate)(&self.cluster, object) {
            Ok(resource) => Some(resource),
            Err(error) => {
                info!(%error, "Dropping untranslatable object");
                None
            }
        }
    }
}

fn translate<O, M>(cluster: &str, object: &O) -> Result<Resource, TranslateError>
where
    M: FromObject<O> + Into<Resource>,
{
    M::from_object(cluster, object).map(Into::into)
}
