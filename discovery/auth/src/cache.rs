use ahash::AHashMap as HashMap;
use mig_discovery_k8s_api::TokenReviewStatus;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// Remembers token reviews for a fixed time.
///
/// Entries are keyed by cluster and bearer token, since a token is only meaningful to the cluster
/// that issued it. An entry is returned until `ttl` has elapsed since it was added; expired entries
/// are purged on access. When full, adding a token evicts the oldest entry.
#[derive(Debug)]
pub struct TokenCache {
    entries: Mutex<HashMap<Key, Entry>>,
    ttl: Duration,
    capacity: usize,
}

type Key = (String, String);

#[derive(Debug)]
struct Entry {
    created: Instant,
    status: TokenReviewStatus,
}

// === impl TokenCache ===

impl TokenCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Default::default(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, cluster: &str, token: &str) -> Option<TokenReviewStatus> {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries
            .get(&(cluster.to_string(), token.to_string()))
            .map(|e| e.status.clone())
    }

    pub fn insert(&self, cluster: &str, token: &str, status: TokenReviewStatus) {
        let key = (cluster.to_string(), token.to_string());
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            Entry {
                created: Instant::now(),
                status,
            },
        );
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, entries: &mut HashMap<Key, Entry>) {
        let ttl = self.ttl;
        entries.retain(|_, e| e.created.elapsed() < ttl);
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_CAPACITY)
    }
}
