use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::QueryResult;

/// Version token before the first successful poll. Never equal to a real
/// backend version.
pub const UNINITIALIZED_VERSION: &str = "uninitialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

struct CacheState {
    entries: HashMap<String, Arc<QueryResult>>,
    observed_version: String,
    generation: u64,
}

/// Query results keyed by content hash, flushed as a whole whenever the
/// backend's data version moves.
#[derive(Clone)]
pub struct QueryCache {
    state: Arc<RwLock<CacheState>>,
    max_entries: usize,
    enabled: bool,
}

impl QueryCache {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState {
                entries: HashMap::new(),
                observed_version: UNINITIALIZED_VERSION.to_string(),
                generation: 0,
            })),
            max_entries,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled && self.max_entries > 0
    }

    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<(Arc<QueryResult>, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<QueryResult, E>>,
    {
        if !self.enabled() {
            return Ok((Arc::new(compute().await?), CacheOutcome::Bypass));
        }

        let generation = {
            let state = self.state.read().await;
            if let Some(hit) = state.entries.get(key) {
                return Ok((hit.clone(), CacheOutcome::Hit));
            }
            state.generation
        };

        let computed = Arc::new(compute().await?);

        let mut state = self.state.write().await;
        // An invalidation ran while we were computing; the result may
        // predate the new version.
        if state.generation != generation {
            tracing::debug!(key, "dropping result computed before invalidation");
            return Ok((computed, CacheOutcome::Miss));
        }
        if state.entries.len() >= self.max_entries && !state.entries.contains_key(key) {
            tracing::debug!(max_entries = self.max_entries, "query cache full; not storing");
            return Ok((computed, CacheOutcome::Miss));
        }
        state.entries.insert(key.to_string(), computed.clone());

        Ok((computed, CacheOutcome::Miss))
    }

    /// Records `version` as the current backend data version. Returns true
    /// (after clearing every entry) if it differs from the last one seen.
    pub async fn observe_version(&self, version: &str) -> bool {
        let mut state = self.state.write().await;
        if state.observed_version == version {
            return false;
        }

        state.entries.clear();
        state.generation = state.generation.wrapping_add(1);
        state.observed_version = version.to_string();
        true
    }

    pub async fn observed_version(&self) -> String {
        self.state.read().await.observed_version.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
