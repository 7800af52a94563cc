//! Process-wide runner registry.
//!
//! Inbound registration connections carry nothing but a runner identifier, so
//! this map is the only way to route a raw socket to its runner object. Bricks
//! insert a runner before launching its worker and remove it once the runner
//! has stopped.

use std::sync::Arc;

use brickflow_core::emit;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::id::RunnerId;
use crate::metrics::ActiveRunners;
use crate::runner::BrickRunner;

/// Concurrent map from runner identifier to runner.
///
/// Cloning is cheap and every clone sees the same entries. Shard locks are
/// held only for the duration of a single call.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: Arc<DashMap<RunnerId, Arc<BrickRunner>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `runner` under its identifier.
    ///
    /// Returns `false` and leaves the registry unchanged if the identifier is
    /// already taken.
    pub fn insert(&self, runner: Arc<BrickRunner>) -> bool {
        let inserted = match self.runners.entry(runner.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(runner);
                true
            }
        };
        if inserted {
            emit!(ActiveRunners { count: self.len() });
        }
        inserted
    }

    pub fn remove(&self, id: &str) -> Option<Arc<BrickRunner>> {
        let removed = self.runners.remove(id).map(|(_, runner)| runner);
        if removed.is_some() {
            emit!(ActiveRunners { count: self.len() });
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<BrickRunner>> {
        self.runners.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.runners.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Identifiers of every registered runner, in no particular order.
    pub fn ids(&self) -> Vec<RunnerId> {
        self.runners.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("len", &self.len())
            .finish()
    }
}
