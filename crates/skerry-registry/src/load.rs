//! Node load reporting
//!
//! TigerStyle: Explicit sample windows, unreachable nodes score high.
//!
//! The registry only needs one question answered: how loaded is the least
//! loaded node serving an adapter. `MemoryLoadCache` answers it from the
//! last load reported by each node.

use crate::error::{RegistryError, RegistryResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use skerry_core::constants::{ADAPTER_ID_LENGTH_BYTES_MAX, NODE_LOAD_UNREACHABLE};
use std::collections::{BTreeSet, HashMap};

/// Load average window used to score a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoadSample {
    /// One-minute average
    #[default]
    One,
    /// Five-minute average
    Five,
    /// Fifteen-minute average
    Fifteen,
}

/// Load averages reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadInfo {
    pub avg1: f32,
    pub avg5: f32,
    pub avg15: f32,
}

impl LoadInfo {
    pub fn new(avg1: f32, avg5: f32, avg15: f32) -> Self {
        debug_assert!(avg1 >= 0.0 && avg5 >= 0.0 && avg15 >= 0.0);
        Self { avg1, avg5, avg15 }
    }

    /// Same load across every window
    pub fn flat(load: f32) -> Self {
        Self::new(load, load, load)
    }

    pub fn sample(&self, sample: LoadSample) -> f32 {
        match sample {
            LoadSample::One => self.avg1,
            LoadSample::Five => self.avg5,
            LoadSample::Fifteen => self.avg15,
        }
    }
}

/// Source of per-adapter load scores
pub trait LoadCache: Send + Sync {
    /// Load of the least loaded node serving the adapter
    ///
    /// Fails with `AdapterNotFound` if the adapter is unknown.
    fn least_loaded_node_load(&self, adapter_id: &str, sample: LoadSample) -> RegistryResult<f32>;
}

#[derive(Debug, Default)]
struct LoadState {
    adapters: HashMap<String, BTreeSet<String>>,
    nodes: HashMap<String, LoadInfo>,
}

/// In-memory load cache fed by node load reports
#[derive(Debug, Default)]
pub struct MemoryLoadCache {
    state: RwLock<LoadState>,
}

impl MemoryLoadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` hosts a replica of the adapter
    pub fn register_adapter(&self, adapter_id: impl Into<String>, node_id: impl Into<String>) {
        let adapter_id = adapter_id.into();
        assert!(!adapter_id.is_empty(), "adapter id cannot be empty");
        assert!(adapter_id.len() <= ADAPTER_ID_LENGTH_BYTES_MAX);

        let mut state = self.state.write();
        state
            .adapters
            .entry(adapter_id)
            .or_default()
            .insert(node_id.into());
    }

    /// Forget an adapter. Returns true if it was known.
    pub fn unregister_adapter(&self, adapter_id: &str) -> bool {
        self.state.write().adapters.remove(adapter_id).is_some()
    }

    /// Store the latest load reported by a node
    pub fn update_node_load(&self, node_id: impl Into<String>, load: LoadInfo) {
        self.state.write().nodes.insert(node_id.into(), load);
    }

    /// Forget a node's load; its adapters now score as unreachable
    pub fn remove_node(&self, node_id: &str) -> bool {
        self.state.write().nodes.remove(node_id).is_some()
    }
}

impl LoadCache for MemoryLoadCache {
    fn least_loaded_node_load(&self, adapter_id: &str, sample: LoadSample) -> RegistryResult<f32> {
        let state = self.state.read();
        let nodes = state
            .adapters
            .get(adapter_id)
            .ok_or_else(|| RegistryError::adapter_not_found(adapter_id))?;

        let load = nodes
            .iter()
            .map(|node| {
                state
                    .nodes
                    .get(node)
                    .map_or(NODE_LOAD_UNREACHABLE, |info| info.sample(sample))
            })
            .fold(NODE_LOAD_UNREACHABLE, f32::min);
        Ok(load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_info_sample() {
        let info = LoadInfo::new(0.5, 1.5, 2.5);
        assert_eq!(info.sample(LoadSample::One), 0.5);
        assert_eq!(info.sample(LoadSample::Five), 1.5);
        assert_eq!(info.sample(LoadSample::Fifteen), 2.5);
    }

    #[test]
    fn test_unknown_adapter() {
        let cache = MemoryLoadCache::new();
        let err = cache
            .least_loaded_node_load("Missing", LoadSample::One)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AdapterNotFound { .. }));
    }

    #[test]
    fn test_least_loaded_replica() {
        let cache = MemoryLoadCache::new();
        cache.register_adapter("Pool", "node-1");
        cache.register_adapter("Pool", "node-2");
        cache.update_node_load("node-1", LoadInfo::new(3.0, 0.2, 1.0));
        cache.update_node_load("node-2", LoadInfo::new(1.0, 0.8, 1.0));

        assert_eq!(cache.least_loaded_node_load("Pool", LoadSample::One).unwrap(), 1.0);
        assert_eq!(cache.least_loaded_node_load("Pool", LoadSample::Five).unwrap(), 0.2);
    }

    #[test]
    fn test_unreported_node_is_unreachable() {
        let cache = MemoryLoadCache::new();
        cache.register_adapter("Pool", "node-1");
        assert_eq!(
            cache.least_loaded_node_load("Pool", LoadSample::One).unwrap(),
            NODE_LOAD_UNREACHABLE
        );

        cache.update_node_load("node-1", LoadInfo::flat(0.4));
        assert!(cache.remove_node("node-1"));
        assert_eq!(
            cache.least_loaded_node_load("Pool", LoadSample::One).unwrap(),
            NODE_LOAD_UNREACHABLE
        );
    }

    #[test]
    fn test_unregister_adapter() {
        let cache = MemoryLoadCache::new();
        cache.register_adapter("Pool", "node-1");
        assert!(cache.unregister_adapter("Pool"));
        assert!(!cache.unregister_adapter("Pool"));
        assert!(cache.least_loaded_node_load("Pool", LoadSample::One).is_err());
    }
}
