//! Object registry
//!
//! TigerStyle: One registry-wide lock, taken before any entry lock.
//!
//! `ObjectCache` maps identities to entries and type names to their
//! `TypeEntry`. Allocation by type shuffles the candidates (optionally
//! stable-sorted by node load afterwards), tries each in turn and parks the
//! request on the type queue when every candidate is busy.

use crate::allocation::AllocatableRef;
use crate::entry::{Freed, ObjectEntry};
use crate::error::{RegistryError, RegistryResult};
use crate::identity::{Identity, ObjectInfo};
use crate::load::{LoadCache, LoadSample};
use crate::request::AllocationRequestRef;
use crate::type_entry::TypeEntry;
use globset::Glob;
use parking_lot::Mutex;
use skerry_core::constants::OBJECT_LOAD_DEFAULT;
use skerry_core::io::{shuffle, DeterministicRng, RngProvider, StdRngProvider};
use skerry_core::RegistryConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<Identity, Arc<ObjectEntry>>,
    types: HashMap<String, TypeEntry>,
}

impl CacheState {
    /// Allocatable members of a type, in identity order
    fn candidates(&self, type_id: &str) -> Option<Vec<Arc<ObjectEntry>>> {
        let type_entry = self.types.get(type_id)?;
        let mut candidates = Vec::with_capacity(type_entry.objects().len());
        for proxy in type_entry.objects() {
            match self.entries.get(proxy.identity()) {
                Some(entry) if entry.allocatable() => candidates.push(entry.clone()),
                Some(_) => {}
                None => {
                    tracing::error!(
                        type_id,
                        object = %proxy.identity(),
                        "type member missing from registry"
                    );
                    debug_assert!(false, "type member {} not registered", proxy.identity());
                }
            }
        }
        if candidates.is_empty() {
            None
        } else {
            Some(candidates)
        }
    }
}

/// Registry of published objects
pub struct ObjectCache {
    config: RegistryConfig,
    load_cache: Arc<dyn LoadCache>,
    rng: Arc<dyn RngProvider>,
    state: Mutex<CacheState>,
}

impl ObjectCache {
    /// Create a registry with the default configuration
    pub fn new(load_cache: Arc<dyn LoadCache>) -> Arc<Self> {
        Self::build(
            RegistryConfig::default(),
            load_cache,
            Arc::new(StdRngProvider::new()),
        )
    }

    /// Create a registry from a validated configuration
    ///
    /// A configured seed makes candidate shuffling reproducible.
    pub fn with_config(
        config: RegistryConfig,
        load_cache: Arc<dyn LoadCache>,
    ) -> RegistryResult<Arc<Self>> {
        config.validate()?;
        let rng: Arc<dyn RngProvider> = match config.rng_seed {
            Some(seed) => Arc::new(DeterministicRng::new(seed)),
            None => Arc::new(StdRngProvider::new()),
        };
        Ok(Self::build(config, load_cache, rng))
    }

    /// Create a registry with an injected random source
    pub fn with_providers(
        config: RegistryConfig,
        load_cache: Arc<dyn LoadCache>,
        rng: Arc<dyn RngProvider>,
    ) -> RegistryResult<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(config, load_cache, rng))
    }

    fn build(
        config: RegistryConfig,
        load_cache: Arc<dyn LoadCache>,
        rng: Arc<dyn RngProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            load_cache,
            rng,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of registered objects
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Whether any object of the type is registered
    pub fn has_type(&self, type_id: &str) -> bool {
        self.state.lock().types.contains_key(type_id)
    }

    /// Requests waiting for any object of the type
    pub fn pending_requests(&self, type_id: &str) -> usize {
        self.state
            .lock()
            .types
            .get(type_id)
            .map_or(0, TypeEntry::pending_requests)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Register an object
    ///
    /// The identity must not be registered already.
    pub fn add(
        self: &Arc<Self>,
        info: ObjectInfo,
        application: impl Into<String>,
        allocatable: bool,
        parent: Option<AllocatableRef>,
    ) -> Arc<ObjectEntry> {
        let identity = info.identity().clone();
        let type_id = info.type_id.clone();
        let proxy = info.proxy.clone();
        let application = application.into();

        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&identity) {
            tracing::error!(object = %identity, "object already registered");
            debug_assert!(false, "duplicate identity {}", identity);
            return existing.clone();
        }

        let entry = ObjectEntry::new(
            Arc::downgrade(self),
            info,
            application,
            allocatable,
            parent,
            &self.config,
        );
        state.entries.insert(identity.clone(), entry.clone());
        state
            .types
            .entry(type_id.clone())
            .or_insert_with(|| TypeEntry::new(type_id.clone()))
            .add(proxy);

        if self.config.traces_lifecycle() {
            tracing::info!(
                object = %identity,
                type_id = %type_id,
                application = entry.application(),
                allocatable,
                "added object"
            );
        }
        entry
    }

    /// Unregister an object
    ///
    /// Requests waiting for this object are canceled; requests waiting for
    /// its type are answered with no object if it was the last member.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<ObjectEntry>> {
        let (entry, orphaned) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.remove(identity) else {
                tracing::error!(object = %identity, "removing unregistered object");
                debug_assert!(false, "unknown identity {}", identity);
                return None;
            };

            let empty = match state.types.get_mut(entry.type_id()) {
                Some(type_entry) => type_entry.remove(entry.proxy(None)),
                None => {
                    tracing::error!(
                        object = %identity,
                        type_id = entry.type_id(),
                        "object type not indexed"
                    );
                    debug_assert!(false, "type {} not indexed", entry.type_id());
                    false
                }
            };
            let orphaned = if empty {
                state
                    .types
                    .remove(entry.type_id())
                    .map(|mut t| t.take_requests())
                    .unwrap_or_default()
            } else {
                Default::default()
            };
            (entry, orphaned)
        };

        entry.cancel_requests(RegistryError::object_not_registered(identity));
        for request in orphaned {
            request.response(None);
        }

        if self.config.traces_lifecycle() {
            tracing::info!(object = %identity, type_id = entry.type_id(), "removed object");
        }
        Some(entry)
    }

    pub fn get(&self, identity: &Identity) -> RegistryResult<Arc<ObjectEntry>> {
        self.state
            .lock()
            .entries
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::object_not_registered(identity))
    }

    /// Descriptors whose identity matches a glob filter, or all if empty
    pub fn get_all(&self, filter: &str) -> RegistryResult<Vec<ObjectInfo>> {
        let matcher = if filter.is_empty() {
            None
        } else {
            let glob = Glob::new(filter).map_err(|e| RegistryError::InvalidFilter {
                pattern: filter.to_string(),
                reason: e.to_string(),
            })?;
            Some(glob.compile_matcher())
        };

        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .filter(|(identity, _)| {
                matcher
                    .as_ref()
                    .map_or(true, |m| m.is_match(identity.to_string()))
            })
            .map(|(_, entry)| entry.info().clone())
            .collect())
    }

    /// Every descriptor of the type, in identity order
    pub fn get_all_by_type(&self, type_id: &str) -> Vec<ObjectInfo> {
        self.infos_by_type(type_id, |_| true)
    }

    /// Non-allocatable descriptors of the type, in identity order
    pub fn get_objects_by_type(&self, type_id: &str) -> Vec<ObjectInfo> {
        self.infos_by_type(type_id, |entry| !entry.allocatable())
    }

    fn infos_by_type(&self, type_id: &str, keep: impl Fn(&ObjectEntry) -> bool) -> Vec<ObjectInfo> {
        let state = self.state.lock();
        let Some(type_entry) = state.types.get(type_id) else {
            return Vec::new();
        };
        type_entry
            .objects()
            .iter()
            .filter_map(|proxy| state.entries.get(proxy.identity()))
            .filter(|entry| keep(entry))
            .map(|entry| entry.info().clone())
            .collect()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate one specific object
    ///
    /// A busy object keeps the request until it is released. The request
    /// is parked under the registry lock, so a concurrent `remove` either
    /// cancels it or is seen first.
    pub fn allocate(&self, identity: &Identity, request: AllocationRequestRef) {
        let mut freed = Freed::default();
        {
            let state = self.state.lock();
            match state.entries.get(identity) {
                Some(entry) => entry.allocate(&request, &mut freed),
                None => request.canceled(RegistryError::object_not_registered(identity)),
            }
        }
        freed.notify();
    }

    /// Allocate any free object of the type
    pub fn allocate_by_type(&self, type_id: &str, request: AllocationRequestRef) {
        let mut state = self.state.lock();
        let Some(mut candidates) = state.candidates(type_id) else {
            drop(state);
            request.response(None);
            return;
        };

        shuffle(self.rng.as_ref(), &mut candidates);
        let mut freed = Freed::default();
        self.try_candidates(&mut state, type_id, candidates.iter(), request, &mut freed);
        drop(state);
        freed.notify();
    }

    /// Allocate the free object of the type whose node is least loaded
    pub fn allocate_by_type_on_least_loaded_node(
        &self,
        type_id: &str,
        request: AllocationRequestRef,
        sample: LoadSample,
    ) {
        let mut state = self.state.lock();
        let Some(mut candidates) = state.candidates(type_id) else {
            drop(state);
            request.response(None);
            return;
        };

        // Shuffle first so equal loads are tried in random order
        shuffle(self.rng.as_ref(), &mut candidates);
        let mut scored: Vec<(Arc<ObjectEntry>, f32)> = candidates
            .into_iter()
            .map(|entry| {
                let load = self.object_load(&entry, sample);
                (entry, load)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut freed = Freed::default();
        self.try_candidates(
            &mut state,
            type_id,
            scored.iter().map(|(entry, _)| entry),
            request,
            &mut freed,
        );
        drop(state);
        freed.notify();
    }

    fn object_load(&self, entry: &ObjectEntry, sample: LoadSample) -> f32 {
        let Some(adapter_id) = entry.proxy(None).adapter_id() else {
            return OBJECT_LOAD_DEFAULT;
        };
        match self.load_cache.least_loaded_node_load(adapter_id, sample) {
            Ok(load) => load,
            Err(RegistryError::AdapterNotFound { .. }) => {
                tracing::debug!(adapter_id, object = %entry.identity(), "adapter gone while scoring");
                OBJECT_LOAD_DEFAULT
            }
            Err(e) => {
                tracing::warn!(adapter_id, error = %e, "load lookup failed");
                OBJECT_LOAD_DEFAULT
            }
        }
    }

    fn try_candidates<'a>(
        &self,
        state: &mut CacheState,
        type_id: &str,
        candidates: impl Iterator<Item = &'a Arc<ObjectEntry>>,
        request: AllocationRequestRef,
        freed: &mut Freed,
    ) {
        for entry in candidates {
            // True means bound or resolved some other way; stop either way
            if entry.try_allocate_in(&request, freed) {
                return;
            }
        }

        match state.types.get_mut(type_id) {
            Some(type_entry) => {
                type_entry.add_allocation_request(request, self.config.type_requests_count_max)
            }
            None => request.response(None),
        }
    }

    /// An entry became free: serve requests waiting on its type
    pub fn released(&self, entry: &ObjectEntry) {
        let mut freed = Freed::default();
        {
            let mut state = self.state.lock();
            let registered = state
                .entries
                .get(entry.identity())
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), entry));
            if !registered {
                return;
            }
            if let Some(type_entry) = state.types.get_mut(entry.type_id()) {
                type_entry.released(entry, &mut freed);
            }
        }
        freed.notify();
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectCache")
            .field("objects", &state.entries.len())
            .field("types", &state.types.len())
            .finish()
    }
}
