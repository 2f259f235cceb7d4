//! Per-type member index and wait queue
//!
//! TigerStyle: Sorted members, bounded FIFO queue.
//!
//! Not synchronized on its own. The registry holds its lock around every
//! call so that membership and queue changes are atomic with each other.

use crate::entry::{Freed, ObjectEntry};
use crate::error::RegistryError;
use crate::identity::ObjectProxy;
use crate::request::AllocationRequestRef;
use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct TypeEntry {
    type_id: String,
    objects: Vec<ObjectProxy>,
    requests: VecDeque<AllocationRequestRef>,
}

impl TypeEntry {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            objects: Vec::new(),
            requests: VecDeque::new(),
        }
    }

    /// Members, sorted by identity
    pub fn objects(&self) -> &[ObjectProxy] {
        &self.objects
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn add(&mut self, proxy: ObjectProxy) {
        match self
            .objects
            .binary_search_by(|p| p.identity().cmp(proxy.identity()))
        {
            Ok(_) => {
                tracing::error!(
                    type_id = %self.type_id,
                    object = %proxy.identity(),
                    "object already indexed under type"
                );
                debug_assert!(false, "duplicate type member {}", proxy.identity());
            }
            Err(index) => self.objects.insert(index, proxy),
        }
    }

    /// Remove a member. Returns true if the type has no members left.
    pub fn remove(&mut self, proxy: &ObjectProxy) -> bool {
        match self
            .objects
            .binary_search_by(|p| p.identity().cmp(proxy.identity()))
        {
            Ok(index) => {
                self.objects.remove(index);
            }
            Err(_) => {
                tracing::error!(
                    type_id = %self.type_id,
                    object = %proxy.identity(),
                    "object not indexed under type"
                );
                debug_assert!(false, "missing type member {}", proxy.identity());
            }
        }
        self.objects.is_empty()
    }

    /// Park a request until a member is released
    ///
    /// Requests that are no longer pending are dropped. A full queue answers
    /// the request with `RequestQueueFull`.
    pub fn add_allocation_request(&mut self, request: AllocationRequestRef, limit: usize) {
        debug_assert!(limit > 0);
        if !request.pending() {
            return;
        }
        if self.requests.len() >= limit {
            tracing::warn!(type_id = %self.type_id, limit, "type request queue full");
            request.canceled(RegistryError::RequestQueueFull {
                target: self.type_id.clone(),
                limit,
            });
            return;
        }
        self.requests.push_back(request);
    }

    /// Serve queued requests with a member that just became free
    ///
    /// Stops when the queue is empty, the entry is taken, or the entry
    /// cannot be taken (for instance while its parent is held elsewhere).
    /// Entries a refused grant left free are pushed to `freed`.
    pub fn released(&mut self, entry: &ObjectEntry, freed: &mut Freed) {
        while !entry.is_allocated() {
            let Some(request) = self.requests.front().cloned() else {
                break;
            };
            if !entry.try_allocate_in(&request, freed) {
                break;
            }
            self.requests.pop_front();
        }
    }

    /// Remove every queued request
    pub fn take_requests(&mut self) -> VecDeque<AllocationRequestRef> {
        std::mem::take(&mut self.requests)
    }
}
