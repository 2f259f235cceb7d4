//! Registered object entries
//!
//! TigerStyle: Registry notifications only after the allocation lock is
//! dropped.

use crate::allocation::{Acquire, Allocatable, AllocatableRef, Allocation};
use crate::cache::ObjectCache;
use crate::error::{RegistryError, RegistryResult};
use crate::identity::{Identity, ObjectInfo, ObjectProxy};
use crate::request::AllocationRequestRef;
use crate::session::SessionRef;
use skerry_core::RegistryConfig;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

/// Entries that lost their owner while the registry lock may be held
///
/// Announced by [`Freed::notify`] once the caller holds no lock.
#[derive(Default)]
pub(crate) struct Freed(Vec<Arc<ObjectEntry>>);

impl Freed {
    fn push(&mut self, allocatable: AllocatableRef) {
        if let Some(entry) = allocatable.as_object_entry() {
            self.0.push(entry);
        }
    }

    pub(crate) fn notify(self) {
        for entry in self.0 {
            entry.notify_released();
        }
    }
}

/// One published object and its allocation state
pub struct ObjectEntry {
    cache: Weak<ObjectCache>,
    me: Weak<ObjectEntry>,
    info: ObjectInfo,
    application: String,
    allocation: Allocation,
    trace_allocation: bool,
    requests_count_max: usize,
}

impl ObjectEntry {
    pub(crate) fn new(
        cache: Weak<ObjectCache>,
        info: ObjectInfo,
        application: String,
        allocatable: bool,
        parent: Option<AllocatableRef>,
        config: &RegistryConfig,
    ) -> Arc<Self> {
        let trace_allocation = config.traces_allocation();
        let requests_count_max = config.object_requests_count_max;
        let entry = Arc::new_cyclic(|me| Self {
            cache,
            me: me.clone(),
            info,
            application,
            allocation: Allocation::new(allocatable, parent),
            trace_allocation,
            requests_count_max,
        });

        if let Some(parent) = entry.allocation.parent() {
            let me: AllocatableRef = entry.clone();
            parent.allocation().declare_child(&me);
        }
        entry
    }

    /// Reference handed out for this object
    ///
    /// The session is accepted for session-scoped visibility, which is not
    /// enforced: every caller sees the object.
    pub fn proxy(&self, _session: Option<&SessionRef>) -> &ObjectProxy {
        &self.info.proxy
    }

    pub fn identity(&self) -> &Identity {
        self.info.identity()
    }

    pub fn type_id(&self) -> &str {
        &self.info.type_id
    }

    /// Application that published the object
    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Removal is never blocked by an outstanding allocation
    pub fn can_remove(&self) -> bool {
        true
    }

    pub fn allocatable(&self) -> bool {
        self.allocation.is_allocatable()
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.is_allocated()
    }

    /// Session currently holding the object
    pub fn session(&self) -> Option<SessionRef> {
        self.allocation.session()
    }

    /// Requests waiting for this specific object
    pub fn pending_requests(&self) -> usize {
        self.allocation.pending_requests()
    }

    /// Try to bind the request to this object
    ///
    /// Returns true when the request is resolved: bound, canceled or
    /// rejected. Returns false if the object is busy and the request is
    /// still open.
    pub fn try_allocate(&self, request: &AllocationRequestRef) -> bool {
        let mut freed = Freed::default();
        let resolved = self.try_allocate_in(request, &mut freed);
        freed.notify();
        resolved
    }

    /// [`Self::try_allocate`] for callers holding the registry lock
    pub(crate) fn try_allocate_in(
        &self,
        request: &AllocationRequestRef,
        freed: &mut Freed,
    ) -> bool {
        self.allocate_with(request, None, freed)
    }

    /// Allocate this object, waiting on its queue if it is busy
    ///
    /// Entries a refused grant left free are pushed to `freed`.
    pub(crate) fn allocate(&self, request: &AllocationRequestRef, freed: &mut Freed) {
        if !self.allocatable() {
            request.canceled(RegistryError::NotAllocatable {
                identity: self.identity().to_string(),
            });
            return;
        }
        let resolved = self.allocate_with(request, Some(self.requests_count_max), freed);
        debug_assert!(resolved);
    }

    fn allocate_with(
        &self,
        request: &AllocationRequestRef,
        queue_limit: Option<usize>,
        freed: &mut Freed,
    ) -> bool {
        if !request.pending() {
            return true;
        }
        if !self.allocatable() {
            request.canceled(RegistryError::NotAllocatable {
                identity: self.identity().to_string(),
            });
            return true;
        }
        let Some(me) = self.as_allocatable() else {
            request.canceled(RegistryError::object_not_registered(self.identity()));
            return true;
        };

        let session = request.session().clone();
        match self.allocation.acquire(&me, request, queue_limit) {
            Acquire::Busy => false,
            Acquire::Queued | Acquire::Resolved => true,
            Acquire::QueueFull(limit) => {
                tracing::warn!(object = %self.identity(), limit, "object request queue full");
                request.canceled(RegistryError::RequestQueueFull {
                    target: self.identity().to_string(),
                    limit,
                });
                true
            }
            Acquire::Closed => {
                request.canceled(RegistryError::object_not_registered(self.identity()));
                true
            }
            Acquire::Acquired { first } => {
                if first && !self.allocated(&session) {
                    // Waiters may have queued on this object or its ancestors meanwhile
                    for ancestor in self.allocation.rollback(&me, &session) {
                        freed.push(ancestor);
                    }
                    if !self.allocation.is_allocated() {
                        freed.push(me);
                    }
                    request.canceled(RegistryError::session_destroyed(session.user_id()));
                    return true;
                }
                request.response(Some(self.info.clone()));
                true
            }
        }
    }

    /// Release the object and notify the registry of everything freed
    fn release_and_notify(&self, session: &SessionRef) -> RegistryResult<bool> {
        let me = self
            .as_allocatable()
            .ok_or_else(|| RegistryError::object_not_registered(self.identity()))?;
        let outcome = self.allocation.release(&me, session, true)?;

        if outcome.freed {
            self.notify_released();
        }
        for dependent in outcome.cascaded {
            if let Some(entry) = dependent.as_object_entry() {
                entry.notify_released();
            }
        }
        Ok(outcome.released)
    }

    /// Serve this object's waiters, then those of free declared
    /// descendants that were turned away while this object was held
    fn notify_released(&self) {
        self.serve_waiters();
        if self.is_allocated() {
            return;
        }

        let mut pending: VecDeque<AllocatableRef> = self.allocation.declared_children().into();
        while let Some(child) = pending.pop_front() {
            if child.allocation().is_allocated() {
                continue;
            }
            pending.extend(child.allocation().declared_children());
            if let Some(entry) = child.as_object_entry() {
                entry.serve_waiters();
            }
        }
    }

    /// Serve this object's own waiters, then the type's waiters
    fn serve_waiters(&self) {
        self.drain_requests();
        if let Some(cache) = self.cache.upgrade() {
            cache.released(self);
        }
    }

    fn drain_requests(&self) {
        while let Some(request) = self.allocation.next_request() {
            if !self.try_allocate(&request) {
                if let Some(request) = self.allocation.requeue_front(request) {
                    request.canceled(RegistryError::object_not_registered(self.identity()));
                }
                break;
            }
        }
    }

    /// Answer every request waiting on this object and refuse new ones
    pub(crate) fn cancel_requests(&self, reason: RegistryError) {
        for request in self.allocation.close() {
            request.canceled(reason.clone());
        }
    }

    fn as_allocatable(&self) -> Option<AllocatableRef> {
        let me: AllocatableRef = self.me.upgrade()?;
        Some(me)
    }
}

impl Allocatable for ObjectEntry {
    fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    fn describe(&self) -> String {
        format!("object `{}`", self.identity())
    }

    fn allocated(&self, session: &SessionRef) -> bool {
        let Some(me) = self.as_allocatable() else {
            return false;
        };
        if !session.add_allocation(me) {
            return false;
        }
        if self.trace_allocation {
            tracing::info!(
                object = %self.identity(),
                user = session.user_id(),
                count = self.allocation.count(),
                "object allocated"
            );
        }
        true
    }

    fn released(&self, session: &SessionRef) {
        if let Some(me) = self.as_allocatable() {
            session.remove_allocation(&me);
        }
        if self.trace_allocation {
            tracing::info!(
                object = %self.identity(),
                user = session.user_id(),
                "object released"
            );
        }
    }

    fn release(&self, session: &SessionRef) -> RegistryResult<bool> {
        self.release_and_notify(session)
    }

    fn as_object_entry(self: Arc<Self>) -> Option<Arc<ObjectEntry>> {
        Some(self)
    }
}

impl fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("identity", &self.identity().to_string())
            .field("type_id", &self.info.type_id)
            .field("application", &self.application)
            .field("allocation", &self.allocation)
            .finish()
    }
}
