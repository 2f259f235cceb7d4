//! Exclusive, re-entrant allocation
//!
//! TigerStyle: Explicit ownership state, bounded hierarchy, no lock held
//! across hooks.
//!
//! An allocatable is owned by at most one session at a time. The owning
//! session may allocate it again, which bumps a counter. Allocating a child
//! also takes a hold on its parent for the same session; the parent stays
//! owned until its own count and all child holds are gone.
//!
//! Lock order is always descendant before ancestor. Hooks run after every
//! lock is dropped.

use crate::entry::ObjectEntry;
use crate::error::{RegistryError, RegistryResult};
use crate::request::AllocationRequestRef;
use crate::session::{same_session, SessionRef};
use parking_lot::{Mutex, MutexGuard};
use skerry_core::constants::ALLOCATION_HIERARCHY_DEPTH_MAX;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

// =============================================================================
// Allocatable
// =============================================================================

/// Something a session can allocate
pub trait Allocatable: Send + Sync + fmt::Debug {
    /// Ownership state
    fn allocation(&self) -> &Allocation;

    /// Human-readable name for errors and logs
    fn describe(&self) -> String;

    /// Hook run when a session first acquires the object
    ///
    /// Returns false if the session rejects it.
    fn allocated(&self, session: &SessionRef) -> bool;

    /// Hook run when a session's last direct allocation is gone
    fn released(&self, session: &SessionRef);

    /// Release one allocation held by the session
    ///
    /// Returns true when the session's direct allocation count reached zero.
    fn release(&self, session: &SessionRef) -> RegistryResult<bool>;

    /// Downcast for registry notifications
    fn as_object_entry(self: Arc<Self>) -> Option<Arc<ObjectEntry>> {
        None
    }
}

/// Shared handle to an allocatable
pub type AllocatableRef = Arc<dyn Allocatable>;

pub fn same_allocatable(a: &AllocatableRef, b: &AllocatableRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn is_child(weak: &Weak<dyn Allocatable>, child: &AllocatableRef) -> bool {
    std::ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(child))
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Owned by another session, or a parent is
    Busy,
    /// Busy, request parked on the object's queue
    Queued,
    /// Busy and the object's queue is at its limit
    QueueFull(usize),
    /// Busy and the object no longer takes requests
    Closed,
    /// Request was no longer pending; nothing changed
    Resolved,
    /// Granted. `first` is set when the session did not hold the object
    /// directly before.
    Acquired { first: bool },
}

/// Result of a release
#[derive(Debug, Default)]
pub struct Release {
    /// The session's direct count reached zero
    pub released: bool,
    /// The object has no owner any more
    pub freed: bool,
    /// Descendants and ancestors freed as a consequence
    pub cascaded: Vec<AllocatableRef>,
}

// =============================================================================
// Allocation
// =============================================================================

/// Retries when ancestors change ownership between walk and lock
const ACQUIRE_ATTEMPTS_MAX: usize = 16;

enum AncestorLock<'a> {
    Held(Vec<MutexGuard<'a, AllocationState>>),
    Busy,
    Stale,
}

#[derive(Default)]
struct AllocationState {
    session: Option<SessionRef>,
    count: u32,
    children: Vec<Weak<dyn Allocatable>>,
    requests: VecDeque<AllocationRequestRef>,
    closed: bool,
}

/// Ownership component embedded in every allocatable
pub struct Allocation {
    allocatable: bool,
    parent: Option<AllocatableRef>,
    state: Mutex<AllocationState>,
    /// Every allocatable created with this one as parent, held or not
    declared: Mutex<Vec<Weak<dyn Allocatable>>>,
}

impl Allocation {
    pub fn new(allocatable: bool, parent: Option<AllocatableRef>) -> Self {
        let mut depth = 0;
        let mut ancestor = parent.clone();
        while let Some(current) = ancestor {
            depth += 1;
            ancestor = current.allocation().parent.clone();
        }
        assert!(
            depth <= ALLOCATION_HIERARCHY_DEPTH_MAX,
            "allocation hierarchy depth {} exceeds {}",
            depth,
            ALLOCATION_HIERARCHY_DEPTH_MAX
        );

        Self {
            allocatable,
            parent,
            state: Mutex::new(AllocationState::default()),
            declared: Mutex::new(Vec::new()),
        }
    }

    /// Record `child` as created under this allocatable
    pub fn declare_child(&self, child: &AllocatableRef) {
        debug_assert!(child
            .allocation()
            .parent
            .as_ref()
            .is_some_and(|parent| std::ptr::eq(parent.allocation(), self)));
        let mut declared = self.declared.lock();
        declared.retain(|w| w.strong_count() > 0);
        declared.push(Arc::downgrade(child));
    }

    /// Live children declared under this allocatable
    pub fn declared_children(&self) -> Vec<AllocatableRef> {
        self.declared.lock().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn is_allocatable(&self) -> bool {
        self.allocatable
    }

    pub fn parent(&self) -> Option<&AllocatableRef> {
        self.parent.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Current owner, if any
    pub fn session(&self) -> Option<SessionRef> {
        self.state.lock().session.clone()
    }

    /// Direct allocation count of the owner
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Try to allocate `me` to the request's session
    ///
    /// The request is claimed while every involved lock is held, so the
    /// grant and the claim are a single step. With `queue_limit` set a busy
    /// object parks the request on its own queue instead of returning
    /// `Busy`.
    pub fn acquire(
        &self,
        me: &AllocatableRef,
        request: &AllocationRequestRef,
        queue_limit: Option<usize>,
    ) -> Acquire {
        debug_assert!(std::ptr::eq(me.allocation(), self));
        let session = request.session();
        let mut state = self.state.lock();

        let owned_by = state.session.as_ref().map(|owner| same_session(owner, session));
        match owned_by {
            Some(false) => return Self::park(&mut state, request, queue_limit),
            Some(true) => {
                if !request.claim() {
                    return Acquire::Resolved;
                }
                let first = state.count == 0;
                state.count += 1;
                return Acquire::Acquired { first };
            }
            None => {}
        }

        for _ in 0..ACQUIRE_ATTEMPTS_MAX {
            let ancestors = self.ancestors_to_take();
            let mut guards = match Self::lock_ancestors(&ancestors, session) {
                AncestorLock::Held(guards) => guards,
                AncestorLock::Busy => return Self::park(&mut state, request, queue_limit),
                AncestorLock::Stale => continue,
            };

            if !request.claim() {
                return Acquire::Resolved;
            }

            // Link each newly taken level to the one below it
            for (i, guard) in guards.iter_mut().enumerate() {
                let child = if i == 0 { me } else { &ancestors[i - 1] };
                let owned = guard.session.is_some();
                guard.session = Some(session.clone());
                debug_assert!(!guard.children.iter().any(|w| is_child(w, child)));
                guard.children.push(Arc::downgrade(child));
                if owned {
                    break;
                }
            }
            drop(guards);

            debug_assert!(state.count == 0);
            state.session = Some(session.clone());
            state.count = 1;
            return Acquire::Acquired { first: true };
        }

        tracing::warn!(
            object = %me.describe(),
            attempts = ACQUIRE_ATTEMPTS_MAX,
            "ancestors kept changing during allocation"
        );
        Self::park(&mut state, request, queue_limit)
    }

    /// Ancestors that must be locked for a new grant, nearest first
    ///
    /// The walk stops at the first ancestor that already has an owner.
    fn ancestors_to_take(&self) -> Vec<AllocatableRef> {
        let mut ancestors = Vec::new();
        let mut current = self.parent.clone();
        while let Some(ancestor) = current {
            ancestors.push(ancestor.clone());
            if ancestor.allocation().is_allocated() {
                break;
            }
            current = ancestor.allocation().parent.clone();
        }
        debug_assert!(ancestors.len() <= ALLOCATION_HIERARCHY_DEPTH_MAX);
        ancestors
    }

    /// Lock the walked ancestors and check they can be taken by `session`
    fn lock_ancestors<'a>(
        ancestors: &'a [AllocatableRef],
        session: &SessionRef,
    ) -> AncestorLock<'a> {
        let mut guards = Vec::with_capacity(ancestors.len());
        for (i, ancestor) in ancestors.iter().enumerate() {
            let guard = ancestor.allocation().state.lock();
            let owned_by = guard.session.as_ref().map(|owner| same_session(owner, session));
            match owned_by {
                Some(false) => return AncestorLock::Busy,
                Some(true) => {
                    guards.push(guard);
                    return AncestorLock::Held(guards);
                }
                None => {
                    let last = i + 1 == ancestors.len();
                    if last && ancestor.allocation().parent.is_some() {
                        // Owner went away after the walk; its parent is not covered
                        return AncestorLock::Stale;
                    }
                    guards.push(guard);
                }
            }
        }
        AncestorLock::Held(guards)
    }

    fn park(
        state: &mut AllocationState,
        request: &AllocationRequestRef,
        queue_limit: Option<usize>,
    ) -> Acquire {
        let Some(limit) = queue_limit else {
            return Acquire::Busy;
        };
        if !request.pending() {
            return Acquire::Resolved;
        }
        if state.closed {
            return Acquire::Closed;
        }
        if state.requests.len() >= limit {
            return Acquire::QueueFull(limit);
        }
        state.requests.push_back(request.clone());
        Acquire::Queued
    }

    /// Release one allocation of `me` held by `session`
    ///
    /// When the count reaches zero and `cascade` is set, every descendant
    /// the session holds through `me` is force-released. Freed ancestors
    /// are reported in `cascaded` as well. The ancestor holds are dropped
    /// before `me` can be taken again.
    pub fn release(
        &self,
        me: &AllocatableRef,
        session: &SessionRef,
        cascade: bool,
    ) -> RegistryResult<Release> {
        debug_assert!(std::ptr::eq(me.allocation(), self));
        let mut cascaded = Vec::new();
        let (children, freed) = {
            let mut state = self.state.lock();
            let owned = state
                .session
                .as_ref()
                .is_some_and(|owner| same_session(owner, session));
            if !owned || state.count == 0 {
                return Err(RegistryError::NotAllocated {
                    object: me.describe(),
                    user_id: session.user_id().to_string(),
                });
            }

            state.count -= 1;
            if state.count > 0 {
                return Ok(Release::default());
            }

            let children = if cascade {
                std::mem::take(&mut state.children)
            } else {
                Vec::new()
            };
            if state.children.is_empty() {
                state.session = None;
                self.detach_from_ancestors(me, &mut cascaded);
            }
            (children, state.session.is_none())
        };

        me.released(session);

        let mut dependents: VecDeque<Weak<dyn Allocatable>> = children.into();
        while let Some(weak) = dependents.pop_front() {
            let Some(child) = weak.upgrade() else {
                continue;
            };
            if let Some((direct, grandchildren)) = child.allocation().force_release(session) {
                if direct {
                    child.released(session);
                }
                dependents.extend(grandchildren);
                cascaded.push(child);
            }
        }

        Ok(Release {
            released: true,
            freed,
            cascaded,
        })
    }

    /// Undo a grant the session refused. No hooks run.
    ///
    /// Returns ancestors freed by the rollback.
    pub fn rollback(&self, me: &AllocatableRef, session: &SessionRef) -> Vec<AllocatableRef> {
        let mut cascaded = Vec::new();
        {
            let mut state = self.state.lock();
            let owned = state
                .session
                .as_ref()
                .is_some_and(|owner| same_session(owner, session));
            debug_assert!(owned && state.count > 0, "rollback of a grant not held");
            if !owned || state.count == 0 {
                return Vec::new();
            }
            state.count -= 1;
            if state.count == 0 && state.children.is_empty() {
                state.session = None;
                self.detach_from_ancestors(me, &mut cascaded);
            }
        }
        cascaded
    }

    /// Drop every hold of `session`, returning whether a direct allocation
    /// existed and the children that were held through this object
    fn force_release(&self, session: &SessionRef) -> Option<(bool, Vec<Weak<dyn Allocatable>>)> {
        let mut state = self.state.lock();
        match &state.session {
            Some(owner) if same_session(owner, session) => {}
            _ => return None,
        }
        let direct = state.count > 0;
        state.count = 0;
        state.session = None;
        Some((direct, std::mem::take(&mut state.children)))
    }

    /// Drop the hold `me` keeps on its parent, walking up while that frees
    /// the ancestor. Freed ancestors are pushed to `cascaded`.
    ///
    /// Called with `me`'s lock held. Each freed ancestor stays locked until
    /// its own parent link is gone, so no grant can link to it meanwhile.
    fn detach_from_ancestors(&self, me: &AllocatableRef, cascaded: &mut Vec<AllocatableRef>) {
        let mut ancestors = Vec::new();
        let mut current = self.parent.clone();
        while let Some(ancestor) = current {
            current = ancestor.allocation().parent.clone();
            ancestors.push(ancestor);
        }

        let mut guards = Vec::with_capacity(ancestors.len());
        for (i, ancestor) in ancestors.iter().enumerate() {
            let child = if i == 0 { me } else { &ancestors[i - 1] };
            let mut guard = ancestor.allocation().state.lock();
            let before = guard.children.len();
            guard.children.retain(|w| !is_child(w, child));
            debug_assert!(before - guard.children.len() <= 1, "duplicate child link");

            // Link already dropped by a cascade, or the ancestor is still held
            let freed = guard.children.len() < before
                && guard.count == 0
                && guard.children.is_empty()
                && guard.session.is_some();
            if !freed {
                break;
            }
            guard.session = None;
            cascaded.push(ancestor.clone());
            guards.push(guard);
        }
        drop(guards);
    }

    /// Pop the next queued request if the object is free
    pub fn next_request(&self) -> Option<AllocationRequestRef> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return None;
        }
        state.requests.pop_front()
    }

    /// Put a request back at the head of the queue
    ///
    /// Hands the request back if the queue was closed meanwhile.
    pub fn requeue_front(&self, request: AllocationRequestRef) -> Option<AllocationRequestRef> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(request);
        }
        state.requests.push_front(request);
        None
    }

    /// Remove every queued request and refuse new ones
    pub fn close(&self) -> Vec<AllocationRequestRef> {
        let mut state = self.state.lock();
        state.closed = true;
        state.requests.drain(..).collect()
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Allocation")
            .field("allocatable", &self.allocatable)
            .field("owner", &state.session.as_ref().map(|s| s.user_id().to_string()))
            .field("count", &state.count)
            .field("children", &state.children.len())
            .field("requests", &state.requests.len())
            .field("closed", &state.closed)
            .finish()
    }
}
