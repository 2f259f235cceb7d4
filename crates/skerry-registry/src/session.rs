//! Client sessions
//!
//! TigerStyle: A session owns the lifetime of its allocations.
//!
//! Allocations are registered with the session when they are granted so
//! that destroying the session releases everything it still holds.

use crate::allocation::{same_allocatable, AllocatableRef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A connected client that can own allocations
pub trait Session: Send + Sync + fmt::Debug {
    /// User identifier, for diagnostics
    fn user_id(&self) -> &str;

    /// Track a granted allocation
    ///
    /// Returns false if the session can no longer accept allocations, in
    /// which case the caller must undo the grant.
    fn add_allocation(&self, allocatable: AllocatableRef) -> bool;

    /// Stop tracking an allocation
    fn remove_allocation(&self, allocatable: &AllocatableRef);
}

/// Shared handle to a session
pub type SessionRef = Arc<dyn Session>;

/// Sessions are compared by address, not by user id
pub fn same_session(a: &SessionRef, b: &SessionRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Debug, Default)]
struct SessionState {
    destroyed: bool,
    allocations: Vec<AllocatableRef>,
}

/// In-process session
pub struct MemorySession {
    user_id: String,
    state: Mutex<SessionState>,
}

impl MemorySession {
    pub fn new(user_id: impl Into<String>) -> Arc<Self> {
        let user_id = user_id.into();
        debug_assert!(!user_id.is_empty(), "user id cannot be empty");
        Arc::new(Self {
            user_id,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Number of allocations currently tracked
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Destroy the session, releasing every allocation it holds
    ///
    /// Returns the number of allocations released. Allocations already freed
    /// by a cascade from another release are skipped.
    pub fn destroy(self: &Arc<Self>) -> usize {
        let allocations = {
            let mut state = self.state.lock();
            if state.destroyed {
                return 0;
            }
            state.destroyed = true;
            std::mem::take(&mut state.allocations)
        };

        let session: SessionRef = self.clone();
        let mut released = 0;
        for allocatable in allocations {
            // A re-entrant allocation needs one release per grant
            loop {
                match allocatable.release(&session) {
                    Ok(true) => {
                        released += 1;
                        break;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::debug!(
                            user = %self.user_id,
                            object = %allocatable.describe(),
                            error = %e,
                            "allocation already released"
                        );
                        break;
                    }
                }
            }
        }

        tracing::debug!(user = %self.user_id, released, "session destroyed");
        released
    }
}

impl Session for MemorySession {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn add_allocation(&self, allocatable: AllocatableRef) -> bool {
        let mut state = self.state.lock();
        if state.destroyed {
            return false;
        }
        // A regrant can be tracked before the previous release hook ran
        state.allocations.push(allocatable);
        true
    }

    fn remove_allocation(&self, allocatable: &AllocatableRef) {
        let mut state = self.state.lock();
        if let Some(i) = state
            .allocations
            .iter()
            .position(|a| same_allocatable(a, allocatable))
        {
            state.allocations.swap_remove(i);
        }
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("user_id", &self.user_id)
            .finish()
    }
}
