//! Allocation requests
//!
//! TigerStyle: Exactly one terminal answer per request.
//!
//! A request is `Pending` until it is claimed by an object (`Claimed`) or
//! answered (`Done`). Claiming happens under the object's allocation lock,
//! so a cancel racing with a grant either wins before the grant or is a
//! no-op after it.

use crate::error::{RegistryError, RegistryResult};
use crate::identity::ObjectInfo;
use crate::session::SessionRef;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome delivered to the request holder
///
/// `Ok(None)` means no object of the requested type exists.
pub type AllocationResult = RegistryResult<Option<ObjectInfo>>;

/// Receiving end held by the requester
pub type AllocationReceiver = oneshot::Receiver<AllocationResult>;

/// A pending ask for an object
pub trait AllocationRequest: Send + Sync + fmt::Debug {
    /// Session the object is allocated to
    fn session(&self) -> &SessionRef;

    /// Whether the request is still waiting for an answer
    fn pending(&self) -> bool;

    /// Reserve the request for a grant. Returns false if it was canceled or
    /// already answered.
    fn claim(&self) -> bool;

    /// Answer with the allocated object, or `None` for "no candidate"
    fn response(&self, object: Option<ObjectInfo>);

    /// Answer with an error
    fn canceled(&self, reason: RegistryError);
}

/// Shared handle to a request
pub type AllocationRequestRef = Arc<dyn AllocationRequest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Pending,
    Claimed,
    Done,
}

#[derive(Debug)]
struct RequestState {
    phase: RequestPhase,
    sender: Option<oneshot::Sender<AllocationResult>>,
}

/// Request answered over a oneshot channel
pub struct ObjectAllocationRequest {
    session: SessionRef,
    state: Mutex<RequestState>,
}

impl ObjectAllocationRequest {
    /// Create a request and the receiver its answer arrives on
    pub fn new(session: SessionRef) -> (Arc<Self>, AllocationReceiver) {
        let (sender, receiver) = oneshot::channel();
        let request = Arc::new(Self {
            session,
            state: Mutex::new(RequestState {
                phase: RequestPhase::Pending,
                sender: Some(sender),
            }),
        });
        (request, receiver)
    }

    /// Cancel the request
    ///
    /// Returns false if it was already claimed or answered.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != RequestPhase::Pending {
            return false;
        }
        state.phase = RequestPhase::Done;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(Err(RegistryError::AllocationCanceled));
        }
        true
    }

    /// Whether an answer was delivered
    pub fn is_done(&self) -> bool {
        self.state.lock().phase == RequestPhase::Done
    }

    fn finish(&self, result: AllocationResult) {
        let mut state = self.state.lock();
        if state.phase == RequestPhase::Done {
            return;
        }
        state.phase = RequestPhase::Done;
        if let Some(sender) = state.sender.take() {
            // Receiver may be gone; the answer is simply dropped
            let _ = sender.send(result);
        }
        debug_assert!(state.sender.is_none());
    }
}

impl AllocationRequest for ObjectAllocationRequest {
    fn session(&self) -> &SessionRef {
        &self.session
    }

    fn pending(&self) -> bool {
        let state = self.state.lock();
        state.phase == RequestPhase::Pending
            && state.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        let abandoned = state.sender.as_ref().map_or(true, |s| s.is_closed());
        if state.phase != RequestPhase::Pending || abandoned {
            return false;
        }
        state.phase = RequestPhase::Claimed;
        true
    }

    fn response(&self, object: Option<ObjectInfo>) {
        self.finish(Ok(object));
    }

    fn canceled(&self, reason: RegistryError) {
        self.finish(Err(reason));
    }
}

impl fmt::Debug for ObjectAllocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAllocationRequest")
            .field("user_id", &self.session.user_id())
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}
