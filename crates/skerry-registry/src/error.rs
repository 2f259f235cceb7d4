//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! Contract violations (duplicate add, removal of an unknown identity) are
//! not modelled here: they are assertions, not recoverable errors.

use crate::identity::Identity;
use thiserror::Error;

/// Registry-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// No object is registered under the identity
    #[error("object not registered: {identity}")]
    ObjectNotRegistered { identity: String },

    /// Identity failed validation
    #[error("invalid identity: {id}, reason: {reason}")]
    InvalidIdentity { id: String, reason: String },

    /// Filter expression could not be compiled
    #[error("invalid filter {pattern}: {reason}")]
    InvalidFilter { pattern: String, reason: String },

    /// Adapter is unknown to the load cache
    #[error("adapter not found: {adapter_id}")]
    AdapterNotFound { adapter_id: String },

    /// Object was published as non-allocatable
    #[error("object {identity} is not allocatable")]
    NotAllocatable { identity: String },

    /// Release by a session that does not hold the allocation
    #[error("{object} is not allocated by session {user_id}")]
    NotAllocated { object: String, user_id: String },

    /// Session was torn down and accepts no further allocations
    #[error("session {user_id} destroyed")]
    SessionDestroyed { user_id: String },

    /// Request was canceled by its holder
    #[error("allocation request canceled")]
    AllocationCanceled,

    /// Pending queue reached its configured bound
    #[error("pending request queue for {target} full ({limit} requests)")]
    RequestQueueFull { target: String, limit: usize },

    /// Core error (configuration)
    #[error("{reason}")]
    Core { reason: String },
}

impl RegistryError {
    /// Create an object not registered error
    pub fn object_not_registered(identity: &Identity) -> Self {
        Self::ObjectNotRegistered {
            identity: identity.to_string(),
        }
    }

    /// Create an adapter not found error
    pub fn adapter_not_found(adapter_id: impl Into<String>) -> Self {
        Self::AdapterNotFound {
            adapter_id: adapter_id.into(),
        }
    }

    /// Create a session destroyed error
    pub fn session_destroyed(user_id: impl Into<String>) -> Self {
        Self::SessionDestroyed {
            user_id: user_id.into(),
        }
    }

    /// Check if the condition may clear up on retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RequestQueueFull { .. })
    }
}

impl From<skerry_core::Error> for RegistryError {
    fn from(err: skerry_core::Error) -> Self {
        Self::Core {
            reason: err.to_string(),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
