//! Skerry Registry
//!
//! Object registry and allocation for Skerry clusters.
//!
//! # Overview
//!
//! The registry provides:
//! - Identity and type indexes over published objects
//! - Exclusive, re-entrant allocation of objects to sessions
//! - Random and least-loaded selection among replicas of a type
//! - Wait queues served as objects are released, with cascading release
//!   through parent/child allocations

pub mod allocation;
pub mod cache;
pub mod entry;
pub mod error;
pub mod identity;
pub mod load;
pub mod request;
pub mod session;
mod type_entry;

pub use allocation::{Allocatable, AllocatableRef, Allocation};
pub use cache::ObjectCache;
pub use entry::ObjectEntry;
pub use error::{RegistryError, RegistryResult};
pub use identity::{Identity, ObjectInfo, ObjectProxy};
pub use load::{LoadCache, LoadInfo, LoadSample, MemoryLoadCache};
pub use request::{
    AllocationReceiver, AllocationRequest, AllocationRequestRef, AllocationResult,
    ObjectAllocationRequest,
};
pub use session::{MemorySession, Session, SessionRef};
