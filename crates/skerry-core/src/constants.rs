//! TigerStyle constants for Skerry
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identity Limits
// =============================================================================

/// Maximum length of an object identity name in bytes
pub const IDENTITY_NAME_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of an object identity category in bytes
pub const IDENTITY_CATEGORY_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an object type id in bytes
pub const TYPE_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of an adapter id in bytes
pub const ADAPTER_ID_LENGTH_BYTES_MAX: usize = 256;

// =============================================================================
// Allocation Limits
// =============================================================================

/// Maximum number of pending allocation requests queued on one type
pub const TYPE_REQUESTS_COUNT_MAX: usize = 100_000;

/// Default bound on pending allocation requests queued on one type
pub const TYPE_REQUESTS_COUNT_DEFAULT: usize = 10_000;

/// Maximum number of pending allocation requests queued on one object
pub const OBJECT_REQUESTS_COUNT_MAX: usize = 10_000;

/// Default bound on pending allocation requests queued on one object
pub const OBJECT_REQUESTS_COUNT_DEFAULT: usize = 1_000;

/// Maximum depth of a parent/child allocation hierarchy
pub const ALLOCATION_HIERARCHY_DEPTH_MAX: usize = 8;

// =============================================================================
// Load Scoring
// =============================================================================

/// Load score of an object that is not bound to an adapter
///
/// Also used when the adapter disappears while the score is computed.
pub const OBJECT_LOAD_DEFAULT: f32 = 1.0;

/// Load reported for a node that never sent a load sample
pub const NODE_LOAD_UNREACHABLE: f32 = 999.9;

// =============================================================================
// Tracing
// =============================================================================

/// Highest meaningful trace level
///
/// Level 1 traces add/remove, level 2 adds allocate/release.
pub const TRACE_LEVEL_MAX: u8 = 2;

/// Trace level at which object add/remove events are emitted
pub const TRACE_LEVEL_OBJECT_LIFECYCLE: u8 = 1;

/// Trace level at which object allocate/release events are emitted
pub const TRACE_LEVEL_OBJECT_ALLOCATION: u8 = 2;

// Compile-time assertions for constant validity
const _: () = {
    assert!(TYPE_REQUESTS_COUNT_DEFAULT <= TYPE_REQUESTS_COUNT_MAX);
    assert!(OBJECT_REQUESTS_COUNT_DEFAULT <= OBJECT_REQUESTS_COUNT_MAX);
    assert!(ALLOCATION_HIERARCHY_DEPTH_MAX >= 1);
    assert!(TRACE_LEVEL_OBJECT_LIFECYCLE < TRACE_LEVEL_OBJECT_ALLOCATION);
    assert!(TRACE_LEVEL_OBJECT_ALLOCATION <= TRACE_LEVEL_MAX);
};
