//! Skerry Core
//!
//! Core types, errors, and constants for the Skerry object registry.
//!
//! # Overview
//!
//! Skerry tracks replicated service endpoints published by a cluster and
//! arbitrates exclusive allocation of one replica among competing sessions.
//! This crate holds what every other crate needs: explicit limits,
//! configuration, the randomness abstraction and telemetry setup.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `IDENTITY_NAME_LENGTH_BYTES_MAX`)
//! - Assertions on preconditions and postconditions
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod telemetry;

pub use config::{RegistryConfig, SkerryConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{shuffle, DeterministicRng, RngProvider, StdRngProvider};
pub use telemetry::{init_telemetry, TelemetryConfig};
