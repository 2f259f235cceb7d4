//! Configuration for Skerry
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for Skerry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkerryConfig {
    /// Object registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl SkerryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        Ok(())
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `SKERRY_TRACE_OBJECT`: Object trace level (default: 0)
    /// - `SKERRY_RNG_SEED`: Seed for deterministic candidate shuffling
    pub fn from_env() -> Self {
        let mut registry = RegistryConfig::default();

        if let Some(level) = std::env::var("SKERRY_TRACE_OBJECT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            registry.trace_object_level = level;
        }

        registry.rng_seed = std::env::var("SKERRY_RNG_SEED")
            .ok()
            .and_then(|v| v.parse().ok());

        Self { registry }
    }
}

/// Object registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Object trace level (0 = silent, 1 = add/remove, 2 = allocate/release)
    #[serde(default)]
    pub trace_object_level: u8,

    /// Seed for the candidate shuffle (random seed if not specified)
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Maximum pending allocation requests per type
    #[serde(default = "default_type_requests_count_max")]
    pub type_requests_count_max: usize,

    /// Maximum pending allocation requests per object
    #[serde(default = "default_object_requests_count_max")]
    pub object_requests_count_max: usize,
}

fn default_type_requests_count_max() -> usize {
    TYPE_REQUESTS_COUNT_DEFAULT
}

fn default_object_requests_count_max() -> usize {
    OBJECT_REQUESTS_COUNT_DEFAULT
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            trace_object_level: 0,
            rng_seed: None,
            type_requests_count_max: default_type_requests_count_max(),
            object_requests_count_max: default_object_requests_count_max(),
        }
    }
}

impl RegistryConfig {
    /// Config with a fixed shuffle seed, for reproducible tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng_seed: Some(seed),
            ..Default::default()
        }
    }

    /// Set the object trace level
    pub fn with_trace_object_level(mut self, level: u8) -> Self {
        self.trace_object_level = level;
        self
    }

    /// Whether add/remove events are traced
    pub fn traces_lifecycle(&self) -> bool {
        self.trace_object_level >= TRACE_LEVEL_OBJECT_LIFECYCLE
    }

    /// Whether allocate/release events are traced
    pub fn traces_allocation(&self) -> bool {
        self.trace_object_level >= TRACE_LEVEL_OBJECT_ALLOCATION
    }

    pub fn validate(&self) -> Result<()> {
        if self.trace_object_level > TRACE_LEVEL_MAX {
            return Err(Error::InvalidConfiguration {
                field: "registry.trace_object_level".into(),
                reason: format!(
                    "{} exceeds limit {}",
                    self.trace_object_level, TRACE_LEVEL_MAX
                ),
            });
        }

        if self.type_requests_count_max == 0
            || self.type_requests_count_max > TYPE_REQUESTS_COUNT_MAX
        {
            return Err(Error::InvalidConfiguration {
                field: "registry.type_requests_count_max".into(),
                reason: format!(
                    "{} must be in 1..={}",
                    self.type_requests_count_max, TYPE_REQUESTS_COUNT_MAX
                ),
            });
        }

        if self.object_requests_count_max == 0
            || self.object_requests_count_max > OBJECT_REQUESTS_COUNT_MAX
        {
            return Err(Error::InvalidConfiguration {
                field: "registry.object_requests_count_max".into(),
                reason: format!(
                    "{} must be in 1..={}",
                    self.object_requests_count_max, OBJECT_REQUESTS_COUNT_MAX
                ),
            });
        }

        Ok(())
    }
}
