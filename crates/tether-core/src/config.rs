//! Session configuration.
//!
//! Both knobs are fixed for the lifetime of a session. The entity capacity in
//! particular is a hard ceiling: the store never grows past it.
//!
//! ## Environment Variables
//!
//! - `TETHER_ENTITY_CAP`: maximum live entities, root included
//! - `TETHER_MAP_BUCKETS`: identity map bucket count (power of two)

use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Default maximum number of live entities (root included)
pub const DEFAULT_ENTITY_CAPACITY: usize = 65_536;

/// Default identity map bucket count
pub const DEFAULT_MAP_BUCKETS: usize = 4_096;

/// Construction-time settings for a [`Session`](crate::session::Session)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Maximum number of live entities, root included
    pub entity_capacity: usize,
    /// Number of identity map buckets; must be a power of two
    pub map_buckets: usize,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            entity_capacity: DEFAULT_ENTITY_CAPACITY,
            map_buckets: DEFAULT_MAP_BUCKETS,
        }
    }
}

impl SessionConfig
{
    /// Defaults overridden by `TETHER_ENTITY_CAP` / `TETHER_MAP_BUCKETS`
    ///
    /// ## Errors
    ///
    /// [`CoreError::InvalidConfig`] if a variable is set but not a number, or
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> CoreResult<Self>
    {
        let mut config = Self::default();
        if let Some(cap) = read_env_usize("TETHER_ENTITY_CAP")? {
            debug!("entity capacity from environment: {}", cap);
            config.entity_capacity = cap;
        }
        if let Some(buckets) = read_env_usize("TETHER_MAP_BUCKETS")? {
            debug!("map bucket count from environment: {}", buckets);
            config.map_buckets = buckets;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// ## Errors
    ///
    /// [`CoreError::InvalidConfig`] when
    /// - `entity_capacity` is below 2 (the root alone would fill it) or does
    ///   not fit a 32-bit slot index
    /// - `map_buckets` is zero or not a power of two
    pub fn validate(&self) -> CoreResult<()>
    {
        if self.entity_capacity < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "entity capacity must be at least 2, got {}",
                self.entity_capacity
            )));
        }
        if u32::try_from(self.entity_capacity).is_err() {
            return Err(CoreError::InvalidConfig(format!(
                "entity capacity {} does not fit a 32-bit slot index",
                self.entity_capacity
            )));
        }
        if !self.map_buckets.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "map bucket count must be a non-zero power of two, got {}",
                self.map_buckets
            )));
        }
        Ok(())
    }
}

fn read_env_usize(name: &str) -> CoreResult<Option<usize>>
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| CoreError::InvalidConfig(format!("{name}={value:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
