//! Arena configuration.
//!
//! The two knobs of the buddy layer are the size of an order-0 block
//! (`page_size`) and the number of times the arena can be halved before
//! reaching it (`max_order`). Together they fix the arena size at
//! `page_size << max_order` bytes.
//!
//! A configuration can be built in code or loaded from TOML:
//!
//! ```
//! use buddy_slab::ArenaConfig;
//!
//! let config = ArenaConfig::from_toml_str("page_size = 256\nmax_order = 4").unwrap();
//! assert_eq!(config.arena_size(), 4096);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{base::DoubleBlockLink, AllocInitError};

/// The default size of an order-0 block, in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// The default highest order; with the default page size this gives a 1 MiB
/// arena.
pub const DEFAULT_MAX_ORDER: usize = 8;

/// Configuration of a [`BuddyArena`](crate::BuddyArena).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArenaConfig {
    /// The size of an order-0 block in bytes. Must be a power of two of at
    /// least 16 bytes.
    pub page_size: usize,
    /// The order of the root block covering the whole arena.
    pub max_order: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            page_size: DEFAULT_PAGE_SIZE,
            max_order: DEFAULT_MAX_ORDER,
        }
    }
}

/// The error type for loading an [`ArenaConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The text is not a valid TOML arena configuration.
    #[error("failed to parse arena configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but cannot be satisfied.
    #[error(transparent)]
    Invalid(#[from] AllocInitError),
}

impl ArenaConfig {
    /// Creates a configuration with the given page size and highest order.
    pub const fn new(page_size: usize, max_order: usize) -> ArenaConfig {
        ArenaConfig {
            page_size,
            max_order,
        }
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or the resulting
    /// configuration is invalid.
    pub fn from_toml_str(text: &str) -> Result<ArenaConfig, ConfigError> {
        let config: ArenaConfig = toml::from_str(text)?;
        config.validate()?;

        Ok(config)
    }

    /// Checks that the configuration can be satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), AllocInitError> {
        if !self.page_size.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig(
                "page size must be a power of two",
            ));
        }

        if self.page_size < DoubleBlockLink::SIZE {
            return Err(AllocInitError::InvalidConfig(
                "page size must be large enough to hold a free-list link",
            ));
        }

        if self.max_order >= usize::BITS as usize {
            return Err(AllocInitError::InvalidConfig(
                "max order must be less than the number of bits in a usize",
            ));
        }

        if self.checked_arena_size().is_none() {
            return Err(AllocInitError::InvalidConfig(
                "arena size overflows usize",
            ));
        }

        Ok(())
    }

    fn checked_arena_size(&self) -> Option<usize> {
        let pages = 1_usize.checked_shl(u32::try_from(self.max_order).ok()?)?;
        self.page_size.checked_mul(pages)
    }

    /// Returns the size of the arena in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn arena_size(&self) -> usize {
        self.checked_arena_size().expect("arena size overflows usize")
    }

    /// Returns the size in bytes of a block of the given order.
    #[inline]
    pub fn block_size(&self, order: usize) -> usize {
        self.page_size << order
    }

    /// Returns the number of order-0 blocks in the arena.
    #[inline]
    pub fn num_pages(&self) -> usize {
        1 << self.max_order
    }
}
