//! A buddy page allocator with a slab object cache layered on top.
//!
//! The crate reproduces, at small scale, the page allocator plus object cache
//! design found in kernel memory subsystems:
//!
//! - [`BuddyArena`] manages one fixed arena as a binary hierarchy of
//!   power-of-two blocks. Block sizes run from `page_size` (order 0) to
//!   `page_size << max_order` (the whole arena).
//! - [`SlabCache`] serves fixed-size objects carved out of order-0 blocks
//!   obtained from a `BuddyArena`.
//!
//! All addresses handed out by this crate are offsets relative to the start
//! of the arena. The bytes behind them are reached through the arena, never
//! through raw pointers.
//!
//! ```
//! use buddy_slab::{ArenaConfig, BuddyArena, SlabCache};
//!
//! let mut arena = BuddyArena::try_new(ArenaConfig::default()).unwrap();
//!
//! // Page-granularity allocation.
//! let block = arena.allocate(2).unwrap();
//! assert_eq!(arena.block(block).unwrap().len(), 4 * 4096);
//! arena.release(block).unwrap();
//!
//! // Object allocation.
//! let mut cache = SlabCache::new(&arena, "nodes", 128).unwrap();
//! let obj = cache.allocate(&mut arena).unwrap();
//! cache.object_mut(&mut arena, obj).unwrap().fill(0xAB);
//! cache.free(&mut arena, obj).unwrap();
//! cache.destroy(&mut arena).unwrap();
//!
//! assert!(arena.is_idle());
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_slab/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod base;
mod bitmap;
pub mod buddy;
pub mod config;
pub mod slab;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use crate::{
    buddy::{ArenaId, BlockAddr, BuddyArena},
    config::{ArenaConfig, ConfigError},
    slab::{
        CacheStats, ListKind, ObjectAddr, SlabCache, SlabError, SlabInfo, MAX_OBJECTS_PER_SLAB,
    },
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocInitError {
    /// The memory provider could not reserve the arena.
    ///
    /// This is fatal for the allocator being constructed; it is not retried.
    #[error("memory provider could not reserve {size} bytes")]
    ProviderExhausted {
        /// The size of the refused reservation.
        size: usize,
    },

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when configuration parameters are impossible
    /// to satisfy.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
///
/// This is the "not found" result of the allocators: it is always
/// recoverable and never leaves the allocator in a modified state.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
#[error("no free block large enough")]
pub struct AllocError;

/// The error type for releasing an address that the allocator does not track.
///
/// Releasing such an address never modifies the allocator.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum AddressError {
    /// The address lies outside of the managed region.
    #[error("address {addr:#x} is outside the managed region")]
    OutOfRange {
        /// The offending arena offset.
        addr: usize,
    },

    /// The address lies inside the managed region but does not start a block
    /// or object.
    #[error("address {addr:#x} does not start a block or object")]
    Misaligned {
        /// The offending arena offset.
        addr: usize,
    },

    /// The address starts a block or object that is not currently allocated.
    #[error("address {addr:#x} is not currently allocated")]
    NotAllocated {
        /// The offending arena offset.
        addr: usize,
    },

    /// The address starts a page held by a slab cache; it can only be
    /// returned by the cache.
    #[error("address {addr:#x} is a page owned by a slab cache")]
    SlabOwned {
        /// The offending arena offset.
        addr: usize,
    },
}

/// Types which provide memory which backs an allocator.
///
/// A provider is consulted exactly once, when a [`BuddyArena`] is
/// constructed, and gets the region back when the arena is dropped.
///
/// This crate provides two implementations:
/// - [`Global`] reserves from the global allocator.
/// - [`Capped`] reserves from the global allocator up to a size limit.
pub trait ArenaProvider {
    /// Reserves a zeroed region of exactly `len` bytes.
    ///
    /// Returns `None` if the region cannot be provided.
    fn reserve(&mut self, len: usize) -> Option<Box<[u8]>>;

    /// Takes back a region previously returned by [`reserve`].
    ///
    /// [`reserve`]: ArenaProvider::reserve
    fn reclaim(&mut self, region: Box<[u8]>) {
        drop(region);
    }
}

/// The global memory allocator.
#[derive(Clone, Debug, Default)]
pub struct Global;

impl ArenaProvider for Global {
    fn reserve(&mut self, len: usize) -> Option<Box<[u8]>> {
        let mut region = Vec::new();
        region.try_reserve_exact(len).ok()?;
        region.resize(len, 0);

        Some(region.into_boxed_slice())
    }
}

/// A provider which refuses any reservation larger than `limit` bytes.
#[derive(Clone, Debug)]
pub struct Capped {
    /// The largest reservation that will be granted.
    pub limit: usize,
}

impl ArenaProvider for Capped {
    fn reserve(&mut self, len: usize) -> Option<Box<[u8]>> {
        if len > self.limit {
            return None;
        }

        Global.reserve(len)
    }
}
