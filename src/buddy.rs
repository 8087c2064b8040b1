//! Binary-buddy page allocation.
//!
//! A buddy allocator manages its arena as a binary hierarchy of power-of-two
//! blocks. A block of order `k` is `page_size << k` bytes long and starts at an
//! offset that is a multiple of its size. Splitting a block yields two halves
//! of the next lower order, its *buddies*; the buddy of the block at offset
//! `o` is found by flipping the bit that corresponds to the block size,
//! `o ^ (page_size << k)`.
//!
//! Allocation pops the smallest free block of sufficient order and splits it
//! down to the requested order, handing the upper halves to the free lists on
//! the way. Deallocation does the reverse, merging with the buddy for as long
//! as the buddy is free and of the same order.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case    |
//! |--------------------------|-----------|---------------|
//! | Allocate                 | O(1)      | O(max_order)  |
//! | Deallocate               | O(1)      | O(max_order)  |
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a power-of-two number of pages, so internal
//! fragmentation can reach half of a block. External fragmentation is bounded
//! by coalescing.

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, trace, warn};

use crate::{
    base::{DoubleBlockLink, Region},
    AddressError, AllocError, AllocInitError, ArenaConfig, ArenaProvider, Global,
};

/// The address of a block, as an offset from the start of its arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr(usize);

impl BlockAddr {
    /// Creates a block address from an arena offset.
    ///
    /// The address is only meaningful to an arena that handed it out.
    #[inline]
    pub const fn new(offset: usize) -> BlockAddr {
        BlockAddr(offset)
    }

    /// Returns the offset of the block from the start of the arena.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Uniquely identifies a [`BuddyArena`] for the lifetime of the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArenaId(u64);

impl ArenaId {
    fn next() -> ArenaId {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ArenaId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the side table knows about one page of the arena.
///
/// Only the first page of a block carries the block's state; the remaining
/// pages are interior.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PageState {
    Interior,
    Head { order: usize, free: bool },
    /// An allocated order-0 block backing a slab.
    Slab,
}

struct BuddyLevel {
    block_size: usize,
    free_list: Option<usize>,
    len: usize,
}

impl BuddyLevel {
    /// Retrieves the offset of the buddy of the block which starts
    /// `block_ofs` bytes from the base.
    #[inline]
    fn buddy_ofs(&self, block_ofs: usize) -> usize {
        block_ofs ^ self.block_size
    }

    /// Pushes a block onto the free list.
    fn free_list_push(&mut self, region: &mut Region, block: usize) {
        debug_assert_eq!(block % self.block_size, 0);

        let old_head = self.free_list;

        if let Some(old_head) = old_head {
            region.set_prev(old_head, Some(block));
        }

        region.init_double_link_at(
            block,
            DoubleBlockLink {
                prev: None,
                next: old_head,
            },
        );

        // `block` points forward to `old_head`.
        // `old_head` points back to `block`.
        self.free_list = Some(block);
        self.len += 1;
    }

    /// Pops a block from the free list.
    ///
    /// If the free list is empty, returns `None`.
    fn free_list_pop(&mut self, region: &mut Region) -> Option<usize> {
        let head = self.free_list?;
        self.free_list_remove(region, head);
        Some(head)
    }

    /// Removes the specified block from the free list.
    ///
    /// `block` must be an element of `self.free_list`.
    fn free_list_remove(&mut self, region: &mut Region, block: usize) {
        let removed = region.double_link(block);

        match removed.prev {
            // Link `prev` forward to `next`.
            Some(p) => region.set_next(p, removed.next),

            // If there's no previous block, then `removed` is the head of
            // the free list.
            None => self.free_list = removed.next,
        }

        if let Some(n) = removed.next {
            // Link `next` back to `prev`.
            region.set_prev(n, removed.prev);
        }

        self.len -= 1;
    }

    /// Iterates over the offsets of the blocks on the free list, head first.
    #[cfg(test)]
    fn iter<'a>(&self, region: &'a Region) -> impl Iterator<Item = usize> + 'a {
        core::iter::successors(self.free_list, move |&ofs| region.double_link(ofs).next)
    }
}

/// A binary-buddy allocator over one arena.
///
/// The arena is `page_size << max_order` bytes, reserved once from an
/// [`ArenaProvider`] and returned to it on drop. Each instance is fully
/// independent; there is no process-wide allocator state.
///
/// For example, an arena of 16 pages of 256 bytes:
///
/// ```
/// use buddy_slab::{ArenaConfig, BuddyArena};
///
/// let mut arena = BuddyArena::try_new(ArenaConfig::new(256, 4)).unwrap();
///
/// let a = arena.allocate(0).unwrap();
/// // Splitting the root left one free block at every lower order.
/// assert!((0..4).all(|order| arena.free_blocks(order) == 1));
///
/// arena.release(a).unwrap();
/// assert!(arena.is_idle());
/// ```
pub struct BuddyArena<P: ArenaProvider = Global> {
    id: ArenaId,
    config: ArenaConfig,
    /// log2 of the page size.
    page_shift: u32,
    region: Region,
    /// One entry per page, indexed by `offset >> page_shift`.
    pages: Vec<PageState>,
    /// One level per order, lowest order first.
    levels: Vec<BuddyLevel>,
    provider: P,
}

impl BuddyArena<Global> {
    /// Constructs a new `BuddyArena` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the arena could not be
    /// reserved.
    pub fn try_new(config: ArenaConfig) -> Result<BuddyArena<Global>, AllocInitError> {
        BuddyArena::try_new_in(config, Global)
    }
}

impl<P: ArenaProvider> BuddyArena<P> {
    /// Constructs a new `BuddyArena` whose arena is reserved from `provider`.
    ///
    /// On success the arena holds a single free block of order
    /// `config.max_order`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `config` is invalid, or
    /// [`AllocInitError::ProviderExhausted`] if `provider` refuses the
    /// reservation.
    pub fn try_new_in(
        config: ArenaConfig,
        mut provider: P,
    ) -> Result<BuddyArena<P>, AllocInitError> {
        config.validate()?;

        let size = config.arena_size();
        let region = Region::reserve(&mut provider, size)
            .ok_or(AllocInitError::ProviderExhausted { size })?;

        let num_pages = config.num_pages();
        let mut pages = Vec::new();
        if pages.try_reserve_exact(num_pages).is_err() {
            provider.reclaim(region.into_bytes());
            return Err(AllocInitError::ProviderExhausted { size });
        }
        pages.resize(num_pages, PageState::Interior);

        let levels = (0..=config.max_order)
            .map(|order| BuddyLevel {
                block_size: config.block_size(order),
                free_list: None,
                len: 0,
            })
            .collect();

        let mut arena = BuddyArena {
            id: ArenaId::next(),
            config,
            page_shift: config.page_size.trailing_zeros(),
            region,
            pages,
            levels,
            provider,
        };

        arena.install_root();

        debug!(
            arena = ?arena.id,
            page_size = config.page_size,
            max_order = config.max_order,
            size,
            "initialized buddy arena"
        );

        Ok(arena)
    }

    /// Returns every block to a single free root block.
    ///
    /// All outstanding allocations, including pages held by slab caches, are
    /// invalidated. The arena takes a new [`ArenaId`], so caches created
    /// before the reset reject it as foreign.
    pub fn reset(&mut self) {
        self.id = ArenaId::next();

        for level in &mut self.levels {
            level.free_list = None;
            level.len = 0;
        }

        self.pages.fill(PageState::Interior);
        self.install_root();

        debug!(arena = ?self.id, "reset buddy arena");
    }

    fn install_root(&mut self) {
        let max_order = self.config.max_order;

        self.pages[0] = PageState::Head {
            order: max_order,
            free: true,
        };
        self.levels[max_order].free_list_push(&mut self.region, 0);
    }

    /// Returns the identity of this arena.
    #[inline]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Returns the configuration this arena was constructed with.
    #[inline]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Returns the size of an order-0 block.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the order of the root block.
    #[inline]
    pub fn max_order(&self) -> usize {
        self.config.max_order
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    #[inline]
    fn page_index(&self, ofs: usize) -> usize {
        ofs >> self.page_shift
    }

    /// Attempts to allocate a block of the given order.
    ///
    /// The block is `page_size << order` bytes long and its offset is a
    /// multiple of its size. The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block of order `order` or higher exists, or
    /// if `order` exceeds the arena's maximum order.
    pub fn allocate(&mut self, order: usize) -> Result<BlockAddr, AllocError> {
        if order > self.config.max_order {
            return Err(AllocError);
        }

        // Scan increasing block sizes until a free block is found.
        let mut found = None;
        for level in order..=self.config.max_order {
            if let Some(block) = self.levels[level].free_list_pop(&mut self.region) {
                found = Some((block, level));
                break;
            }
        }

        let (block, init_order) = found.ok_or(AllocError)?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for level in (order..init_order).rev() {
            let back_half = block + self.config.block_size(level);

            let back_idx = self.page_index(back_half);
            self.pages[back_idx] = PageState::Head {
                order: level,
                free: true,
            };
            self.levels[level].free_list_push(&mut self.region, back_half);

            trace!(arena = ?self.id, block, back_half, order = level, "split block");
        }

        let idx = self.page_index(block);
        self.pages[idx] = PageState::Head { order, free: false };

        Ok(BlockAddr(block))
    }

    /// Returns the order of the allocated block starting at `addr`.
    fn allocated_order(&self, addr: BlockAddr) -> Result<usize, AddressError> {
        let ofs = addr.0;
        self.region.check_ofs(ofs)?;

        if ofs % self.config.page_size != 0 {
            return Err(AddressError::Misaligned { addr: ofs });
        }

        match self.pages[self.page_index(ofs)] {
            PageState::Interior => Err(AddressError::Misaligned { addr: ofs }),
            PageState::Head { free: true, .. } => Err(AddressError::NotAllocated { addr: ofs }),
            PageState::Head { order, free: false } => Ok(order),
            PageState::Slab => Err(AddressError::SlabOwned { addr: ofs }),
        }
    }

    /// Returns the order of the allocated block starting at `addr`, or `None`
    /// if `addr` is not an allocated block.
    pub fn order_of(&self, addr: BlockAddr) -> Option<usize> {
        self.allocated_order(addr).ok()
    }

    /// Returns the address of the buddy of the block of order `order` at
    /// `addr`.
    ///
    /// Returns `None` for the root order, which has no buddy, or if `addr` is
    /// not aligned to the block size of `order`.
    pub fn buddy_of(&self, addr: BlockAddr, order: usize) -> Option<BlockAddr> {
        if order >= self.config.max_order || !self.region.contains_ofs(addr.0) {
            return None;
        }

        let level = &self.levels[order];
        (addr.0 % level.block_size == 0).then(|| BlockAddr(level.buddy_ofs(addr.0)))
    }

    /// Releases the block starting at `addr`.
    ///
    /// The block is merged with its buddy for as long as the buddy is free
    /// and of the same order, then pushed onto the free list of the resulting
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the arena unchanged, if `addr` does not
    /// denote a block currently allocated from this arena.
    pub fn release(&mut self, addr: BlockAddr) -> Result<(), AddressError> {
        let mut order = match self.allocated_order(addr) {
            Ok(o) => o,
            Err(e) => {
                warn!(arena = ?self.id, %addr, error = %e, "rejected block release");
                return Err(e);
            }
        };

        let mut block = addr.0;

        while order < self.config.max_order {
            let buddy = self.levels[order].buddy_ofs(block);

            let mergeable = self.pages[self.page_index(buddy)]
                == PageState::Head {
                    order,
                    free: true,
                };
            if !mergeable {
                break;
            }

            // Remove the buddy block from the free list.
            self.levels[order].free_list_remove(&mut self.region, buddy);

            // The coalesced block starts at the lower of the two addresses.
            let (lower, upper) = if block < buddy {
                (block, buddy)
            } else {
                (buddy, block)
            };
            let upper_idx = self.page_index(upper);
            self.pages[upper_idx] = PageState::Interior;

            trace!(arena = ?self.id, block = lower, order = order + 1, "merged buddies");

            block = lower;
            order += 1;
        }

        let idx = self.page_index(block);
        self.pages[idx] = PageState::Head { order, free: true };
        self.levels[order].free_list_push(&mut self.region, block);

        Ok(())
    }

    /// Returns the number of free blocks of the given order.
    ///
    /// # Panics
    ///
    /// Panics if `order` exceeds the arena's maximum order.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.levels[order].len
    }

    /// Returns the total size of all free blocks in bytes.
    pub fn free_bytes(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.len * level.block_size)
            .sum()
    }

    /// Returns `true` if the whole arena is a single free block.
    pub fn is_idle(&self) -> bool {
        self.levels[self.config.max_order].len == 1
    }

    /// Returns the contents of the allocated block starting at `addr`.
    ///
    /// Returns `None` if `addr` does not denote an allocated block.
    pub fn block(&self, addr: BlockAddr) -> Option<&[u8]> {
        let order = self.order_of(addr)?;
        Some(self.region.bytes(addr.0, self.config.block_size(order)))
    }

    /// Returns the contents of the allocated block starting at `addr`,
    /// mutably.
    ///
    /// Returns `None` if `addr` does not denote an allocated block.
    pub fn block_mut(&mut self, addr: BlockAddr) -> Option<&mut [u8]> {
        let order = self.order_of(addr)?;
        let len = self.config.block_size(order);
        Some(self.region.bytes_mut(addr.0, len))
    }

    /// Allocates an order-0 block on behalf of a slab cache.
    ///
    /// The block can only be released through [`release_slab_page`].
    ///
    /// [`release_slab_page`]: BuddyArena::release_slab_page
    pub(crate) fn allocate_slab_page(&mut self) -> Result<BlockAddr, AllocError> {
        let page = self.allocate(0)?;
        let idx = self.page_index(page.0);
        self.pages[idx] = PageState::Slab;

        Ok(page)
    }

    /// Releases a block obtained from [`allocate_slab_page`].
    ///
    /// [`allocate_slab_page`]: BuddyArena::allocate_slab_page
    pub(crate) fn release_slab_page(&mut self, page: BlockAddr) -> Result<(), AddressError> {
        self.region.check_ofs(page.0)?;

        let idx = self.page_index(page.0);
        if page.0 % self.config.page_size != 0 || self.pages[idx] != PageState::Slab {
            return Err(AddressError::NotAllocated { addr: page.0 });
        }

        self.pages[idx] = PageState::Head {
            order: 0,
            free: false,
        };
        self.release(page)
    }

    /// Returns `len` bytes at `ofs` without consulting the block table.
    pub(crate) fn raw_bytes(&self, ofs: usize, len: usize) -> &[u8] {
        self.region.bytes(ofs, len)
    }

    pub(crate) fn raw_bytes_mut(&mut self, ofs: usize, len: usize) -> &mut [u8] {
        self.region.bytes_mut(ofs, len)
    }

    /// Checks every structural invariant of the free lists and the page
    /// table.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut covered = 0;
        for (idx, state) in self.pages.iter().enumerate() {
            let order = match *state {
                PageState::Interior => continue,
                PageState::Head { order, .. } => order,
                PageState::Slab => 0,
            };

            let ofs = idx << self.page_shift;
            assert_eq!(ofs % self.config.block_size(order), 0, "misaligned block");
            assert_eq!(ofs, covered, "blocks overlap or leave a gap");
            covered += self.config.block_size(order);
        }
        assert_eq!(covered, self.size(), "blocks do not tile the arena");

        for (order, level) in self.levels.iter().enumerate() {
            let mut prev = None;
            let mut count = 0;
            for ofs in level.iter(&self.region) {
                assert_eq!(self.region.double_link(ofs).prev, prev);
                assert_eq!(
                    self.pages[self.page_index(ofs)],
                    PageState::Head { order, free: true }
                );

                // No two free buddies may coexist unmerged.
                if order < self.config.max_order {
                    let buddy = level.buddy_ofs(ofs);
                    assert_ne!(
                        self.pages[self.page_index(buddy)],
                        PageState::Head { order, free: true },
                        "unmerged free buddies at order {order}"
                    );
                }

                prev = Some(ofs);
                count += 1;
            }
            assert_eq!(count, level.len);
        }

        let free_heads = self
            .pages
            .iter()
            .filter(|s| matches!(s, PageState::Head { free: true, .. }))
            .count();
        let listed: usize = self.levels.iter().map(|l| l.len).sum();
        assert_eq!(free_heads, listed, "free block missing from its list");
    }
}

impl<P: ArenaProvider> Drop for BuddyArena<P> {
    fn drop(&mut self) {
        let region = core::mem::take(&mut self.region);
        self.provider.reclaim(region.into_bytes());
    }
}

impl<P: ArenaProvider> fmt::Debug for BuddyArena<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyArena")
            .field("id", &self.id)
            .field("page_size", &self.config.page_size)
            .field("max_order", &self.config.max_order)
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

/// Summarizes the free lists as `Ord<k>:<count>` for every non-empty order.
impl<P: ArenaProvider> fmt::Display for BuddyArena<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut empty = true;

        for (order, level) in self.levels.iter().enumerate() {
            if level.len == 0 {
                continue;
            }

            if !empty {
                f.write_str(" ")?;
            }
            write!(f, "Ord{order}:{}", level.len)?;
            empty = false;
        }

        if empty {
            f.write_str("Empty")?;
        }

        Ok(())
    }
}
