//! Slab allocation.
//!
//! A slab cache serves objects of one fixed size. It obtains order-0 blocks
//! (pages) from a [`BuddyArena`] and divides each page into up to
//! [`MAX_OBJECTS_PER_SLAB`] equally-sized slots, tracked by a bitmap.
//!
//! Each slab sits on exactly one of three lists, according to how many of
//! its slots are free:
//!
//! | List      | Free slots                 |
//! |-----------|----------------------------|
//! | `free`    | all of them                |
//! | `partial` | some, but not all          |
//! | `full`    | none                       |
//!
//! Allocation is served from `partial` first, then from `free`, and only then
//! from a new page. Slabs that become empty stay cached on `free` until the
//! cache is shrunk or destroyed.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case           |
//! |--------------------------|-----------|----------------------|
//! | Allocate                 | O(1)      | O(max_order)         |
//! | Deallocate               | O(1)      | O(slabs)             |
//!
//! #### Fragmentation
//!
//! Objects never straddle pages. A page holds `min(page_size / obj_size, 32)`
//! objects; whatever is left over is wasted.

use core::fmt;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    bitmap::SlotBitmap,
    buddy::{ArenaId, BlockAddr, BuddyArena},
    AddressError, AllocError, AllocInitError, ArenaProvider,
};

/// The largest number of objects a single slab can hold.
pub const MAX_OBJECTS_PER_SLAB: usize = SlotBitmap::MAX_BITS;

/// The address of an object, as an offset from the start of its arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectAddr(usize);

impl ObjectAddr {
    /// Creates an object address from an arena offset.
    #[inline]
    pub const fn new(offset: usize) -> ObjectAddr {
        ObjectAddr(offset)
    }

    /// Returns the offset of the object from the start of the arena.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The error type for slab cache operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SlabError {
    /// No page could be obtained for a new slab.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// The address is not an object currently allocated from this cache.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// The arena is not the one this cache was created against.
    #[error("arena does not back this cache")]
    ForeignArena,
}

/// Names one of a cache's three slab lists.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Slabs with every slot free.
    Free,
    /// Slabs with some slots free.
    Partial,
    /// Slabs with no slot free.
    Full,
}

impl ListKind {
    #[inline]
    const fn index(self) -> usize {
        match self {
            ListKind::Free => 0,
            ListKind::Partial => 1,
            ListKind::Full => 2,
        }
    }
}

/// A snapshot of one slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlabInfo {
    /// The page backing the slab.
    pub page_start: BlockAddr,
    /// The number of free slots.
    pub free_count: usize,
    /// The occupancy bitmap; bit `i` is set if slot `i` is allocated.
    pub bitmap: u32,
}

/// The number of slabs on each list of a cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Slabs with no free slot.
    pub full: usize,
    /// Slabs with some free slots.
    pub partial: usize,
    /// Slabs with every slot free.
    pub free: usize,
}

type SlabId = usize;

struct Slab {
    page: BlockAddr,
    free_count: usize,
    bitmap: SlotBitmap,
    /// The next slab on the same list.
    next: Option<SlabId>,
    /// The list this slab is on.
    list: ListKind,
}

#[derive(Default)]
struct SlabList {
    head: Option<SlabId>,
    len: usize,
}

/// A cache of fixed-size objects backed by pages of a [`BuddyArena`].
///
/// The cache does not hold on to the arena; every operation that touches
/// memory takes the arena explicitly, and must be given the arena the cache
/// was created against.
///
/// A cache should be torn down with [`destroy`](SlabCache::destroy), which
/// hands its pages back to the arena. Dropping a cache that still holds pages
/// leaves them allocated in the arena. Pages held by a cache cannot be
/// released through [`BuddyArena::release`].
///
/// Resetting the arena detaches every cache created against it; such caches
/// reject the arena as foreign from then on.
pub struct SlabCache {
    name: String,
    arena: ArenaId,
    page_size: usize,
    obj_size: usize,
    objects_per_slab: usize,
    slabs: Vec<Option<Slab>>,
    vacant: Vec<SlabId>,
    lists: [SlabList; 3],
}

impl SlabCache {
    /// Creates a cache for objects of `obj_size` bytes backed by `arena`.
    ///
    /// No memory is taken from the arena until the first allocation.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `obj_size` is zero or
    /// larger than the arena's page size.
    pub fn new<P: ArenaProvider>(
        arena: &BuddyArena<P>,
        name: impl Into<String>,
        obj_size: usize,
    ) -> Result<SlabCache, AllocInitError> {
        let page_size = arena.page_size();

        if obj_size == 0 {
            return Err(AllocInitError::InvalidConfig("object size must be nonzero"));
        }

        if obj_size > page_size {
            return Err(AllocInitError::InvalidConfig(
                "object size must not exceed the page size",
            ));
        }

        // The bitmap word bounds slab density; any space beyond the last slot
        // is left unused.
        let objects_per_slab = (page_size / obj_size).min(MAX_OBJECTS_PER_SLAB);

        let name = name.into();
        debug!(cache = %name, obj_size, objects_per_slab, "created slab cache");

        Ok(SlabCache {
            name,
            arena: arena.id(),
            page_size,
            obj_size,
            objects_per_slab,
            slabs: Vec::new(),
            vacant: Vec::new(),
            lists: Default::default(),
        })
    }

    /// Returns the name of the cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the size of the objects served by the cache.
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Returns the number of objects each slab holds.
    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    /// Returns the number of slabs on each list.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            full: self.list(ListKind::Full).len,
            partial: self.list(ListKind::Partial).len,
            free: self.list(ListKind::Free).len,
        }
    }

    /// Iterates over the slabs on one list, head first.
    pub fn slabs(&self, kind: ListKind) -> impl Iterator<Item = SlabInfo> + '_ {
        self.iter_list(kind).map(move |id| {
            let slab = self.slab(id);
            SlabInfo {
                page_start: slab.page,
                free_count: slab.free_count,
                bitmap: slab.bitmap.bits(),
            }
        })
    }

    /// Attempts to allocate an object.
    ///
    /// The object is taken from the first free slot of the slab at the head
    /// of the `partial` list; failing that, a slab on the `free` list is put
    /// back into service, and failing that, a new page is requested from
    /// `arena`. The contents of the object are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`SlabError::Alloc`] if a new page was needed and `arena` is
    /// exhausted, or [`SlabError::ForeignArena`] if `arena` does not back this
    /// cache. The cache is unchanged in either case.
    pub fn allocate<P: ArenaProvider>(
        &mut self,
        arena: &mut BuddyArena<P>,
    ) -> Result<ObjectAddr, SlabError> {
        self.check_arena(arena)?;

        let id = match self.list(ListKind::Partial).head {
            Some(id) => id,
            None => match self.pop(ListKind::Free) {
                Some(id) => {
                    self.push(ListKind::Partial, id);
                    id
                }
                None => self.grow(arena)?,
            },
        };

        let obj_size = self.obj_size;
        let slab = self.slab_mut(id);

        let slot = slab
            .bitmap
            .first_clear()
            .expect("partial slab must have a free slot");
        slab.bitmap.set(slot, true);
        slab.free_count -= 1;

        let addr = slab.page.offset() + slot * obj_size;

        self.refile(id);

        Ok(ObjectAddr(addr))
    }

    /// Creates a new slab on the `partial` list.
    fn grow<P: ArenaProvider>(&mut self, arena: &mut BuddyArena<P>) -> Result<SlabId, AllocError> {
        let page = arena.allocate_slab_page()?;

        let slab = Slab {
            page,
            free_count: self.objects_per_slab,
            bitmap: SlotBitmap::new(self.objects_per_slab),
            next: None,
            list: ListKind::Partial,
        };

        let id = match self.vacant.pop() {
            Some(id) => {
                self.slabs[id] = Some(slab);
                id
            }
            None => {
                self.slabs.push(Some(slab));
                self.slabs.len() - 1
            }
        };

        self.push(ListKind::Partial, id);

        debug!(cache = %self.name, %page, "created slab");

        Ok(id)
    }

    /// Frees the object at `addr`.
    ///
    /// The owning slab is moved to whichever list matches its new number of
    /// free slots.
    ///
    /// # Errors
    ///
    /// Returns [`SlabError::Address`] if `addr` is not an object currently
    /// allocated from this cache, or [`SlabError::ForeignArena`] if `arena`
    /// does not back this cache. The cache is unchanged in either case.
    pub fn free<P: ArenaProvider>(
        &mut self,
        arena: &mut BuddyArena<P>,
        addr: ObjectAddr,
    ) -> Result<(), SlabError> {
        self.check_arena(arena)?;

        let (id, slot) = match self.locate(arena, addr) {
            Ok(found) => found,
            Err(e) => {
                warn!(cache = %self.name, %addr, error = %e, "rejected object free");
                return Err(e.into());
            }
        };

        let slab = self.slab_mut(id);
        slab.bitmap.set(slot, false);
        slab.free_count += 1;

        self.refile(id);

        Ok(())
    }

    /// Returns the pages of all slabs on the `free` list to `arena`.
    ///
    /// Returns the number of pages released.
    ///
    /// # Errors
    ///
    /// Returns [`SlabError::ForeignArena`] if `arena` does not back this
    /// cache.
    pub fn shrink<P: ArenaProvider>(&mut self, arena: &mut BuddyArena<P>) -> Result<usize, SlabError> {
        self.check_arena(arena)?;

        let mut released = 0;
        while let Some(id) = self.pop(ListKind::Free) {
            self.release_slab(arena, id);
            released += 1;
        }

        debug!(cache = %self.name, released, "shrunk slab cache");

        Ok(released)
    }

    /// Destroys the cache, returning the pages of all of its slabs to
    /// `arena`.
    ///
    /// Every object allocated from the cache is invalidated.
    ///
    /// # Errors
    ///
    /// If `arena` does not back this cache, nothing is released and the cache
    /// is handed back unchanged.
    pub fn destroy<P: ArenaProvider>(mut self, arena: &mut BuddyArena<P>) -> Result<(), SlabCache> {
        if self.check_arena(arena).is_err() {
            return Err(self);
        }

        let mut released = 0;
        for kind in [ListKind::Full, ListKind::Partial, ListKind::Free] {
            while let Some(id) = self.pop(kind) {
                self.release_slab(arena, id);
                released += 1;
            }
        }

        debug!(cache = %self.name, released, "destroyed slab cache");

        Ok(())
    }

    /// Returns the contents of the object at `addr`.
    ///
    /// Returns `None` if `addr` is not an object currently allocated from
    /// this cache or `arena` does not back this cache.
    pub fn object<'a, P: ArenaProvider>(
        &self,
        arena: &'a BuddyArena<P>,
        addr: ObjectAddr,
    ) -> Option<&'a [u8]> {
        if arena.id() != self.arena {
            return None;
        }

        self.locate(arena, addr).ok()?;
        Some(arena.raw_bytes(addr.0, self.obj_size))
    }

    /// Returns the contents of the object at `addr`, mutably.
    ///
    /// Returns `None` if `addr` is not an object currently allocated from
    /// this cache or `arena` does not back this cache.
    pub fn object_mut<'a, P: ArenaProvider>(
        &self,
        arena: &'a mut BuddyArena<P>,
        addr: ObjectAddr,
    ) -> Option<&'a mut [u8]> {
        if arena.id() != self.arena {
            return None;
        }

        self.locate(arena, addr).ok()?;
        Some(arena.raw_bytes_mut(addr.0, self.obj_size))
    }

    fn check_arena<P: ArenaProvider>(&self, arena: &BuddyArena<P>) -> Result<(), SlabError> {
        if arena.id() == self.arena {
            Ok(())
        } else {
            warn!(cache = %self.name, arena = ?arena.id(), "cache used with a foreign arena");
            Err(SlabError::ForeignArena)
        }
    }

    /// Finds the slab and slot of the allocated object at `addr`.
    ///
    /// Only the `partial` and `full` lists are searched, as slabs on `free`
    /// hold no objects.
    fn locate<P: ArenaProvider>(
        &self,
        arena: &BuddyArena<P>,
        addr: ObjectAddr,
    ) -> Result<(SlabId, usize), AddressError> {
        let ofs = addr.0;
        if ofs >= arena.size() {
            return Err(AddressError::OutOfRange { addr: ofs });
        }

        let id = self
            .iter_list(ListKind::Partial)
            .chain(self.iter_list(ListKind::Full))
            .find(|&id| {
                let start = self.slab(id).page.offset();
                (start..start + self.page_size).contains(&ofs)
            })
            .ok_or(AddressError::NotAllocated { addr: ofs })?;

        let slab = self.slab(id);
        let rel = ofs - slab.page.offset();
        let slot = rel / self.obj_size;

        if rel % self.obj_size != 0 || slot >= self.objects_per_slab {
            return Err(AddressError::Misaligned { addr: ofs });
        }

        if !slab.bitmap.get(slot) {
            return Err(AddressError::NotAllocated { addr: ofs });
        }

        Ok((id, slot))
    }

    /// Returns the list a slab with `free_count` free slots belongs on.
    fn classify(&self, free_count: usize) -> ListKind {
        if free_count == self.objects_per_slab {
            ListKind::Free
        } else if free_count == 0 {
            ListKind::Full
        } else {
            ListKind::Partial
        }
    }

    /// Moves a slab to the list matching its occupancy.
    fn refile(&mut self, id: SlabId) {
        let slab = self.slab(id);
        let from = slab.list;
        let to = self.classify(slab.free_count);

        if from != to {
            self.unlink(from, id);
            self.push(to, id);

            trace!(cache = %self.name, page = %self.slab(id).page, ?from, ?to, "moved slab");
        }
    }

    fn release_slab<P: ArenaProvider>(&mut self, arena: &mut BuddyArena<P>, id: SlabId) {
        if let Some(slab) = self.slabs[id].take() {
            self.vacant.push(id);

            if let Err(e) = arena.release_slab_page(slab.page) {
                warn!(cache = %self.name, page = %slab.page, error = %e, "slab page was not released");
            }
        }
    }

    #[inline]
    fn list(&self, kind: ListKind) -> &SlabList {
        &self.lists[kind.index()]
    }

    #[inline]
    fn slab(&self, id: SlabId) -> &Slab {
        self.slabs[id].as_ref().expect("listed slab id must be occupied")
    }

    #[inline]
    fn slab_mut(&mut self, id: SlabId) -> &mut Slab {
        self.slabs[id].as_mut().expect("listed slab id must be occupied")
    }

    fn iter_list(&self, kind: ListKind) -> impl Iterator<Item = SlabId> + '_ {
        core::iter::successors(self.list(kind).head, move |&id| self.slab(id).next)
    }

    /// Pushes a slab onto the head of a list.
    fn push(&mut self, kind: ListKind, id: SlabId) {
        let old_head = self.lists[kind.index()].head;

        let slab = self.slab_mut(id);
        slab.next = old_head;
        slab.list = kind;

        let list = &mut self.lists[kind.index()];
        list.head = Some(id);
        list.len += 1;
    }

    /// Pops the slab at the head of a list.
    fn pop(&mut self, kind: ListKind) -> Option<SlabId> {
        let head = self.list(kind).head?;
        self.unlink(kind, head);
        Some(head)
    }

    /// Removes a slab from a list.
    ///
    /// `id` must be an element of the list.
    fn unlink(&mut self, kind: ListKind, id: SlabId) {
        let prev = self
            .iter_list(kind)
            .take_while(|&cur| cur != id)
            .last();
        let next = self.slab_mut(id).next.take();

        match prev {
            Some(p) => self.slab_mut(p).next = next,
            None => self.lists[kind.index()].head = next,
        }

        self.lists[kind.index()].len -= 1;
    }

    /// Checks the bitmap and list invariants of every slab.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut listed = 0;

        for kind in [ListKind::Free, ListKind::Partial, ListKind::Full] {
            let mut count = 0;
            for id in self.iter_list(kind) {
                let slab = self.slab(id);
                assert_eq!(slab.list, kind);
                assert_eq!(
                    slab.free_count,
                    self.objects_per_slab - slab.bitmap.count_ones(),
                    "free count disagrees with bitmap"
                );
                assert_eq!(self.classify(slab.free_count), kind, "slab on wrong list");
                count += 1;
            }
            assert_eq!(count, self.list(kind).len);
            listed += count;
        }

        let live = self.slabs.iter().filter(|s| s.is_some()).count();
        assert_eq!(listed, live, "slab missing from every list");
        assert_eq!(live + self.vacant.len(), self.slabs.len());
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        let live = self.slabs.iter().filter(|s| s.is_some()).count();
        if live > 0 {
            warn!(cache = %self.name, slabs = live, "slab cache dropped without being destroyed");
        }
    }
}

impl fmt::Debug for SlabCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabCache")
            .field("name", &self.name)
            .field("obj_size", &self.obj_size)
            .field("objects_per_slab", &self.objects_per_slab)
            .field("stats", &self.stats())
            .finish()
    }
}

impl fmt::Display for SlabCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "[Cache '{}'] Full: {} | Partial: {} | Free: {}",
            self.name, stats.full, stats.partial, stats.free
        )
    }
}
