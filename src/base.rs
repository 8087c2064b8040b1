use crate::{AddressError, ArenaProvider};

/// The region of memory managed by an allocator.
///
/// All locations inside the region are expressed as offsets from its start.
#[derive(Debug, Default)]
pub struct Region {
    bytes: Box<[u8]>,
}

impl Region {
    /// Reserves a region of `len` bytes from `provider`.
    pub fn reserve<P: ArenaProvider>(provider: &mut P, len: usize) -> Option<Region> {
        let bytes = provider.reserve(len)?;

        // A provider handing back the wrong size is treated as a refusal.
        if bytes.len() != len {
            provider.reclaim(bytes);
            return None;
        }

        Some(Region { bytes })
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn contains_ofs(&self, ofs: usize) -> bool {
        ofs < self.len()
    }

    /// Checks that `ofs` lies within the region.
    #[inline]
    pub fn check_ofs(&self, ofs: usize) -> Result<(), AddressError> {
        if self.contains_ofs(ofs) {
            Ok(())
        } else {
            Err(AddressError::OutOfRange { addr: ofs })
        }
    }

    /// Returns the `len` bytes starting at `ofs`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie within the region.
    #[inline]
    pub fn bytes(&self, ofs: usize, len: usize) -> &[u8] {
        &self.bytes[ofs..ofs + len]
    }

    /// Returns the `len` bytes starting at `ofs`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the range does not lie within the region.
    #[inline]
    pub fn bytes_mut(&mut self, ofs: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[ofs..ofs + len]
    }

    /// Writes a `DoubleBlockLink` at the given offset.
    ///
    /// The memory at `ofs` must be unallocated by the associated allocator;
    /// the link overwrites the first bytes of the block.
    #[inline]
    pub fn init_double_link_at(&mut self, ofs: usize, link: DoubleBlockLink) {
        debug_assert!(self.contains_ofs(ofs));
        debug_assert!(
            link.next.map_or(true, |next| self.contains_ofs(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_ofs(prev)),
            "prev link out of region"
        );

        link.encode(self.bytes_mut(ofs, DoubleBlockLink::SIZE));
    }

    /// Reads the `DoubleBlockLink` stored at the given offset.
    ///
    /// The memory at `ofs` must hold a link written by `init_double_link_at`
    /// and must not have been handed out since.
    #[inline]
    pub fn double_link(&self, ofs: usize) -> DoubleBlockLink {
        let link = DoubleBlockLink::decode(self.bytes(ofs, DoubleBlockLink::SIZE));

        debug_assert!(
            link.next.map_or(true, |next| self.contains_ofs(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_ofs(prev)),
            "prev link out of region"
        );

        link
    }

    /// Updates the `prev` field of the link stored at `ofs`.
    #[inline]
    pub fn set_prev(&mut self, ofs: usize, prev: Option<usize>) {
        let mut link = self.double_link(ofs);
        link.prev = prev;
        self.init_double_link_at(ofs, link);
    }

    /// Updates the `next` field of the link stored at `ofs`.
    #[inline]
    pub fn set_next(&mut self, ofs: usize, next: Option<usize>) {
        let mut link = self.double_link(ofs);
        link.next = next;
        self.init_double_link_at(ofs, link);
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.bytes
    }
}

// Links are stored as offsets from the region start rather than pointers. A
// link is only meaningful while the block holding it is free; once the block
// is handed out, its bytes belong to the caller and the link is garbage.

/// A double link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// doubly linked list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DoubleBlockLink {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl DoubleBlockLink {
    /// The number of bytes a link occupies inside a block.
    pub const SIZE: usize = 2 * FIELD_SIZE;

    fn encode(self, out: &mut [u8]) {
        let (prev, next) = out.split_at_mut(FIELD_SIZE);
        prev.copy_from_slice(&encode_field(self.prev));
        next.copy_from_slice(&encode_field(self.next));
    }

    fn decode(raw: &[u8]) -> DoubleBlockLink {
        let (prev, next) = raw.split_at(FIELD_SIZE);

        DoubleBlockLink {
            prev: decode_field(prev),
            next: decode_field(next),
        }
    }
}

const FIELD_SIZE: usize = 8;
const NIL: u64 = u64::MAX;

fn encode_field(ofs: Option<usize>) -> [u8; FIELD_SIZE] {
    let raw = match ofs {
        Some(o) => u64::try_from(o).expect("region offset overflowed a u64"),
        None => NIL,
    };

    raw.to_le_bytes()
}

fn decode_field(raw: &[u8]) -> Option<usize> {
    let mut buf = [0; FIELD_SIZE];
    buf.copy_from_slice(raw);

    match u64::from_le_bytes(buf) {
        NIL => None,
        o => Some(usize::try_from(o).expect("stored offset overflowed a usize")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Capped, Global};

    #[test]
    fn links_survive_a_round_trip_through_memory() {
        let mut region = Region::reserve(&mut Global, 64).unwrap();

        let link = DoubleBlockLink {
            prev: None,
            next: Some(32),
        };
        region.init_double_link_at(0, link);
        region.init_double_link_at(
            32,
            DoubleBlockLink {
                prev: Some(0),
                next: None,
            },
        );

        assert_eq!(region.double_link(0), link);
        assert_eq!(region.double_link(32).prev, Some(0));

        region.set_next(0, None);
        assert_eq!(region.double_link(0).next, None);
        assert_eq!(region.double_link(32).prev, Some(0));
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let region = Region::reserve(&mut Global, 16).unwrap();
        region.check_ofs(15).unwrap();
        assert_eq!(
            region.check_ofs(16),
            Err(AddressError::OutOfRange { addr: 16 })
        );
    }

    #[test]
    fn refused_reservation_yields_none() {
        assert!(Region::reserve(&mut Capped { limit: 8 }, 16).is_none());
        assert_eq!(Region::reserve(&mut Capped { limit: 16 }, 16).unwrap().len(), 16);
    }
}
