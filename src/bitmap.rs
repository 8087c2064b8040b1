/// A fixed-width occupancy bitmap for the slots of one slab.
///
/// Bit `i` is set if and only if slot `i` is occupied. The width of the
/// backing word bounds the number of slots a slab may have.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotBitmap {
    num_bits: usize,
    map: u32,
}

impl SlotBitmap {
    /// The largest number of bits a bitmap can track.
    pub const MAX_BITS: usize = u32::BITS as usize;

    /// Constructs a new, all-clear bitmap of `num_bits` bits.
    pub fn new(num_bits: usize) -> SlotBitmap {
        assert!(num_bits > 0);
        assert!(num_bits <= Self::MAX_BITS);

        SlotBitmap { num_bits, map: 0 }
    }

    /// Returns the mask which extracts `bit`.
    #[inline]
    const fn mask(bit: usize) -> u32 {
        1 << bit
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        self.map & Self::mask(index) != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        self.map = match value {
            true => self.map | Self::mask(index),
            false => self.map & !Self::mask(index),
        };
    }

    /// Returns the index of the lowest clear bit, if any.
    #[inline]
    pub fn first_clear(&self) -> Option<usize> {
        let index = self.map.trailing_ones() as usize;
        (index < self.num_bits).then_some(index)
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.map.count_ones() as usize
    }

    /// Returns the raw bitmap word.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.map
    }
}
