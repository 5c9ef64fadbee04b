//! Provides `PrioBitmap`, a bit array structure supporting constant-time bit
//! scan operations.
use core::fmt;

type Word = usize;
const WORD_LEN: usize = core::mem::size_of::<Word>() * 8;

/// The maximum bit count supported by [`PrioBitmap`].
pub const PRIO_BITMAP_MAX_LEN: usize = WORD_LEN * WORD_LEN;

/// Get the number of second-level words required to store `len` bits.
pub const fn prio_bitmap_words(len: usize) -> usize {
    assert!(len <= PRIO_BITMAP_MAX_LEN, "too many bits");
    (len + WORD_LEN - 1) / WORD_LEN
}

/// A two-level bit array storing up to `WORDS * WORD_LEN` entries. Bit `i`
/// being set means priority `i` has something ready; the lowest set bit is
/// the most urgent priority.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy)]
pub struct PrioBitmap<const WORDS: usize> {
    // Invariant: `first & (1 << i) != 0` iff `second[i] != 0`
    first: Word,
    second: [Word; WORDS],
}

impl<const WORDS: usize> PrioBitmap<WORDS> {
    pub const INIT: Self = {
        assert!(WORDS <= WORD_LEN, "too many words");
        Self {
            first: 0,
            second: [0; WORDS],
        }
    };

    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first &= !(1 << (i / WORD_LEN));
        }
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        self.second[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.first |= 1 << (i / WORD_LEN);
    }

    /// Get the position of the first set bit.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.first == 0 {
            return None;
        }
        let group_i = self.first.trailing_zeros() as usize;
        let group = self.second[group_i];
        debug_assert_ne!(group, 0);
        Some(group.trailing_zeros() as usize + group_i * WORD_LEN)
    }

    /// Enumerate the positions of all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.second
            .iter()
            .enumerate()
            .filter(|(_, group)| **group != 0)
            .flat_map(|(group_i, &group)| {
                (0..WORD_LEN)
                    .filter(move |&bit| group & (1 << bit) != 0)
                    .map(move |bit| bit + group_i * WORD_LEN)
            })
    }
}

impl<const WORDS: usize> Default for PrioBitmap<WORDS> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<const WORDS: usize> fmt::Debug for PrioBitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter_set()).finish()
    }
}
