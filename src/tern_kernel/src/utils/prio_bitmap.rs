//! A fixed 32-entry bit array supporting constant-time bit scan, used as
//! the ready-set index.
use core::fmt;

use super::Init;

/// Bitmap with one bit per priority level. Bit *p* is set iff the ready
/// queue for priority *p* is non-empty; the scheduler's
/// highest-priority-ready lookup is a single find-first-set.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..u32::BITS as usize).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < u32::BITS as usize);
        (self.bits >> i) & 1 != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits &= !(1 << i);
    }

    /// Get the position of the first (lowest-numbered, i.e. most urgent)
    /// set bit.
    pub fn find_set(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros();
        if i == u32::BITS {
            None
        } else {
            Some(i as usize)
        }
    }
}
