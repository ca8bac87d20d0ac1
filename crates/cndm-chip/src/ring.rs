//! Ring geometry and the completion phase protocol.
//!
//! Rings hold a power-of-two number of 16-byte entries. Producer and
//! consumer counters only ever increase (wrapping at `u32::MAX`); the slot
//! for a counter is `counter & (size - 1)` and `counter & size` flips once
//! per pass over the ring. The device writes each completion with the
//! phase bit set to the inverse of that flag, so a software consumer at
//! counter `C` owns the slot exactly when
//! `bool(word3 & 0x8000_0000) != bool(C & size)`.

use crate::desc::{CPL_PHASE, ENTRY_SIZE};

/// Largest supported ring: 2^16 entries. Doorbells carry 16 bits.
pub const MAX_LOG_SIZE: u32 = 16;

/// Size of a power-of-two ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingGeometry {
    log_size: u32,
}

impl RingGeometry {
    /// Ring of `2^log_size` entries; `None` above [`MAX_LOG_SIZE`].
    #[must_use]
    pub const fn new(log_size: u32) -> Option<Self> {
        if log_size > MAX_LOG_SIZE {
            return None;
        }
        Some(Self { log_size })
    }

    /// Ring of `size` entries; `None` unless `size` is a power of two no
    /// larger than `2^16`.
    #[must_use]
    pub const fn from_size(size: u32) -> Option<Self> {
        if !size.is_power_of_two() {
            return None;
        }
        Self::new(size.trailing_zeros())
    }

    /// log2 of the entry count.
    #[must_use]
    pub const fn log_size(self) -> u32 {
        self.log_size
    }

    /// Entry count.
    #[must_use]
    pub const fn size(self) -> u32 {
        1 << self.log_size
    }

    /// `size - 1`.
    #[must_use]
    pub const fn mask(self) -> u32 {
        self.size() - 1
    }

    /// Bytes of DMA memory backing the ring.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        (self.size() as usize) * ENTRY_SIZE
    }

    /// Slot index for a counter.
    #[must_use]
    pub const fn index(self, counter: u32) -> usize {
        (counter & self.mask()) as usize
    }

    /// Byte offset of the slot for a counter.
    #[must_use]
    pub const fn offset(self, counter: u32) -> usize {
        self.index(counter) * ENTRY_SIZE
    }

    /// Entries between consumer and producer.
    #[must_use]
    pub const fn occupancy(self, prod: u32, cons: u32) -> u32 {
        prod.wrapping_sub(cons)
    }

    /// Free slots between producer and the ring capacity.
    #[must_use]
    pub const fn space(self, prod: u32, cons: u32) -> u32 {
        self.size().saturating_sub(self.occupancy(prod, cons))
    }

    /// `true` when no more entries may be posted.
    #[must_use]
    pub const fn is_full(self, prod: u32, cons: u32) -> bool {
        self.occupancy(prod, cons) >= self.size()
    }

    /// Phase flag of a counter: `counter & size != 0`.
    #[must_use]
    pub const fn pass_flag(self, counter: u32) -> bool {
        counter & self.size() != 0
    }

    /// `true` when the completion at consumer counter `cons`, whose last
    /// word is `word3`, has been written by the device and not yet consumed.
    #[must_use]
    pub const fn cpl_ready(self, word3: u32, cons: u32) -> bool {
        (word3 & CPL_PHASE != 0) != self.pass_flag(cons)
    }

    /// Phase bit the device writes for the completion at producer counter
    /// `prod`.
    #[must_use]
    pub const fn device_phase(self, prod: u32) -> bool {
        !self.pass_flag(prod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(RingGeometry::from_size(0).is_none());
        assert!(RingGeometry::from_size(3).is_none());
        assert!(RingGeometry::from_size(1 << 17).is_none());
        assert_eq!(RingGeometry::from_size(256).map(RingGeometry::log_size), Some(8));
        assert!(RingGeometry::new(17).is_none());
    }

    #[test]
    fn index_is_counter_masked_over_three_wraps() {
        for log_size in 0..=MAX_LOG_SIZE {
            let ring = RingGeometry::new(log_size).unwrap();
            let size = ring.size();
            let step = (size / 64).max(1);
            let mut counter = 0u32;
            while counter < 3 * size + 1 {
                assert_eq!(ring.index(counter), (counter & (size - 1)) as usize);
                assert!(ring.index(counter) < size as usize);
                counter += step;
            }
            for c in [size - 1, size, 2 * size - 1, 2 * size, 3 * size] {
                assert_eq!(ring.index(c), (c % size) as usize);
            }
        }
    }

    #[test]
    fn index_survives_u32_wrap() {
        let ring = RingGeometry::new(8).unwrap();
        let prod = 5u32;
        let cons = u32::MAX - 2;
        assert_eq!(ring.occupancy(prod, cons), 8);
        assert_eq!(ring.index(u32::MAX), 255);
        assert_eq!(ring.index(u32::MAX.wrapping_add(1)), 0);
    }

    #[test]
    fn phase_toggles_once_per_wrap() {
        let ring = RingGeometry::new(4).unwrap();
        let s = ring.size();
        // Zeroed memory is never ready on the first pass.
        assert!(!ring.cpl_ready(0, 0));
        for pass in 0..4u32 {
            let c = pass * s;
            let written = if ring.device_phase(c) { CPL_PHASE } else { 0 };
            let stale = written ^ CPL_PHASE;
            assert!(ring.cpl_ready(written, c), "pass {pass}");
            assert!(!ring.cpl_ready(stale, c), "pass {pass}");
            // Same slot, one pass later: what was fresh is now stale.
            assert!(!ring.cpl_ready(written, c + s), "pass {pass}");
        }
        assert_ne!(ring.device_phase(s - 1), ring.device_phase(s));
        assert_eq!(ring.device_phase(0), ring.device_phase(2 * s));
    }

    #[test]
    fn occupancy_and_space() {
        let ring = RingGeometry::new(3).unwrap();
        assert_eq!(ring.space(0, 0), 8);
        assert!(!ring.is_full(7, 0));
        assert!(ring.is_full(8, 0));
        assert_eq!(ring.space(20, 15), 3);
        assert_eq!(ring.byte_len(), 128);
        assert_eq!(ring.offset(9), 16);
    }
}
