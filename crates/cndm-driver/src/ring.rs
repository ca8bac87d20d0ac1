//! Descriptor and completion rings in DMA memory.

use std::sync::atomic::{fence, Ordering};

use cndm_chip::desc::{Completion, Descriptor, ENTRY_SIZE};
use cndm_chip::ring::RingGeometry;

use crate::device::{DmaRegion, MemoryPool};
use crate::error::Result;

/// Work queue: software produces descriptors, the device consumes them.
#[derive(Debug)]
pub(crate) struct DescRing<G> {
    region: G,
    geometry: RingGeometry,
    pub(crate) prod: u32,
    pub(crate) cons: u32,
}

impl<G: DmaRegion> DescRing<G> {
    pub(crate) fn alloc<P>(pool: &P, geometry: RingGeometry) -> Result<Self>
    where
        P: MemoryPool<Region = G>,
    {
        Ok(Self {
            region: pool.alloc_region(geometry.byte_len())?,
            geometry,
            prod: 0,
            cons: 0,
        })
    }

    pub(crate) const fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub(crate) fn base_address(&self) -> u64 {
        self.region.device_address(0)
    }

    pub(crate) const fn occupancy(&self) -> u32 {
        self.geometry.occupancy(self.prod, self.cons)
    }

    pub(crate) const fn is_full(&self) -> bool {
        self.geometry.is_full(self.prod, self.cons)
    }

    pub(crate) const fn missing(&self) -> u32 {
        self.geometry.space(self.prod, self.cons)
    }

    /// Slot of the next descriptor to post.
    pub(crate) const fn prod_index(&self) -> usize {
        self.geometry.index(self.prod)
    }

    /// Slot of the oldest outstanding descriptor.
    pub(crate) const fn cons_index(&self) -> usize {
        self.geometry.index(self.cons)
    }

    /// Write `desc` at the producer slot and advance the producer.
    pub(crate) fn post(&mut self, desc: Descriptor) {
        self.region
            .write(self.geometry.offset(self.prod), &desc.encode());
        self.prod = self.prod.wrapping_add(1);
    }

    pub(crate) fn advance_cons(&mut self) {
        self.cons = self.cons.wrapping_add(1);
    }
}

/// Completion queue: the device produces, software consumes by phase.
#[derive(Debug)]
pub(crate) struct CplRing<G> {
    region: G,
    geometry: RingGeometry,
    pub(crate) cons: u32,
}

impl<G: DmaRegion> CplRing<G> {
    pub(crate) fn alloc<P>(pool: &P, geometry: RingGeometry) -> Result<Self>
    where
        P: MemoryPool<Region = G>,
    {
        Ok(Self {
            region: pool.alloc_region(geometry.byte_len())?,
            geometry,
            cons: 0,
        })
    }

    pub(crate) const fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub(crate) fn base_address(&self) -> u64 {
        self.region.device_address(0)
    }

    /// The completion at the consumer position, if the device has written
    /// it.
    pub(crate) fn peek(&self) -> Option<Completion> {
        let offset = self.geometry.offset(self.cons);
        let word3 = self.region.read_u32(offset + 12);
        if !self.geometry.cpl_ready(word3, self.cons) {
            return None;
        }
        // The phase word is written last; read the rest only after it.
        fence(Ordering::Acquire);
        let mut entry = [0u8; ENTRY_SIZE];
        self.region.read(offset, &mut entry);
        Some(Completion::decode(&entry))
    }

    pub(crate) fn advance(&mut self) {
        self.cons = self.cons.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostMemoryPool;

    #[test]
    fn post_wraps_and_tracks_occupancy() {
        let pool = HostMemoryPool::new();
        let mut ring = DescRing::alloc(&pool, RingGeometry::new(2).unwrap()).unwrap();
        for k in 0..4u64 {
            assert_eq!(ring.prod_index(), k as usize);
            ring.post(Descriptor { len: 1, addr: k });
        }
        assert!(ring.is_full());
        assert_eq!(ring.missing(), 0);
        ring.advance_cons();
        assert_eq!(ring.occupancy(), 3);
        assert_eq!(ring.prod_index(), 0);
        assert_eq!(ring.cons_index(), 1);
    }

    #[test]
    fn peek_follows_phase() {
        let pool = HostMemoryPool::new();
        let mut cq = CplRing::alloc(&pool, RingGeometry::new(1).unwrap()).unwrap();
        assert!(cq.peek().is_none());

        // Device fills both slots on the first pass with the phase bit set.
        for slot in 0..2u64 {
            let cpl = Completion {
                len: 60 + slot as u32,
                phase: true,
                ..Completion::default()
            };
            pool.dma_write(cq.base_address() + slot * 16, &cpl.encode())
                .unwrap();
        }
        assert_eq!(cq.peek().map(|c| c.len), Some(60));
        cq.advance();
        assert_eq!(cq.peek().map(|c| c.len), Some(61));
        cq.advance();
        // Second pass: slot 0 still carries the first-pass phase.
        assert!(cq.peek().is_none());

        let cpl = Completion {
            len: 99,
            phase: false,
            ..Completion::default()
        };
        pool.dma_write(cq.base_address(), &cpl.encode()).unwrap();
        assert_eq!(cq.peek().map(|c| c.len), Some(99));
    }
}
